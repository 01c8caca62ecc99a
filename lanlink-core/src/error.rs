//! Errors reported to callers of a message exchange.

/// Why a request did not produce a reply. Carried in `P2PResponse::result`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum P2PError {
    #[error("node not found")]
    NodeNotFound,
    #[error("connection to node is stale")]
    ConnectionStale,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("authentication failed")]
    Authentication,
    #[error("timed out")]
    Timeout,
    #[error("socket closed")]
    Closed,
    #[error("cancelled")]
    Cancelled,
    #[error("remote rejected the request")]
    RemoteRejected,
}

impl P2PError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        P2PError::Transport(err.to_string())
    }
}
