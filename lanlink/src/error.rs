use std::io;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("no free actor port in {first}..={last}: {source}")]
    Bind {
        first: u16,
        last: u16,
        #[source]
        source: io::Error,
    },
    #[error("binding control port {port}: {source}")]
    BindControl {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("socket closed")]
    Closed,
}
