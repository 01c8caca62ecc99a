//! lanlink: serverless LAN peer-to-peer sockets.
//!
//! Peers find each other by UDP broadcast, prove ownership of their X25519 key
//! and their address, then exchange encrypted request/response messages over
//! pooled TCP streams.

pub mod config;
mod discovery;
mod error;
mod handlers;
mod slot;
mod socket;
mod stats;
mod targets;
mod transport;

pub use config::{ConfigError, LocalhostStrategy, SocketConfig};
pub use error::SocketError;
pub use handlers::Handlers;
pub use socket::Socket;
pub use stats::StatsSnapshot;

pub use lanlink_core::{
    ConnectionType, KeyPair, NodeId, P2PError, P2PMessage, P2PRequest, P2PResponse, PublicKey,
};
