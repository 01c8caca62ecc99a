//! lanlink protocol core.
//! No I/O: identity and crypto, wire codecs, node registry, expiring cache.
//! The `lanlink` crate drives these from a tokio runtime.

pub mod cache;
pub mod cvli;
pub mod error;
pub mod frame;
pub mod identity;
pub mod message;
pub mod packet;
pub mod registry;
pub mod tick;
pub mod verify;

pub use cache::ExpiringMap;
pub use error::P2PError;
pub use frame::{FrameError, TcpCodec, TcpCommand, TcpFrame};
pub use identity::{CryptoError, KeyCache, KeyPair, NodeId, PublicKey, ShortNodeId};
pub use message::{ConnectionType, P2PMessage, P2PRequest, P2PResponse};
pub use packet::{Command, Packet, PacketError, ReplyVerifyNode, VerifyNode};
pub use registry::{Connection, ConnectionKind, Node, PingOutcome, Registry, Route, UpsertOutcome};
pub use tick::{check_delay, Clock};
pub use verify::{answer_challenge, check_reply, Verified, VerifyError};
