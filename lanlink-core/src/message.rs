//! Request/response payloads exchanged over the TCP channel.

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::OnceLock;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::P2PError;
use crate::identity::NodeId;

/// Opaque payload with lazily computed, cached views as text or JSON.
#[derive(Clone, Default)]
pub struct P2PMessage {
    data: Bytes,
    text: OnceLock<Option<String>>,
    json: OnceLock<Option<serde_json::Value>>,
}

impl P2PMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let msg = Self::new(Bytes::from(text.clone().into_bytes()));
        let _ = msg.text.set(Some(text));
        msg
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        let msg = Self::new(Bytes::from(value.to_string().into_bytes()));
        let _ = msg.json.set(Some(value));
        msg
    }

    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload as UTF-8, or `None` if it is not valid text.
    pub fn text(&self) -> Option<&str> {
        self.text
            .get_or_init(|| std::str::from_utf8(&self.data).ok().map(str::to_owned))
            .as_deref()
    }

    /// The payload parsed as JSON, or `None` if it does not parse.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.data).ok())
            .as_ref()
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

impl PartialEq for P2PMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for P2PMessage {}

impl fmt::Debug for P2PMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text() {
            Some(text) if text.len() <= 64 => write!(f, "P2PMessage({:?})", text),
            _ => write!(f, "P2PMessage({} bytes)", self.data.len()),
        }
    }
}

impl From<Vec<u8>> for P2PMessage {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl From<&'static [u8]> for P2PMessage {
    fn from(v: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(v))
    }
}

impl From<&str> for P2PMessage {
    fn from(s: &str) -> Self {
        Self::from_text(s)
    }
}

impl From<String> for P2PMessage {
    fn from(s: String) -> Self {
        Self::from_text(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Direct,
}

/// An incoming request as seen by the receive handler.
#[derive(Debug, Clone)]
pub struct P2PRequest {
    pub sender: NodeId,
    pub connection_type: ConnectionType,
    pub remote_address: SocketAddrV4,
    pub message: P2PMessage,
}

/// Outcome of a send. An empty `Ok` message means the peer replied with nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2PResponse {
    pub connection_type: Option<ConnectionType>,
    pub result: Result<P2PMessage, P2PError>,
}

impl P2PResponse {
    pub fn ok(connection_type: ConnectionType, message: P2PMessage) -> Self {
        Self {
            connection_type: Some(connection_type),
            result: Ok(message),
        }
    }

    pub fn err(error: P2PError) -> Self {
        Self {
            connection_type: None,
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn message(&self) -> Option<&P2PMessage> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&P2PError> {
        self.result.as_ref().err()
    }
}
