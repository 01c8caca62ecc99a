//! Application callbacks. All of them run on the socket's I/O thread and must not block.

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

use lanlink_core::{NodeId, P2PMessage, P2PRequest};

type RequestFn = Arc<dyn Fn(&P2PRequest) + Send + Sync>;
type ReplyFn = Arc<dyn Fn(&P2PRequest) -> P2PMessage + Send + Sync>;
type ConnectFn = Arc<dyn Fn(NodeId, SocketAddrV4) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Handlers {
    hello: Option<RequestFn>,
    connect_node: Option<ConnectFn>,
    message: Option<ReplyFn>,
    datagram: Option<RequestFn>,
    broadcast: Option<RequestFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hello or ReplyHello whose payload matched the configured prefix; the
    /// request carries the payload with the prefix stripped.
    pub fn on_receive_hello(mut self, f: impl Fn(&P2PRequest) + Send + Sync + 'static) -> Self {
        self.hello = Some(Arc::new(f));
        self
    }

    /// A peer completed address verification.
    pub fn on_connect_node(
        mut self,
        f: impl Fn(NodeId, SocketAddrV4) + Send + Sync + 'static,
    ) -> Self {
        self.connect_node = Some(Arc::new(f));
        self
    }

    /// Answer a TCP request. An empty reply is sent as an empty ReplyMessage.
    pub fn on_receive_message(
        mut self,
        f: impl Fn(&P2PRequest) -> P2PMessage + Send + Sync + 'static,
    ) -> Self {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn on_receive_datagram(mut self, f: impl Fn(&P2PRequest) + Send + Sync + 'static) -> Self {
        self.datagram = Some(Arc::new(f));
        self
    }

    pub fn on_receive_broadcast(mut self, f: impl Fn(&P2PRequest) + Send + Sync + 'static) -> Self {
        self.broadcast = Some(Arc::new(f));
        self
    }

    pub(crate) fn hello(&self, req: &P2PRequest) {
        if let Some(f) = &self.hello {
            f(req);
        }
    }

    pub(crate) fn connect_node(&self, id: NodeId, addr: SocketAddrV4) {
        if let Some(f) = &self.connect_node {
            f(id, addr);
        }
    }

    pub(crate) fn message(&self, req: &P2PRequest) -> P2PMessage {
        match &self.message {
            Some(f) => f(req),
            None => P2PMessage::empty(),
        }
    }

    pub(crate) fn datagram(&self, req: &P2PRequest) {
        if let Some(f) = &self.datagram {
            f(req);
        }
    }

    pub(crate) fn broadcast(&self, req: &P2PRequest) {
        if let Some(f) = &self.broadcast {
            f(req);
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("hello", &self.hello.is_some())
            .field("connect_node", &self.connect_node.is_some())
            .field("message", &self.message.is_some())
            .field("datagram", &self.datagram.is_some())
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}
