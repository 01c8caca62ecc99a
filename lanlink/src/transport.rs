//! TCP channel: pooled client exchanges and the server loop, both framed with [`TcpCodec`]
//! and encrypted with the per-peer shared key.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use lanlink_core::identity::{open, seal, CryptoError};
use lanlink_core::{
    ConnectionType, FrameError, NodeId, P2PError, P2PMessage, P2PRequest, Route, TcpCodec,
    TcpFrame,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::socket::{to_v4, Inner};
use crate::stats::Stats;

pub(crate) type IdleStream = Framed<TcpStream, TcpCodec>;

/// Identifies a live stream; allocated from a counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StreamId(pub u64);

#[derive(Debug, Clone)]
pub(crate) enum StreamRole {
    Server { remote: Option<NodeId>, peer: SocketAddr },
    Client { node: NodeId, address: SocketAddrV4 },
}

pub(crate) struct LiveStream {
    pub role: StreamRole,
    pub cancel: CancellationToken,
}

/// Removes the stream from the live map when the exchange ends, however it ends.
struct LiveGuard<'a> {
    inner: &'a Inner,
    id: StreamId,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.inner.live.lock().remove(&self.id);
    }
}

impl Inner {
    fn register_live(&self, role: StreamRole) -> (LiveGuard<'_>, CancellationToken) {
        let id = self.next_stream_id();
        // A child token is cancelled by shutdown as well as by a sweep.
        let cancel = self.shutdown.child_token();
        self.live.lock().insert(
            id,
            LiveStream {
                role,
                cancel: cancel.clone(),
            },
        );
        (LiveGuard { inner: self, id }, cancel)
    }

    fn touch_live(&self, id: StreamId) {
        self.live.lock().touch(&id);
    }

    fn set_live_role(&self, id: StreamId, role: StreamRole) {
        if let Some(live) = self.live.lock().get_mut(&id) {
            live.role = role;
        }
    }

    fn framed(&self, stream: TcpStream) -> IdleStream {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "set_nodelay failed");
        }
        Framed::with_capacity(
            stream,
            TcpCodec::new(self.config.max_message_size),
            self.config.message_buffer_size,
        )
    }

    /// One request/response with `route`, over a pooled stream if one is idle.
    pub(crate) async fn client_exchange(
        &self,
        route: Route,
        message: P2PMessage,
    ) -> Result<P2PMessage, P2PError> {
        let pool_key = (route.node_id, route.address);
        let pooled = self.idle.lock().take(&pool_key);
        let (guard, cancel) = self.register_live(StreamRole::Client {
            node: route.node_id,
            address: route.address,
        });
        let exchange = async {
            let mut framed = match pooled {
                Some(framed) => {
                    Stats::incr(&self.stats.pooled_reuses);
                    trace!(node = %route.node_id, addr = %route.address, "reusing idle stream");
                    framed
                }
                None => self.dial(&route).await?,
            };
            self.touch_live(guard.id);
            let reply = self.send_request(&mut framed, &route, &message).await?;
            Ok::<_, P2PError>((framed, reply))
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                if self.is_closed() { Err(P2PError::Closed) } else { Err(P2PError::Cancelled) }
            }
            r = exchange => r,
        };
        drop(guard);
        let (framed, reply) = outcome?;
        self.return_to_pool(pool_key, framed);
        Ok(reply)
    }

    /// Park a finished stream for reuse. Teardown drains the pool after marking the
    /// socket closed, so the check has to happen under the pool lock.
    fn return_to_pool(&self, key: (NodeId, SocketAddrV4), framed: IdleStream) -> bool {
        let mut idle = self.idle.lock();
        if self.is_closed() {
            return false;
        }
        idle.insert(key, framed);
        true
    }

    async fn dial(&self, route: &Route) -> Result<IdleStream, P2PError> {
        Stats::incr(&self.stats.tcp_dials);
        let connect = TcpStream::connect(SocketAddr::V4(route.address));
        let stream = tokio::time::timeout(self.config.stream_timeout(), connect)
            .await
            .map_err(|_| P2PError::Timeout)?
            .map_err(P2PError::transport)?;
        let mut framed = self.framed(stream);
        Stats::incr(&self.stats.tcp_handshakes);
        framed
            .send(TcpFrame::InitTcp {
                target: route.node_id.short(),
                public_key: *self.keypair.public_key(),
            })
            .await
            .map_err(|e| P2PError::Handshake(e.to_string()))?;
        match framed.next().await {
            Some(Ok(TcpFrame::ReplyInitTcp)) => {
                debug!(node = %route.node_id, addr = %route.address, "tcp stream established");
                Ok(framed)
            }
            Some(Ok(other)) => Err(P2PError::Handshake(format!(
                "unexpected {:?} during handshake",
                other.command()
            ))),
            Some(Err(e)) => Err(P2PError::Handshake(e.to_string())),
            None => Err(P2PError::RemoteRejected),
        }
    }

    async fn send_request(
        &self,
        framed: &mut IdleStream,
        route: &Route,
        message: &P2PMessage,
    ) -> Result<P2PMessage, P2PError> {
        let content = seal_content(&route.encryption_key, message.as_bytes())
            .map_err(P2PError::transport)?;
        framed
            .send(TcpFrame::Message(content))
            .await
            .map_err(frame_error)?;
        Stats::incr(&self.stats.messages_sent);
        match framed.next().await {
            Some(Ok(TcpFrame::ReplyMessage(content))) => {
                open_content(&route.encryption_key, &content).map(P2PMessage::new)
            }
            Some(Ok(other)) => Err(P2PError::Transport(format!(
                "unexpected {:?} awaiting reply",
                other.command()
            ))),
            Some(Err(e)) => Err(frame_error(e)),
            None => Err(P2PError::Transport("stream closed before reply".into())),
        }
    }

    pub(crate) async fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let inner = self.clone();
                    self.spawn(async move { inner.serve(stream, peer).await });
                }
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Serve one accepted stream until it fails, is closed, or times out.
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let (guard, cancel) = self.register_live(StreamRole::Server { remote: None, peer });
        let Some(remote_address) = to_v4(peer) else {
            return;
        };
        let mut framed = self.framed(stream);
        let mut session: Option<(NodeId, [u8; 32])> = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                f = framed.next() => f,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(addr = %peer, error = %e, "closing stream on framing error");
                    break;
                }
                None => break,
            };
            self.touch_live(guard.id);
            let reply = match frame {
                TcpFrame::InitTcp { target, public_key } => {
                    let remote = public_key.node_id();
                    if target != self.local_id.short() || remote == self.local_id {
                        debug!(addr = %peer, "InitTcp for another node");
                        break;
                    }
                    session = Some((remote, self.shared_key(&public_key)));
                    self.set_live_role(
                        guard.id,
                        StreamRole::Server {
                            remote: Some(remote),
                            peer,
                        },
                    );
                    trace!(node = %remote, addr = %peer, "tcp handshake accepted");
                    TcpFrame::ReplyInitTcp
                }
                TcpFrame::Message(content) => {
                    let Some((sender, key)) = session else {
                        debug!(addr = %peer, "message before InitTcp");
                        break;
                    };
                    let plain = match open_content(&key, &content) {
                        Ok(plain) => plain,
                        Err(e) => {
                            debug!(node = %sender, error = %e, "rejecting message");
                            break;
                        }
                    };
                    Stats::incr(&self.stats.messages_received);
                    let request = P2PRequest {
                        sender,
                        connection_type: ConnectionType::Direct,
                        remote_address,
                        message: P2PMessage::new(plain),
                    };
                    let response = self.handlers.message(&request);
                    match seal_content(&key, response.as_bytes()) {
                        Ok(content) => TcpFrame::ReplyMessage(content),
                        Err(e) => {
                            warn!(node = %sender, error = %e, "sealing reply failed");
                            break;
                        }
                    }
                }
                TcpFrame::ReplyInitTcp | TcpFrame::ReplyMessage(_) => {
                    debug!(addr = %peer, "client-bound frame sent to server");
                    break;
                }
            };
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                r = framed.send(reply) => r,
            };
            if let Err(e) = sent {
                debug!(addr = %peer, error = %e, "writing reply failed");
                break;
            }
        }
        trace!(addr = %peer, "server stream closed");
    }
}

/// Empty payloads travel as zero-length content.
fn seal_content(key: &[u8; 32], plain: &[u8]) -> Result<Bytes, CryptoError> {
    if plain.is_empty() {
        return Ok(Bytes::new());
    }
    seal(key, plain).map(Bytes::from)
}

fn open_content(key: &[u8; 32], content: &[u8]) -> Result<Vec<u8>, P2PError> {
    if content.is_empty() {
        return Ok(Vec::new());
    }
    open(key, content).map_err(|e| match e {
        CryptoError::Authentication => P2PError::Authentication,
        other => P2PError::transport(other),
    })
}

fn frame_error(e: FrameError) -> P2PError {
    P2PError::transport(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Handlers, Socket, SocketConfig};
    use lanlink_core::KeyPair;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn idle_socket(port: u16) -> Socket {
        Socket::open(
            SocketConfig {
                port,
                port_count: 10,
                auto_start: false,
                hello_interval_ms: 0,
                stream_timeout_ms: 100,
                ..SocketConfig::default()
            },
            Handlers::new(),
        )
        .unwrap()
    }

    fn loopback_pair(inner: &Inner) -> (SocketAddrV4, IdleStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = to_v4(listener.local_addr().unwrap()).unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (server, _) = listener.accept().unwrap();
        let _guard = inner.handle.enter();
        let framed = inner.framed(TcpStream::from_std(client).unwrap());
        (addr, framed, server)
    }

    #[test]
    fn sweep_cancels_expired_streams() {
        let s = idle_socket(42400);
        let inner = s.inner();
        let node = KeyPair::generate().node_id();
        let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 42499);
        let (_guard, cancel) = inner.register_live(StreamRole::Client { node, address });
        assert_eq!(inner.live.lock().len(), 1);
        inner.sweep();
        assert!(!cancel.is_cancelled());

        std::thread::sleep(Duration::from_millis(150));
        inner.sweep();
        assert!(cancel.is_cancelled());
        assert!(inner.live.lock().is_empty());
    }

    #[test]
    fn finished_stream_is_not_pooled_after_close() {
        let s = idle_socket(42420);
        let inner = s.inner().clone();
        let node = KeyPair::generate().node_id();

        let (addr, framed, _server) = loopback_pair(&inner);
        assert!(inner.return_to_pool((node, addr), framed));
        assert_eq!(inner.idle.lock().len(), 1);

        let (addr, framed, _server2) = loopback_pair(&inner);
        s.close();
        assert!(inner.idle.lock().is_empty());
        assert!(!inner.return_to_pool((node, addr), framed));
        assert!(inner.idle.lock().is_empty());
    }

    #[test]
    fn empty_content_round_trips_without_sealing() {
        let key = [3u8; 32];
        assert!(seal_content(&key, b"").unwrap().is_empty());
        assert!(open_content(&key, b"").unwrap().is_empty());
    }

    #[test]
    fn open_content_maps_tag_failure() {
        let key = [3u8; 32];
        let mut sealed = seal_content(&key, b"payload").unwrap().to_vec();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert_eq!(open_content(&key, &sealed), Err(P2PError::Authentication));
        let other = seal_content(&key, b"p").unwrap();
        assert_eq!(
            open_content(&[4u8; 32], &other),
            Err(P2PError::Authentication)
        );
    }
}
