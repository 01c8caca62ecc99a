//! Socket facade: binding, the I/O thread, the public API, and ordered shutdown.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use lanlink_core::{
    Clock, ExpiringMap, KeyCache, KeyPair, NodeId, P2PError, P2PMessage, P2PResponse, PublicKey,
    Registry,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{SocketConfig, MAX_HELLO_SIZE};
use crate::discovery::Outbound;
use crate::error::SocketError;
use crate::handlers::Handlers;
use crate::slot::ResponseSlot;
use crate::stats::{Stats, StatsSnapshot};
use crate::targets::BroadcastTargets;
use crate::transport::{IdleStream, LiveStream, StreamId, StreamRole};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Waiters for a node lookup, woken when the node is verified.
pub(crate) type Waiters = Vec<oneshot::Sender<()>>;

/// State shared by the public handle and every task on the I/O thread.
pub(crate) struct Inner {
    pub(crate) config: SocketConfig,
    pub(crate) keypair: KeyPair,
    pub(crate) local_id: NodeId,
    pub(crate) clock: Clock,
    pub(crate) handlers: Handlers,
    pub(crate) bound_port: u16,
    /// Hello prefix followed by the hello message.
    pub(crate) hello: Mutex<Vec<u8>>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) key_cache: Mutex<KeyCache>,
    pub(crate) pending: Mutex<ExpiringMap<NodeId, Waiters>>,
    pub(crate) live: Mutex<ExpiringMap<StreamId, LiveStream>>,
    pub(crate) idle: Mutex<ExpiringMap<(NodeId, SocketAddrV4), IdleStream>>,
    pub(crate) targets: Mutex<BroadcastTargets>,
    pub(crate) stats: Stats,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) handle: Handle,
    pub(crate) actor: UdpSocket,
    /// Datagrams queued for the send loop.
    pub(crate) outbound: mpsc::UnboundedSender<Outbound>,
    lobby: UdpSocket,
    listener: Mutex<Option<TcpListener>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    next_stream_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now()
    }

    pub(crate) fn next_stream_id(&self) -> StreamId {
        StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Shared key with `remote`, derived once and cached.
    pub(crate) fn shared_key(&self, remote: &PublicKey) -> [u8; 32] {
        self.key_cache.lock().get_or_derive(&self.keypair, remote)
    }

    /// Spawn onto the I/O runtime; the task is awaited (bounded) at close.
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(fut, &self.handle);
    }

    fn spawn_loops(self: &Arc<Self>) {
        if let Some(rx) = self.outbound_rx.lock().take() {
            let inner = self.clone();
            self.spawn(async move { inner.send_loop(rx).await });
        }
        let inner = self.clone();
        self.spawn(async move { inner.recv_loop(&inner.actor, "actor").await });
        let inner = self.clone();
        self.spawn(async move { inner.recv_loop(&inner.lobby, "lobby").await });
        if let Some(listener) = self.listener.lock().take() {
            let inner = self.clone();
            self.spawn(async move { inner.accept_loop(listener).await });
        }
        let inner = self.clone();
        self.spawn(async move { inner.hello_loop().await });
        let inner = self.clone();
        self.spawn(async move { inner.sweep_loop().await });
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    pub(crate) fn sweep(&self) {
        let expired = self.live.lock().sweep();
        for (id, stream) in &expired {
            match &stream.role {
                StreamRole::Server { remote, peer } => {
                    debug!(stream = id.0, addr = %peer, node = ?remote, "server stream timed out");
                }
                StreamRole::Client { node, address } => {
                    debug!(stream = id.0, %node, addr = %address, "client stream timed out");
                }
            }
            stream.cancel.cancel();
        }
        let idle = self.idle.lock().sweep();
        if !idle.is_empty() {
            debug!(count = idle.len(), "dropping idle streams");
        }
        // Waiters have their own timeout; this only frees abandoned entries.
        drop(self.pending.lock().sweep());
    }

    /// Register for a wakeup when `target` is verified.
    pub(crate) fn add_waiter(&self, target: NodeId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let mut waiters = pending.remove(&target).unwrap_or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        pending.insert(target, waiters);
        rx
    }

    pub(crate) fn wake_waiters(&self, target: &NodeId) {
        let waiters = self.pending.lock().remove(target);
        for w in waiters.into_iter().flatten() {
            let _ = w.send(());
        }
    }

    /// Broadcast FindNode until the node is verified or retries run out.
    pub(crate) async fn find_node(&self, target: NodeId) -> Result<(), P2PError> {
        for attempt in 0..=self.config.find_retries {
            let rx = self.add_waiter(target);
            if self.registry.lock().contains(&target) {
                return Ok(());
            }
            debug!(node = %target, attempt, "looking up node");
            self.send_find_node(target);
            match tokio::time::timeout(self.config.find_timeout(), rx).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) if self.is_closed() => return Err(P2PError::Closed),
                // Sender swept just ahead of our own timeout.
                Ok(Err(_)) | Err(_) => {}
            }
        }
        debug!(node = %target, "node not found");
        Err(P2PError::NodeNotFound)
    }

    async fn exchange(
        self: &Arc<Self>,
        target: NodeId,
        message: P2PMessage,
    ) -> Result<P2PMessage, P2PError> {
        if target == self.local_id {
            return Err(P2PError::NodeNotFound);
        }
        if message.len() > self.config.max_message_size {
            return Err(P2PError::Transport(format!(
                "message of {} bytes exceeds max_message_size",
                message.len()
            )));
        }
        let known = self.registry.lock().contains(&target);
        if !known {
            self.find_node(target).await?;
        }
        let route = self.registry.lock().route(
            &target,
            self.now(),
            self.config.connection_timeout_ticks(),
        )?;
        self.client_exchange(route, message).await
    }

    pub(crate) async fn request(
        self: &Arc<Self>,
        target: NodeId,
        message: P2PMessage,
        timeout: Option<Duration>,
    ) -> P2PResponse {
        let exchange = async {
            match timeout {
                Some(t) => tokio::time::timeout(t, self.exchange(target, message))
                    .await
                    .unwrap_or(Err(P2PError::Timeout)),
                None => self.exchange(target, message).await,
            }
        };
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(P2PError::Closed),
            r = exchange => r,
        };
        match result {
            Ok(reply) => P2PResponse::ok(lanlink_core::ConnectionType::Direct, reply),
            Err(e) => {
                debug!(node = %target, error = %e, "request failed");
                P2PResponse::err(e)
            }
        }
    }

    /// Tear down in order: streams, pool, waiters, registry.
    fn teardown(&self) {
        self.shutdown.cancel();
        let live = self.live.lock().drain();
        if !live.is_empty() {
            debug!(count = live.len(), "cancelling live streams");
        }
        for (_, stream) in live {
            stream.cancel.cancel();
        }
        drop(self.idle.lock().drain());
        drop(self.pending.lock().drain());
        self.registry.lock().clear();
        self.key_cache.lock().clear();
        self.tracker.close();
    }
}

enum RuntimeState {
    /// Opened but not started; tasks queue on the runtime until it is driven.
    Idle(Runtime),
    Running {
        thread: JoinHandle<()>,
        thread_id: ThreadId,
    },
    Stopped,
}

/// A P2P socket bound to the control port and one actor port.
///
/// All callbacks run on the socket's dedicated I/O thread. Dropping the socket closes it.
pub struct Socket {
    inner: Arc<Inner>,
    runtime: Mutex<RuntimeState>,
    generated_key: bool,
}

impl Socket {
    /// Bind the control port and the first free actor port (UDP and TCP on the
    /// same number). Starts the I/O thread when `config.auto_start` is set.
    pub fn open(config: SocketConfig, handlers: Handlers) -> Result<Socket, SocketError> {
        let config = config.normalized();
        if config.port == 0 {
            return Err(SocketError::InvalidConfig("port must be non-zero".into()));
        }
        let (keypair, generated_key) = match &config.key {
            Some(hex) => (
                KeyPair::from_hex(hex)
                    .map_err(|e| SocketError::InvalidConfig(format!("key: {}", e)))?,
                false,
            ),
            None => (KeyPair::generate(), true),
        };
        let mut hello = config.hello_prefix.as_bytes().to_vec();
        hello.extend_from_slice(config.hello_message.as_bytes());
        if hello.len() > MAX_HELLO_SIZE {
            return Err(SocketError::InvalidConfig(format!(
                "hello prefix and message exceed {} bytes",
                MAX_HELLO_SIZE
            )));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("lanlink-io")
            .build()
            .map_err(SocketError::Runtime)?;
        let (lobby, actor, listener, bound_port) = {
            let _guard = runtime.enter();
            bind_sockets(&config)?
        };

        let local_id = keypair.node_id();
        info!(node = %local_id, port = bound_port, control = config.port, "socket bound");
        let stream_ttl = config.stream_timeout();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            targets: Mutex::new(BroadcastTargets::new(&config, bound_port)),
            pending: Mutex::new(ExpiringMap::new(config.find_timeout())),
            live: Mutex::new(ExpiringMap::new(stream_ttl)),
            idle: Mutex::new(ExpiringMap::new(stream_ttl)),
            registry: Mutex::new(Registry::new()),
            key_cache: Mutex::new(KeyCache::new()),
            hello: Mutex::new(hello),
            handle: runtime.handle().clone(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stats: Stats::default(),
            clock: Clock::new(),
            listener: Mutex::new(Some(listener)),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            next_stream_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
            keypair,
            local_id,
            handlers,
            bound_port,
            actor,
            lobby,
        });
        let socket = Socket {
            inner,
            runtime: Mutex::new(RuntimeState::Idle(runtime)),
            generated_key,
        };
        if socket.inner.config.auto_start {
            socket.start()?;
        }
        Ok(socket)
    }

    /// Start the I/O thread. No-op if already started.
    pub fn start(&self) -> Result<(), SocketError> {
        let mut state = self.runtime.lock();
        let runtime = match std::mem::replace(&mut *state, RuntimeState::Stopped) {
            RuntimeState::Idle(rt) => rt,
            running @ RuntimeState::Running { .. } => {
                *state = running;
                return Ok(());
            }
            RuntimeState::Stopped => return Err(SocketError::Closed),
        };
        let inner = self.inner.clone();
        let thread = thread::Builder::new()
            .name("lanlink-io".into())
            .spawn(move || {
                runtime.block_on(async {
                    inner.spawn_loops();
                    inner.shutdown.cancelled().await;
                    inner.tracker.close();
                    if tokio::time::timeout(CLOSE_GRACE, inner.tracker.wait())
                        .await
                        .is_err()
                    {
                        debug!("tasks still running at shutdown");
                    }
                });
                runtime.shutdown_timeout(Duration::from_millis(100));
            })
            .map_err(SocketError::Runtime)?;
        *state = RuntimeState::Running {
            thread_id: thread.thread().id(),
            thread,
        };
        Ok(())
    }

    pub fn is_opened(&self) -> bool {
        !self.inner.is_closed()
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.runtime.lock(), RuntimeState::Running { .. })
    }

    /// Close the socket. Outstanding requests resolve with `Closed`. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.inner.local_id, "closing socket");
        self.inner.teardown();
        let state = std::mem::replace(&mut *self.runtime.lock(), RuntimeState::Stopped);
        match state {
            RuntimeState::Running { thread, thread_id } => {
                if thread::current().id() != thread_id && thread.join().is_err() {
                    warn!("I/O thread panicked");
                }
            }
            RuntimeState::Idle(runtime) => {
                // Queued tasks are dropped with the runtime, which cannot happen inside
                // another runtime's context.
                let dropper = thread::Builder::new()
                    .name("lanlink-close".into())
                    .spawn(move || drop(runtime));
                match dropper {
                    Ok(handle) => {
                        let _ = handle.join();
                    }
                    Err(e) => warn!(error = %e, "could not spawn runtime drop thread"),
                }
            }
            RuntimeState::Stopped => {}
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn public_key(&self) -> PublicKey {
        *self.inner.keypair.public_key()
    }

    /// Actor port; UDP and TCP listeners share it.
    pub fn bound_port(&self) -> u16 {
        self.inner.bound_port
    }

    pub fn control_port(&self) -> u16 {
        self.inner.config.port
    }

    /// True when no key was configured and one was generated at open.
    pub fn generated_key(&self) -> bool {
        self.generated_key
    }

    /// Hex of the secret key, so a generated key can be persisted.
    pub fn secret_key_hex(&self) -> String {
        self.inner.keypair.secret_hex()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of verified peers.
    pub fn known_nodes(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Send `message` to `target` and call `callback` with the reply or error.
    pub fn send_message(
        &self,
        target: NodeId,
        message: impl Into<P2PMessage>,
        callback: impl FnOnce(P2PResponse) + Send + 'static,
    ) {
        self.send_message_with_timeout(target, message, None, callback)
    }

    /// As [`Socket::send_message`], failing with `Timeout` if the whole exchange
    /// (lookup included) takes longer than `timeout`.
    pub fn send_message_with_timeout(
        &self,
        target: NodeId,
        message: impl Into<P2PMessage>,
        timeout: Option<Duration>,
        callback: impl FnOnce(P2PResponse) + Send + 'static,
    ) {
        let slot = ResponseSlot::new(callback, self.inner.shutdown.clone());
        if self.inner.is_closed() {
            slot.fail(P2PError::Closed);
            return;
        }
        let message = message.into();
        let inner = self.inner.clone();
        self.inner.spawn(async move {
            let response = inner.request(target, message, timeout).await;
            slot.resolve(response);
        });
    }

    /// Awaitable form of [`Socket::send_message`]; usable from any runtime.
    pub async fn request(
        &self,
        target: NodeId,
        message: impl Into<P2PMessage>,
        timeout: Option<Duration>,
    ) -> P2PResponse {
        let (tx, rx) = oneshot::channel();
        self.send_message_with_timeout(target, message, timeout, move |r| {
            let _ = tx.send(r);
        });
        rx.await.unwrap_or_else(|_| P2PResponse::err(P2PError::Closed))
    }

    /// Fan `payload` out to every broadcast destination. Empty payloads are not sent.
    pub fn send_broadcast(&self, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        if self.inner.is_closed() || payload.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        self.inner.spawn(async move { inner.send_broadcast_now(&payload) });
    }

    /// Fire-and-forget datagram to one peer's actor address.
    pub fn send_datagram(&self, address: SocketAddrV4, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        if self.inner.is_closed() || payload.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        self.inner
            .spawn(async move { inner.send_datagram_now(address, &payload) });
    }

    /// Warm up a route: look the node up if unknown, otherwise ping its connections.
    pub fn connect_node(&self, target: NodeId) {
        if self.inner.is_closed() || target == self.inner.local_id {
            return;
        }
        let inner = self.inner.clone();
        self.inner.spawn(async move {
            let addresses = inner.registry.lock().get(&target).map(|n| n.addresses());
            match addresses {
                Some(addresses) => {
                    for addr in addresses {
                        inner.send_ping(addr, target);
                    }
                }
                None => {
                    if let Err(e) = inner.find_node(target).await {
                        debug!(node = %target, error = %e, "connect_node lookup failed");
                    }
                }
            }
        });
    }

    /// Replace the hello message (the configured prefix is kept in front of it).
    /// Messages longer than the hello limit are truncated.
    pub fn set_hello_message(&self, message: impl AsRef<[u8]>) {
        let prefix = self.inner.config.hello_prefix.as_bytes();
        let message = message.as_ref();
        let room = MAX_HELLO_SIZE.saturating_sub(prefix.len());
        if message.len() > room {
            warn!(len = message.len(), room, "hello message truncated");
        }
        let mut hello = prefix.to_vec();
        hello.extend_from_slice(&message[..message.len().min(room)]);
        *self.inner.hello.lock() = hello;
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("node", &self.inner.local_id)
            .field("port", &self.inner.bound_port)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// Bind the shared control socket, then the first actor port free for both UDP and TCP.
fn bind_sockets(config: &SocketConfig) -> Result<(UdpSocket, UdpSocket, TcpListener, u16), SocketError> {
    let control = SocketAddrV4::new(config.bind_address, config.port);
    let lobby = bind_udp(control, true).map_err(|source| SocketError::BindControl {
        port: config.port,
        source,
    })?;
    let first = config.port.saturating_add(1);
    let last = config.actor_port_max();
    let mut last_err = None;
    for port in first..=last {
        let addr = SocketAddrV4::new(config.bind_address, port);
        let actor = match bind_udp(addr, false) {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        match bind_tcp(addr) {
            Ok(listener) => return Ok((lobby, actor, listener, port)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(SocketError::Bind {
        first,
        last,
        source: last_err.unwrap_or_else(|| std::io::Error::other("empty port range")),
    })
}

fn bind_udp(addr: SocketAddrV4, shared: bool) -> std::io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if shared {
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
    }
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn bind_tcp(addr: SocketAddrV4) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Peer address as IPv4; the socket binds IPv4 only.
pub(crate) fn to_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(a) => Some(a),
        SocketAddr::V6(a) => a.ip().to_ipv4_mapped().map(|ip| SocketAddrV4::new(ip, a.port())),
    }
}
