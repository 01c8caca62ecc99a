//! Protocol counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub hello_sent: AtomicU64,
    pub find_node_sent: AtomicU64,
    pub verify_sent: AtomicU64,
    pub nodes_verified: AtomicU64,
    pub ping_sent: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub tcp_dials: AtomicU64,
    pub tcp_handshakes: AtomicU64,
    pub pooled_reuses: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            hello_sent: load(&self.hello_sent),
            find_node_sent: load(&self.find_node_sent),
            verify_sent: load(&self.verify_sent),
            nodes_verified: load(&self.nodes_verified),
            ping_sent: load(&self.ping_sent),
            datagrams_sent: load(&self.datagrams_sent),
            datagrams_dropped: load(&self.datagrams_dropped),
            tcp_dials: load(&self.tcp_dials),
            tcp_handshakes: load(&self.tcp_handshakes),
            pooled_reuses: load(&self.pooled_reuses),
            messages_sent: load(&self.messages_sent),
            messages_received: load(&self.messages_received),
        }
    }
}

/// Point-in-time copy of the socket's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hello_sent: u64,
    pub find_node_sent: u64,
    pub verify_sent: u64,
    pub nodes_verified: u64,
    pub ping_sent: u64,
    /// UDP datagrams handed to the kernel.
    pub datagrams_sent: u64,
    /// Datagrams rejected by the sender filter or the packet decoder.
    pub datagrams_dropped: u64,
    pub tcp_dials: u64,
    /// InitTcp frames sent by this socket.
    pub tcp_handshakes: u64,
    pub pooled_reuses: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}
