//! Known peers, their verified connections, and the default-connection policy.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::P2PError;
use crate::identity::{NodeId, PublicKey};
use crate::tick;
use crate::verify::Verified;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Verified path to the peer's actor port at one IPv4 address.
    Direct { address: SocketAddrV4 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub kind: ConnectionKind,
    /// Tick of the last successful verify or ping.
    pub last_ping: u32,
    /// Last measured round trip, ms.
    pub delay: u32,
}

impl Connection {
    pub fn direct(address: SocketAddrV4, last_ping: u32, delay: u32) -> Self {
        Self {
            kind: ConnectionKind::Direct { address },
            last_ping,
            delay,
        }
    }

    pub fn address(&self) -> SocketAddrV4 {
        match self.kind {
            ConnectionKind::Direct { address } => address,
        }
    }

    pub fn is_valid(&self, now: u32, timeout: u32) -> bool {
        tick::check_delay(self.last_ping, now, timeout)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub public_key: PublicKey,
    pub encryption_key: [u8; 32],
    /// Actor port the peer was last verified on; its TCP listener shares the number.
    pub bound_port: u16,
    /// Key into `connections` of the preferred connection.
    pub default: Option<Ipv4Addr>,
    pub connections: HashMap<Ipv4Addr, Connection>,
}

impl Node {
    fn new(public_key: PublicKey, encryption_key: [u8; 32], bound_port: u16) -> Self {
        Self {
            id: public_key.node_id(),
            public_key,
            encryption_key,
            bound_port,
            default: None,
            connections: HashMap::new(),
        }
    }

    pub fn default_connection(&self) -> Option<&Connection> {
        self.default.and_then(|ip| self.connections.get(&ip))
    }

    /// Make the connection at `candidate` the default unless the current default
    /// is still valid and at least as fast. Returns true if the default changed.
    pub fn select_default_if_better(&mut self, candidate: Ipv4Addr, now: u32, timeout: u32) -> bool {
        let Some(cand) = self.connections.get(&candidate) else {
            return false;
        };
        if self.default == Some(candidate) {
            return false;
        }
        if let Some(current) = self.default_connection() {
            if current.is_valid(now, timeout) && current.delay <= cand.delay {
                return false;
            }
        }
        self.default = Some(candidate);
        true
    }

    /// The default connection, if it is still within the timeout.
    pub fn usable_connection(&self, now: u32, timeout: u32) -> Result<&Connection, P2PError> {
        match self.default_connection() {
            Some(conn) if conn.is_valid(now, timeout) => Ok(conn),
            _ => Err(P2PError::ConnectionStale),
        }
    }

    /// Addresses of every connection, for re-pinging.
    pub fn addresses(&self) -> Vec<SocketAddrV4> {
        self.connections.values().map(Connection::address).collect()
    }
}

/// What a caller needs to open a TCP exchange with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub encryption_key: [u8; 32],
    /// Peer IP with the node's bound port.
    pub address: SocketAddrV4,
    pub delay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub new_node: bool,
    pub new_connection: bool,
    pub default_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Refreshed { default_changed: bool },
    /// Known node, but no connection at that IP; it should be verified.
    UnknownAddress,
    UnknownNode,
    /// Echoed tick older than the connection timeout.
    Expired,
}

#[derive(Debug, Default)]
pub struct Registry {
    nodes: HashMap<NodeId, Node>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Record a verified peer: create the node on first sight, refresh the
    /// connection for the replying address, and re-run the selection policy.
    pub fn upsert_verified(
        &mut self,
        verified: &Verified,
        encryption_key: [u8; 32],
        now: u32,
        timeout: u32,
    ) -> UpsertOutcome {
        let port = verified.address.port();
        let mut new_node = false;
        let node = self.nodes.entry(verified.node_id).or_insert_with(|| {
            new_node = true;
            Node::new(verified.public_key, encryption_key, port)
        });
        if node.bound_port != port {
            // The peer rebound; old connections point at a dead port.
            node.bound_port = port;
            node.connections.clear();
            node.default = None;
        }
        let ip = *verified.address.ip();
        let new_connection = !node.connections.contains_key(&ip);
        node.connections.insert(
            ip,
            Connection::direct(verified.address, now, verified.delay),
        );
        let default_changed = node.select_default_if_better(ip, now, timeout);
        UpsertOutcome {
            new_node,
            new_connection,
            default_changed,
        }
    }

    /// Apply a ReplyPing from `from` echoing `sent_tick`.
    pub fn refresh_ping(
        &mut self,
        id: &NodeId,
        from: SocketAddrV4,
        sent_tick: u32,
        now: u32,
        timeout: u32,
    ) -> PingOutcome {
        let Some(node) = self.nodes.get_mut(id) else {
            return PingOutcome::UnknownNode;
        };
        if !tick::check_delay(sent_tick, now, timeout) {
            return PingOutcome::Expired;
        }
        let ip = *from.ip();
        match node.connections.get_mut(&ip) {
            Some(conn) if conn.address() == from => {
                conn.last_ping = now;
                conn.delay = tick::elapsed(sent_tick, now);
            }
            _ => return PingOutcome::UnknownAddress,
        }
        PingOutcome::Refreshed {
            default_changed: node.select_default_if_better(ip, now, timeout),
        }
    }

    /// Resolve the route for a send. `NodeNotFound` if we never verified the
    /// node, `ConnectionStale` if its default has not been refreshed in time.
    pub fn route(&self, id: &NodeId, now: u32, timeout: u32) -> Result<Route, P2PError> {
        let node = self.nodes.get(id).ok_or(P2PError::NodeNotFound)?;
        let conn = node.usable_connection(now, timeout)?;
        Ok(Route {
            node_id: node.id,
            public_key: node.public_key,
            encryption_key: node.encryption_key,
            address: SocketAddrV4::new(*conn.address().ip(), node.bound_port),
            delay: conn.delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    const TIMEOUT: u32 = 60_000;

    fn verified(kp: &KeyPair, ip: [u8; 4], delay: u32) -> Verified {
        Verified {
            public_key: *kp.public_key(),
            node_id: kp.node_id(),
            address: SocketAddrV4::new(Ipv4Addr::from(ip), 39001),
            delay,
        }
    }

    #[test]
    fn first_verify_creates_node_and_default() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        let out = reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 5), [0; 32], 100, TIMEOUT);
        assert!(out.new_node && out.new_connection && out.default_changed);
        let route = reg.route(&kp.node_id(), 200, TIMEOUT).unwrap();
        assert_eq!(route.address, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 39001));
        assert_eq!(route.delay, 5);
    }

    #[test]
    fn lower_delay_default_is_kept() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 5), [0; 32], 100, TIMEOUT);
        let out = reg.upsert_verified(&verified(&kp, [192, 168, 0, 9], 40), [0; 32], 110, TIMEOUT);
        assert!(out.new_connection);
        assert!(!out.default_changed);
        assert_eq!(reg.get(&kp.node_id()).unwrap().default, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn equal_delay_keeps_existing_default() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 7), [0; 32], 100, TIMEOUT);
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 2], 7), [0; 32], 100, TIMEOUT);
        assert_eq!(reg.get(&kp.node_id()).unwrap().default, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn strictly_faster_candidate_wins() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 30), [0; 32], 100, TIMEOUT);
        let out = reg.upsert_verified(&verified(&kp, [10, 0, 0, 2], 3), [0; 32], 100, TIMEOUT);
        assert!(out.default_changed);
        assert_eq!(reg.get(&kp.node_id()).unwrap().default, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn stale_default_is_replaced_by_slower_candidate() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 1), [0; 32], 100, TIMEOUT);
        let out = reg.upsert_verified(
            &verified(&kp, [10, 0, 0, 2], 50),
            [0; 32],
            100 + TIMEOUT,
            TIMEOUT,
        );
        assert!(out.default_changed);
    }

    #[test]
    fn stale_default_route_fails() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 1), [0; 32], 100, TIMEOUT);
        assert_eq!(
            reg.route(&kp.node_id(), 100 + TIMEOUT, TIMEOUT),
            Err(P2PError::ConnectionStale)
        );
        assert_eq!(
            reg.route(&KeyPair::generate().node_id(), 100, TIMEOUT),
            Err(P2PError::NodeNotFound)
        );
    }

    #[test]
    fn ping_refreshes_matching_connection() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        let v = verified(&kp, [10, 0, 0, 1], 9);
        reg.upsert_verified(&v, [0; 32], 100, TIMEOUT);
        assert_eq!(
            reg.refresh_ping(&kp.node_id(), v.address, 50_000, 50_004, TIMEOUT),
            PingOutcome::Refreshed { default_changed: false }
        );
        let node = reg.get(&kp.node_id()).unwrap();
        let conn = node.default_connection().unwrap();
        assert_eq!((conn.last_ping, conn.delay), (50_004, 4));
        assert!(reg.route(&kp.node_id(), 100 + TIMEOUT, TIMEOUT).is_ok());
    }

    #[test]
    fn ping_from_unknown_ip_needs_verification() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 9), [0; 32], 100, TIMEOUT);
        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 39001);
        assert_eq!(
            reg.refresh_ping(&kp.node_id(), other, 100, 101, TIMEOUT),
            PingOutcome::UnknownAddress
        );
        assert_eq!(
            reg.refresh_ping(&KeyPair::generate().node_id(), other, 100, 101, TIMEOUT),
            PingOutcome::UnknownNode
        );
    }

    #[test]
    fn rebound_port_drops_old_connections() {
        let kp = KeyPair::generate();
        let mut reg = Registry::new();
        reg.upsert_verified(&verified(&kp, [10, 0, 0, 1], 9), [0; 32], 100, TIMEOUT);
        let mut moved = verified(&kp, [10, 0, 0, 2], 20);
        moved.address.set_port(39002);
        reg.upsert_verified(&moved, [0; 32], 200, TIMEOUT);
        let node = reg.get(&kp.node_id()).unwrap();
        assert_eq!(node.bound_port, 39002);
        assert_eq!(node.connections.len(), 1);
        assert_eq!(node.default, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
