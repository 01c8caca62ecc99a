//! UDP control channel: hello, lookup, address verification, ping, broadcast.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use lanlink_core::packet::{Packet, ReplyVerifyNode, VerifyNode};
use lanlink_core::registry::PingOutcome;
use lanlink_core::{
    answer_challenge, check_reply, ConnectionType, NodeId, P2PMessage, P2PRequest, PublicKey,
    ShortNodeId,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::socket::{to_v4, Inner};
use crate::stats::Stats;

const RECV_BUFFER_SIZE: usize = 65536;

/// One queued datagram. Fan-outs share the encoded bytes.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub to: SocketAddrV4,
    pub bytes: Bytes,
}

impl Inner {
    /// Drain the outbound queue onto the actor socket, waiting for writability.
    pub(crate) async fn send_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                m = rx.recv() => m,
            };
            let Some(Outbound { to, bytes }) = next else {
                break;
            };
            let sent = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = self.actor.send_to(&bytes, SocketAddr::V4(to)) => r,
            };
            match sent {
                Ok(_) => Stats::incr(&self.stats.datagrams_sent),
                Err(e) => trace!(addr = %to, error = %e, "udp send failed"),
            }
        }
        trace!("udp send loop stopped");
    }

    pub(crate) async fn recv_loop(self: &Arc<Self>, socket: &UdpSocket, name: &'static str) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok((n, from)) => self.handle_datagram(from, &buf[..n]),
                    // ICMP unreachable from an earlier send surfaces here on some platforms.
                    Err(e) => trace!(socket = name, error = %e, "udp recv error"),
                },
            }
        }
        trace!(socket = name, "udp receive loop stopped");
    }

    pub(crate) async fn hello_loop(self: Arc<Self>) {
        self.send_hello(true);
        let Some(interval) = self.config.hello_interval() else {
            return;
        };
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.send_hello(false),
            }
        }
    }

    /// Filter, decode and dispatch one datagram from either UDP socket.
    pub(crate) fn handle_datagram(self: &Arc<Self>, from: SocketAddr, data: &[u8]) {
        let Some(from) = to_v4(from) else {
            return;
        };
        if !self.targets.lock().is_valid_sender(from) {
            trace!(addr = %from, "dropping datagram from own or unspecified address");
            Stats::incr(&self.stats.datagrams_dropped);
            return;
        }
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                trace!(addr = %from, error = %e, "dropping malformed datagram");
                Stats::incr(&self.stats.datagrams_dropped);
                return;
            }
        };
        match packet {
            Packet::Hello {
                sender,
                need_reply,
                message,
            } => self.on_hello(from, sender, need_reply, message),
            Packet::ReplyHello { sender, message } => {
                if sender != self.local_id {
                    self.deliver_hello(from, sender, message);
                }
            }
            Packet::FindNode { target } => {
                if target == self.local_id {
                    trace!(addr = %from, "answering lookup");
                    self.send_packet(
                        from,
                        &Packet::ReplyFindNode {
                            sender_key: *self.keypair.public_key(),
                        },
                    );
                }
            }
            Packet::ReplyFindNode { sender_key } => {
                if sender_key.node_id() != self.local_id {
                    self.send_verify(from, &sender_key);
                }
            }
            Packet::VerifyNode(challenge) => self.on_verify_node(from, challenge),
            Packet::ReplyVerifyNode(reply) => self.on_reply_verify_node(from, reply),
            Packet::Ping { target, tick } => self.on_ping(from, target, tick),
            Packet::ReplyPing { sender, tick } => self.on_reply_ping(from, sender, tick),
            Packet::Broadcast { sender, payload } => {
                if sender != self.local_id {
                    self.handlers.broadcast(&request(sender, from, payload));
                }
            }
            Packet::Datagram { sender, payload } => {
                if sender != self.local_id {
                    self.handlers.datagram(&request(sender, from, payload));
                }
            }
        }
    }

    fn on_hello(self: &Arc<Self>, from: SocketAddrV4, sender: NodeId, need_reply: bool, message: Vec<u8>) {
        if sender == self.local_id {
            return;
        }
        if !self.deliver_hello(from, sender, message) {
            return;
        }
        // With the hello timer off the peer would otherwise never hear from us.
        if need_reply || self.config.hello_interval().is_none() {
            let reply = Packet::ReplyHello {
                sender: self.local_id,
                message: self.hello.lock().clone(),
            };
            self.send_packet(from, &reply);
        }
        let known_key = {
            let registry = self.registry.lock();
            registry
                .get(&sender)
                .filter(|n| n.bound_port == from.port())
                .map(|n| n.public_key)
        };
        if let Some(key) = known_key {
            self.send_verify(from, &key);
        }
    }

    /// Apply the prefix filter and pass the hello to the handler.
    /// Returns false if the prefix did not match.
    fn deliver_hello(&self, from: SocketAddrV4, sender: NodeId, message: Vec<u8>) -> bool {
        self.targets.lock().note_loopback_sender(from);
        let prefix = self.config.hello_prefix.as_bytes();
        let Some(body) = message.strip_prefix(prefix) else {
            trace!(addr = %from, "hello prefix mismatch");
            return false;
        };
        self.handlers.hello(&request(sender, from, body.to_vec()));
        true
    }

    fn on_verify_node(&self, from: SocketAddrV4, challenge: VerifyNode) {
        if challenge.target != self.local_id || challenge.sender_key.node_id() == self.local_id {
            return;
        }
        let key = self.shared_key(&challenge.sender_key);
        match answer_challenge(&key, &challenge, self.keypair.public_key()) {
            Ok(reply) => self.send_packet(from, &Packet::ReplyVerifyNode(reply)),
            Err(e) => warn!(addr = %from, error = %e, "answering verify failed"),
        }
    }

    fn on_reply_verify_node(&self, from: SocketAddrV4, reply: ReplyVerifyNode) {
        if reply.target != self.local_id {
            return;
        }
        let key = self.shared_key(&reply.sender_key);
        let now = self.now();
        let verified = match check_reply(
            &key,
            &self.local_id,
            &reply,
            from,
            now,
            self.config.find_timeout_ticks(),
        ) {
            Ok(v) => v,
            Err(e) => {
                debug!(addr = %from, error = %e, "rejecting verify reply");
                return;
            }
        };
        let outcome = self.registry.lock().upsert_verified(
            &verified,
            key,
            now,
            self.config.connection_timeout_ticks(),
        );
        Stats::incr(&self.stats.nodes_verified);
        if outcome.new_node {
            info!(node = %verified.node_id, addr = %from, delay = verified.delay, "node verified");
        } else {
            debug!(
                node = %verified.node_id,
                addr = %from,
                delay = verified.delay,
                default_changed = outcome.default_changed,
                "connection refreshed"
            );
        }
        self.handlers.connect_node(verified.node_id, from);
        self.wake_waiters(&verified.node_id);
    }

    fn on_ping(&self, from: SocketAddrV4, target: ShortNodeId, tick: u32) {
        if target != self.local_id.short() {
            return;
        }
        self.send_packet(
            from,
            &Packet::ReplyPing {
                sender: self.local_id,
                tick,
            },
        );
    }

    fn on_reply_ping(&self, from: SocketAddrV4, sender: NodeId, tick: u32) {
        if sender == self.local_id {
            return;
        }
        let outcome = self.registry.lock().refresh_ping(
            &sender,
            from,
            tick,
            self.now(),
            self.config.connection_timeout_ticks(),
        );
        match outcome {
            PingOutcome::Refreshed { default_changed } => {
                trace!(node = %sender, addr = %from, default_changed, "ping refreshed");
            }
            PingOutcome::UnknownAddress => {
                let key = self.registry.lock().get(&sender).map(|n| n.public_key);
                if let Some(key) = key {
                    self.send_verify(from, &key);
                }
            }
            PingOutcome::UnknownNode | PingOutcome::Expired => {
                trace!(node = %sender, addr = %from, ?outcome, "ignoring ping reply");
            }
        }
    }

    pub(crate) fn send_hello(&self, need_reply: bool) {
        let packet = Packet::Hello {
            sender: self.local_id,
            need_reply,
            message: self.hello.lock().clone(),
        };
        Stats::incr(&self.stats.hello_sent);
        self.send_to_targets(packet.encode());
    }

    pub(crate) fn send_find_node(&self, target: NodeId) {
        Stats::incr(&self.stats.find_node_sent);
        self.send_to_targets(Packet::FindNode { target }.encode());
    }

    /// Challenge `to` to prove it owns `remote_key`.
    pub(crate) fn send_verify(&self, to: SocketAddrV4, remote_key: &PublicKey) {
        let packet = Packet::VerifyNode(VerifyNode {
            target: remote_key.node_id(),
            tick: self.now(),
            claimed: to,
            sender_key: *self.keypair.public_key(),
        });
        Stats::incr(&self.stats.verify_sent);
        self.send_packet(to, &packet);
    }

    pub(crate) fn send_ping(&self, to: SocketAddrV4, target: NodeId) {
        let packet = Packet::Ping {
            target: target.short(),
            tick: self.now(),
        };
        Stats::incr(&self.stats.ping_sent);
        self.send_packet(to, &packet);
    }

    pub(crate) fn send_broadcast_now(&self, payload: &[u8]) {
        let packet = Packet::Broadcast {
            sender: self.local_id,
            payload: payload.to_vec(),
        };
        self.send_to_targets(packet.encode());
    }

    pub(crate) fn send_datagram_now(&self, to: SocketAddrV4, payload: &[u8]) {
        let packet = Packet::Datagram {
            sender: self.local_id,
            payload: payload.to_vec(),
        };
        self.send_packet(to, &packet);
    }

    fn send_packet(&self, to: SocketAddrV4, packet: &Packet) {
        self.send_raw(to, Bytes::from(packet.encode()));
    }

    fn send_to_targets(&self, bytes: Vec<u8>) {
        let bytes = Bytes::from(bytes);
        let destinations = self.targets.lock().destinations();
        for to in destinations {
            self.send_raw(to, bytes.clone());
        }
    }

    /// Queue for the send loop. The queue is gone only after shutdown.
    fn send_raw(&self, to: SocketAddrV4, bytes: Bytes) {
        if self.outbound.send(Outbound { to, bytes }).is_err() {
            trace!(addr = %to, "udp send after shutdown");
        }
    }
}

fn request(sender: NodeId, from: SocketAddrV4, payload: Vec<u8>) -> P2PRequest {
    P2PRequest {
        sender,
        connection_type: ConnectionType::Direct,
        remote_address: from,
        message: P2PMessage::new(payload),
    }
}
