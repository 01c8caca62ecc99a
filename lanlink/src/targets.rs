//! Where discovery broadcasts go, and which senders are accepted.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{LocalhostStrategy, SocketConfig};

const INTERFACE_REFRESH: Duration = Duration::from_secs(10);
const LOOPBACK_BROADCAST: Ipv4Addr = Ipv4Addr::new(127, 255, 255, 255);

#[derive(Debug)]
pub(crate) struct BroadcastTargets {
    control_port: u16,
    bound_port: u16,
    actor_port_max: u16,
    strategy: LocalhostStrategy,
    bind_address: Ipv4Addr,
    configured: Vec<Ipv4Addr>,
    /// Highest loopback actor port seen; port-scan sends go up to here.
    localhost_max: u16,
    local_ips: Vec<Ipv4Addr>,
    broadcasts: Vec<Ipv4Addr>,
    refreshed: Option<Instant>,
}

impl BroadcastTargets {
    pub(crate) fn new(config: &SocketConfig, bound_port: u16) -> Self {
        Self {
            control_port: config.port,
            bound_port,
            actor_port_max: config.actor_port_max(),
            strategy: config.localhost_strategy,
            bind_address: config.bind_address,
            configured: config.broadcaster_addresses.clone(),
            localhost_max: bound_port.saturating_sub(1),
            local_ips: Vec::new(),
            broadcasts: Vec::new(),
            refreshed: None,
        }
    }

    fn refresh_if_due(&mut self) {
        if self.refreshed.is_some_and(|at| at.elapsed() < INTERFACE_REFRESH) {
            return;
        }
        self.refreshed = Some(Instant::now());
        match get_if_addrs::get_if_addrs() {
            Ok(ifaces) => {
                self.local_ips.clear();
                self.broadcasts.clear();
                for iface in ifaces.iter().filter(|i| !i.is_loopback()) {
                    if let get_if_addrs::IfAddr::V4(v4) = &iface.addr {
                        self.local_ips.push(v4.ip);
                        if let Some(b) = v4.broadcast {
                            if !self.broadcasts.contains(&b) {
                                self.broadcasts.push(b);
                            }
                        }
                    }
                }
                debug!(
                    local = ?self.local_ips,
                    broadcast = ?self.broadcasts,
                    "refreshed interface addresses"
                );
            }
            Err(e) => warn!(error = %e, "enumerating interfaces failed"),
        }
    }

    /// Every destination a discovery broadcast should be sent to.
    pub(crate) fn destinations(&mut self) -> Vec<SocketAddrV4> {
        self.refresh_if_due();
        let mut out: Vec<SocketAddrV4> = if !self.configured.is_empty() {
            self.configured
                .iter()
                .map(|ip| SocketAddrV4::new(*ip, self.control_port))
                .collect()
        } else if !self.bind_address.is_unspecified() || self.broadcasts.is_empty() {
            vec![SocketAddrV4::new(Ipv4Addr::BROADCAST, self.control_port)]
        } else {
            self.broadcasts
                .iter()
                .map(|ip| SocketAddrV4::new(*ip, self.control_port))
                .collect()
        };
        match self.strategy {
            LocalhostStrategy::LoopbackBroadcast => {
                out.push(SocketAddrV4::new(LOOPBACK_BROADCAST, self.control_port));
            }
            LocalhostStrategy::PortScan => {
                let first = self.control_port.saturating_add(1);
                out.extend(
                    (first..=self.localhost_max)
                        .filter(|p| *p != self.bound_port)
                        .map(|p| SocketAddrV4::new(Ipv4Addr::LOCALHOST, p)),
                );
            }
        }
        out
    }

    /// A loopback peer's actor port extends the port-scan range.
    pub(crate) fn note_loopback_sender(&mut self, from: SocketAddrV4) {
        let port = from.port();
        if from.ip().is_loopback() && port > self.localhost_max && port <= self.actor_port_max {
            self.localhost_max = port;
        }
    }

    /// Reject packets that may be our own: from an unspecified address, from one
    /// of our interface addresses, or looped back from our own actor port.
    pub(crate) fn is_valid_sender(&mut self, from: SocketAddrV4) -> bool {
        let ip = *from.ip();
        if ip.is_unspecified() || from.port() == 0 {
            return false;
        }
        if ip.is_loopback() {
            return from.port() != self.bound_port;
        }
        self.refresh_if_due();
        !self.local_ips.contains(&ip)
    }

    #[cfg(test)]
    fn with_interfaces(mut self, local_ips: Vec<Ipv4Addr>, broadcasts: Vec<Ipv4Addr>) -> Self {
        self.local_ips = local_ips;
        self.broadcasts = broadcasts;
        self.refreshed = Some(Instant::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SocketConfig {
        SocketConfig {
            port: 41000,
            port_count: 10,
            ..SocketConfig::default()
        }
    }

    #[test]
    fn port_scan_covers_lower_ports_then_grows() {
        let mut t = BroadcastTargets::new(&config(), 41003)
            .with_interfaces(vec![Ipv4Addr::new(192, 168, 1, 5)], vec![Ipv4Addr::new(192, 168, 1, 255)]);
        let d = t.destinations();
        assert_eq!(d[0], SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 255), 41000));
        let loopback: Vec<u16> = d.iter().filter(|a| a.ip().is_loopback()).map(|a| a.port()).collect();
        assert_eq!(loopback, vec![41001, 41002]);

        t.note_loopback_sender(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 41005));
        t.note_loopback_sender(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 41050));
        let loopback: Vec<u16> = t
            .destinations()
            .iter()
            .filter(|a| a.ip().is_loopback())
            .map(|a| a.port())
            .collect();
        assert_eq!(loopback, vec![41001, 41002, 41004, 41005]);
    }

    #[test]
    fn configured_addresses_win() {
        let cfg = SocketConfig {
            broadcaster_addresses: vec![Ipv4Addr::new(10, 1, 255, 255)],
            localhost_strategy: LocalhostStrategy::LoopbackBroadcast,
            ..config()
        };
        let mut t = BroadcastTargets::new(&cfg, 41001).with_interfaces(vec![], vec![]);
        assert_eq!(
            t.destinations(),
            vec![
                SocketAddrV4::new(Ipv4Addr::new(10, 1, 255, 255), 41000),
                SocketAddrV4::new(LOOPBACK_BROADCAST, 41000),
            ]
        );
    }

    #[test]
    fn sender_filter() {
        let mut t = BroadcastTargets::new(&config(), 41003)
            .with_interfaces(vec![Ipv4Addr::new(192, 168, 1, 5)], vec![]);
        assert!(!t.is_valid_sender(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 41001)));
        assert!(!t.is_valid_sender(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 41002)));
        assert!(!t.is_valid_sender(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 41003)));
        assert!(t.is_valid_sender(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 41004)));
        assert!(t.is_valid_sender(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 6), 41002)));
    }
}
