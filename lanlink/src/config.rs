//! Socket configuration: defaults, config file, environment overrides.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Smallest accepted hello interval (0 disables the timer).
pub const MIN_HELLO_INTERVAL_MS: u64 = 100;
pub const MIN_FIND_TIMEOUT_MS: u64 = 100;
pub const MIN_STREAM_TIMEOUT_MS: u64 = 100;
pub const MIN_MESSAGE_BUFFER_SIZE: usize = 1024;
/// Hello prefix plus message must fit comfortably in one datagram.
pub const MAX_HELLO_SIZE: usize = 1024;

/// How same-host peers are reached, since unicast to a shared control port
/// reaches only one of the processes bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocalhostStrategy {
    /// Unicast to every loopback actor port up to the highest seen.
    #[default]
    PortScan,
    /// Send once to 127.255.255.255 on the control port.
    LoopbackBroadcast,
}

/// Socket configuration. File: ~/.config/lanlink/config.toml or /etc/lanlink/config.toml.
/// Env overrides: LANLINK_PORT, LANLINK_PORT_COUNT, LANLINK_KEY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,
    /// Control (lobby) port shared by every node on the LAN (default 39000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Actor ports tried are port+1 ..= port+port_count.
    #[serde(default = "default_port_count")]
    pub port_count: u16,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_hello_interval_ms")]
    pub hello_interval_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_find_timeout_ms")]
    pub find_timeout_ms: u64,
    #[serde(default = "default_find_retries")]
    pub find_retries: u32,
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_message_buffer_size")]
    pub message_buffer_size: usize,
    /// Hellos not starting with this prefix are ignored.
    #[serde(default)]
    pub hello_prefix: String,
    #[serde(default)]
    pub hello_message: String,
    /// Broadcast destinations to use instead of enumerating interfaces.
    #[serde(default)]
    pub broadcaster_addresses: Vec<Ipv4Addr>,
    #[serde(default)]
    pub localhost_strategy: LocalhostStrategy,
    /// Hex-encoded 32-byte secret. Generated when absent.
    #[serde(default)]
    pub key: Option<String>,
}

fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_port() -> u16 {
    39000
}
fn default_port_count() -> u16 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_hello_interval_ms() -> u64 {
    10_000
}
fn default_connection_timeout_ms() -> u64 {
    60_000
}
fn default_find_timeout_ms() -> u64 {
    10_000
}
fn default_find_retries() -> u32 {
    3
}
fn default_stream_timeout_ms() -> u64 {
    60_000
}
fn default_max_message_size() -> usize {
    100 * 1024 * 1024
}
fn default_message_buffer_size() -> usize {
    64 * 1024
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            port_count: default_port_count(),
            auto_start: true,
            hello_interval_ms: default_hello_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            find_timeout_ms: default_find_timeout_ms(),
            find_retries: default_find_retries(),
            stream_timeout_ms: default_stream_timeout_ms(),
            max_message_size: default_max_message_size(),
            message_buffer_size: default_message_buffer_size(),
            hello_prefix: String::new(),
            hello_message: String::new(),
            broadcaster_addresses: Vec::new(),
            localhost_strategy: LocalhostStrategy::default(),
            key: None,
        }
    }
}

impl SocketConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Clamp values to their minimums so the runtime never sees a zero timeout.
    pub fn normalized(mut self) -> Self {
        if self.hello_interval_ms != 0 {
            self.hello_interval_ms = self.hello_interval_ms.max(MIN_HELLO_INTERVAL_MS);
        }
        self.find_timeout_ms = self.find_timeout_ms.max(MIN_FIND_TIMEOUT_MS);
        self.connection_timeout_ms = self.connection_timeout_ms.max(self.find_timeout_ms);
        self.stream_timeout_ms = self.stream_timeout_ms.max(MIN_STREAM_TIMEOUT_MS);
        self.max_message_size = self.max_message_size.clamp(1, u32::MAX as usize / 2);
        self.message_buffer_size = self.message_buffer_size.max(MIN_MESSAGE_BUFFER_SIZE);
        let room = u16::MAX - self.port.min(u16::MAX - 1);
        self.port_count = self.port_count.clamp(1, room);
        self
    }

    /// `None` when the periodic hello is disabled.
    pub fn hello_interval(&self) -> Option<Duration> {
        (self.hello_interval_ms != 0).then(|| Duration::from_millis(self.hello_interval_ms))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn find_timeout(&self) -> Duration {
        Duration::from_millis(self.find_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    /// Connection timeout in ticks.
    pub fn connection_timeout_ticks(&self) -> u32 {
        self.connection_timeout_ms.min(u32::MAX as u64) as u32
    }

    /// Verify window in ticks.
    pub fn find_timeout_ticks(&self) -> u32 {
        self.find_timeout_ms.min(u32::MAX as u64) as u32
    }

    /// Highest actor port in the range.
    pub fn actor_port_max(&self) -> u16 {
        self.port.saturating_add(self.port_count)
    }

    fn apply_env(&mut self) {
        if let Ok(s) = std::env::var("LANLINK_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.port = p;
            }
        }
        if let Ok(s) = std::env::var("LANLINK_PORT_COUNT") {
            if let Ok(n) = s.parse::<u16>() {
                self.port_count = n;
            }
        }
        if let Ok(s) = std::env::var("LANLINK_KEY") {
            if !s.trim().is_empty() {
                self.key = Some(s);
            }
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> Result<SocketConfig, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => SocketConfig::default(),
    };
    c.apply_env();
    Ok(c)
}

pub fn load_file(path: &Path) -> Result<SocketConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    SocketConfig::from_toml_str(&s)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanlink/config.toml"));
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c = SocketConfig::from_toml_str("").unwrap();
        assert_eq!(c.port, 39000);
        assert_eq!(c.port_count, 1000);
        assert!(c.auto_start);
        assert_eq!(c.find_retries, 3);
        assert_eq!(c.max_message_size, 100 * 1024 * 1024);
        assert_eq!(c.localhost_strategy, LocalhostStrategy::PortScan);
        assert_eq!(c.hello_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn parses_fields() {
        let c = SocketConfig::from_toml_str(
            r#"
            port = 40100
            port_count = 20
            hello_interval_ms = 0
            hello_prefix = "app/"
            broadcaster_addresses = ["192.168.1.255"]
            localhost_strategy = "loopback_broadcast"
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 40100);
        assert_eq!(c.actor_port_max(), 40120);
        assert_eq!(c.hello_interval(), None);
        assert_eq!(c.broadcaster_addresses, vec![Ipv4Addr::new(192, 168, 1, 255)]);
        assert_eq!(c.localhost_strategy, LocalhostStrategy::LoopbackBroadcast);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(matches!(
            SocketConfig::from_toml_str("prot = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn normalized_clamps_minimums() {
        let c = SocketConfig {
            hello_interval_ms: 5,
            find_timeout_ms: 1,
            connection_timeout_ms: 2,
            stream_timeout_ms: 0,
            message_buffer_size: 10,
            port: 65530,
            port_count: 1000,
            ..SocketConfig::default()
        }
        .normalized();
        assert_eq!(c.hello_interval_ms, MIN_HELLO_INTERVAL_MS);
        assert_eq!(c.find_timeout_ms, MIN_FIND_TIMEOUT_MS);
        assert_eq!(c.connection_timeout_ms, MIN_FIND_TIMEOUT_MS);
        assert_eq!(c.stream_timeout_ms, MIN_STREAM_TIMEOUT_MS);
        assert_eq!(c.message_buffer_size, MIN_MESSAGE_BUFFER_SIZE);
        assert_eq!(c.actor_port_max(), u16::MAX);
    }

    #[test]
    fn zero_hello_interval_stays_disabled() {
        let c = SocketConfig {
            hello_interval_ms: 0,
            ..SocketConfig::default()
        }
        .normalized();
        assert_eq!(c.hello_interval(), None);
    }
}
