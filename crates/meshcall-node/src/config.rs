use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Node configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// IP address to listen on (default "::", which also accepts IPv4).
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for signaling; peers dial the same port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Encrypted database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Wrapping key for the identity secret.
    #[serde(default = "default_keystore_path")]
    pub keystore_path: PathBuf,

    /// Read timeout for a ping reply.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Read timeout for the first message on an inbound socket.
    #[serde(default = "default_signal_timeout_ms")]
    pub signal_timeout_ms: u64,

    /// How long a dialed peer has to answer or decline.
    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,

    /// How long an incoming call rings before it counts as missed.
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,

    /// Ping interval on a connected call (at least one second).
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// A connected call ends when nothing arrives from the peer for this long.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_host() -> String {
    "::".into()
}

fn default_port() -> u16 {
    10001
}

fn default_database_path() -> PathBuf {
    data_dir().join("database.bin")
}

fn default_keystore_path() -> PathBuf {
    data_dir().join("identity.key")
}

fn default_ping_timeout_ms() -> u64 {
    3000
}

fn default_signal_timeout_ms() -> u64 {
    5000
}

fn default_answer_timeout_secs() -> u64 {
    60
}

fn default_ring_timeout_secs() -> u64 {
    45
}

fn default_keepalive_interval_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    20
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            keystore_path: default_keystore_path(),
            ping_timeout_ms: default_ping_timeout_ms(),
            signal_timeout_ms: default_signal_timeout_ms(),
            answer_timeout_secs: default_answer_timeout_secs(),
            ring_timeout_secs: default_ring_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl NodeConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            ping: Duration::from_millis(self.ping_timeout_ms),
            signal: Duration::from_millis(self.signal_timeout_ms),
            answer: Duration::from_secs(self.answer_timeout_secs),
            ring: Duration::from_secs(self.ring_timeout_secs),
            keepalive: Duration::from_secs(self.keepalive_interval_secs.max(1)),
            idle: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Timeouts applied by the pinger and call signaling.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub ping: Duration,
    pub signal: Duration,
    pub answer: Duration,
    pub ring: Duration,
    pub keepalive: Duration,
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        NodeConfig::default().timeouts()
    }
}

/// Per-user data directory (`~/.local/share/meshcall` on Linux).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshcall")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = NodeConfig::default();
        assert_eq!(config.host, "::");
        assert_eq!(config.port, 10001);
        assert_eq!(config.ping_timeout_ms, 3000);
        assert!(config.database_path.ends_with("meshcall/database.bin"));
        assert_eq!(config.timeouts().ping, Duration::from_secs(3));
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            host = "0.0.0.0"
            port = 12000
            database_path = "/tmp/mc/db.bin"
            ring_timeout_secs = 10
        "#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 12000);
        assert_eq!(config.database_path, PathBuf::from("/tmp/mc/db.bin"));
        assert_eq!(config.ring_timeout_secs, 10);
        assert_eq!(config.answer_timeout_secs, 60);
    }

    #[test]
    fn empty_toml_is_default() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, 10001);
        assert_eq!(config.signal_timeout_ms, 5000);
        assert_eq!(config.timeouts().idle, Duration::from_secs(20));
    }

    #[test]
    fn keepalive_never_zero() {
        let config: NodeConfig = toml::from_str("keepalive_interval_secs = 0").unwrap();
        assert_eq!(config.timeouts().keepalive, Duration::from_secs(1));
    }
}
