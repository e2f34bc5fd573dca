use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use cxo_crypto::PubKey;
use cxo_skyobject::ContainerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Configuration of a [`Node`](crate::Node).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to accept TCP connections on.
    pub listen: Option<SocketAddr>,
    /// Peers to connect to on start.
    pub peers: Vec<SocketAddr>,
    /// Hex public keys of feeds to replicate.
    pub feeds: Vec<String>,
    /// Cap on requests in flight per connection.
    pub max_outstanding_requests: usize,
    pub request_timeout_ms: u64,
    /// Re-sends of a timed-out request before the peer is given up on.
    pub max_retries: u32,
    /// Capacity of each connection's outgoing queue.
    pub queue_capacity: usize,
    /// How long a full outgoing queue may block before the connection is
    /// dropped.
    pub enqueue_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub disconnect_on_violation: bool,
    /// Answer feed listing requests.
    pub public: bool,
    pub max_message_size: usize,
    pub container: ContainerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            feeds: Vec::new(),
            max_outstanding_requests: 64,
            request_timeout_ms: 10_000,
            max_retries: 3,
            queue_capacity: 256,
            enqueue_timeout_ms: 5_000,
            tick_interval_ms: 250,
            disconnect_on_violation: true,
            public: false,
            max_message_size: cxo_protocol::MAX_MESSAGE_SIZE,
            container: ContainerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> SyncResult<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn validate(&self) -> SyncResult<()> {
        let positive = [
            ("max_outstanding_requests", self.max_outstanding_requests as u64),
            ("request_timeout_ms", self.request_timeout_ms),
            ("queue_capacity", self.queue_capacity as u64),
            ("enqueue_timeout_ms", self.enqueue_timeout_ms),
            ("tick_interval_ms", self.tick_interval_ms),
            ("max_message_size", self.max_message_size as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::Config(format!("{name} must be positive")));
            }
        }
        self.feed_keys()?;
        self.container
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    /// The configured feeds, parsed.
    pub fn feed_keys(&self) -> SyncResult<Vec<PubKey>> {
        self.feeds
            .iter()
            .map(|hex| {
                PubKey::from_hex(hex)
                    .map_err(|e| SyncError::Config(format!("feed {hex:?}: {e}")))
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use cxo_crypto::SecretKey;

    use super::*;

    #[test]
    fn default_config() {
        let c = NodeConfig::default();
        assert!(c.listen.is_none());
        assert_eq!(c.max_outstanding_requests, 64);
        assert_eq!(c.request_timeout(), Duration::from_secs(10));
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.queue_capacity, 256);
        assert!(c.disconnect_on_violation);
        assert!(!c.public);
        assert_eq!(c.max_message_size, 16 * 1024 * 1024);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let pk = SecretKey::generate().pub_key();
        let text = format!(
            r#"
listen = "127.0.0.1:8870"
peers = ["10.0.0.2:8870"]
feeds = ["{}"]
public = true

[container]
keep_roots = 3
"#,
            pk.to_hex()
        );
        let c = NodeConfig::from_toml_str(&text).unwrap();
        assert_eq!(c.listen, Some("127.0.0.1:8870".parse().unwrap()));
        assert_eq!(c.peers.len(), 1);
        assert_eq!(c.feed_keys().unwrap(), vec![pk]);
        assert!(c.public);
        assert_eq!(c.container.keep_roots, Some(3));
        assert_eq!(c.container.refs_degree, 16);
        assert_eq!(c.queue_capacity, 256);
    }

    #[test]
    fn toml_roundtrip() {
        let c = NodeConfig {
            public: true,
            max_retries: 5,
            ..NodeConfig::default()
        };
        let text = c.to_toml_string().unwrap();
        assert_eq!(NodeConfig::from_toml_str(&text).unwrap(), c);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            NodeConfig::from_toml_str("queue_capacity = 0"),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("feeds = [\"not-hex\"]"),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("[container]\nrefs_degree = 1"),
            Err(SyncError::Config(_))
        ));
        assert!(NodeConfig::from_toml_str("max_retries = \"x\"").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "tick_interval_ms = 50\n").unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap().tick_interval_ms, 50);
        assert!(NodeConfig::load(&dir.path().join("absent.toml")).is_err());
    }
}
