use crate::constants::{DEFAULT_BIND_HOST, DEFAULT_POLL_INTERVAL_MS};
use crate::error::{NodeError, Result};
use ledger_core::constants::{DEFAULT_CANCEL_CHECK_INTERVAL, HASH_HEX_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Constructor-time settings for one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub client_port: u16,
    pub peer_port: u16,
    /// Peer endpoints (`host:port`) of every node in the network, this one included.
    pub peers: Vec<String>,
    /// Position of this node in `peers`; that entry is skipped when broadcasting or syncing.
    pub index: usize,
    pub difficulty: usize,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: u64,
    /// Upper bound on in-flight connection handlers per listener. `None` accepts without limit.
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
    #[serde(default = "default_sync_on_start")]
    pub sync_on_start: bool,
}

fn default_bind_host() -> String {
    DEFAULT_BIND_HOST.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_cancel_check_interval() -> u64 {
    DEFAULT_CANCEL_CHECK_INTERVAL
}

fn default_sync_on_start() -> bool {
    true
}

impl NodeConfig {
    pub fn new(
        client_port: u16,
        peer_port: u16,
        peers: Vec<String>,
        index: usize,
        difficulty: usize,
    ) -> Self {
        Self {
            client_port,
            peer_port,
            peers,
            index,
            difficulty,
            bind_host: default_bind_host(),
            poll_interval_ms: default_poll_interval_ms(),
            cancel_check_interval: default_cancel_check_interval(),
            max_connections: None,
            io_timeout_ms: None,
            sync_on_start: default_sync_on_start(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.index >= self.peers.len() {
            return Err(NodeError::InvalidConfig(format!(
                "index {} is outside the {} configured peers",
                self.index,
                self.peers.len()
            )));
        }
        if self.difficulty > HASH_HEX_SIZE {
            return Err(NodeError::InvalidConfig(format!(
                "difficulty {} exceeds {HASH_HEX_SIZE}",
                self.difficulty
            )));
        }
        if self.max_connections == Some(0) {
            return Err(NodeError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Every peer address except this node's own, in index order.
    pub fn other_peers(&self) -> impl Iterator<Item = &str> {
        self.peers
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.index)
            .map(|(_, addr)| addr.as_str())
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn client_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.client_port)
    }

    pub fn peer_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.peer_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<String> {
        vec![
            "127.0.0.1:5000".to_string(),
            "127.0.0.1:5001".to_string(),
            "127.0.0.1:5002".to_string(),
        ]
    }

    #[test]
    fn defaults_example() {
        let config = NodeConfig::new(6000, 5000, peers(), 0, 4);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.max_connections.is_none());
        assert!(config.io_timeout().is_none());
        assert!(config.sync_on_start);
        assert_eq!(config.client_bind_addr(), "127.0.0.1:6000");
        assert_eq!(config.peer_bind_addr(), "127.0.0.1:5000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn other_peers_skips_self() {
        let config = NodeConfig::new(6001, 5001, peers(), 1, 4);
        let others: Vec<_> = config.other_peers().collect();
        assert_eq!(others, vec!["127.0.0.1:5000", "127.0.0.1:5002"]);
    }

    #[test]
    fn validate_rejects_bad_index() {
        let config = NodeConfig::new(6000, 5000, peers(), 3, 4);
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_bad_difficulty() {
        let config = NodeConfig::new(6000, 5000, peers(), 0, 65);
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn deserialize_fills_defaults() {
        let json = r#"{"client_port":6000,"peer_port":5000,
            "peers":["127.0.0.1:5000"],"index":0,"difficulty":3}"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.cancel_check_interval, 1024);
        assert!(config.sync_on_start);
        assert_eq!(config.difficulty, 3);
    }
}
