//! Configuration for areakvd

use areakv_core::{AreaId, NodeId};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration and request validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("node id cannot be empty")]
    EmptyNodeId,
    #[error("at least one area must be configured")]
    NoAreas,
    #[error("duplicate area config id: {0}")]
    DuplicateArea(AreaId),
    #[error("area {area}: key_ttl_ms should be a finite positive number, got {ttl_ms}")]
    InvalidKeyTtl { area: AreaId, ttl_ms: i64 },
    #[error("area {area}: ttl_decrement_ms must be below key_ttl_ms")]
    InvalidTtlDecrement { area: AreaId },
    #[error("area {area}: tombstone_grace_ms should be > 0")]
    InvalidTombstoneGrace { area: AreaId },
    #[error("area {area}: flood {field} should be > 0")]
    InvalidFloodRate { area: AreaId, field: &'static str },
    #[error("peer {peer} references unknown area {area}")]
    UnknownPeerArea { area: AreaId, peer: NodeId },
    #[error("{field} should be > 0")]
    ZeroSetting { field: &'static str },
    #[error("invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("key {key}: ttl {ttl_ms} is neither positive nor infinite")]
    InvalidEntryTtl { key: String, ttl_ms: i64 },
}

/// areakvd - replicated area key-value store daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "areakvd")]
#[command(about = "Replicated, area-partitioned key-value store for link-state control planes")]
pub struct Cli {
    /// Path to the JSON store configuration
    #[arg(short, long, env = "AREAKV_CONFIG")]
    pub config: PathBuf,

    /// Override the configured node id
    #[arg(long, env = "AREAKV_NODE_ID")]
    pub node_id: Option<String>,

    /// Override the configured listen address
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Cli {
    /// Load the configuration file and apply command-line overrides
    pub fn load_config(&self) -> anyhow::Result<KvStoreConfig> {
        let mut config = KvStoreConfig::load(&self.config)?;
        if let Some(node_id) = &self.node_id {
            config.node_id = NodeId::from(node_id.as_str());
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Flood rate limit for one area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodRate {
    pub messages_per_sec: u32,
    pub burst_size: u32,
}

/// Per-area parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaConfig {
    pub area_id: AreaId,

    /// Lease for self-originated persistent keys
    #[serde(default = "default_key_ttl_ms")]
    pub key_ttl_ms: i64,

    /// Subtracted from the remaining TTL on every flood hop
    #[serde(default = "default_ttl_decrement_ms")]
    pub ttl_decrement_ms: i64,

    /// How long an expired tombstone lingers before purge
    #[serde(default = "default_tombstone_grace_ms")]
    pub tombstone_grace_ms: i64,

    #[serde(default)]
    pub flood_rate: Option<FloodRate>,

    #[serde(default)]
    pub enable_flood_optimization: bool,

    /// Offer this node as a flood root candidate
    #[serde(default = "default_true")]
    pub is_flood_root: bool,

    /// Designated flood root; when unset the smallest reachable candidate wins
    #[serde(default)]
    pub flood_root: Option<NodeId>,
}

fn default_key_ttl_ms() -> i64 {
    300_000
}

fn default_ttl_decrement_ms() -> i64 {
    1
}

fn default_tombstone_grace_ms() -> i64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl AreaConfig {
    /// Area with default parameters
    pub fn new(area_id: impl Into<AreaId>) -> Self {
        Self {
            area_id: area_id.into(),
            key_ttl_ms: default_key_ttl_ms(),
            ttl_decrement_ms: default_ttl_decrement_ms(),
            tombstone_grace_ms: default_tombstone_grace_ms(),
            flood_rate: None,
            enable_flood_optimization: false,
            is_flood_root: true,
            flood_root: None,
        }
    }

    pub fn key_ttl(&self) -> Duration {
        Duration::from_millis(self.key_ttl_ms.max(0) as u64)
    }

    pub fn tombstone_grace(&self) -> Duration {
        Duration::from_millis(self.tombstone_grace_ms.max(0) as u64)
    }

    /// Validate area parameters
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key_ttl_ms <= 0 {
            return Err(ValidationError::InvalidKeyTtl {
                area: self.area_id.clone(),
                ttl_ms: self.key_ttl_ms,
            });
        }
        if self.ttl_decrement_ms < 0 || self.ttl_decrement_ms >= self.key_ttl_ms {
            return Err(ValidationError::InvalidTtlDecrement {
                area: self.area_id.clone(),
            });
        }
        if self.tombstone_grace_ms <= 0 {
            return Err(ValidationError::InvalidTombstoneGrace {
                area: self.area_id.clone(),
            });
        }
        if let Some(rate) = &self.flood_rate {
            if rate.messages_per_sec == 0 {
                return Err(ValidationError::InvalidFloodRate {
                    area: self.area_id.clone(),
                    field: "messages_per_sec",
                });
            }
            if rate.burst_size == 0 {
                return Err(ValidationError::InvalidFloodRate {
                    area: self.area_id.clone(),
                    field: "burst_size",
                });
            }
        }
        Ok(())
    }
}

/// Statically configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub area: AreaId,
    pub node_id: NodeId,
    pub endpoint: String,
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStoreConfig {
    pub node_id: NodeId,

    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    pub areas: Vec<AreaConfig>,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default = "default_ttl_sweep_interval_ms")]
    pub ttl_sweep_interval_ms: u64,

    #[serde(default = "default_flood_flush_interval_ms")]
    pub flood_flush_interval_ms: u64,

    #[serde(default = "default_anti_entropy_interval_ms")]
    pub anti_entropy_interval_ms: u64,

    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Areas report "synced" after this long even if peers never answer
    #[serde(default = "default_initial_sync_timeout_ms")]
    pub initial_sync_timeout_ms: u64,

    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,

    #[serde(default = "default_peer_queue_size")]
    pub peer_queue_size: usize,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9100))
}

fn default_ttl_sweep_interval_ms() -> u64 {
    500
}

fn default_flood_flush_interval_ms() -> u64 {
    100
}

fn default_anti_entropy_interval_ms() -> u64 {
    60_000
}

fn default_sync_timeout_ms() -> u64 {
    10_000
}

fn default_initial_sync_timeout_ms() -> u64 {
    30_000
}

fn default_subscriber_queue_size() -> usize {
    1024
}

fn default_peer_queue_size() -> usize {
    4096
}

impl KvStoreConfig {
    /// Configuration with default timers for the given areas
    pub fn new(node_id: impl Into<NodeId>, areas: Vec<AreaConfig>) -> Self {
        Self {
            node_id: node_id.into(),
            listen: default_listen(),
            areas,
            peers: Vec::new(),
            ttl_sweep_interval_ms: default_ttl_sweep_interval_ms(),
            flood_flush_interval_ms: default_flood_flush_interval_ms(),
            anti_entropy_interval_ms: default_anti_entropy_interval_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            initial_sync_timeout_ms: default_initial_sync_timeout_ms(),
            subscriber_queue_size: default_subscriber_queue_size(),
            peer_queue_size: default_peer_queue_size(),
        }
    }

    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.node_id.as_str().is_empty() {
            return Err(ValidationError::EmptyNodeId);
        }
        if self.areas.is_empty() {
            return Err(ValidationError::NoAreas);
        }

        let mut seen = HashSet::new();
        for area in &self.areas {
            if !seen.insert(area.area_id.clone()) {
                return Err(ValidationError::DuplicateArea(area.area_id.clone()));
            }
            area.validate()?;
        }

        for peer in &self.peers {
            if !seen.contains(&peer.area) {
                return Err(ValidationError::UnknownPeerArea {
                    area: peer.area.clone(),
                    peer: peer.node_id.clone(),
                });
            }
        }

        for (field, value) in [
            ("ttl_sweep_interval_ms", self.ttl_sweep_interval_ms),
            ("flood_flush_interval_ms", self.flood_flush_interval_ms),
            ("anti_entropy_interval_ms", self.anti_entropy_interval_ms),
            ("sync_timeout_ms", self.sync_timeout_ms),
            ("subscriber_queue_size", self.subscriber_queue_size as u64),
            ("peer_queue_size", self.peer_queue_size as u64),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroSetting { field });
            }
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn initial_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_sync_timeout_ms)
    }

    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = KvStoreConfig::new("node1", vec![AreaConfig::new("spine")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_area() {
        let config = KvStoreConfig::new(
            "node1",
            vec![AreaConfig::new("spine"), AreaConfig::new("spine")],
        );
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateArea(AreaId::from("spine")))
        );
    }

    #[test]
    fn test_flood_rate_must_be_positive() {
        let mut area = AreaConfig::new("pod");
        area.flood_rate = Some(FloodRate {
            messages_per_sec: 0,
            burst_size: 10,
        });
        assert!(matches!(
            area.validate(),
            Err(ValidationError::InvalidFloodRate { field: "messages_per_sec", .. })
        ));

        area.flood_rate = Some(FloodRate {
            messages_per_sec: 10,
            burst_size: 0,
        });
        assert!(matches!(
            area.validate(),
            Err(ValidationError::InvalidFloodRate { field: "burst_size", .. })
        ));
    }

    #[test]
    fn test_key_ttl_must_be_finite() {
        let mut area = AreaConfig::new("pod");
        area.key_ttl_ms = areakv_core::TTL_INFINITY;
        assert!(matches!(
            area.validate(),
            Err(ValidationError::InvalidKeyTtl { .. })
        ));
    }

    #[test]
    fn test_peer_with_unknown_area() {
        let mut config = KvStoreConfig::new("node1", vec![AreaConfig::new("spine")]);
        config.peers.push(PeerConfig {
            area: AreaId::from("plane"),
            node_id: NodeId::from("node2"),
            endpoint: "127.0.0.1:9100".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnknownPeerArea { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node_id": "node1",
                "listen": "127.0.0.1:9200",
                "areas": [
                    {{"area_id": "spine", "enable_flood_optimization": true,
                      "flood_rate": {{"messages_per_sec": 100, "burst_size": 20}}}},
                    {{"area_id": "pod", "key_ttl_ms": 10000}}
                ],
                "peers": [{{"area": "spine", "node_id": "node2", "endpoint": "127.0.0.1:9201"}}]
            }}"#
        )
        .unwrap();

        let config = KvStoreConfig::load(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.areas.len(), 2);
        assert!(config.areas[0].enable_flood_optimization);
        assert_eq!(config.areas[1].key_ttl_ms, 10_000);
        assert_eq!(config.areas[1].tombstone_grace_ms, 60_000);
        assert_eq!(config.peers[0].node_id, NodeId::from("node2"));
    }
}
