//! Peer connection bookkeeping

use areakv_core::NodeId;
use std::time::{SystemTime, UNIX_EPOCH};

/// Information about a connected or connecting peer
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: NodeId,
    /// Transport endpoint (`host:port`)
    pub endpoint: String,
    /// Last successful frame exchange (unix millis)
    pub last_seen: u64,
    /// Number of (re)connections made
    pub connects: u32,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(id: NodeId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            last_seen: 0,
            connects: 0,
        }
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        self.last_seen = unix_millis();
    }
}

/// Current wall-clock time in unix millis
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
