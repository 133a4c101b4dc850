//! Core data model and wire types for areakv
//!
//! All types here serialize deterministically via postcard. Maps are
//! `BTreeMap`/`BTreeSet` so iteration and encoding order are stable.

use crate::canonical::{hash_hex, value_hash};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// TTL sentinel for entries that never expire.
pub const TTL_INFINITY: i64 = i32::MIN as i64;

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Area identifier: an isolated replication namespace
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(pub String);

impl AreaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AreaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AreaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Node identifier. Used both as entry originator and as peer identity.
///
/// Ordering is lexicographic on the string, which the merge tie-break and
/// flood-root election rely on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// ENTRY VALUE
// =============================================================================

/// A versioned entry value.
///
/// `value` is `None` for TTL-only refreshes and hash-only dumps, and
/// `Some(empty)` for tombstones. The hash covers `(version, originator_id,
/// value)` and is recomputed by every constructor; it cannot be set directly.
/// Values without payload carry the hash of the payload they refer to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireValue", into = "WireValue")]
pub struct Value {
    version: u64,
    originator_id: NodeId,
    value: Option<Vec<u8>>,
    /// Remaining lease in milliseconds, or [`TTL_INFINITY`]
    pub ttl_ms: i64,
    /// Bumped on lease refresh without content change
    pub ttl_version: u64,
    hash: u64,
}

impl Value {
    /// Create a value with payload and `ttl_version = 0`.
    pub fn new(
        version: u64,
        originator_id: impl Into<NodeId>,
        value: impl Into<Vec<u8>>,
        ttl_ms: i64,
    ) -> Self {
        let originator_id = originator_id.into();
        let value = Some(value.into());
        let hash = value_hash(version, originator_id.as_str(), value.as_deref());
        Self {
            version,
            originator_id,
            value,
            ttl_ms,
            ttl_version: 0,
            hash,
        }
    }

    /// Create a tombstone (empty payload).
    pub fn tombstone(version: u64, originator_id: impl Into<NodeId>, ttl_ms: i64) -> Self {
        Self::new(version, originator_id, Vec::new(), ttl_ms)
    }

    /// Builder-style ttl version override.
    pub fn with_ttl_version(mut self, ttl_version: u64) -> Self {
        self.ttl_version = ttl_version;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn originator_id(&self) -> &NodeId {
        &self.originator_id
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// TTL-only: no payload at all.
    pub fn is_ttl_only(&self) -> bool {
        self.value.is_none()
    }

    /// Tombstone: payload present but empty.
    pub fn is_tombstone(&self) -> bool {
        matches!(&self.value, Some(v) if v.is_empty())
    }

    pub fn is_ttl_infinite(&self) -> bool {
        self.ttl_ms == TTL_INFINITY
    }

    /// Copy without payload, keeping the hash of the payload.
    ///
    /// Used for TTL refresh messages, hash dumps and redacted publications.
    pub fn without_value(&self) -> Self {
        Self {
            version: self.version,
            originator_id: self.originator_id.clone(),
            value: None,
            ttl_ms: self.ttl_ms,
            ttl_version: self.ttl_version,
            hash: self.hash,
        }
    }

    /// TTL must be positive or the infinity sentinel.
    pub fn check_ttl(&self) -> Result<()> {
        if self.ttl_ms == TTL_INFINITY || self.ttl_ms > 0 {
            Ok(())
        } else {
            Err(Error::InvalidTtl(self.ttl_ms))
        }
    }

    /// Payload size in bytes (0 for TTL-only and tombstones).
    pub fn payload_len(&self) -> usize {
        self.value.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Check the carried hash against the payload.
    ///
    /// TTL-only values cannot be checked and always pass.
    pub fn verify_hash(&self) -> Result<()> {
        let Some(payload) = self.value.as_deref() else {
            return Ok(());
        };
        let computed = value_hash(self.version, self.originator_id.as_str(), Some(payload));
        if computed != self.hash {
            return Err(Error::HashMismatch {
                computed: hash_hex(computed),
                carried: hash_hex(self.hash),
            });
        }
        Ok(())
    }

    /// Compact digest used by sync and anti-entropy.
    pub fn digest(&self, key: impl Into<String>) -> KeyDigest {
        KeyDigest {
            key: key.into(),
            version: self.version,
            originator_id: self.originator_id.clone(),
            ttl_version: self.ttl_version,
            hash: self.hash,
        }
    }
}

/// Serialized form of [`Value`]. Payload-carrying values are rehashed on
/// decode so a stored hash always matches its content.
#[derive(Clone, Serialize, Deserialize)]
struct WireValue {
    version: u64,
    originator_id: NodeId,
    value: Option<Vec<u8>>,
    ttl_ms: i64,
    ttl_version: u64,
    hash: u64,
}

impl From<WireValue> for Value {
    fn from(wire: WireValue) -> Self {
        let hash = match wire.value.as_deref() {
            Some(payload) => value_hash(wire.version, wire.originator_id.as_str(), Some(payload)),
            None => wire.hash,
        };
        Self {
            version: wire.version,
            originator_id: wire.originator_id,
            value: wire.value,
            ttl_ms: wire.ttl_ms,
            ttl_version: wire.ttl_version,
            hash,
        }
    }
}

impl From<Value> for WireValue {
    fn from(value: Value) -> Self {
        Self {
            version: value.version,
            originator_id: value.originator_id,
            value: value.value,
            ttl_ms: value.ttl_ms,
            ttl_version: value.ttl_version,
            hash: value.hash,
        }
    }
}

/// Key → value map, ordered by key.
pub type KeyVals = BTreeMap<String, Value>;

/// Compact per-key summary exchanged during sync.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyDigest {
    pub key: String,
    pub version: u64,
    pub originator_id: NodeId,
    pub ttl_version: u64,
    pub hash: u64,
}

// =============================================================================
// FILTERS & PUBLICATIONS
// =============================================================================

/// How key and originator criteria combine.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilterOperator {
    #[default]
    Or,
    And,
}

/// Subscriber / dump predicate
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyFilter {
    /// Regular expressions, anchored at the start of the key
    pub key_patterns: Vec<String>,
    pub originator_ids: BTreeSet<NodeId>,
    pub combinator: FilterOperator,
    /// Deliver TTL-only refreshes (value absent) when set
    pub ignore_ttl: bool,
    /// Strip values from every delivered entry
    pub redact_value: bool,
}

impl KeyFilter {
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_patterns: keys.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_originators<I, S>(mut self, originators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.originator_ids = originators.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_combinator(mut self, combinator: FilterOperator) -> Self {
        self.combinator = combinator;
        self
    }
}

/// A batch of changes (or a snapshot) for one area.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publication {
    pub area: Option<AreaId>,
    pub key_vals: KeyVals,
    /// Keys purged after tombstone grace
    pub expired_keys: Vec<String>,
    /// Wall-clock creation time (unix millis)
    pub timestamp_ms: u64,
}

impl Publication {
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

// =============================================================================
// PEERS & TOPOLOGY
// =============================================================================

/// Peer session state
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Syncing,
    Established,
}

/// Peer as reported by `get_peers`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSpec {
    /// Transport endpoint (e.g. `10.0.0.1:9100`)
    pub endpoint: String,
    pub state: PeerState,
}

/// Spanning-tree state per flood root
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SptState {
    NoRoot,
    Computing,
    Stable,
}

/// Child (un)registration sent to a chosen/abandoned parent
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FloodTopoSetParams {
    pub root_id: NodeId,
    /// Node asking to (un)register as child
    pub src_id: NodeId,
    pub become_child: bool,
    /// Apply to every root this node knows (used on teardown)
    pub all_roots: bool,
}

/// Distance-vector advertisement element
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootCost {
    pub root_id: NodeId,
    pub cost: u32,
}

/// Per-root spanning tree view
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SptInfo {
    pub state: SptState,
    pub cost: u32,
    /// The root reports itself as its own parent
    pub parent: Option<NodeId>,
    pub children: BTreeSet<NodeId>,
}

/// Topology messages exchanged with one peer
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NeighborCounters {
    pub adverts_sent: u64,
    pub adverts_received: u64,
    pub topo_sets_sent: u64,
    pub topo_sets_received: u64,
}

/// Tree churn for one root
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootCounters {
    pub parent_changes: u64,
    pub children_added: u64,
    pub children_removed: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SptCounters {
    /// One entry per current peer
    pub neighbor_counters: BTreeMap<NodeId, NeighborCounters>,
    /// One entry per known root
    pub root_counters: BTreeMap<NodeId, RootCounters>,
}

/// Spanning tree diagnostics for an area
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SptInfos {
    pub infos: BTreeMap<NodeId, SptInfo>,
    pub counters: SptCounters,
    pub flood_root_id: Option<NodeId>,
    pub flood_peers: BTreeSet<NodeId>,
}

/// Operational summary for one area
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AreaSummary {
    pub area: AreaId,
    pub key_count: usize,
    pub key_bytes: usize,
    pub peer_count: usize,
    pub flood_root_id: Option<NodeId>,
}

// =============================================================================
// PEER MESSAGES
// =============================================================================

/// Message body, one variant per protocol exchange
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageBody {
    /// Flooded entries with payload
    Update { entries: KeyVals },
    /// Lease refreshes, values absent
    TtlRefresh { entries: KeyVals },
    /// Initial full sync: requester digests, optional key prefix filter
    SyncRequest {
        digests: Vec<KeyDigest>,
        key_prefixes: Vec<String>,
    },
    /// Entries the requester lacks plus keys it should push back
    SyncResponse {
        entries: KeyVals,
        to_be_updated_keys: Vec<String>,
    },
    /// Distance-vector costs to every known root
    TopologyAdvert { costs: Vec<RootCost> },
    /// Child registration
    FloodTopoSet(FloodTopoSetParams),
    /// Anti-entropy digest comparison
    DigestRequest { digests: Vec<KeyDigest> },
    /// Keys whose digests differ from the requester's
    DigestResponse { mismatched: Vec<String> },
    /// Request full values
    PullRequest { keys: Vec<String> },
    /// Full values for a pull
    PullResponse { entries: KeyVals },
}

impl MessageBody {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::TtlRefresh { .. } => "ttl-refresh",
            Self::SyncRequest { .. } => "sync-request",
            Self::SyncResponse { .. } => "sync-response",
            Self::TopologyAdvert { .. } => "topology-advert",
            Self::FloodTopoSet(_) => "flood-topo-set",
            Self::DigestRequest { .. } => "digest-request",
            Self::DigestResponse { .. } => "digest-response",
            Self::PullRequest { .. } => "pull-request",
            Self::PullResponse { .. } => "pull-response",
        }
    }
}

/// Area-scoped message between peers
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMessage {
    pub area: AreaId,
    pub sender: NodeId,
    pub body: MessageBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_and_ttl_only_are_distinct() {
        let tomb = Value::tombstone(2, "node1", 1000);
        assert!(tomb.is_tombstone());
        assert!(!tomb.is_ttl_only());

        let refresh = tomb.without_value();
        assert!(refresh.is_ttl_only());
        assert!(!refresh.is_tombstone());
        assert_eq!(refresh.hash(), tomb.hash());
    }

    #[test]
    fn test_ttl_version_does_not_change_hash() {
        let a = Value::new(1, "node1", b"v".to_vec(), 1000);
        let b = a.clone().with_ttl_version(7);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_node_id_ordering_is_lexicographic() {
        assert!(NodeId::from("n2") > NodeId::from("n1"));
        assert!(NodeId::from("node33") > NodeId::from("node3"));
    }

    #[test]
    fn test_filter_json_defaults() {
        let filter: KeyFilter = serde_json::from_str(
            r#"{"key_patterns":["key3"],"originator_ids":[],"combinator":"And","ignore_ttl":false,"redact_value":true}"#,
        )
        .unwrap();
        assert_eq!(filter.combinator, FilterOperator::And);
        assert!(filter.redact_value);
        assert_eq!(KeyFilter::default().combinator, FilterOperator::Or);
    }
}
