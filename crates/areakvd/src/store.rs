//! Per-area entry store and the merge rule
//!
//! Every write, local or remote, goes through [`EntryStore::apply`]. The
//! outcome decides whether the change is published and flooded; rejected
//! candidates go nowhere, which is what stops flooding loops.

use areakv_core::{KeyDigest, NodeId, Value, TTL_INFINITY};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A stored value plus its local expiry deadline
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub value: Value,
    /// `None` for infinite leases
    pub expires_at: Option<Instant>,
    /// Tombstones only: lease end plus the grace period
    pub purge_at: Option<Instant>,
}

impl StoredEntry {
    pub fn new(value: Value, now: Instant, grace: Duration) -> Self {
        let expires_at = deadline_for(&value, now, grace);
        let purge_at = if value.is_tombstone() {
            expires_at.map(|deadline| deadline + grace)
        } else {
            None
        };
        Self {
            value,
            expires_at,
            purge_at,
        }
    }

    /// When the TTL sweep next has to look at this entry
    pub fn next_deadline(&self) -> Option<Instant> {
        self.purge_at.or(self.expires_at)
    }

    /// Remaining lease at `now`, clamped at zero
    pub fn remaining_ttl(&self, now: Instant) -> i64 {
        match self.expires_at {
            None => TTL_INFINITY,
            Some(deadline) => deadline.saturating_duration_since(now).as_millis() as i64,
        }
    }

    /// The value with its TTL rewritten to the remaining lease
    pub fn current(&self, now: Instant) -> Value {
        let mut value = self.value.clone();
        if self.expires_at.is_some() {
            value.ttl_ms = self.remaining_ttl(now);
        }
        value
    }

    /// The value as it should be flooded: remaining lease minus the per-hop
    /// decrement. `None` once nothing would be left for the receiver.
    ///
    /// A tombstone past its lease but inside the grace period still floods,
    /// carrying the time left until purge, so stale peers converge on it.
    pub fn flood_value(&self, now: Instant, ttl_decrement_ms: i64) -> Option<Value> {
        if self.expires_at.is_none() {
            return Some(self.value.clone());
        }
        let mut remaining = self.remaining_ttl(now) - ttl_decrement_ms;
        if remaining <= 0 {
            if let Some(purge_at) = self.purge_at {
                remaining =
                    purge_at.saturating_duration_since(now).as_millis() as i64 - ttl_decrement_ms;
            }
        }
        if remaining <= 0 {
            return None;
        }
        let mut value = self.value.clone();
        value.ttl_ms = remaining;
        Some(value)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }

    /// Tombstone whose grace period has run out too
    pub fn is_purgeable(&self, now: Instant) -> bool {
        matches!(self.purge_at, Some(deadline) if deadline <= now)
    }
}

// =============================================================================
// ORDERING
// =============================================================================

/// Fields the merge rule compares
#[derive(Debug, Clone, Copy)]
pub struct Stamp<'a> {
    pub version: u64,
    pub originator_id: &'a NodeId,
    pub ttl_version: u64,
    pub hash: u64,
}

impl<'a> From<&'a Value> for Stamp<'a> {
    fn from(value: &'a Value) -> Self {
        Self {
            version: value.version(),
            originator_id: value.originator_id(),
            ttl_version: value.ttl_version,
            hash: value.hash(),
        }
    }
}

impl<'a> From<&'a KeyDigest> for Stamp<'a> {
    fn from(digest: &'a KeyDigest) -> Self {
        Self {
            version: digest.version,
            originator_id: &digest.originator_id,
            ttl_version: digest.ttl_version,
            hash: digest.hash,
        }
    }
}

/// Result of comparing two stamps for the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Left side wins
    Newer,
    /// Right side wins
    Older,
    Same,
    /// Equal ordering fields, different hashes
    Conflict,
}

/// Total order used by the merge rule: version, then originator id, then
/// ttl version.
pub fn compare(a: Stamp<'_>, b: Stamp<'_>) -> Comparison {
    let order = a
        .version
        .cmp(&b.version)
        .then_with(|| a.originator_id.cmp(b.originator_id))
        .then(a.ttl_version.cmp(&b.ttl_version));
    match order {
        Ordering::Greater => Comparison::Newer,
        Ordering::Less => Comparison::Older,
        Ordering::Equal if a.hash == b.hash => Comparison::Same,
        Ordering::Equal => Comparison::Conflict,
    }
}

// =============================================================================
// MERGE OUTCOMES
// =============================================================================

/// What an accepted write changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateKind {
    /// Lease only; value and version untouched
    TtlRefresh,
    /// Value, version or originator changed
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Candidate loses the merge order
    Stale,
    /// TTL neither positive nor infinite
    InvalidTtl,
    /// TTL-only refresh for a version we do not hold
    UnknownTtlTarget,
    /// Same ordering fields, different content
    HashMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Accepted(UpdateKind),
    AcceptedNoChange,
    Rejected(RejectReason),
}

impl MergeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Key → entry map for one area
#[derive(Debug)]
pub struct EntryStore {
    entries: BTreeMap<String, StoredEntry>,
    /// Lease given to tombstones that arrive with an infinite TTL, and the
    /// time tombstones are kept past their lease before purge
    tombstone_grace: Duration,
    /// First accepted write that did not move its key forward
    regression: Option<String>,
}

impl EntryStore {
    pub fn new(tombstone_grace: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstone_grace,
            regression: None,
        }
    }

    /// Apply a candidate value for `key`.
    pub fn apply(&mut self, key: &str, candidate: Value, now: Instant) -> MergeOutcome {
        if candidate.check_ttl().is_err() {
            return MergeOutcome::Rejected(RejectReason::InvalidTtl);
        }

        if candidate.is_ttl_only() {
            return self.apply_ttl_refresh(key, candidate, now);
        }

        let grace = self.tombstone_grace;
        match self.entries.get_mut(key) {
            None => {
                self.entries.insert(key.to_string(), StoredEntry::new(candidate, now, grace));
                MergeOutcome::Accepted(UpdateKind::Full)
            }
            Some(existing) => {
                match compare(Stamp::from(&candidate), Stamp::from(&existing.value)) {
                    Comparison::Newer => {
                        let before = existing.value.digest(key);
                        *existing = StoredEntry::new(candidate, now, grace);
                        if !moved_forward(&before, &existing.value) {
                            self.regression.get_or_insert_with(|| key.to_string());
                        }
                        MergeOutcome::Accepted(UpdateKind::Full)
                    }
                    Comparison::Same => MergeOutcome::AcceptedNoChange,
                    Comparison::Older => MergeOutcome::Rejected(RejectReason::Stale),
                    Comparison::Conflict => MergeOutcome::Rejected(RejectReason::HashMismatch),
                }
            }
        }
    }

    fn apply_ttl_refresh(&mut self, key: &str, candidate: Value, now: Instant) -> MergeOutcome {
        let grace = self.tombstone_grace;
        let Some(existing) = self.entries.get_mut(key) else {
            return MergeOutcome::Rejected(RejectReason::UnknownTtlTarget);
        };

        let order = candidate
            .version()
            .cmp(&existing.value.version())
            .then_with(|| candidate.originator_id().cmp(existing.value.originator_id()));
        match order {
            Ordering::Less => return MergeOutcome::Rejected(RejectReason::Stale),
            Ordering::Greater => return MergeOutcome::Rejected(RejectReason::UnknownTtlTarget),
            Ordering::Equal => {}
        }
        if candidate.hash() != existing.value.hash() {
            return MergeOutcome::Rejected(RejectReason::HashMismatch);
        }

        match candidate.ttl_version.cmp(&existing.value.ttl_version) {
            Ordering::Greater => {
                let before = existing.value.digest(key);
                let mut value = existing.value.clone();
                value.ttl_version = candidate.ttl_version;
                value.ttl_ms = candidate.ttl_ms;
                *existing = StoredEntry::new(value, now, grace);
                if !moved_forward(&before, &existing.value) {
                    self.regression.get_or_insert_with(|| key.to_string());
                }
                MergeOutcome::Accepted(UpdateKind::TtlRefresh)
            }
            Ordering::Equal => MergeOutcome::AcceptedNoChange,
            Ordering::Less => MergeOutcome::Rejected(RejectReason::Stale),
        }
    }

    pub fn get(&self, key: &str) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    /// Physically remove an entry (tombstone purge)
    pub fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoredEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes held
    pub fn total_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, entry)| key.len() + entry.value.payload_len())
            .sum()
    }

    /// Digests of every key starting with one of `prefixes` (all keys when
    /// empty)
    pub fn digests(&self, prefixes: &[String]) -> Vec<KeyDigest> {
        self.entries
            .iter()
            .filter(|(key, _)| matches_prefix(key, prefixes))
            .map(|(key, entry)| entry.value.digest(key.as_str()))
            .collect()
    }

    /// Key of the first accepted write that failed to move its entry
    /// forward in the merge order, cleared once taken
    pub fn take_regression(&mut self) -> Option<String> {
        self.regression.take()
    }
}

pub fn matches_prefix(key: &str, prefixes: &[String]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|p| key.starts_with(p.as_str()))
}

/// An accepted write must leave the entry strictly newer than before
fn moved_forward(before: &KeyDigest, after: &Value) -> bool {
    compare(Stamp::from(after), Stamp::from(before)) == Comparison::Newer
}

fn deadline_for(value: &Value, now: Instant, grace: Duration) -> Option<Instant> {
    if value.is_ttl_infinite() {
        // Tombstones always expire so they can be purged
        return value.is_tombstone().then(|| now + grace);
    }
    Some(now + Duration::from_millis(value.ttl_ms.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EntryStore {
        EntryStore::new(Duration::from_secs(60))
    }

    #[test]
    fn test_first_write_accepted() {
        let mut store = store();
        let now = Instant::now();
        let outcome = store.apply("k", Value::new(1, "node1", b"a".to_vec(), 1000), now);
        assert_eq!(outcome, MergeOutcome::Accepted(UpdateKind::Full));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").unwrap().remaining_ttl(now), 1000);
    }

    #[test]
    fn test_originator_tie_break() {
        let mut store = store();
        let now = Instant::now();
        store.apply("x", Value::new(1, "n1", b"a".to_vec(), TTL_INFINITY), now);
        let outcome = store.apply("x", Value::new(1, "n2", b"b".to_vec(), TTL_INFINITY), now);
        assert_eq!(outcome, MergeOutcome::Accepted(UpdateKind::Full));

        let outcome = store.apply("x", Value::new(1, "n1", b"a".to_vec(), TTL_INFINITY), now);
        assert_eq!(outcome, MergeOutcome::Rejected(RejectReason::Stale));

        let stored = &store.get("x").unwrap().value;
        assert_eq!(stored.originator_id(), &NodeId::from("n2"));
        assert_eq!(stored.value(), Some(&b"b"[..]));
    }

    #[test]
    fn test_higher_version_wins_regardless_of_originator() {
        let mut store = store();
        let now = Instant::now();
        store.apply("x", Value::new(1, "z", b"a".to_vec(), TTL_INFINITY), now);
        let outcome = store.apply("x", Value::new(2, "a", b"b".to_vec(), TTL_INFINITY), now);
        assert_eq!(outcome, MergeOutcome::Accepted(UpdateKind::Full));
    }

    #[test]
    fn test_duplicate_is_no_change() {
        let mut store = store();
        let now = Instant::now();
        let value = Value::new(3, "node1", b"a".to_vec(), 5000);
        store.apply("k", value.clone(), now);
        assert_eq!(store.apply("k", value, now), MergeOutcome::AcceptedNoChange);
    }

    #[test]
    fn test_ttl_refresh_changes_only_lease() {
        let mut store = store();
        let now = Instant::now();
        let value = Value::new(1, "node1", b"a".to_vec(), 1000);
        store.apply("k", value.clone(), now);

        let mut refresh = value.without_value().with_ttl_version(1);
        refresh.ttl_ms = 9000;
        let outcome = store.apply("k", refresh.clone(), now);
        assert_eq!(outcome, MergeOutcome::Accepted(UpdateKind::TtlRefresh));

        let stored = store.get("k").unwrap();
        assert_eq!(stored.value.version(), 1);
        assert_eq!(stored.value.ttl_version, 1);
        assert_eq!(stored.value.value(), Some(&b"a"[..]));
        assert_eq!(stored.value.hash(), value.hash());
        assert_eq!(stored.remaining_ttl(now), 9000);

        assert_eq!(store.apply("k", refresh, now), MergeOutcome::AcceptedNoChange);
    }

    #[test]
    fn test_ttl_refresh_for_unknown_version() {
        let mut store = store();
        let now = Instant::now();
        let refresh = Value::new(1, "node1", b"a".to_vec(), 1000).without_value();
        assert_eq!(
            store.apply("k", refresh.clone(), now),
            MergeOutcome::Rejected(RejectReason::UnknownTtlTarget)
        );

        store.apply("k", Value::new(2, "node1", b"b".to_vec(), 1000), now);
        assert_eq!(
            store.apply("k", refresh, now),
            MergeOutcome::Rejected(RejectReason::Stale)
        );
    }

    #[test]
    fn test_hash_mismatch_keeps_entry() {
        let mut store = store();
        let now = Instant::now();
        store.apply("k", Value::new(1, "node1", b"a".to_vec(), TTL_INFINITY), now);
        let outcome = store.apply("k", Value::new(1, "node1", b"b".to_vec(), TTL_INFINITY), now);
        assert_eq!(outcome, MergeOutcome::Rejected(RejectReason::HashMismatch));
        assert_eq!(store.get("k").unwrap().value.value(), Some(&b"a"[..]));
    }

    #[test]
    fn test_invalid_ttl_rejected() {
        let mut store = store();
        let outcome = store.apply("k", Value::new(1, "node1", b"a".to_vec(), 0), Instant::now());
        assert_eq!(outcome, MergeOutcome::Rejected(RejectReason::InvalidTtl));
        assert!(store.is_empty());
    }

    #[test]
    fn test_infinite_tombstone_still_expires() {
        let mut store = store();
        let now = Instant::now();
        store.apply("k", Value::tombstone(1, "node1", TTL_INFINITY), now);
        let entry = store.get("k").unwrap();
        assert_eq!(entry.expires_at, Some(now + Duration::from_secs(60)));
        assert_eq!(entry.purge_at, Some(now + Duration::from_secs(120)));

        store.apply("v", Value::new(1, "node1", b"a".to_vec(), TTL_INFINITY), now);
        assert_eq!(store.get("v").unwrap().expires_at, None);
    }

    #[test]
    fn test_flood_value_applies_decrement() {
        let now = Instant::now();
        let entry = StoredEntry::new(
            Value::new(1, "node1", b"a".to_vec(), 100),
            now,
            Duration::from_secs(60),
        );
        assert_eq!(entry.flood_value(now, 1).unwrap().ttl_ms, 99);
        assert!(entry.flood_value(now + Duration::from_millis(99), 1).is_none());
    }

    #[test]
    fn test_tombstone_floods_during_grace() {
        let now = Instant::now();
        let grace = Duration::from_secs(10);
        let entry = StoredEntry::new(Value::tombstone(2, "node1", 1_000), now, grace);
        assert_eq!(entry.purge_at, Some(now + Duration::from_secs(11)));

        let later = now + Duration::from_secs(2);
        assert!(entry.is_expired(later));
        assert!(!entry.is_purgeable(later));
        let flooded = entry.flood_value(later, 1).unwrap();
        assert!(flooded.is_tombstone());
        assert_eq!(flooded.ttl_ms, 8_999);

        let gone = now + Duration::from_secs(11);
        assert!(entry.is_purgeable(gone));
        assert!(entry.flood_value(gone, 1).is_none());
    }

    #[test]
    fn test_accepted_writes_move_forward() {
        let mut store = store();
        let now = Instant::now();
        let value = Value::new(1, "n1", b"a".to_vec(), 1000);
        store.apply("k", value.clone(), now);
        store.apply("k", value.without_value().with_ttl_version(1), now);
        store.apply("k", Value::new(2, "n1", b"b".to_vec(), 1000), now);
        store.apply("k", value, now);
        assert_eq!(store.take_regression(), None);

        let before = Value::new(2, "n1", b"b".to_vec(), 1000).digest("k");
        assert!(!moved_forward(&before, &Value::new(2, "n1", b"b".to_vec(), 1000)));
        assert!(!moved_forward(&before, &Value::new(1, "n9", b"c".to_vec(), 1000)));
        assert!(moved_forward(&before, &Value::new(2, "n2", b"b".to_vec(), 1000)));
    }

    #[test]
    fn test_digests_by_prefix() {
        let mut store = store();
        let now = Instant::now();
        store.apply("adj:1", Value::new(1, "n", b"a".to_vec(), TTL_INFINITY), now);
        store.apply("prefix:1", Value::new(1, "n", b"b".to_vec(), TTL_INFINITY), now);
        assert_eq!(store.digests(&[]).len(), 2);
        let adj = store.digests(&["adj:".to_string()]);
        assert_eq!(adj.len(), 1);
        assert_eq!(adj[0].key, "adj:1");
    }

    #[test]
    fn test_merge_order_is_commutative() {
        let candidates = vec![
            Value::new(1, "n1", b"a".to_vec(), TTL_INFINITY),
            Value::new(1, "n2", b"b".to_vec(), TTL_INFINITY),
            Value::new(2, "n0", b"c".to_vec(), TTL_INFINITY),
            Value::new(2, "n0", b"c".to_vec(), TTL_INFINITY).with_ttl_version(3),
        ];
        let now = Instant::now();

        let mut forward = store();
        for c in candidates.iter().cloned() {
            forward.apply("k", c, now);
        }
        let mut backward = store();
        for c in candidates.iter().rev().cloned() {
            backward.apply("k", c, now);
        }
        assert_eq!(forward.get("k").unwrap().value, backward.get("k").unwrap().value);
        assert_eq!(forward.get("k").unwrap().value.ttl_version, 3);
    }
}
