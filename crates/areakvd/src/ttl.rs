//! Lease tracking for soft-state entries
//!
//! Deadlines live in a min-heap. Entries are never removed from the heap when
//! they change; a popped deadline is checked against the store and dropped if
//! the entry has since been refreshed, replaced or purged. Tombstones are
//! tracked to their purge deadline, one grace period past their lease.

use crate::store::{EntryStore, StoredEntry};
use areakv_core::{NodeId, Value};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::{Duration, Instant};

/// What the sweep decided for one expired entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Live value ran out: write this tombstone through the merge path
    Tombstone { key: String, tombstone: Value },
    /// Tombstone past its grace period: remove without propagation
    Purge { key: String, originator_id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Countdown {
    deadline: Instant,
    key: String,
    version: u64,
    ttl_version: u64,
}

/// A self-originated key kept alive by this node
#[derive(Debug, Clone)]
struct PersistedKey {
    value: Vec<u8>,
    next_refresh: Instant,
}

/// Per-area lease manager
#[derive(Debug)]
pub struct TtlManager {
    node_id: NodeId,
    key_ttl: Duration,
    tombstone_grace: Duration,
    queue: BinaryHeap<Reverse<Countdown>>,
    persisted: BTreeMap<String, PersistedKey>,
}

impl TtlManager {
    pub fn new(node_id: NodeId, key_ttl: Duration, tombstone_grace: Duration) -> Self {
        Self {
            node_id,
            key_ttl,
            tombstone_grace,
            queue: BinaryHeap::new(),
            persisted: BTreeMap::new(),
        }
    }

    /// Track the deadline of an accepted write or refresh
    pub fn schedule(&mut self, key: &str, entry: &StoredEntry) {
        if let Some(deadline) = entry.next_deadline() {
            self.queue.push(Reverse(Countdown {
                deadline,
                key: key.to_string(),
                version: entry.value.version(),
                ttl_version: entry.value.ttl_version,
            }));
        }
    }

    /// Earliest pending deadline, possibly stale
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(c)| c.deadline)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Pop every deadline at or before `now` and decide what to do with the
    /// entries that really expired.
    pub fn expired(&mut self, store: &EntryStore, now: Instant) -> Vec<Expiry> {
        let mut expiries = Vec::new();

        while let Some(Reverse(head)) = self.queue.peek() {
            if head.deadline > now {
                break;
            }
            let Some(Reverse(countdown)) = self.queue.pop() else {
                break;
            };

            let Some(entry) = store.get(&countdown.key) else {
                continue;
            };
            let current = entry.value.version() == countdown.version
                && entry.value.ttl_version == countdown.ttl_version
                && entry.next_deadline() == Some(countdown.deadline);
            if !current {
                continue;
            }

            if entry.value.is_tombstone() {
                if entry.is_purgeable(now) {
                    expiries.push(Expiry::Purge {
                        key: countdown.key,
                        originator_id: entry.value.originator_id().clone(),
                    });
                }
            } else if entry.is_expired(now) {
                let tombstone = Value::tombstone(
                    entry.value.version() + 1,
                    self.node_id.clone(),
                    self.tombstone_grace.as_millis() as i64,
                );
                expiries.push(Expiry::Tombstone {
                    key: countdown.key,
                    tombstone,
                });
            }
        }

        expiries
    }

    // =========================================================================
    // Self-originated keys
    // =========================================================================

    /// Keep `key` alive with `value` until [`TtlManager::unpersist`]
    pub fn persist(&mut self, key: &str, value: Vec<u8>, now: Instant) {
        self.persisted.insert(
            key.to_string(),
            PersistedKey {
                value,
                next_refresh: now + self.refresh_interval(),
            },
        );
    }

    pub fn unpersist(&mut self, key: &str) -> bool {
        self.persisted.remove(key).is_some()
    }

    pub fn persisted_len(&self) -> usize {
        self.persisted.len()
    }

    fn refresh_interval(&self) -> Duration {
        self.key_ttl / 4
    }

    fn key_ttl_ms(&self) -> i64 {
        self.key_ttl.as_millis() as i64
    }

    /// Candidate writes keeping persisted keys alive: a TTL-only refresh
    /// when we still own the entry, a full re-assertion otherwise.
    pub fn refreshes_due(&mut self, store: &EntryStore, now: Instant) -> Vec<(String, Value)> {
        let interval = self.refresh_interval();
        let key_ttl_ms = self.key_ttl_ms();
        let mut due = Vec::new();

        for (key, persisted) in self.persisted.iter_mut() {
            if persisted.next_refresh > now {
                continue;
            }
            persisted.next_refresh = now + interval;

            let candidate = match store.get(key) {
                Some(entry)
                    if entry.value.originator_id() == &self.node_id
                        && entry.value.value() == Some(persisted.value.as_slice()) =>
                {
                    let mut refresh = entry
                        .value
                        .without_value()
                        .with_ttl_version(entry.value.ttl_version + 1);
                    refresh.ttl_ms = key_ttl_ms;
                    refresh
                }
                Some(entry) => Value::new(
                    entry.value.version() + 1,
                    self.node_id.clone(),
                    persisted.value.clone(),
                    key_ttl_ms,
                ),
                None => Value::new(1, self.node_id.clone(), persisted.value.clone(), key_ttl_ms),
            };
            due.push((key.clone(), candidate));
        }

        due
    }

    /// Re-assertion for a persisted key another node has overridden
    pub fn reassertion(&self, key: &str, store: &EntryStore) -> Option<Value> {
        let persisted = self.persisted.get(key)?;
        let entry = store.get(key)?;
        if entry.value.originator_id() == &self.node_id
            && entry.value.value() == Some(persisted.value.as_slice())
        {
            return None;
        }
        Some(Value::new(
            entry.value.version() + 1,
            self.node_id.clone(),
            persisted.value.clone(),
            self.key_ttl_ms(),
        ))
    }
}
