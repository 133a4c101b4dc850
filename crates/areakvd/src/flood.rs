//! Flood scheduling with per-peer rate limiting
//!
//! The engine decides *when* a peer gets which keys; the area materializes
//! the actual values at send time so a batch always carries the latest state.

use crate::config::FloodRate;
use crate::store::UpdateKind;
use areakv_core::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Token bucket state for one peer
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: &FloodRate, now: Instant) -> Self {
        Self {
            tokens: rate.burst_size as f64,
            last_refill: now,
        }
    }

    fn try_acquire(&mut self, rate: &FloodRate, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate.messages_per_sec as f64)
            .min(rate.burst_size as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Keys due for one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloodBatch {
    pub peer: NodeId,
    pub keys: BTreeMap<String, UpdateKind>,
}

/// Flood counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloodStats {
    pub batches_sent: u64,
    pub batches_deferred: u64,
}

/// Per-area flood scheduler
#[derive(Debug)]
pub struct FloodEngine {
    rate: Option<FloodRate>,
    buckets: HashMap<NodeId, TokenBucket>,
    pending: BTreeMap<NodeId, BTreeMap<String, UpdateKind>>,
    stats: FloodStats,
}

impl FloodEngine {
    pub fn new(rate: Option<FloodRate>) -> Self {
        Self {
            rate,
            buckets: HashMap::new(),
            pending: BTreeMap::new(),
            stats: FloodStats::default(),
        }
    }

    /// Queue `keys` for every target and return the batches that may go out
    /// now. Peers out of tokens keep their keys pending for [`Self::flush`].
    pub fn propagate<I>(
        &mut self,
        targets: I,
        keys: &[(String, UpdateKind)],
        now: Instant,
    ) -> Vec<FloodBatch>
    where
        I: IntoIterator<Item = NodeId>,
    {
        if keys.is_empty() {
            return Vec::new();
        }

        let mut ready = Vec::new();
        for peer in targets {
            let pending = self.pending.entry(peer.clone()).or_default();
            for (key, kind) in keys {
                // A full update subsumes a lease refresh for the same key
                let slot = pending.entry(key.clone()).or_insert(*kind);
                *slot = (*slot).max(*kind);
            }
            if let Some(batch) = self.take_if_allowed(&peer, now) {
                ready.push(batch);
            }
        }
        ready
    }

    /// Release deferred batches for peers whose buckets have refilled
    pub fn flush(&mut self, now: Instant) -> Vec<FloodBatch> {
        let peers: Vec<NodeId> = self.pending.keys().cloned().collect();
        peers
            .into_iter()
            .filter_map(|peer| self.take_if_allowed(&peer, now))
            .collect()
    }

    fn take_if_allowed(&mut self, peer: &NodeId, now: Instant) -> Option<FloodBatch> {
        if self.pending.get(peer).map_or(true, BTreeMap::is_empty) {
            return None;
        }

        if let Some(rate) = &self.rate {
            let bucket = self
                .buckets
                .entry(peer.clone())
                .or_insert_with(|| TokenBucket::new(rate, now));
            if !bucket.try_acquire(rate, now) {
                self.stats.batches_deferred += 1;
                return None;
            }
        }

        let keys = self.pending.remove(peer)?;
        self.stats.batches_sent += 1;
        Some(FloodBatch {
            peer: peer.clone(),
            keys,
        })
    }

    /// Forget a peer's bucket and pending keys
    pub fn remove_peer(&mut self, peer: &NodeId) {
        self.buckets.remove(peer);
        self.pending.remove(peer);
    }

    /// Number of keys waiting across all peers
    pub fn pending_keys(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    pub fn stats(&self) -> &FloodStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn keys(names: &[&str], kind: UpdateKind) -> Vec<(String, UpdateKind)> {
        names.iter().map(|k| (k.to_string(), kind)).collect()
    }

    #[test]
    fn test_unlimited_sends_immediately() {
        let mut engine = FloodEngine::new(None);
        let peers = vec![NodeId::from("a"), NodeId::from("b")];
        let batches = engine.propagate(peers, &keys(&["k1"], UpdateKind::Full), Instant::now());
        assert_eq!(batches.len(), 2);
        assert_eq!(engine.pending_keys(), 0);
    }

    #[test]
    fn test_exhausted_bucket_batches_without_loss() {
        let rate = FloodRate {
            messages_per_sec: 10,
            burst_size: 2,
        };
        let mut engine = FloodEngine::new(Some(rate));
        let peer = NodeId::from("a");
        let t0 = Instant::now();

        for key in ["k1", "k2", "k3", "k4", "k5"] {
            engine.propagate([peer.clone()], &keys(&[key], UpdateKind::Full), t0);
        }
        assert_eq!(engine.stats().batches_sent, 2);
        assert_eq!(engine.pending_keys(), 3);
        assert!(engine.flush(t0).is_empty());

        let batches = engine.flush(t0 + Duration::from_millis(200));
        assert_eq!(batches.len(), 1);
        let batched: Vec<&String> = batches[0].keys.keys().collect();
        assert_eq!(batched, vec!["k3", "k4", "k5"]);
        assert_eq!(engine.pending_keys(), 0);
    }

    #[test]
    fn test_full_update_dominates_refresh() {
        let rate = FloodRate {
            messages_per_sec: 1,
            burst_size: 1,
        };
        let mut engine = FloodEngine::new(Some(rate));
        let peer = NodeId::from("a");
        let t0 = Instant::now();

        engine.propagate([peer.clone()], &keys(&["warmup"], UpdateKind::Full), t0);
        engine.propagate([peer.clone()], &keys(&["k"], UpdateKind::Full), t0);
        engine.propagate([peer.clone()], &keys(&["k"], UpdateKind::TtlRefresh), t0);

        let batches = engine.flush(t0 + Duration::from_secs(1));
        assert_eq!(batches[0].keys.get("k"), Some(&UpdateKind::Full));
    }

    #[test]
    fn test_remove_peer_drops_pending() {
        let rate = FloodRate {
            messages_per_sec: 1,
            burst_size: 1,
        };
        let mut engine = FloodEngine::new(Some(rate));
        let peer = NodeId::from("a");
        let t0 = Instant::now();
        engine.propagate([peer.clone()], &keys(&["k1"], UpdateKind::Full), t0);
        engine.propagate([peer.clone()], &keys(&["k2"], UpdateKind::Full), t0);
        assert_eq!(engine.pending_keys(), 1);

        engine.remove_peer(&peer);
        assert_eq!(engine.pending_keys(), 0);
    }
}
