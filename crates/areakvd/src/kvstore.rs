//! Store facade over all configured areas
//!
//! Routes every call to its area. No lock spans areas: multi-area reads and
//! subscriptions take one per-area snapshot after another.

use crate::area::{Area, AreaStats};
use crate::config::{KvStoreConfig, ValidationError};
use crate::filter::CompiledFilter;
use crate::publisher::{subscription_channel, Subscription};
use areakv_core::{
    AreaId, AreaSummary, FloodTopoSetParams, KeyFilter, KeyVals, NodeId, PeerMessage, PeerSpec,
    Publication, SptInfos,
};
use areakv_net::PeerSink;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Store errors
#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("Unknown area: {0}")]
    UnknownArea(AreaId),
    #[error("Unknown peer {peer} in area {area}")]
    UnknownPeer { area: AreaId, peer: NodeId },
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Protocol error from {peer} in area {area}: {reason}")]
    Protocol {
        area: AreaId,
        peer: NodeId,
        reason: String,
    },
    #[error("Invariant violated in area {area}: {detail}")]
    InvariantViolation { area: AreaId, detail: String },
}

impl KvStoreError {
    /// Errors the daemon must not continue past
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

/// The replicated store
pub struct KvStore {
    node_id: NodeId,
    areas: BTreeMap<AreaId, Area>,
    subscriber_queue_size: usize,
    next_subscriber_id: AtomicU64,
}

impl KvStore {
    /// Build the store from a validated configuration
    pub fn new(config: &KvStoreConfig, sink: Arc<dyn PeerSink>) -> Result<Self, KvStoreError> {
        config.validate()?;
        let now = Instant::now();

        let areas = config
            .areas
            .iter()
            .map(|area| {
                (
                    area.area_id.clone(),
                    Area::new(config.node_id.clone(), area.clone(), config, sink.clone(), now),
                )
            })
            .collect();

        info!(
            "KvStore for {} with {} areas",
            config.node_id,
            config.areas.len()
        );
        Ok(Self {
            node_id: config.node_id.clone(),
            areas,
            subscriber_queue_size: config.subscriber_queue_size,
            next_subscriber_id: AtomicU64::new(1),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn area_ids(&self) -> Vec<AreaId> {
        self.areas.keys().cloned().collect()
    }

    pub fn area(&self, area: &AreaId) -> Result<&Area, KvStoreError> {
        self.areas
            .get(area)
            .ok_or_else(|| KvStoreError::UnknownArea(area.clone()))
    }

    // =========================================================================
    // Keys
    // =========================================================================

    pub fn set_keys(&self, area: &AreaId, entries: KeyVals) -> Result<usize, KvStoreError> {
        self.area(area)?.set_keys(entries, Instant::now())
    }

    pub fn get_keys(&self, area: &AreaId, keys: &[String]) -> Result<KeyVals, KvStoreError> {
        Ok(self.area(area)?.get_keys(keys, Instant::now()))
    }

    pub fn dump_keys(
        &self,
        area: &AreaId,
        filter: &KeyFilter,
    ) -> Result<Publication, KvStoreError> {
        let filter = CompiledFilter::compile(filter)?;
        Ok(self.area(area)?.dump(&filter, Instant::now()))
    }

    pub fn dump_hashes(
        &self,
        area: &AreaId,
        filter: &KeyFilter,
    ) -> Result<Publication, KvStoreError> {
        let filter = CompiledFilter::compile(filter)?;
        Ok(self.area(area)?.dump_hashes(&filter, Instant::now()))
    }

    pub fn persist_key(
        &self,
        area: &AreaId,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), KvStoreError> {
        self.area(area)?.persist_key(key, value.into(), Instant::now())
    }

    pub fn unset_key(&self, area: &AreaId, key: &str) -> Result<bool, KvStoreError> {
        Ok(self.area(area)?.unset_key(key, Instant::now()))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Snapshot (one publication per area) plus a live stream of changes.
    ///
    /// An empty `areas` subscribes to every area.
    pub fn subscribe(
        &self,
        filter: &KeyFilter,
        areas: &[AreaId],
    ) -> Result<(Vec<Publication>, Subscription), KvStoreError> {
        let compiled = CompiledFilter::compile(filter)?;
        let selected: Vec<&Area> = if areas.is_empty() {
            self.areas.values().collect()
        } else {
            areas
                .iter()
                .map(|id| self.area(id))
                .collect::<Result<_, _>>()?
        };

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (handle, subscription) =
            subscription_channel(id, compiled, self.subscriber_queue_size);

        let now = Instant::now();
        let snapshot = selected
            .into_iter()
            .map(|area| area.subscribe(handle.clone(), now))
            .collect();
        Ok((snapshot, subscription))
    }

    /// Cancel `subscription` and release its handle in every area at once
    pub fn unsubscribe(&self, subscription: &Subscription) -> usize {
        subscription.cancel();
        let released = self
            .areas
            .values()
            .filter(|area| area.unsubscribe(subscription.id()))
            .count();
        debug!("Subscriber {} released from {} areas", subscription.id(), released);
        released
    }

    pub fn num_subscribers(&self) -> usize {
        self.areas
            .values()
            .map(Area::num_subscribers)
            .max()
            .unwrap_or(0)
    }

    // =========================================================================
    // Peers & topology
    // =========================================================================

    pub fn add_peer(
        &self,
        area: &AreaId,
        peer: &NodeId,
        endpoint: &str,
    ) -> Result<bool, KvStoreError> {
        Ok(self.area(area)?.add_peer(peer, endpoint, Instant::now()))
    }

    pub fn del_peer(&self, area: &AreaId, peer: &NodeId) -> Result<bool, KvStoreError> {
        Ok(self.area(area)?.del_peer(peer))
    }

    pub fn get_peers(&self, area: &AreaId) -> Result<BTreeMap<NodeId, PeerSpec>, KvStoreError> {
        Ok(self.area(area)?.peers())
    }

    /// Areas where `peer` is configured
    pub fn areas_with_peer(&self, peer: &NodeId) -> Vec<AreaId> {
        self.areas
            .values()
            .filter(|area| area.has_peer(peer))
            .map(|area| area.id().clone())
            .collect()
    }

    pub fn spanning_tree_info(&self, area: &AreaId) -> Result<SptInfos, KvStoreError> {
        Ok(self.area(area)?.spanning_tree_info())
    }

    pub fn update_flood_topology_child(
        &self,
        area: &AreaId,
        params: &FloodTopoSetParams,
    ) -> Result<bool, KvStoreError> {
        Ok(self.area(area)?.update_flood_topology_child(params))
    }

    /// Summaries for the requested areas (all when empty); unknown areas
    /// are skipped.
    pub fn area_summary(&self, areas: &[AreaId]) -> Vec<AreaSummary> {
        if areas.is_empty() {
            return self.areas.values().map(Area::summary).collect();
        }
        areas
            .iter()
            .filter_map(|id| self.areas.get(id))
            .map(Area::summary)
            .collect()
    }

    /// Internal counters of every area
    pub fn area_stats(&self) -> Vec<AreaStats> {
        self.areas.values().map(Area::stats).collect()
    }

    pub fn peer_session_failed(&self, area: &AreaId, peer: &NodeId) -> Result<(), KvStoreError> {
        self.area(area)?.peer_session_failed(peer, Instant::now())
    }

    pub fn synced(&self, area: &AreaId) -> Result<watch::Receiver<bool>, KvStoreError> {
        Ok(self.area(area)?.synced())
    }

    // =========================================================================
    // Inbound messages & background work
    // =========================================================================

    pub fn handle_message(&self, message: PeerMessage) -> Result<(), KvStoreError> {
        self.handle_message_at(message, Instant::now())
    }

    pub fn handle_message_at(
        &self,
        message: PeerMessage,
        now: Instant,
    ) -> Result<(), KvStoreError> {
        let Some(area) = self.areas.get(&message.area) else {
            warn!(
                "{} from {} for unknown area {}",
                message.body.kind(),
                message.sender,
                message.area
            );
            return Err(KvStoreError::UnknownArea(message.area));
        };
        area.handle_message(message, now)
    }

    pub fn process_ttl(&self, now: Instant) -> Result<(), KvStoreError> {
        for area in self.areas.values() {
            area.process_ttl(now)?;
        }
        Ok(())
    }

    pub fn flush_floods(&self, now: Instant) {
        for area in self.areas.values() {
            area.flush_floods(now);
        }
    }

    pub fn run_anti_entropy(&self, now: Instant) -> usize {
        self.areas.values().map(|a| a.run_anti_entropy(now)).sum()
    }

    pub fn check_sessions(&self, now: Instant) {
        for area in self.areas.values() {
            area.check_sessions(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AreaConfig;
    use areakv_core::{FilterOperator, MessageBody, Value, TTL_INFINITY};
    use areakv_net::TransportError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(NodeId, PeerMessage)>>,
    }

    impl PeerSink for RecordingSink {
        fn send(&self, peer: &NodeId, message: PeerMessage) -> Result<(), TransportError> {
            self.sent.lock().push((peer.clone(), message));
            Ok(())
        }
    }

    fn store(areas: &[&str]) -> (KvStore, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = KvStoreConfig::new(
            "node1",
            areas.iter().map(|a| AreaConfig::new(*a)).collect(),
        );
        (KvStore::new(&config, sink.clone()).unwrap(), sink)
    }

    fn kv(key: &str, value: Value) -> KeyVals {
        KeyVals::from([(key.to_string(), value)])
    }

    #[test]
    fn test_set_and_get() {
        let (store, _) = store(&["spine"]);
        let area = AreaId::from("spine");
        let accepted = store
            .set_keys(&area, kv("k", Value::new(1, "node1", b"v".to_vec(), TTL_INFINITY)))
            .unwrap();
        assert_eq!(accepted, 1);

        let got = store.get_keys(&area, &["k".into(), "missing".into()]).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["k"].value(), Some(&b"v"[..]));
    }

    #[test]
    fn test_invalid_ttl_rejected_whole_batch() {
        let (store, _) = store(&["spine"]);
        let area = AreaId::from("spine");
        let mut entries = kv("good", Value::new(1, "node1", b"v".to_vec(), 1000));
        entries.insert("bad".into(), Value::new(1, "node1", b"v".to_vec(), -5));

        assert!(matches!(
            store.set_keys(&area, entries),
            Err(KvStoreError::Validation(ValidationError::InvalidEntryTtl { .. }))
        ));
        assert!(store.get_keys(&area, &["good".into()]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_area() {
        let (store, _) = store(&["spine"]);
        let area = AreaId::from("plane");
        assert!(matches!(
            store.get_keys(&area, &[]),
            Err(KvStoreError::UnknownArea(_))
        ));

        let message = PeerMessage {
            area: area.clone(),
            sender: NodeId::from("node2"),
            body: MessageBody::PullRequest { keys: vec![] },
        };
        assert!(matches!(
            store.handle_message(message),
            Err(KvStoreError::UnknownArea(_))
        ));
    }

    #[test]
    fn test_area_summary_skips_unknown() {
        let (store, _) = store(&["spine", "pod"]);
        store
            .set_keys(
                &AreaId::from("pod"),
                kv("k", Value::new(1, "node1", b"abc".to_vec(), TTL_INFINITY)),
            )
            .unwrap();

        let summaries = store.area_summary(&[AreaId::from("pod"), AreaId::from("nope")]);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].key_count, 1);
        assert_eq!(summaries[0].key_bytes, 4);
        assert_eq!(store.area_summary(&[]).len(), 2);
    }

    #[test]
    fn test_keys_in_areas_do_not_interact() {
        let (store, _) = store(&["spine", "pod"]);
        store
            .set_keys(
                &AreaId::from("spine"),
                kv("k", Value::new(5, "node1", b"spine".to_vec(), TTL_INFINITY)),
            )
            .unwrap();
        store
            .set_keys(
                &AreaId::from("pod"),
                kv("k", Value::new(1, "node1", b"pod".to_vec(), TTL_INFINITY)),
            )
            .unwrap();

        let pod = store.get_keys(&AreaId::from("pod"), &["k".into()]).unwrap();
        assert_eq!(pod["k"].value(), Some(&b"pod"[..]));
    }

    #[test]
    fn test_add_peer_starts_sync() {
        let (store, sink) = store(&["spine"]);
        let area = AreaId::from("spine");
        assert!(store.add_peer(&area, &NodeId::from("node2"), "10.0.0.2:9100").unwrap());
        assert!(!store.add_peer(&area, &NodeId::from("node2"), "10.0.0.2:9100").unwrap());

        let peers = store.get_peers(&area).unwrap();
        assert_eq!(peers[&NodeId::from("node2")].state, areakv_core::PeerState::Syncing);

        let sent = sink.sent.lock();
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m.body, MessageBody::SyncRequest { .. })));
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m.body, MessageBody::TopologyAdvert { .. })));
    }

    #[test]
    fn test_message_from_unknown_peer() {
        let (store, _) = store(&["spine"]);
        let message = PeerMessage {
            area: AreaId::from("spine"),
            sender: NodeId::from("stranger"),
            body: MessageBody::PullRequest { keys: vec![] },
        };
        assert!(matches!(
            store.handle_message(message),
            Err(KvStoreError::UnknownPeer { .. })
        ));
    }

    #[test]
    fn test_subscribe_validates_filter_and_areas() {
        let (store, _) = store(&["spine"]);
        assert!(matches!(
            store.subscribe(&KeyFilter::with_keys(["("]), &[]),
            Err(KvStoreError::Validation(_))
        ));
        assert!(matches!(
            store.subscribe(&KeyFilter::default(), &[AreaId::from("nope")]),
            Err(KvStoreError::UnknownArea(_))
        ));
        assert_eq!(store.num_subscribers(), 0);
    }

    #[test]
    fn test_dump_hashes_strip_values() {
        let (store, _) = store(&["spine"]);
        let area = AreaId::from("spine");
        let value = Value::new(1, "node1", b"payload".to_vec(), TTL_INFINITY);
        store.set_keys(&area, kv("adj:1", value.clone())).unwrap();
        store
            .set_keys(&area, kv("prefix:1", Value::new(1, "node1", b"p".to_vec(), TTL_INFINITY)))
            .unwrap();

        let filter = KeyFilter::with_keys(["adj"]).with_combinator(FilterOperator::And);
        let dump = store.dump_hashes(&area, &filter).unwrap();
        assert_eq!(dump.key_vals.len(), 1);
        assert!(dump.key_vals["adj:1"].value().is_none());
        assert_eq!(dump.key_vals["adj:1"].hash(), value.hash());

        let full = store.dump_keys(&area, &KeyFilter::default()).unwrap();
        assert_eq!(full.key_vals.len(), 2);
    }

    #[test]
    fn test_unsubscribe_releases_every_area() {
        let (store, _) = store(&["spine", "pod"]);
        let (snapshot, mut subscription) = store.subscribe(&KeyFilter::default(), &[]).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(store.num_subscribers(), 1);

        assert_eq!(store.unsubscribe(&subscription), 2);
        assert_eq!(store.num_subscribers(), 0);
        assert!(subscription.try_recv().is_none());
        assert_eq!(store.unsubscribe(&subscription), 0);
    }

    #[test]
    fn test_area_stats_track_persisted_keys() {
        let (store, _) = store(&["spine"]);
        let area = AreaId::from("spine");
        store.persist_key(&area, "adj:node1", b"links".to_vec()).unwrap();

        let stats = store.area_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].persisted_keys, 1);
        assert_eq!(stats[0].ttl_deadlines, 1);
        assert!(stats[0].next_ttl_deadline.is_some());
        assert_eq!(stats[0].sync.peer_count, 0);
    }
}
