//! One replication area
//!
//! All per-area state sits behind a single mutex: every write, whether local,
//! from a peer, from the TTL sweep or from sync, passes through
//! [`Area::merge_batch`] while holding it. Outbound messages go to the
//! [`PeerSink`], which never blocks.

use crate::config::{AreaConfig, KvStoreConfig, ValidationError};
use crate::filter::CompiledFilter;
use crate::flood::{FloodBatch, FloodEngine, FloodStats};
use crate::kvstore::KvStoreError;
use crate::publisher::{Delta, PublisherHub, SubscriberHandle};
use crate::spt::{SpanningTreeBuilder, TopoMessage};
use crate::store::{EntryStore, MergeOutcome, RejectReason, UpdateKind};
use crate::sync::{SyncEngine, SyncStats};
use crate::ttl::{Expiry, TtlManager};
use areakv_core::{
    AreaId, AreaSummary, FloodTopoSetParams, KeyVals, MessageBody, NodeId, PeerMessage,
    PeerSpec, PeerState, Publication, SptInfos, Value,
};
use areakv_net::peer::unix_millis;
use areakv_net::PeerSink;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Where a batch of candidate writes came from
#[derive(Debug, Clone, Copy)]
enum Source<'a> {
    Local,
    Peer(&'a NodeId),
    /// Answer to our own pull; mismatches here are not pulled again
    Pull(&'a NodeId),
}

impl<'a> Source<'a> {
    fn peer(&self) -> Option<&'a NodeId> {
        match *self {
            Source::Local => None,
            Source::Peer(peer) | Source::Pull(peer) => Some(peer),
        }
    }
}

/// Summary of one merge batch
#[derive(Debug, Default)]
pub struct MergeReport {
    pub accepted: Vec<(String, UpdateKind)>,
    pub unchanged: usize,
    pub rejected: usize,
    /// Keys to pull in full from the sender
    pub repull: Vec<String>,
}

/// Internal counters of one area
#[derive(Debug, Clone)]
pub struct AreaStats {
    pub area: AreaId,
    pub flood: FloodStats,
    pub sync: SyncStats,
    /// Keys waiting on rate limits
    pub pending_floods: usize,
    /// Lease deadlines queued, including stale ones
    pub ttl_deadlines: usize,
    pub next_ttl_deadline: Option<Instant>,
    pub persisted_keys: usize,
}

struct AreaState {
    store: EntryStore,
    ttl: TtlManager,
    flood: FloodEngine,
    spt: SpanningTreeBuilder,
    sync: SyncEngine,
    hub: PublisherHub,
}

pub struct Area {
    id: AreaId,
    node_id: NodeId,
    config: AreaConfig,
    sink: Arc<dyn PeerSink>,
    state: Mutex<AreaState>,
    synced_tx: watch::Sender<bool>,
}

impl Area {
    pub fn new(
        node_id: NodeId,
        config: AreaConfig,
        store_config: &KvStoreConfig,
        sink: Arc<dyn PeerSink>,
        now: Instant,
    ) -> Self {
        let state = AreaState {
            store: EntryStore::new(config.tombstone_grace()),
            ttl: TtlManager::new(node_id.clone(), config.key_ttl(), config.tombstone_grace()),
            flood: FloodEngine::new(config.flood_rate),
            spt: SpanningTreeBuilder::new(
                node_id.clone(),
                config.is_flood_root,
                config.flood_root.clone(),
            ),
            sync: SyncEngine::new(
                store_config.sync_timeout(),
                store_config.anti_entropy_interval(),
                store_config.initial_sync_timeout(),
                now,
            ),
            hub: PublisherHub::new(),
        };
        let (synced_tx, _) = watch::channel(false);

        Self {
            id: config.area_id.clone(),
            node_id,
            config,
            sink,
            state: Mutex::new(state),
            synced_tx,
        }
    }

    pub fn id(&self) -> &AreaId {
        &self.id
    }

    pub fn config(&self) -> &AreaConfig {
        &self.config
    }

    // =========================================================================
    // Merge path
    // =========================================================================

    fn merge_batch(
        &self,
        state: &mut AreaState,
        entries: KeyVals,
        source: Source<'_>,
        now: Instant,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut deltas = Vec::new();
        let mut reassert = KeyVals::new();

        for (key, value) in entries {
            match state.store.apply(&key, value, now) {
                MergeOutcome::Accepted(kind) => {
                    let Some(entry) = state.store.get(&key) else {
                        continue;
                    };
                    state.ttl.schedule(&key, entry);
                    deltas.push(Delta {
                        key: key.clone(),
                        value: entry.current(now),
                        kind,
                    });
                    if kind == UpdateKind::Full {
                        if let Some(value) = state.ttl.reassertion(&key, &state.store) {
                            reassert.insert(key.clone(), value);
                        }
                    }
                    report.accepted.push((key, kind));
                }
                MergeOutcome::AcceptedNoChange => report.unchanged += 1,
                MergeOutcome::Rejected(reason) => {
                    report.rejected += 1;
                    match reason {
                        RejectReason::Stale => {
                            trace!("Area {}: conflict rejected for {}", self.id, key);
                        }
                        RejectReason::InvalidTtl => {
                            debug!("Area {}: invalid ttl for {}", self.id, key);
                        }
                        RejectReason::HashMismatch => {
                            warn!(
                                "Area {}: hash mismatch for {} from {}",
                                self.id,
                                key,
                                source.peer().map(NodeId::as_str).unwrap_or("local")
                            );
                            report.repull.push(key);
                        }
                        RejectReason::UnknownTtlTarget => {
                            debug!("Area {}: ttl refresh for unknown version of {}", self.id, key);
                            report.repull.push(key);
                        }
                    }
                }
            }
        }

        if !deltas.is_empty() {
            state.hub.publish(&self.id, &deltas, &[], unix_millis());
        }
        self.propagate(state, &report.accepted, source.peer(), now);

        if let Some(peer) = source.peer() {
            if report.unchanged > 0 {
                state.sync.note_exchange(peer, now);
            }
            if matches!(source, Source::Peer(_)) && !report.repull.is_empty() {
                self.send(
                    peer,
                    MessageBody::PullRequest {
                        keys: report.repull.clone(),
                    },
                );
            }
        }

        if !reassert.is_empty() {
            info!(
                "Area {}: re-asserting {} overridden persistent keys",
                self.id,
                reassert.len()
            );
            let again = self.merge_batch(state, reassert, Source::Local, now);
            report.accepted.extend(again.accepted);
        }

        report
    }

    fn flood_targets(&self, state: &AreaState, exclude: Option<&NodeId>) -> Vec<NodeId> {
        let tree = if self.config.enable_flood_optimization {
            state.spt.flood_peers()
        } else {
            None
        };
        state
            .sync
            .active_peers()
            .filter(|peer| Some(*peer) != exclude)
            .filter(|peer| tree.as_ref().map_or(true, |t| t.contains(*peer)))
            .cloned()
            .collect()
    }

    fn propagate(
        &self,
        state: &mut AreaState,
        keys: &[(String, UpdateKind)],
        exclude: Option<&NodeId>,
        now: Instant,
    ) {
        if keys.is_empty() {
            return;
        }
        let targets = self.flood_targets(state, exclude);
        let batches = state.flood.propagate(targets, keys, now);
        self.send_batches(state, batches, now);
    }

    fn send_batches(&self, state: &AreaState, batches: Vec<FloodBatch>, now: Instant) {
        for batch in batches {
            let mut full = KeyVals::new();
            let mut refresh = KeyVals::new();
            for (key, kind) in batch.keys {
                let Some(entry) = state.store.get(&key) else {
                    continue;
                };
                let Some(value) = entry.flood_value(now, self.config.ttl_decrement_ms) else {
                    continue;
                };
                match kind {
                    UpdateKind::Full => full.insert(key, value),
                    UpdateKind::TtlRefresh => refresh.insert(key, value.without_value()),
                };
            }
            if !full.is_empty() {
                self.send(&batch.peer, MessageBody::Update { entries: full });
            }
            if !refresh.is_empty() {
                self.send(&batch.peer, MessageBody::TtlRefresh { entries: refresh });
            }
        }
    }

    fn send(&self, peer: &NodeId, body: MessageBody) {
        let kind = body.kind();
        let message = PeerMessage {
            area: self.id.clone(),
            sender: self.node_id.clone(),
            body,
        };
        if let Err(e) = self.sink.send(peer, message) {
            debug!("Area {}: {} to {} not sent: {}", self.id, kind, peer, e);
        }
    }

    fn send_topology(&self, messages: Vec<TopoMessage>) {
        for (peer, body) in messages {
            self.send(&peer, body);
        }
    }

    fn mark_synced(&self) {
        info!("Area {} initial sync complete", self.id);
        self.synced_tx.send_replace(true);
    }

    // =========================================================================
    // Local API
    // =========================================================================

    /// Write entries through the merge path. Returns the number accepted.
    pub fn set_keys(&self, entries: KeyVals, now: Instant) -> Result<usize, KvStoreError> {
        for (key, value) in &entries {
            if value.check_ttl().is_err() {
                return Err(ValidationError::InvalidEntryTtl {
                    key: key.clone(),
                    ttl_ms: value.ttl_ms,
                }
                .into());
            }
        }
        let mut guard = self.state.lock();
        let report = self.merge_batch(&mut guard, entries, Source::Local, now);
        Ok(report.accepted.len())
    }

    /// Exact-key lookup; missing keys are omitted
    pub fn get_keys(&self, keys: &[String], now: Instant) -> KeyVals {
        let state = self.state.lock();
        keys.iter()
            .filter_map(|key| Some((key.clone(), state.store.get(key)?.current(now))))
            .collect()
    }

    fn snapshot(&self, state: &AreaState, filter: &CompiledFilter, now: Instant) -> Publication {
        Publication {
            area: Some(self.id.clone()),
            key_vals: state
                .store
                .iter()
                .filter_map(|(key, entry)| {
                    filter
                        .snapshot_value(key, &entry.current(now))
                        .map(|v| (key.clone(), v))
                })
                .collect(),
            expired_keys: Vec::new(),
            timestamp_ms: unix_millis(),
        }
    }

    /// Filtered dump of the area
    pub fn dump(&self, filter: &CompiledFilter, now: Instant) -> Publication {
        let state = self.state.lock();
        self.snapshot(&state, filter, now)
    }

    /// Filtered dump with values stripped and hashes kept
    pub fn dump_hashes(&self, filter: &CompiledFilter, now: Instant) -> Publication {
        let mut publication = self.dump(filter, now);
        for value in publication.key_vals.values_mut() {
            *value = value.without_value();
        }
        publication
    }

    /// Take the snapshot and register the subscriber in one critical
    /// section so no change falls between them.
    pub fn subscribe(&self, handle: SubscriberHandle, now: Instant) -> Publication {
        let mut state = self.state.lock();
        let snapshot = self.snapshot(&state, handle.filter(), now);
        state.hub.register(handle);
        snapshot
    }

    pub fn num_subscribers(&self) -> usize {
        self.state.lock().hub.len()
    }

    /// Drop a subscriber's handle and filter now. Returns whether it was
    /// registered here.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.state.lock().hub.remove(id)
    }

    pub fn summary(&self) -> AreaSummary {
        let state = self.state.lock();
        AreaSummary {
            area: self.id.clone(),
            key_count: state.store.len(),
            key_bytes: state.store.total_bytes(),
            peer_count: state.sync.len(),
            flood_root_id: state.spt.flood_root(),
        }
    }

    pub fn stats(&self) -> AreaStats {
        let state = self.state.lock();
        AreaStats {
            area: self.id.clone(),
            flood: state.flood.stats().clone(),
            sync: state.sync.stats(),
            pending_floods: state.flood.pending_keys(),
            ttl_deadlines: state.ttl.pending(),
            next_ttl_deadline: state.ttl.next_deadline(),
            persisted_keys: state.ttl.persisted_len(),
        }
    }

    /// Keep a self-originated key alive until [`Area::unset_key`]
    pub fn persist_key(&self, key: &str, value: Vec<u8>, now: Instant) -> Result<(), KvStoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let candidate = match state.store.get(key) {
            Some(entry)
                if entry.value.originator_id() == &self.node_id
                    && entry.value.value() == Some(value.as_slice()) =>
            {
                None
            }
            Some(entry) => Some(entry.value.version() + 1),
            None => Some(1),
        }
        .map(|version| {
            Value::new(
                version,
                self.node_id.clone(),
                value.clone(),
                self.config.key_ttl_ms,
            )
        });

        state.ttl.persist(key, value, now);
        if let Some(candidate) = candidate {
            let mut entries = KeyVals::new();
            entries.insert(key.to_string(), candidate);
            self.merge_batch(state, entries, Source::Local, now);
        }
        Ok(())
    }

    /// Stop refreshing a persisted key and tombstone it if we own it.
    /// Returns whether the key was persisted.
    pub fn unset_key(&self, key: &str, now: Instant) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let was_persisted = state.ttl.unpersist(key);

        let tombstone = state.store.get(key).and_then(|entry| {
            (entry.value.originator_id() == &self.node_id && !entry.value.is_tombstone()).then(
                || {
                    Value::tombstone(
                        entry.value.version() + 1,
                        self.node_id.clone(),
                        self.config.tombstone_grace_ms,
                    )
                },
            )
        });
        if let Some(tombstone) = tombstone {
            let mut entries = KeyVals::new();
            entries.insert(key.to_string(), tombstone);
            self.merge_batch(state, entries, Source::Local, now);
        }
        was_persisted
    }

    // =========================================================================
    // Peers & topology
    // =========================================================================

    /// Add a peer and start the initial sync with it. Returns `false` if it
    /// was already known at this endpoint.
    pub fn add_peer(&self, peer: &NodeId, endpoint: &str, now: Instant) -> bool {
        if *peer == self.node_id {
            warn!("Area {}: refusing to peer with ourselves", self.id);
            return false;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.sync.register_peer(peer, endpoint) {
            return false;
        }
        info!("Area {}: peer {} added at {}", self.id, peer, endpoint);

        let messages = state.spt.peer_up(peer);
        self.send_topology(messages);
        if let Some(request) = state.sync.start_sync(peer, &state.store, &[], now) {
            self.send(peer, request);
        }
        true
    }

    pub fn del_peer(&self, peer: &NodeId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.sync.unregister_peer(peer).is_none() {
            return false;
        }
        info!("Area {}: peer {} removed", self.id, peer);

        state.flood.remove_peer(peer);
        let messages = state.spt.peer_down(peer);
        self.send_topology(messages);
        true
    }

    pub fn peers(&self) -> BTreeMap<NodeId, PeerSpec> {
        self.state.lock().sync.peers()
    }

    pub fn has_peer(&self, peer: &NodeId) -> bool {
        self.state.lock().sync.contains(peer)
    }

    pub fn spanning_tree_info(&self) -> SptInfos {
        self.state.lock().spt.info()
    }

    /// Apply a child (un)registration as if `params.src_id` had sent it
    pub fn update_flood_topology_child(&self, params: &FloodTopoSetParams) -> bool {
        self.state.lock().spt.handle_set_child(params)
    }

    fn restart_session(&self, state: &mut AreaState, peer: &NodeId, now: Instant) {
        let mut messages = state.spt.peer_down(peer);
        messages.extend(state.spt.peer_up(peer));
        self.send_topology(messages);
        if let Some(request) = state.sync.start_sync(peer, &state.store, &[], now) {
            self.send(peer, request);
        }
    }

    /// Reset a failed session: back to syncing, topology recomputed,
    /// entries kept.
    pub fn peer_session_failed(&self, peer: &NodeId, now: Instant) -> Result<(), KvStoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.sync.contains(peer) {
            return Err(KvStoreError::UnknownPeer {
                area: self.id.clone(),
                peer: peer.clone(),
            });
        }
        state.sync.mark_failure(peer);
        let failures = state.sync.session(peer).map_or(0, |s| s.failures);
        warn!(
            "Area {}: session with {} failed ({} in a row), resyncing",
            self.id, peer, failures
        );
        self.restart_session(state, peer, now);
        Ok(())
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        self.state.lock().sync.is_synced()
    }

    // =========================================================================
    // Inbound messages
    // =========================================================================

    pub fn handle_message(&self, message: PeerMessage, now: Instant) -> Result<(), KvStoreError> {
        let sender = message.sender;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.sync.contains(&sender) {
            return Err(KvStoreError::UnknownPeer {
                area: self.id.clone(),
                peer: sender,
            });
        }
        trace!("Area {}: {} from {}", self.id, message.body.kind(), sender);

        match message.body {
            MessageBody::Update { entries } => {
                self.merge_batch(state, entries, Source::Peer(&sender), now);
            }
            MessageBody::TtlRefresh { entries } => {
                if entries.values().any(|v| !v.is_ttl_only()) {
                    return Err(self.protocol_error(&sender, "ttl refresh carrying values"));
                }
                self.merge_batch(state, entries, Source::Peer(&sender), now);
            }
            MessageBody::SyncRequest {
                digests,
                key_prefixes,
            } => {
                let response = SyncEngine::build_sync_response(
                    &state.store,
                    &digests,
                    &key_prefixes,
                    now,
                    self.config.ttl_decrement_ms,
                );
                self.send(&sender, response);
                let messages = state.spt.readvertise(&sender);
                self.send_topology(messages);
            }
            MessageBody::SyncResponse {
                entries,
                to_be_updated_keys,
            } => {
                let report = self.merge_batch(state, entries, Source::Peer(&sender), now);
                let push = SyncEngine::collect_entries(
                    &state.store,
                    &to_be_updated_keys,
                    now,
                    self.config.ttl_decrement_ms,
                );
                if !push.is_empty() {
                    self.send(&sender, MessageBody::Update { entries: push });
                }
                if state.sync.state(&sender) == Some(PeerState::Syncing) {
                    info!(
                        "Area {}: synced with {} ({} accepted, {} pushed back)",
                        self.id,
                        sender,
                        report.accepted.len(),
                        to_be_updated_keys.len()
                    );
                    if state.sync.complete_sync(&sender, now) {
                        self.mark_synced();
                    }
                }
            }
            MessageBody::TopologyAdvert { costs } => {
                let messages = state.spt.handle_advert(&sender, costs);
                self.send_topology(messages);
            }
            MessageBody::FloodTopoSet(params) => {
                if params.src_id != sender {
                    return Err(self.protocol_error(&sender, "flood topology for another node"));
                }
                state.spt.handle_set_child(&params);
            }
            MessageBody::DigestRequest { digests } => {
                let diff = SyncEngine::diff(&state.store, &digests, &[]);
                if !diff.theirs_newer.is_empty() {
                    self.send(
                        &sender,
                        MessageBody::PullRequest {
                            keys: diff.theirs_newer,
                        },
                    );
                }
                self.send(
                    &sender,
                    MessageBody::DigestResponse {
                        mismatched: diff.ours_newer,
                    },
                );
                state.sync.note_exchange(&sender, now);
            }
            MessageBody::DigestResponse { mismatched } => {
                if !mismatched.is_empty() {
                    debug!(
                        "Area {}: anti-entropy with {} found {} stale keys",
                        self.id,
                        sender,
                        mismatched.len()
                    );
                    self.send(&sender, MessageBody::PullRequest { keys: mismatched });
                }
                state.sync.note_exchange(&sender, now);
            }
            MessageBody::PullRequest { keys } => {
                let entries = SyncEngine::collect_entries(
                    &state.store,
                    &keys,
                    now,
                    self.config.ttl_decrement_ms,
                );
                if !entries.is_empty() {
                    self.send(&sender, MessageBody::PullResponse { entries });
                }
            }
            MessageBody::PullResponse { entries } => {
                self.merge_batch(state, entries, Source::Pull(&sender), now);
            }
        }
        Ok(())
    }

    fn protocol_error(&self, peer: &NodeId, reason: &str) -> KvStoreError {
        warn!("Area {}: protocol error from {}: {}", self.id, peer, reason);
        KvStoreError::Protocol {
            area: self.id.clone(),
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Expire leases, purge tombstones past their grace period, refresh
    /// persisted keys, then check that no accepted write went backwards.
    pub fn process_ttl(&self, now: Instant) -> Result<(), KvStoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut tombstones = KeyVals::new();
        let mut purged = Vec::new();
        for expiry in state.ttl.expired(&state.store, now) {
            match expiry {
                Expiry::Tombstone { key, tombstone } => {
                    debug!("Area {}: {} expired", self.id, key);
                    tombstones.insert(key, tombstone);
                }
                Expiry::Purge { key, originator_id } => {
                    state.store.remove(&key);
                    purged.push((key, originator_id));
                }
            }
        }
        if !purged.is_empty() {
            debug!("Area {}: purged {} tombstones", self.id, purged.len());
            state.hub.publish(&self.id, &[], &purged, unix_millis());
        }
        if !tombstones.is_empty() {
            self.merge_batch(state, tombstones, Source::Local, now);
        }

        let refreshes: KeyVals = state.ttl.refreshes_due(&state.store, now).into_iter().collect();
        if !refreshes.is_empty() {
            self.merge_batch(state, refreshes, Source::Local, now);
        }

        match state.store.take_regression() {
            None => Ok(()),
            Some(key) => {
                error!("Area {}: accepted write for {} did not advance it", self.id, key);
                Err(KvStoreError::InvariantViolation {
                    area: self.id.clone(),
                    detail: format!("{}: merge order went backwards", key),
                })
            }
        }
    }

    /// Send batches deferred by rate limiting
    pub fn flush_floods(&self, now: Instant) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let batches = state.flood.flush(now);
        self.send_batches(state, batches, now);
    }

    /// Send digest requests to established peers that are due
    pub fn run_anti_entropy(&self, now: Instant) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let due = state.sync.peers_needing_anti_entropy(now);
        for peer in &due {
            self.send(
                peer,
                MessageBody::DigestRequest {
                    digests: state.store.digests(&[]),
                },
            );
            state.sync.note_exchange(peer, now);
        }
        due.len()
    }

    /// Retry timed-out syncs and evaluate the initial-sync deadline
    pub fn check_sessions(&self, now: Instant) -> Vec<NodeId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let expired = state.sync.expired_syncs(now);
        for peer in &expired {
            warn!("Area {}: sync with {} timed out, retrying", self.id, peer);
            self.restart_session(state, peer, now);
        }
        if state.sync.check_initial_sync(now) {
            self.mark_synced();
        }
        expired
    }

    /// Keys waiting on rate limits
    pub fn pending_floods(&self) -> usize {
        self.state.lock().flood.pending_keys()
    }

    /// Peers this area would flood a fresh local write to
    pub fn flood_peers(&self) -> BTreeSet<NodeId> {
        let state = self.state.lock();
        self.flood_targets(&state, None).into_iter().collect()
    }
}
