//! Peer session tracking, full sync and anti-entropy

use crate::store::{compare, matches_prefix, Comparison, EntryStore, Stamp};
use areakv_core::{KeyDigest, KeyVals, MessageBody, NodeId, PeerSpec, PeerState};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::warn;

/// Sync state for one peer
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub endpoint: String,
    pub state: PeerState,
    /// When the outstanding sync request was sent
    pub sync_started: Option<Instant>,
    /// Last completed full sync or anti-entropy round
    pub last_sync: Option<Instant>,
    /// Number of completed full syncs
    pub sync_count: u64,
    /// Consecutive failures
    pub failures: u32,
}

impl PeerSession {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            state: PeerState::Idle,
            sync_started: None,
            last_sync: None,
            sync_count: 0,
            failures: 0,
        }
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub peer_count: usize,
    pub established: usize,
    pub total_syncs: u64,
    pub total_failures: u64,
}

/// Result of a digest comparison from the responder's side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestDiff {
    /// Keys where we are newer or the other side lacks the key
    pub ours_newer: Vec<String>,
    /// Keys where the other side is newer or we lack the key
    pub theirs_newer: Vec<String>,
}

/// Per-area synchronization manager
#[derive(Debug)]
pub struct SyncEngine {
    sessions: BTreeMap<NodeId, PeerSession>,
    sync_timeout: Duration,
    anti_entropy_interval: Duration,
    /// Report synced after this point even without peers completing
    initial_deadline: Instant,
    synced: bool,
}

impl SyncEngine {
    pub fn new(
        sync_timeout: Duration,
        anti_entropy_interval: Duration,
        initial_sync_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            sessions: BTreeMap::new(),
            sync_timeout,
            anti_entropy_interval,
            initial_deadline: now + initial_sync_timeout,
            synced: false,
        }
    }

    /// Register a peer. Returns `false` if it is already known at the same
    /// endpoint.
    pub fn register_peer(&mut self, peer: &NodeId, endpoint: &str) -> bool {
        match self.sessions.get_mut(peer) {
            Some(session) if session.endpoint == endpoint => false,
            Some(session) => {
                session.endpoint = endpoint.to_string();
                session.state = PeerState::Idle;
                true
            }
            None => {
                self.sessions
                    .insert(peer.clone(), PeerSession::new(endpoint.to_string()));
                true
            }
        }
    }

    pub fn unregister_peer(&mut self, peer: &NodeId) -> Option<PeerSession> {
        self.sessions.remove(peer)
    }

    pub fn session(&self, peer: &NodeId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn state(&self, peer: &NodeId) -> Option<PeerState> {
        self.sessions.get(peer).map(|s| s.state)
    }

    /// Peers for `get_peers`
    pub fn peers(&self) -> BTreeMap<NodeId, PeerSpec> {
        self.sessions
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    PeerSpec {
                        endpoint: s.endpoint.clone(),
                        state: s.state,
                    },
                )
            })
            .collect()
    }

    /// Peers that should receive floods: every session past `Idle`
    pub fn active_peers(&self) -> impl Iterator<Item = &NodeId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state != PeerState::Idle)
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // =========================================================================
    // Full sync
    // =========================================================================

    /// Move the session to `Syncing` and build the request
    pub fn start_sync(
        &mut self,
        peer: &NodeId,
        store: &EntryStore,
        key_prefixes: &[String],
        now: Instant,
    ) -> Option<MessageBody> {
        let session = self.sessions.get_mut(peer)?;
        session.state = PeerState::Syncing;
        session.sync_started = Some(now);
        Some(MessageBody::SyncRequest {
            digests: store.digests(key_prefixes),
            key_prefixes: key_prefixes.to_vec(),
        })
    }

    /// Responder side of full sync: our better entries plus the keys the
    /// requester should push back.
    pub fn build_sync_response(
        store: &EntryStore,
        digests: &[KeyDigest],
        key_prefixes: &[String],
        now: Instant,
        ttl_decrement_ms: i64,
    ) -> MessageBody {
        let diff = Self::diff(store, digests, key_prefixes);
        let entries = Self::collect_entries(store, &diff.ours_newer, now, ttl_decrement_ms);
        MessageBody::SyncResponse {
            entries,
            to_be_updated_keys: diff.theirs_newer,
        }
    }

    /// Compare the other side's digests with our store.
    pub fn diff(store: &EntryStore, digests: &[KeyDigest], key_prefixes: &[String]) -> DigestDiff {
        let theirs: HashMap<&str, &KeyDigest> =
            digests.iter().map(|d| (d.key.as_str(), d)).collect();
        let mut diff = DigestDiff::default();

        for (key, entry) in store.iter() {
            if !matches_prefix(key, key_prefixes) {
                continue;
            }
            match theirs.get(key.as_str()) {
                None => diff.ours_newer.push(key.clone()),
                Some(digest) => {
                    match compare(Stamp::from(&entry.value), Stamp::from(*digest)) {
                        Comparison::Newer => diff.ours_newer.push(key.clone()),
                        Comparison::Older => diff.theirs_newer.push(key.clone()),
                        Comparison::Conflict => {
                            // Pulled so the merge path logs the mismatch
                            warn!(
                                "Digest conflict for {}: same version {} from {}, different hash",
                                key, digest.version, digest.originator_id
                            );
                            diff.theirs_newer.push(key.clone());
                        }
                        Comparison::Same => {}
                    }
                }
            }
        }

        for digest in digests {
            if matches_prefix(&digest.key, key_prefixes) && store.get(&digest.key).is_none() {
                diff.theirs_newer.push(digest.key.clone());
            }
        }
        diff
    }

    /// Flood-ready values for `keys`, skipping expired or missing ones
    pub fn collect_entries(
        store: &EntryStore,
        keys: &[String],
        now: Instant,
        ttl_decrement_ms: i64,
    ) -> KeyVals {
        keys.iter()
            .filter_map(|key| {
                let value = store.get(key)?.flood_value(now, ttl_decrement_ms)?;
                Some((key.clone(), value))
            })
            .collect()
    }

    /// Mark a full sync complete. Returns `true` when this completion makes
    /// the area synced for the first time.
    pub fn complete_sync(&mut self, peer: &NodeId, now: Instant) -> bool {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.state = PeerState::Established;
            session.sync_started = None;
            session.last_sync = Some(now);
            session.sync_count += 1;
            session.failures = 0;
        }
        self.check_initial_sync(now)
    }

    /// Synced once no session is still waiting on its first sync, or once
    /// the initial sync timeout passes. Never reverts.
    pub fn check_initial_sync(&mut self, now: Instant) -> bool {
        if self.synced {
            return false;
        }
        let pending = self
            .sessions
            .values()
            .any(|s| s.state != PeerState::Established && s.sync_count == 0);
        if !pending || now >= self.initial_deadline {
            self.synced = true;
            return true;
        }
        false
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Sessions whose sync request went unanswered past the timeout. Their
    /// failure count is bumped.
    pub fn expired_syncs(&mut self, now: Instant) -> Vec<NodeId> {
        let timeout = self.sync_timeout;
        self.sessions
            .iter_mut()
            .filter(|(_, s)| {
                s.state == PeerState::Syncing
                    && s.sync_started.map_or(false, |t| now.saturating_duration_since(t) >= timeout)
            })
            .map(|(id, s)| {
                s.failures += 1;
                id.clone()
            })
            .collect()
    }

    pub fn mark_failure(&mut self, peer: &NodeId) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.failures += 1;
        }
    }

    // =========================================================================
    // Anti-entropy
    // =========================================================================

    /// Established peers whose last exchange is older than the interval
    pub fn peers_needing_anti_entropy(&self, now: Instant) -> Vec<NodeId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state == PeerState::Established)
            .filter(|(_, s)| {
                s.last_sync.map_or(true, |t| {
                    now.saturating_duration_since(t) >= self.anti_entropy_interval
                })
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Record an anti-entropy round or an exchange that proved agreement
    pub fn note_exchange(&mut self, peer: &NodeId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(peer) {
            if session.state == PeerState::Established {
                session.last_sync = Some(now);
            }
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            peer_count: self.sessions.len(),
            established: self
                .sessions
                .values()
                .filter(|s| s.state == PeerState::Established)
                .count(),
            total_syncs: self.sessions.values().map(|s| s.sync_count).sum(),
            total_failures: self.sessions.values().map(|s| s.failures as u64).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use areakv_core::{Value, TTL_INFINITY};

    fn engine(now: Instant) -> SyncEngine {
        SyncEngine::new(
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(30),
            now,
        )
    }

    fn store_with(entries: &[(&str, u64, &str)]) -> EntryStore {
        let mut store = EntryStore::new(Duration::from_secs(60));
        for (key, version, originator) in entries {
            store.apply(
                key,
                Value::new(*version, *originator, key.as_bytes().to_vec(), TTL_INFINITY),
                Instant::now(),
            );
        }
        store
    }

    #[test]
    fn test_peer_registration() {
        let mut engine = engine(Instant::now());
        let peer = NodeId::from("n2");

        assert!(engine.register_peer(&peer, "10.0.0.2:9100"));
        assert!(!engine.register_peer(&peer, "10.0.0.2:9100"));
        assert_eq!(engine.state(&peer), Some(PeerState::Idle));

        assert!(engine.unregister_peer(&peer).is_some());
        assert!(!engine.contains(&peer));
    }

    #[test]
    fn test_three_way_sync_response() {
        let local = store_with(&[("a", 2, "n1"), ("b", 1, "n1"), ("c", 1, "n1")]);
        let remote = store_with(&[("a", 1, "n1"), ("b", 3, "n1"), ("d", 1, "n2")]);

        let response =
            SyncEngine::build_sync_response(&local, &remote.digests(&[]), &[], Instant::now(), 1);
        match response {
            MessageBody::SyncResponse {
                entries,
                to_be_updated_keys,
            } => {
                let keys: Vec<&String> = entries.keys().collect();
                assert_eq!(keys, vec!["a", "c"]);
                assert_eq!(to_be_updated_keys, vec!["b".to_string(), "d".to_string()]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_digest_is_pulled() {
        let local = store_with(&[("k", 1, "n9")]);
        let mut remote = EntryStore::new(Duration::from_secs(60));
        remote.apply("k", Value::new(1, "n9", b"other".to_vec(), TTL_INFINITY), Instant::now());

        let diff = SyncEngine::diff(&local, &remote.digests(&[]), &[]);
        assert_eq!(diff.theirs_newer, vec!["k".to_string()]);
        assert!(diff.ours_newer.is_empty());
    }

    #[test]
    fn test_prefix_limited_diff() {
        let local = store_with(&[("adj:1", 1, "n1"), ("prefix:1", 1, "n1")]);
        let diff = SyncEngine::diff(&local, &[], &["adj:".to_string()]);
        assert_eq!(diff.ours_newer, vec!["adj:1".to_string()]);
        assert!(diff.theirs_newer.is_empty());
    }

    #[test]
    fn test_sync_lifecycle_and_synced_signal() {
        let now = Instant::now();
        let mut engine = engine(now);
        let store = store_with(&[]);
        let (p1, p2) = (NodeId::from("n2"), NodeId::from("n3"));
        engine.register_peer(&p1, "a");
        engine.register_peer(&p2, "b");

        assert!(engine.start_sync(&p1, &store, &[], now).is_some());
        assert!(engine.start_sync(&p2, &store, &[], now).is_some());
        assert_eq!(engine.state(&p1), Some(PeerState::Syncing));

        assert!(!engine.complete_sync(&p1, now));
        assert!(engine.complete_sync(&p2, now));
        assert!(engine.is_synced());
        assert_eq!(engine.stats().established, 2);
    }

    #[test]
    fn test_synced_after_initial_timeout() {
        let now = Instant::now();
        let mut engine = engine(now);
        let store = store_with(&[]);
        let peer = NodeId::from("n2");
        engine.register_peer(&peer, "a");
        engine.start_sync(&peer, &store, &[], now);

        assert!(!engine.check_initial_sync(now + Duration::from_secs(5)));
        assert!(engine.check_initial_sync(now + Duration::from_secs(30)));
        assert!(!engine.check_initial_sync(now + Duration::from_secs(31)));
        assert!(engine.is_synced());
    }

    #[test]
    fn test_sync_timeout_counts_failure() {
        let now = Instant::now();
        let mut engine = engine(now);
        let store = store_with(&[]);
        let peer = NodeId::from("n2");
        engine.register_peer(&peer, "a");
        engine.start_sync(&peer, &store, &[], now);

        assert!(engine.expired_syncs(now + Duration::from_secs(5)).is_empty());
        assert_eq!(engine.expired_syncs(now + Duration::from_secs(10)), vec![peer.clone()]);
        assert_eq!(engine.session(&peer).unwrap().failures, 1);
    }

    #[test]
    fn test_anti_entropy_schedule() {
        let now = Instant::now();
        let mut engine = engine(now);
        let peer = NodeId::from("n2");
        engine.register_peer(&peer, "a");
        engine.complete_sync(&peer, now);

        assert!(engine.peers_needing_anti_entropy(now + Duration::from_secs(30)).is_empty());
        assert_eq!(
            engine.peers_needing_anti_entropy(now + Duration::from_secs(60)),
            vec![peer.clone()]
        );

        engine.note_exchange(&peer, now + Duration::from_secs(60));
        assert!(engine
            .peers_needing_anti_entropy(now + Duration::from_secs(90))
            .is_empty());
    }
}
