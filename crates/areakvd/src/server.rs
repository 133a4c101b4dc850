//! areakvd server - transport wiring and background timers

use crate::config::KvStoreConfig;
use crate::area::AreaStats;
use crate::kvstore::{KvStore, KvStoreError};
use areakv_core::{AreaId, AreaSummary, NodeId};
use areakv_net::{PeerSink, Transport, TransportEvent};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] KvStoreError),
    #[error("Server already running")]
    AlreadyRunning,
}

/// Server state
pub struct Server {
    config: KvStoreConfig,
    kv_store: Arc<KvStore>,
    transport: Arc<Transport>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: KvStoreConfig) -> Result<Self, ServerError> {
        let (transport, events) = Transport::new(config.node_id.clone(), config.peer_queue_size);
        let sink: Arc<dyn PeerSink> = transport.clone();
        let kv_store = Arc::new(KvStore::new(&config, sink)?);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            kv_store,
            transport,
            events: Mutex::new(Some(events)),
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        self.transport.our_id()
    }

    pub fn kv_store(&self) -> &Arc<KvStore> {
        &self.kv_store
    }

    /// Add a peer: open the transport connection, then start the session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_peer(
        &self,
        area: &AreaId,
        peer: &NodeId,
        endpoint: &str,
    ) -> Result<bool, ServerError> {
        self.kv_store.area(area)?;
        self.transport.connect(peer.clone(), endpoint);
        Ok(self.kv_store.add_peer(area, peer, endpoint)?)
    }

    /// Remove a peer; the connection is closed once no area uses it
    pub fn del_peer(&self, area: &AreaId, peer: &NodeId) -> Result<bool, ServerError> {
        let removed = self.kv_store.del_peer(area, peer)?;
        if self.kv_store.areas_with_peer(peer).is_empty() {
            self.transport.disconnect(peer);
        }
        Ok(removed)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut events = self.events.lock().take().ok_or(ServerError::AlreadyRunning)?;
        let local: SocketAddr = listener.local_addr()?;
        info!(
            "Starting areakvd {} on {} ({} areas)",
            self.config.node_id,
            local,
            self.config.areas.len()
        );

        tokio::spawn(self.transport.clone().listen(listener));

        for peer in &self.config.peers {
            info!("Configured peer {} in area {} at {}", peer.node_id, peer.area, peer.endpoint);
            self.add_peer(&peer.area, &peer.node_id, &peer.endpoint)?;
        }

        let flood_handle = self.spawn_flood_task();
        let session_handle = self.spawn_session_task();

        let mut ttl_ticker = interval(Duration::from_millis(self.config.ttl_sweep_interval_ms));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let result = loop {
            tokio::select! {
                _ = ttl_ticker.tick() => {
                    if let Err(e) = self.kv_store.process_ttl(Instant::now()) {
                        error!("TTL sweep failed: {}", e);
                        if e.is_fatal() {
                            break Err(e.into());
                        }
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break Ok(());
                }
            }
        };

        flood_handle.abort();
        session_handle.abort();
        self.transport.shutdown();

        result
    }

    fn handle_event(&self, event: TransportEvent) -> Result<(), ServerError> {
        match event {
            TransportEvent::MessageReceived { from, message } => {
                match self.kv_store.handle_message(message) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!("Fatal error handling message from {}: {}", from, e);
                        return Err(e.into());
                    }
                    Err(KvStoreError::UnknownArea(_)) => {}
                    Err(e) => debug!("Message from {} dropped: {}", from, e),
                }
            }
            TransportEvent::PeerConnected(peer) => {
                let reconnect = self
                    .transport
                    .peer_info(&peer)
                    .map_or(false, |info| info.connects > 1);
                if reconnect {
                    self.fail_sessions(&peer, "reconnected");
                }
            }
            TransportEvent::PeerDisconnected(peer) => {
                debug!("Connection to {} lost, reconnecting", peer);
            }
            TransportEvent::Malformed { from, error } => {
                warn!("Malformed message from {}: {}", from, error);
                self.fail_sessions(&from, "malformed message");
            }
        }
        Ok(())
    }

    fn fail_sessions(&self, peer: &NodeId, reason: &str) {
        for area in self.kv_store.areas_with_peer(peer) {
            debug!("Resetting session with {} in {}: {}", peer, area, reason);
            if let Err(e) = self.kv_store.peer_session_failed(&area, peer) {
                warn!("Session reset for {} failed: {}", peer, e);
            }
        }
    }

    /// Spawn background flood flush task
    fn spawn_flood_task(&self) -> tokio::task::JoinHandle<()> {
        let kv_store = self.kv_store.clone();
        let period = Duration::from_millis(self.config.flood_flush_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => kv_store.flush_floods(Instant::now()),
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Spawn background anti-entropy and session check task
    fn spawn_session_task(&self) -> tokio::task::JoinHandle<()> {
        let kv_store = self.kv_store.clone();
        let period = Duration::from_millis(
            self.config
                .sync_timeout_ms
                .min(self.config.anti_entropy_interval_ms)
                .max(100)
                / 2,
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        kv_store.check_sessions(now);
                        let sent = kv_store.run_anti_entropy(now);
                        if sent > 0 {
                            debug!("Anti-entropy round with {} peers", sent);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            areas: self.kv_store.area_summary(&[]),
            area_stats: self.kv_store.area_stats(),
            connected_peers: self.transport.connected_peers().len(),
            subscribers: self.kv_store.num_subscribers(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub areas: Vec<AreaSummary>,
    pub area_stats: Vec<AreaStats>,
    pub connected_peers: usize,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AreaConfig;

    fn test_config() -> KvStoreConfig {
        let mut config = KvStoreConfig::new("node1", vec![AreaConfig::new("spine")]);
        config.listen = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(test_config()).unwrap();
        let stats = server.stats();
        assert_eq!(stats.areas.len(), 1);
        assert_eq!(stats.area_stats[0].flood.batches_sent, 0);
        assert_eq!(stats.area_stats[0].sync.established, 0);
        assert_eq!(server.node_id(), &NodeId::from("node1"));
        assert_eq!(stats.connected_peers, 0);
        assert_eq!(stats.subscribers, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.areas.clear();
        assert!(matches!(
            Server::new(config),
            Err(ServerError::Store(KvStoreError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_add_peer_unknown_area() {
        let server = Server::new(test_config()).unwrap();
        let result = server.add_peer(&AreaId::from("nope"), &NodeId::from("n2"), "127.0.0.1:1");
        assert!(matches!(
            result,
            Err(ServerError::Store(KvStoreError::UnknownArea(_)))
        ));
        assert!(server.transport.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve() {
        let server = Arc::new(Server::new(test_config()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = server.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
