//! TCP peer transport
//!
//! Each peer gets one outbound connection with its own bounded send queue,
//! so a slow or unreachable peer never blocks sends to the others. Inbound
//! connections are receive-only and identify the remote node with a hello
//! frame.

use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::peer::PeerInfo;
use areakv_core::{NodeId, PeerMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),
    #[error("Send queue full for peer {0}")]
    QueueFull(NodeId),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Non-blocking outbound path used by the store engine.
///
/// Implementations must never wait: the engine calls this while holding an
/// area lock.
pub trait PeerSink: Send + Sync {
    fn send(&self, peer: &NodeId, message: PeerMessage) -> Result<(), TransportError>;
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// Outbound connection (re)established
    PeerConnected(NodeId),
    /// Outbound connection lost; will be retried
    PeerDisconnected(NodeId),
    /// Message received on an inbound connection
    MessageReceived { from: NodeId, message: PeerMessage },
    /// Undecodable or spoofed message
    Malformed { from: NodeId, error: String },
}

/// Outbound connection to a peer
struct Connection {
    info: RwLock<PeerInfo>,
    tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

/// Transport layer managing peer connections
pub struct Transport {
    our_id: NodeId,
    queue_size: usize,
    connections: RwLock<HashMap<NodeId, Arc<Connection>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
}

impl Transport {
    /// Create a new transport and its event stream
    pub fn new(our_id: NodeId, queue_size: usize) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let queue_size = queue_size.max(1);
        let (event_tx, event_rx) = mpsc::channel(queue_size);
        let transport = Arc::new(Self {
            our_id,
            queue_size,
            connections: RwLock::new(HashMap::new()),
            event_tx,
            shutdown: CancellationToken::new(),
        });
        (transport, event_rx)
    }

    /// Get our node id
    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// List peers with an outbound connection task
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.connections.read().keys().cloned().collect()
    }

    /// Get connection info for a peer
    pub fn peer_info(&self, id: &NodeId) -> Option<PeerInfo> {
        self.connections.read().get(id).map(|c| c.info.read().clone())
    }

    /// Start (or keep) an outbound connection to a peer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(self: &Arc<Self>, peer: NodeId, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&peer) {
            if existing.info.read().endpoint == endpoint {
                return;
            }
            existing.shutdown.cancel();
        }

        let (tx, rx) = mpsc::channel(self.queue_size);
        let shutdown = self.shutdown.child_token();
        let conn = Arc::new(Connection {
            info: RwLock::new(PeerInfo::new(peer.clone(), endpoint)),
            tx,
            shutdown: shutdown.clone(),
        });
        connections.insert(peer, conn.clone());
        drop(connections);

        let transport = self.clone();
        tokio::spawn(async move {
            transport.run_outbound(conn, rx, shutdown).await;
        });
    }

    /// Drop the outbound connection to a peer
    pub fn disconnect(&self, peer: &NodeId) {
        if let Some(conn) = self.connections.write().remove(peer) {
            conn.shutdown.cancel();
        }
    }

    /// Stop every connection task and the listener
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept inbound connections until shutdown
    pub async fn listen(self: Arc<Self>, listener: TcpListener) -> Result<(), TransportError> {
        info!("Transport listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.run_inbound(stream, addr).await {
                    debug!("Inbound connection from {} closed: {}", addr, e);
                }
            });
        }
    }

    async fn run_outbound(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut rx: mpsc::Receiver<Frame>,
        shutdown: CancellationToken,
    ) {
        let (peer, endpoint) = {
            let info = conn.info.read();
            (info.id.clone(), info.endpoint.clone())
        };
        let mut backoff = RECONNECT_MIN;

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = TcpStream::connect(endpoint.as_str()) => result,
            };
            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("Connect to {} at {} failed: {}", peer, endpoint, e);
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff + Duration::from_millis(jitter)) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            };
            backoff = RECONNECT_MIN;

            let mut framed = Framed::new(stream, FrameCodec::new());
            if let Err(e) = framed.send(Frame::hello(&self.our_id)).await {
                warn!("Hello to {} failed: {}", peer, e);
                continue;
            }
            {
                let mut info = conn.info.write();
                info.connects += 1;
                info.touch();
            }
            info!("Connected to peer {} at {}", peer, endpoint);
            self.emit(TransportEvent::PeerConnected(peer.clone())).await;

            // Frames lost on a broken connection are repaired by anti-entropy.
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = framed.send(frame).await {
                                warn!("Send to {} failed: {}", peer, e);
                                break;
                            }
                            conn.info.write().touch();
                        }
                        None => return,
                    },
                    incoming = framed.next() => match incoming {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Connection to {} broken: {}", peer, e);
                            break;
                        }
                        None => break,
                    },
                }
            }

            self.emit(TransportEvent::PeerDisconnected(peer.clone())).await;
        }
    }

    async fn run_inbound(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), TransportError> {
        let mut framed = Framed::new(stream, FrameCodec::new());

        let hello = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            frame = framed.next() => frame.ok_or(TransportError::ConnectionClosed)??,
        };
        let peer = hello
            .hello_node_id()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        debug!("Inbound connection from {} ({})", peer, addr);

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = framed.next() => match frame {
                    Some(frame) => frame?,
                    None => return Ok(()),
                },
            };

            match frame.frame_type {
                FrameType::Message => match frame.peer_message() {
                    Ok(message) if message.sender == peer => {
                        self.emit(TransportEvent::MessageReceived {
                            from: peer.clone(),
                            message,
                        })
                        .await;
                    }
                    Ok(message) => {
                        self.emit(TransportEvent::Malformed {
                            from: peer.clone(),
                            error: format!("sender {} on connection from {}", message.sender, peer),
                        })
                        .await;
                    }
                    Err(e) => {
                        self.emit(TransportEvent::Malformed {
                            from: peer.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    }
                },
                FrameType::Ping => framed.send(Frame::pong()).await?,
                FrameType::Pong => {}
                FrameType::Hello => {
                    return Err(TransportError::Handshake("duplicate hello".into()));
                }
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Transport event receiver dropped");
        }
    }
}

impl PeerSink for Transport {
    fn send(&self, peer: &NodeId, message: PeerMessage) -> Result<(), TransportError> {
        let conn = self
            .connections
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotFound(peer.clone()))?;

        let frame = Frame::message(&message)?;
        conn.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(peer.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use areakv_core::{AreaId, MessageBody};

    #[tokio::test]
    async fn test_message_delivery_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server, mut server_events) = Transport::new(NodeId::from("server"), 16);
        tokio::spawn(server.clone().listen(listener));

        let (client, mut client_events) = Transport::new(NodeId::from("client"), 16);
        client.connect(NodeId::from("server"), addr.to_string());

        match client_events.recv().await.unwrap() {
            TransportEvent::PeerConnected(id) => assert_eq!(id, NodeId::from("server")),
            other => panic!("unexpected event: {:?}", other),
        }

        let message = PeerMessage {
            area: AreaId::from("spine"),
            sender: NodeId::from("client"),
            body: MessageBody::PullRequest { keys: vec!["k".into()] },
        };
        client.send(&NodeId::from("server"), message.clone()).unwrap();

        match server_events.recv().await.unwrap() {
            TransportEvent::MessageReceived { from, message: received } => {
                assert_eq!(from, NodeId::from("client"));
                assert_eq!(received, message);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (transport, _events) = Transport::new(NodeId::from("a"), 4);
        let message = PeerMessage {
            area: AreaId::from("spine"),
            sender: NodeId::from("a"),
            body: MessageBody::PullRequest { keys: vec![] },
        };
        assert!(matches!(
            transport.send(&NodeId::from("b"), message),
            Err(TransportError::PeerNotFound(_))
        ));
    }
}
