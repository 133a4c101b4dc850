//! Networking primitives for the areakv replicated store
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - Peer connection bookkeeping
//! - A TCP transport with per-peer bounded send queues
//! - The [`PeerSink`] seam the store engine sends through

pub mod framing;
pub mod peer;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use peer::PeerInfo;
pub use transport::{PeerSink, Transport, TransportError, TransportEvent};
