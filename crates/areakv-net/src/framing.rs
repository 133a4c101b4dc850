//! Message framing for peer transport
//!
//! Provides length-prefixed framing for hello/keepalive frames and
//! postcard-encoded area messages.

use areakv_core::canonical::{decode_message, encode_message};
use areakv_core::{NodeId, PeerMessage};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unexpected frame type: {0:?}")]
    UnexpectedType(FrameType),
}

impl From<areakv_core::Error> for FrameError {
    fn from(e: areakv_core::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// First frame on a connection, carries the sender's node id
    Hello = 0,
    /// Ping for keepalive
    Ping = 1,
    /// Pong response
    Pong = 2,
    /// Area-scoped peer message
    Message = 10,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            10 => Ok(Self::Message),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("empty frame".into()));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a hello frame announcing our node id
    pub fn hello(node_id: &NodeId) -> Self {
        Self::new(FrameType::Hello, node_id.as_str().as_bytes().to_vec())
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }

    /// Wrap a peer message
    pub fn message(message: &PeerMessage) -> Result<Self, FrameError> {
        Ok(Self::new(FrameType::Message, encode_message(message)?))
    }

    /// Node id carried by a hello frame
    pub fn hello_node_id(&self) -> Result<NodeId, FrameError> {
        if self.frame_type != FrameType::Hello {
            return Err(FrameError::UnexpectedType(self.frame_type));
        }
        let id = std::str::from_utf8(&self.payload)
            .map_err(|e| FrameError::Serialization(e.to_string()))?;
        if id.is_empty() {
            return Err(FrameError::Serialization("empty node id".into()));
        }
        Ok(NodeId::from(id))
    }

    /// Peer message carried by a message frame
    pub fn peer_message(&self) -> Result<PeerMessage, FrameError> {
        if self.frame_type != FrameType::Message {
            return Err(FrameError::UnexpectedType(self.frame_type));
        }
        Ok(decode_message(&self.payload)?)
    }
}
