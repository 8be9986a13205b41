//! Message framing for network transport
//!
//! Provides length-prefixed framing for the Gossip, Forward, Backward and
//! Handshake RPCs.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<postcard::Error> for FrameError {
    fn from(e: postcard::Error) -> Self {
        FrameError::Serialization(e.to_string())
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
    /// Ping for keepalive
    Ping = 0,
    /// Pong response
    Pong = 1,
    /// Gossip batch push
    GossipRequest = 10,
    /// Gossip batch reply
    GossipResponse = 11,
    /// Forward call
    ForwardRequest = 20,
    /// Forward result
    ForwardResponse = 21,
    /// Backward call
    BackwardRequest = 22,
    /// Backward result
    BackwardResponse = 23,
    /// Signed request to reopen a rejected connection
    HandshakeRequest = 24,
    /// Signed handshake acknowledgement
    HandshakeResponse = 25,
    /// Call failed (payload is an [`RpcFailure`])
    Error = 30,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            10 => Ok(Self::GossipRequest),
            11 => Ok(Self::GossipResponse),
            20 => Ok(Self::ForwardRequest),
            21 => Ok(Self::ForwardResponse),
            22 => Ok(Self::BackwardRequest),
            23 => Ok(Self::BackwardResponse),
            24 => Ok(Self::HandshakeRequest),
            25 => Ok(Self::HandshakeResponse),
            30 => Ok(Self::Error),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Failure reported to the caller of an RPC
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    /// Stable code from `metagraph_core::Error::code`
    pub code: u16,
    pub message: String,
}

impl From<&metagraph_core::Error> for RpcFailure {
    fn from(e: &metagraph_core::Error) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
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

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("empty frame".into()));
        }

        // Need full frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        // Consume length prefix
        src.advance(4);

        // Read frame type
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        // Read payload
        let payload_len = length - 1;
        let payload = src.split_to(payload_len).to_vec();

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

    /// Create a frame carrying a postcard-encoded body
    pub fn encode<T: Serialize>(frame_type: FrameType, body: &T) -> Result<Self, FrameError> {
        Ok(Self::new(frame_type, postcard::to_allocvec(body)?))
    }

    /// Decode the postcard body of this frame
    pub fn decode<'a, T: Deserialize<'a>>(&'a self) -> Result<T, FrameError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    /// Create an error frame
    pub fn failure(error: &metagraph_core::Error) -> Self {
        // RpcFailure always encodes
        let payload = postcard::to_allocvec(&RpcFailure::from(error)).unwrap_or_default();
        Self::new(FrameType::Error, payload)
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }
}
