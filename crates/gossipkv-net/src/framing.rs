//! Message framing for gossip payloads
//!
//! Every broadcast is wrapped in a typed, length-prefixed frame so receivers
//! can tell incremental updates from full-state pushes.

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
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
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
    /// Changed keys since the previous round
    Delta = 1,
    /// Every key the sender holds
    FullState = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Delta),
            2 => Ok(Self::FullState),
            _ => Err(FrameError::Malformed(format!("Unknown frame type: {}", value))),
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
            return Err(FrameError::Malformed("zero length".into()));
        }

        // Wait for the rest of the frame
        if src.len() < 4 + length {
            return Ok(None);
        }

        // Skip length, read type
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

        // Length, type, payload
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

    pub fn delta(payload: Vec<u8>) -> Self {
        Self::new(FrameType::Delta, payload)
    }

    pub fn full_state(payload: Vec<u8>) -> Self {
        Self::new(FrameType::FullState, payload)
    }

    /// Encode into a single datagram-style buffer
    pub fn to_bytes(self) -> Result<Vec<u8>, FrameError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(self, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode exactly one frame from a buffer; trailing bytes are an error
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut buf = BytesMut::from(bytes);
        let frame = FrameCodec
            .decode(&mut buf)?
            .ok_or_else(|| FrameError::Malformed("truncated frame".into()))?;
        if !buf.is_empty() {
            return Err(FrameError::Malformed(format!("{} trailing bytes", buf.len())));
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::delta(vec![1, 2, 3, 4, 5]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let bytes = Frame::full_state(vec![9; 32]).to_bytes().unwrap();
        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[10..]);
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::FullState);
    }

    #[test]
    fn test_from_bytes_rejects_bad_input() {
        assert!(Frame::from_bytes(&[0, 0, 0]).is_err());
        assert!(Frame::from_bytes(&[0, 0, 0, 1, 7]).is_err());

        let mut bytes = Frame::delta(vec![1]).to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(Frame::from_bytes(&bytes), Err(FrameError::Malformed(_))));
    }
}
