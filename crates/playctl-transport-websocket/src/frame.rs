//! Stream multiplexing frames
//!
//! Every WebSocket binary message carries exactly one frame:
//!
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: frame type (0=data, 1=fin, 2=open)
//! - Rest: payload
//!
//! An `open` frame's payload is the UTF-8 `host:port` the far side should
//! dial for that stream.

use bytes::Bytes;

/// Size of the stream ID plus frame type prefix
pub const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Fin,
    Open,
}

impl FrameType {
    fn to_byte(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Fin => 1,
            FrameType::Open => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::Fin),
            2 => Some(FrameType::Open),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(stream_id: u32, payload: &[u8]) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Data,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Fin,
            payload: Bytes::new(),
        }
    }

    pub fn open(stream_id: u32, remote_addr: &str) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Open,
            payload: Bytes::copy_from_slice(remote_addr.as_bytes()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.push(self.frame_type.to_byte());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Returns `None` for short buffers and unknown frame types
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return None;
        }
        let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let frame_type = FrameType::from_byte(data[4])?;
        Some(Self {
            stream_id,
            frame_type,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encoding() {
        let frame = Frame::data(42, b"hello");
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_LEN + 5);
        assert_eq!(Frame::decode(&encoded), Some(frame));
    }

    #[test]
    fn test_open_frame_carries_remote_addr() {
        let decoded = Frame::decode(&Frame::open(3, "127.0.0.1:22").encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Open);
        assert_eq!(&decoded.payload[..], b"127.0.0.1:22");
    }

    #[test]
    fn test_invalid_frames() {
        assert_eq!(Frame::decode(&[0, 0, 0]), None);
        assert_eq!(Frame::decode(&[0, 0, 0, 1, 9]), None);
    }
}
