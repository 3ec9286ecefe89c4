//! Frame encoding/decoding for the session layer
//!
//! Frame format:
//! ```text
//! +--------+----------------+--------+
//! |  Type  | Stream ID (4B) | Len(2B)|
//! +--------+----------------+--------+
//! |             Payload              |
//! +----------------------------------+
//! ```

use super::MuxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_LEN: usize = 7;

/// Maximum payload carried by one data frame (16 KiB)
pub const MAX_PAYLOAD: usize = 16384;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a new stream
    Open = 0x01,
    /// Stream payload
    Data = 0x02,
    /// Close the sender's direction of a stream
    Close = 0x03,
    /// Flow control credit
    WindowUpdate = 0x04,
    /// Keep-alive probe
    Ping = 0x05,
    /// Keep-alive response
    Pong = 0x06,
    /// Session is ending
    GoAway = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Close),
            0x04 => Ok(FrameType::WindowUpdate),
            0x05 => Ok(FrameType::Ping),
            0x06 => Ok(FrameType::Pong),
            0x07 => Ok(FrameType::GoAway),
            _ => Err(MuxError::InvalidFrame(format!(
                "unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A session layer frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a stream open frame
    pub fn open(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create a ping frame
    pub fn ping(seq: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(seq);
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Create a pong frame echoing a ping payload
    pub fn pong(payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload,
        }
    }

    /// Create a session-ending frame
    pub fn go_away() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Parse a window update increment from the payload
    pub fn window_increment(&self) -> Result<u32, MuxError> {
        if self.payload.len() < 4 {
            return Err(MuxError::InvalidFrame(
                "window update payload too short".to_string(),
            ));
        }
        Ok(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from the buffer; returns `Ok(None)` until a whole
    /// frame is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[0])?;
        let payload_len = ((buf[5] as usize) << 8) | (buf[6] as usize);
        if payload_len > MAX_PAYLOAD {
            return Err(MuxError::InvalidFrame(format!(
                "payload too large: {}",
                payload_len
            )));
        }

        if buf.len() < FRAME_HEADER_LEN + payload_len {
            return Ok(None);
        }

        buf.advance(1);
        let stream_id = buf.get_u32();
        buf.advance(2);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let original = Frame::data(42, Bytes::from_static(b"hello, session"));
        let mut encoded = original.encode();

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(&decoded.payload[..], b"hello, session");
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_partial_then_complete() {
        let frame = Frame::data(7, Bytes::from_static(b"partial"));
        let encoded = frame.encode();

        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[5..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 7);
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = BytesMut::from(&[0xFFu8, 0, 0, 0, 1, 0, 0][..]);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32(1);
        buf.put_u16(u16::MAX);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn test_window_update_payload() {
        let frame = Frame::window_update(3, 65536);
        let mut encoded = frame.encode();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.window_increment().unwrap(), 65536);
    }

    #[test]
    fn test_ping_pong() {
        let ping = Frame::ping(99);
        let mut encoded = ping.encode();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Ping);

        let pong = Frame::pong(decoded.payload.clone());
        assert_eq!(pong.payload, decoded.payload);
    }

    #[test]
    fn test_two_frames_in_buffer() {
        let mut buf = Frame::open(1).encode();
        buf.extend_from_slice(&Frame::close(1).encode());

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Open);
        assert_eq!(second.frame_type, FrameType::Close);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }
}
