//! Gateway handshake wire format
//!
//! The first bytes exchanged on a fresh gateway connection, before the
//! session layer starts. All integers are little-endian.
//!
//! ```text
//! agent -> gateway                      gateway -> agent
//! +----------------+                    +----------------+
//! |   token (36)   |                    |  status (u16)  |
//! +----------------+                    +----------------+
//! |  version (16)  |                    | msg size (u16) |
//! +----------------+                    +----------------+
//! | config sz (u32)|                    |    message     |
//! +----------------+                    +----------------+
//! |  config blob   |
//! +----------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};

/// Project token length on the wire
pub const TOKEN_LEN: usize = 36;

/// Version tag field width; shorter tags are right-padded with zeros
pub const VERSION_LEN: usize = 16;

/// Fixed request header size
pub const REQUEST_HEADER_LEN: usize = TOKEN_LEN + VERSION_LEN + 4;

/// Fixed response header size
pub const RESPONSE_HEADER_LEN: usize = 4;

/// Status a gateway answers when the handshake is accepted
pub const STATUS_OK: u16 = 200;

/// Handshake codec errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("token must be exactly {TOKEN_LEN} bytes, got {0}")]
    TokenLength(usize),

    #[error("version tag too long: {0} > {VERSION_LEN} bytes")]
    VersionLength(usize),
}

/// Fixed-size header opening every gateway connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub token: [u8; TOKEN_LEN],
    pub version: [u8; VERSION_LEN],
    pub config_size: u32,
}

impl RequestHeader {
    /// Build a header, validating field widths. The version tag is
    /// right-padded with zero bytes.
    pub fn new(token: &str, version: &str, config_size: u32) -> Result<Self, ProtocolError> {
        if token.len() != TOKEN_LEN {
            return Err(ProtocolError::TokenLength(token.len()));
        }
        if version.len() > VERSION_LEN {
            return Err(ProtocolError::VersionLength(version.len()));
        }

        let mut token_buf = [0u8; TOKEN_LEN];
        token_buf.copy_from_slice(token.as_bytes());
        let mut version_buf = [0u8; VERSION_LEN];
        version_buf[..version.len()].copy_from_slice(version.as_bytes());

        Ok(Self {
            token: token_buf,
            version: version_buf,
            config_size,
        })
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN);
        buf.put_slice(&self.token);
        buf.put_slice(&self.version);
        buf.put_u32_le(self.config_size);
        buf
    }

    /// Decode from wire bytes; returns `None` until a full header is buffered
    pub fn decode(buf: &mut BytesMut) -> Option<Self> {
        if buf.len() < REQUEST_HEADER_LEN {
            return None;
        }

        let mut token = [0u8; TOKEN_LEN];
        buf.copy_to_slice(&mut token);
        let mut version = [0u8; VERSION_LEN];
        buf.copy_to_slice(&mut version);
        let config_size = buf.get_u32_le();

        Some(Self {
            token,
            version,
            config_size,
        })
    }

    /// Version tag with the zero padding stripped
    pub fn version_str(&self) -> &str {
        let end = self
            .version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_LEN);
        std::str::from_utf8(&self.version[..end]).unwrap_or("")
    }
}

/// Gateway verdict on a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: u16,
    pub message_size: u16,
}

impl ResponseHeader {
    pub fn new(status: u16, message_size: u16) -> Self {
        Self {
            status,
            message_size,
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN);
        buf.put_u16_le(self.status);
        buf.put_u16_le(self.message_size);
        buf
    }

    /// Decode from wire bytes; returns `None` until a full header is buffered
    pub fn decode(buf: &mut BytesMut) -> Option<Self> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return None;
        }
        let status = buf.get_u16_le();
        let message_size = buf.get_u16_le();
        Some(Self {
            status,
            message_size,
        })
    }

    /// Parse from an exact-size buffer
    pub fn parse(bytes: [u8; RESPONSE_HEADER_LEN]) -> Self {
        Self {
            status: u16::from_le_bytes([bytes[0], bytes[1]]),
            message_size: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}
