//! Session layer: stream multiplexing over one byte stream
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing with credit-based flow control
//! - Keep-alive pings with dead-session detection
//! - Half-close per direction
//!
//! The protocol is symmetric; which side may open streams is a matter of
//! convention. In this agent the gateway opens streams and the agent runs
//! the accepting role on its own outbound connection, so [`Session::server`]
//! is the production entry point and [`Session::client`] is the other half
//! of the contract (used by gateways and by tests).

mod frame;
mod session;
mod stream;

pub use frame::{Frame, FrameType, FRAME_HEADER_LEN, MAX_PAYLOAD};
pub use session::Session;
pub use stream::{MuxStream, StreamRead, StreamWrite};

use std::time::Duration;

/// Session layer errors
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("keep-alive timeout")]
    KeepAliveTimeout,

    #[error("remote ended the session")]
    RemoteGoAway,

    #[error("stream closed")]
    StreamClosed,

    #[error("session closed")]
    SessionClosed,
}

/// Initial per-stream flow control window (256 KiB)
pub const DEFAULT_WINDOW: u32 = 262144;

/// Session configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Keep-alive ping interval
    pub keepalive_interval: Duration,
    /// Tear the session down after this long without any inbound frame
    pub keepalive_timeout: Duration,
    /// Initial flow control window granted to each direction of a stream
    pub window: u32,
    /// Accepted-but-unclaimed stream backlog
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::with_keepalive(Duration::from_secs(1))
    }
}

impl MuxConfig {
    /// Config with the given ping interval; the session is considered dead
    /// after three silent intervals.
    pub fn with_keepalive(interval: Duration) -> Self {
        Self {
            keepalive_interval: interval,
            keepalive_timeout: interval * 3,
            window: DEFAULT_WINDOW,
            accept_backlog: 32,
        }
    }
}
