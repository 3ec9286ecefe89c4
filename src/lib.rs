//! # Backhaul
//!
//! A reverse-tunnel agent that exposes selected internal TCP services
//! through a remote gateway fleet without opening any inbound ports.
//!
//! The agent dials *out* to each gateway, authenticates with a fixed framed
//! handshake, uploads its routing configuration, and then serves proxy
//! streams that the gateway opens back over the same TLS connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Fleet Reconciler                     │
//! │     (resolver polling, one supervisor per gateway)   │
//! ├─────────────────────────────────────────────────────┤
//! │                Tunnel Supervisor                     │
//! │        (connect, serve, reconnect with backoff)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Stream Proxy                        │
//! │   (accept streams, dial destinations, splice bytes)  │
//! ├─────────────────────────────────────────────────────┤
//! │                 Session Layer                        │
//! │      (stream multiplexing, flow control, pings)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport                          │
//! │          (TLS over TCP, framed handshake)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod fleet;
pub mod mux;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::AgentConfig;

/// Agent build version, sent to gateways in the handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Session error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Stream error: {0}")]
    Proxy(#[from] proxy::StreamError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] fleet::ResolverError),
}
