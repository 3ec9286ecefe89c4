//! Stream proxy: bridges multiplexed streams to internal TCP destinations
//!
//! On an established session the agent accepts streams the gateway opens.
//! Each stream starts with a framed destination address; the agent dials it
//! and splices bytes in both directions until either side finishes or the
//! stream's absolute deadline fires. A stream failure never affects its
//! peers; only session death ends the accept loop.

use crate::mux::{MuxError, MuxStream, Session, MAX_PAYLOAD};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-stream errors. Logged and confined to the stream that caused them.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid destination: {0}")]
    BadDestination(String),

    #[error("timed out dialing {0}")]
    DialTimeout(String),

    #[error("stream deadline exceeded")]
    Deadline,
}

/// Proxy timing knobs, taken from the agent configuration.
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    /// Absolute cap on one stream's total lifetime
    pub stream_timeout: Duration,
    /// Timeout for dialing the destination
    pub dial_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(300),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Accept and service streams until the supervisor cancels or the session
/// dies. The session is closed on either exit path; in-flight streams are
/// left to their own deadlines and the dropped transport.
pub async fn serve(
    session: &mut Session,
    cfg: ProxyConfig,
    cancel: CancellationToken,
) -> Result<(), MuxError> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => None,
            accepted = session.accept() => Some(accepted),
        };

        match accepted {
            None => {
                session.close().await;
                return Ok(());
            }
            Some(Ok(stream)) => {
                tokio::spawn(async move {
                    let id = stream.id();
                    if let Err(e) = handle_stream(stream, cfg).await {
                        debug!("stream {}: {}", id, e);
                    }
                });
            }
            Some(Err(e)) => {
                session.close().await;
                return Err(e);
            }
        }
    }
}

/// Service one stream under its absolute deadline. When the deadline fires
/// both the stream and the destination connection are dropped, which closes
/// them; there is no extension.
async fn handle_stream(stream: MuxStream, cfg: ProxyConfig) -> Result<(), StreamError> {
    let deadline = Instant::now() + cfg.stream_timeout;
    match tokio::time::timeout_at(deadline, service_stream(stream, cfg)).await {
        Ok(result) => result,
        Err(_) => Err(StreamError::Deadline),
    }
}

async fn service_stream(stream: MuxStream, cfg: ProxyConfig) -> Result<(), StreamError> {
    let (mut read, mut write) = stream.split();

    // Destination header: dst_len u16 little-endian, then host:port bytes.
    // The gateway may coalesce the first payload bytes into the same frame;
    // whatever follows the header belongs to the destination.
    let mut pending = BytesMut::new();
    let destination = loop {
        if pending.len() >= 2 {
            let len = u16::from_le_bytes([pending[0], pending[1]]) as usize;
            if pending.len() >= 2 + len {
                pending.advance(2);
                let raw = pending.split_to(len);
                break String::from_utf8(raw.to_vec())
                    .map_err(|_| StreamError::BadDestination("not UTF-8".to_string()))?;
            }
        }
        match read.recv().await {
            Some(chunk) => pending.extend_from_slice(&chunk),
            None => {
                return Err(StreamError::BadDestination(
                    "stream closed before destination header".to_string(),
                ))
            }
        }
    };
    if destination.is_empty() {
        return Err(StreamError::BadDestination("empty address".to_string()));
    }

    debug!("stream {} -> {}", read.id(), destination);

    let dst = tokio::time::timeout(cfg.dial_timeout, TcpStream::connect(&destination))
        .await
        .map_err(|_| StreamError::DialTimeout(destination.clone()))??;
    dst.set_nodelay(true).ok();
    let (mut dst_read, mut dst_write) = dst.into_split();

    if !pending.is_empty() {
        dst_write.write_all(&pending).await?;
    }

    // Both directions run on this task so the deadline cancels everything
    // at once. EOF in one direction half-closes it and leaves the other
    // running.
    let inbound = async {
        while let Some(chunk) = read.recv().await {
            if dst_write.write_all(&chunk).await.is_err() {
                return;
            }
        }
        let _ = dst_write.shutdown().await;
    };

    let outbound = async {
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            match dst_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if write
                        .send(Bytes::copy_from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        write.close().await;
    };

    tokio::join!(inbound, outbound);
    Ok(())
}
