//! Tunnel supervisor: keeps one gateway connected for as long as wanted
//!
//! Each supervisor owns exactly one worker task running a
//! connect → serve → backoff loop. A session that stayed up longer than the
//! backoff ceiling counts as healthy and resets the schedule, so a gateway
//! that flaps quickly backs off while one that merely restarts does not pay
//! an ever-growing penalty.

use crate::config::{AgentConfig, BackoffConfig};
use crate::mux::{MuxConfig, Session};
use crate::proxy::{self, ProxyConfig};
use crate::transport::GatewayConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exponential reconnect backoff, saturating at a ceiling.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    cfg: BackoffConfig,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self {
            current: cfg.min,
            cfg,
        }
    }

    /// The next sleep. Each call scales the following one by the factor,
    /// saturating at the ceiling.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.cfg.factor).min(self.cfg.max);
        delay
    }

    /// Return the schedule to its minimum (after a healthy run).
    pub fn reset(&mut self) {
        self.current = self.cfg.min;
    }

    /// The ceiling; sessions outliving it count as healthy.
    pub fn max(&self) -> Duration {
        self.cfg.max
    }
}

/// A supervised connection to one gateway endpoint.
pub struct Tunnel {
    endpoint: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Tunnel {
    /// Start supervising `endpoint`. The worker reconnects until
    /// [`Tunnel::close`] is called or the tunnel is dropped.
    pub fn spawn(
        endpoint: String,
        connector: Arc<GatewayConnector>,
        cfg: Arc<AgentConfig>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker_endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            keep_connected(worker_endpoint, connector, cfg, token).await;
        });

        Self {
            endpoint,
            cancel,
            task,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop the worker and close the live connection, if any. Idempotent;
    /// any in-progress network call is unblocked in bounded time.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the worker task has fully wound down.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn keep_connected(
    endpoint: String,
    connector: Arc<GatewayConnector>,
    cfg: Arc<AgentConfig>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(cfg.backoff);

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connector.connect(&endpoint) => result,
        };

        let cause = match connected {
            Ok(conn) => {
                info!("ready to proxy requests from {}", endpoint);
                let started = Instant::now();

                let mut session =
                    Session::server(conn, MuxConfig::with_keepalive(cfg.keepalive_interval));
                let result = proxy::serve(
                    &mut session,
                    ProxyConfig {
                        stream_timeout: cfg.stream_timeout,
                        dial_timeout: cfg.dial_timeout,
                    },
                    cancel.clone(),
                )
                .await;

                if started.elapsed() > backoff.max() {
                    backoff.reset();
                }

                match result {
                    // Clean exit: cancellation was observed inside the proxy
                    Ok(()) => continue,
                    Err(e) => e.to_string(),
                }
            }
            Err(e) => e.to_string(),
        };

        error!("tunnel to {}: {}", endpoint, cause);
        let delay = backoff.next();
        info!("reconnecting to {} in {:?}", endpoint, delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
