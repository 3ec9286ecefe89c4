//! Fleet reconciler: converges running tunnels onto the resolver's answer
//!
//! The resolver decides which gateways this agent should be connected to;
//! the agent never load-balances on its own. The reconciler owns the map of
//! supervisors exclusively, so convergence needs no locking: one fetch, one
//! diff, one sleep, forever.

use crate::config::AgentConfig;
use crate::transport::GatewayConnector;
use crate::tunnel::{Backoff, Tunnel};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info};

/// Resolver call failures. Always recovered with backoff, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("resolver request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("resolver answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// HTTP client for the resolver endpoint.
pub struct Resolver {
    client: reqwest::Client,
    url: url::Url,
    token: String,
}

impl Resolver {
    pub fn new(cfg: &AgentConfig) -> Result<Self, ResolverError> {
        // A request timeout keeps a wedged resolver from stalling the
        // whole refresh cycle.
        let client = reqwest::Client::builder()
            .timeout(cfg.handshake_timeout)
            .build()?;
        Ok(Self {
            client,
            url: cfg.resolver_url.clone(),
            token: cfg.token.clone(),
        })
    }

    /// Fetch the Desired Set: a trimmed, semicolon-separated endpoint list.
    pub async fn fetch(&self) -> Result<Vec<String>, ResolverError> {
        let response = self
            .client
            .get(self.url.as_str())
            .header("X-Token", &self.token)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            return Err(ResolverError::Status { status, body });
        }

        Ok(parse_endpoints(&body))
    }
}

/// An empty body is an empty set; empty segments are discarded.
fn parse_endpoints(body: &str) -> Vec<String> {
    body.trim()
        .split(';')
        .filter(|segment| !segment.is_empty())
        .map(String::from)
        .collect()
}

/// Owns every tunnel supervisor and keeps the set equal to the resolver's
/// most recent answer.
pub struct Fleet {
    cfg: Arc<AgentConfig>,
    connector: Arc<GatewayConnector>,
    resolver: Resolver,
    tunnels: HashMap<String, Tunnel>,
}

impl Fleet {
    pub fn new(
        cfg: Arc<AgentConfig>,
        connector: Arc<GatewayConnector>,
        resolver: Resolver,
    ) -> Self {
        Self {
            cfg,
            connector,
            resolver,
            tunnels: HashMap::new(),
        }
    }

    /// Poll the resolver and reconcile, forever. Resolver failures back off
    /// and retry; nothing here terminates the process.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.cfg.backoff);

        loop {
            info!("updating gateway endpoints from {}", self.cfg.resolver_url);
            let endpoints = match self.resolver.fetch().await {
                Ok(endpoints) => {
                    backoff.reset();
                    endpoints
                }
                Err(e) => {
                    let delay = backoff.next();
                    error!("failed to fetch gateway endpoints: {}, retry in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            info!("desired endpoints: {:?}", endpoints);
            self.reconcile(&endpoints);
            tokio::time::sleep(self.cfg.refresh_interval).await;
        }
    }

    /// Start supervisors for new endpoints, then close and drop the ones
    /// that left the Desired Set. Additions come first so an endpoint
    /// moving between answers never sees its fleet empty.
    fn reconcile(&mut self, endpoints: &[String]) {
        for endpoint in endpoints {
            if !self.tunnels.contains_key(endpoint) {
                info!("starting a tunnel to {}", endpoint);
                self.tunnels.insert(
                    endpoint.clone(),
                    Tunnel::spawn(
                        endpoint.clone(),
                        Arc::clone(&self.connector),
                        Arc::clone(&self.cfg),
                    ),
                );
            }
        }

        let desired: HashSet<&str> = endpoints.iter().map(String::as_str).collect();
        self.tunnels.retain(|endpoint, tunnel| {
            if desired.contains(endpoint.as_str()) {
                true
            } else {
                info!("closing tunnel to {}", endpoint);
                tunnel.close();
                false
            }
        });
    }
}
