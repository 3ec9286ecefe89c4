//! Backhaul agent
//!
//! Runs inside a private network and keeps outbound tunnels to the gateway
//! fleet named by the resolver. All settings come from the environment (or
//! the matching flags); validation failures exit non-zero before any
//! network traffic.

use anyhow::{Context, Result};
use backhaul::config::AgentConfig;
use backhaul::fleet::{Fleet, Resolver};
use backhaul::transport::GatewayConnector;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Backhaul agent - reverse tunnel to the gateway fleet
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Expose internal TCP services through an outbound gateway fleet")]
#[command(version)]
struct Args {
    /// Project auth token (exactly 36 characters)
    #[arg(long, env = "PROJECT_TOKEN", hide_env_values = true)]
    token: String,

    /// Path to the routing config uploaded to each gateway
    #[arg(long, env = "CONFIG_PATH")]
    config: PathBuf,

    /// Resolver endpoint returning the desired gateway set
    #[arg(long, env = "RESOLVER_URL")]
    resolver_url: Option<String>,

    /// Skip gateway certificate verification (dev only)
    #[arg(long, env = "TLS_SKIP_VERIFY")]
    insecure: bool,

    /// Log filter (tracing env-filter syntax)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    info!("backhaul agent v{}", backhaul::VERSION);

    let cfg = AgentConfig::build(
        &args.token,
        &args.config,
        args.resolver_url.as_deref(),
        args.insecure,
    )
    .context("invalid configuration")?;

    if cfg.tls_skip_verify {
        warn!("gateway certificate verification is disabled");
    }

    let cfg = Arc::new(cfg);
    let connector =
        Arc::new(GatewayConnector::new(&cfg).context("failed to build gateway connector")?);
    let resolver = Resolver::new(&cfg).context("failed to build resolver client")?;
    let fleet = Fleet::new(Arc::clone(&cfg), connector, resolver);

    // No graceful shutdown protocol: process termination tears everything
    // down, so Ctrl-C just ends the select.
    tokio::select! {
        _ = fleet.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
