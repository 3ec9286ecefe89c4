//! Agent configuration
//!
//! Everything is read once at startup and frozen into a single immutable
//! [`AgentConfig`] record. There is no reload path: changing the token,
//! the config blob, or the resolver requires a restart.

use bytes::Bytes;
use regex_lite::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::protocol::TOKEN_LEN;

/// Resolver used when `RESOLVER_URL` is not set.
pub const DEFAULT_RESOLVER_URL: &str = "https://gw.backhaul.dev/connect/resolve";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("project token must be exactly {TOKEN_LEN} bytes, got {0}")]
    TokenLength(usize),

    #[error("project token must be ASCII")]
    TokenNotAscii,

    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config blob too large: {0} bytes")]
    ConfigTooLarge(usize),

    #[error("invalid resolver URL {url}: {source}")]
    InvalidResolverUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("resolver URL {0} has no host")]
    ResolverUrlMissingHost(String),
}

/// Reconnect backoff parameters, shared by tunnel supervisors and the
/// fleet reconciler.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First sleep after a failure
    pub min: Duration,
    /// Saturation point; also the "healthy session" threshold
    pub max: Duration,
    /// Multiplier applied to each successive sleep
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

/// Immutable agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 36-byte project credential, sent to the resolver and every gateway
    pub token: String,
    /// Routing configuration uploaded verbatim to each gateway
    pub config_blob: Bytes,
    /// Resolver endpoint returning the desired gateway set
    pub resolver_url: Url,
    /// TLS server name expected from every gateway (the resolver's hostname)
    pub server_name: String,
    /// Build identifier sent in the handshake, at most 16 bytes
    pub version: String,
    /// Disable gateway certificate verification (dev only)
    pub tls_skip_verify: bool,
    /// Deadline over the whole gateway handshake
    pub handshake_timeout: Duration,
    /// Timeout for dialing a proxied destination
    pub dial_timeout: Duration,
    /// Absolute lifetime cap for one proxied stream
    pub stream_timeout: Duration,
    /// Pause between resolver polls
    pub refresh_interval: Duration,
    /// Session keep-alive ping interval
    pub keepalive_interval: Duration,
    /// Reconnect backoff schedule
    pub backoff: BackoffConfig,
}

impl AgentConfig {
    /// Build the configuration from startup inputs, reading and expanding
    /// the config file. Fails before any network object is constructed.
    pub fn build(
        token: &str,
        config_path: &Path,
        resolver_url: Option<&str>,
        tls_skip_verify: bool,
    ) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(config_path).map_err(|source| {
            ConfigError::ConfigRead {
                path: config_path.to_path_buf(),
                source,
            }
        })?;
        let blob = Bytes::from(expand_env(&raw).into_bytes());
        Self::with_blob(token, blob, resolver_url, tls_skip_verify)
    }

    /// Build the configuration from an already-materialized config blob.
    pub fn with_blob(
        token: &str,
        config_blob: Bytes,
        resolver_url: Option<&str>,
        tls_skip_verify: bool,
    ) -> Result<Self, ConfigError> {
        validate_token(token)?;

        if u32::try_from(config_blob.len()).is_err() {
            return Err(ConfigError::ConfigTooLarge(config_blob.len()));
        }

        let raw_url = resolver_url.unwrap_or(DEFAULT_RESOLVER_URL);
        let resolver_url =
            Url::parse(raw_url).map_err(|source| ConfigError::InvalidResolverUrl {
                url: raw_url.to_string(),
                source,
            })?;
        let server_name = resolver_url
            .host_str()
            .ok_or_else(|| ConfigError::ResolverUrlMissingHost(raw_url.to_string()))?
            .to_string();

        Ok(Self {
            token: token.to_string(),
            config_blob,
            resolver_url,
            server_name,
            version: crate::VERSION.to_string(),
            tls_skip_verify,
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(600),
            keepalive_interval: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
        })
    }
}

fn validate_token(token: &str) -> Result<(), ConfigError> {
    if token.len() != TOKEN_LEN {
        return Err(ConfigError::TokenLength(token.len()));
    }
    if !token.is_ascii() {
        return Err(ConfigError::TokenNotAscii);
    }
    Ok(())
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
///
/// Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap();
        result.push_str(&input[last..whole.start()]);
        result.push_str(&std::env::var(name).unwrap_or_default());
        last = whole.end();
    }
    result.push_str(&input[last..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_TOKEN: &str = "0123456789abcdef0123456789abcdef0123";

    #[test]
    fn test_expand_env() {
        std::env::set_var("BACKHAUL_TEST_HOST", "db.local");
        std::env::set_var("BACKHAUL_TEST_PORT", "5432");

        assert_eq!(expand_env("host=${BACKHAUL_TEST_HOST}"), "host=db.local");
        assert_eq!(expand_env("host=$BACKHAUL_TEST_HOST"), "host=db.local");
        assert_eq!(
            expand_env("${BACKHAUL_TEST_HOST}:${BACKHAUL_TEST_PORT}"),
            "db.local:5432"
        );
        assert_eq!(expand_env("no variables here"), "no variables here");
        assert_eq!(expand_env("${BACKHAUL_TEST_UNSET_VAR}"), "");
        assert_eq!(expand_env("a $BACKHAUL_TEST_UNSET_VAR b"), "a  b");
    }

    #[test]
    fn test_token_length_rejected() {
        let short = "too-short";
        let err = AgentConfig::with_blob(short, Bytes::new(), None, false).unwrap_err();
        assert!(matches!(err, ConfigError::TokenLength(9)));

        let long = "0123456789abcdef0123456789abcdef01234";
        let err = AgentConfig::with_blob(long, Bytes::new(), None, false).unwrap_err();
        assert!(matches!(err, ConfigError::TokenLength(37)));
    }

    #[test]
    fn test_non_ascii_token_rejected() {
        // 36 bytes but not ASCII
        let token = "0123456789abcdef0123456789abcdef01é";
        assert_eq!(token.len(), TOKEN_LEN);
        let err = AgentConfig::with_blob(token, Bytes::new(), None, false).unwrap_err();
        assert!(matches!(err, ConfigError::TokenNotAscii));
    }

    #[test]
    fn test_default_resolver_url() {
        let cfg = AgentConfig::with_blob(GOOD_TOKEN, Bytes::new(), None, false).unwrap();
        assert_eq!(cfg.resolver_url.as_str(), DEFAULT_RESOLVER_URL);
        assert_eq!(cfg.server_name, "gw.backhaul.dev");
    }

    #[test]
    fn test_server_name_from_resolver_host() {
        let cfg = AgentConfig::with_blob(
            GOOD_TOKEN,
            Bytes::new(),
            Some("https://edge.example.net:8443/resolve"),
            false,
        )
        .unwrap();
        assert_eq!(cfg.server_name, "edge.example.net");
    }

    #[test]
    fn test_invalid_resolver_url_rejected() {
        let err =
            AgentConfig::with_blob(GOOD_TOKEN, Bytes::new(), Some("not a url"), false).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidResolverUrl { .. }));
    }

    #[test]
    fn test_config_file_expansion() {
        std::env::set_var("BACKHAUL_TEST_MY_HOST", "db.local");

        let dir = std::env::temp_dir();
        let path = dir.join("backhaul-config-expansion-test");
        std::fs::write(&path, "host=${BACKHAUL_TEST_MY_HOST}").unwrap();

        let cfg = AgentConfig::build(GOOD_TOKEN, &path, None, false).unwrap();
        assert_eq!(&cfg.config_blob[..], b"host=db.local");
        assert_eq!(cfg.config_blob.len(), 13);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_config_file() {
        let err = AgentConfig::build(
            GOOD_TOKEN,
            Path::new("/nonexistent/backhaul.conf"),
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConfigRead { .. }));
    }
}
