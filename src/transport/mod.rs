//! Gateway transport: TLS dialing and the authenticate exchange
//!
//! A [`GatewayConnector`] owns everything needed to bring up one
//! authenticated gateway connection: the TLS client config, the expected
//! server name, and the pre-encoded handshake. The whole exchange (TCP
//! dial, TLS handshake, request write, response read) runs under a single
//! deadline; any failure closes the connection and surfaces here. Retrying
//! is the supervisor's job, never this module's.

use crate::config::AgentConfig;
use crate::protocol::{
    ProtocolError, RequestHeader, ResponseHeader, RESPONSE_HEADER_LEN, STATUS_OK,
};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, info};

/// Transport and handshake errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid TLS server name {0}")]
    InvalidServerName(String),

    #[error("handshake deadline exceeded")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("gateway rejected handshake with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Dials gateways and runs the handshake exchange.
pub struct GatewayConnector {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    request: Bytes,
    config_blob: Bytes,
    timeout: Duration,
}

impl GatewayConnector {
    pub fn new(cfg: &AgentConfig) -> Result<Self, TransportError> {
        ensure_crypto_provider();

        let tls_config = build_tls_config(cfg.tls_skip_verify);
        let server_name = ServerName::try_from(cfg.server_name.clone())
            .map_err(|_| TransportError::InvalidServerName(cfg.server_name.clone()))?;

        let header = RequestHeader::new(&cfg.token, &cfg.version, cfg.config_blob.len() as u32)?;

        Ok(Self {
            connector: TlsConnector::from(tls_config),
            server_name,
            request: header.encode().freeze(),
            config_blob: cfg.config_blob.clone(),
            timeout: cfg.handshake_timeout,
        })
    }

    /// Establish one authenticated gateway connection.
    ///
    /// The returned stream is ready for the session layer. The deadline
    /// covers the entire exchange; on expiry the connection is dropped.
    pub async fn connect(&self, addr: &str) -> Result<TlsStream<TcpStream>, TransportError> {
        match tokio::time::timeout(self.timeout, self.exchange(addr)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn exchange(&self, addr: &str) -> Result<TlsStream<TcpStream>, TransportError> {
        debug!("connecting to {} ({:?})", addr, self.server_name);

        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true).ok();

        let mut stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        stream.write_all(&self.request).await?;
        stream.write_all(&self.config_blob).await?;
        stream.flush().await?;

        let mut header_buf = [0u8; RESPONSE_HEADER_LEN];
        stream.read_exact(&mut header_buf).await?;
        let response = ResponseHeader::parse(header_buf);

        let mut message = vec![0u8; response.message_size as usize];
        stream.read_exact(&mut message).await?;
        let message = String::from_utf8_lossy(&message).into_owned();

        if response.status != STATUS_OK {
            return Err(TransportError::Rejected {
                status: response.status,
                message,
            });
        }

        info!("connected to gateway {}", addr);
        Ok(stream)
    }
}

fn build_tls_config(skip_verify: bool) -> Arc<rustls::ClientConfig> {
    let config = if skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Arc::new(config)
}

// Installing the process-wide provider races with other users of rustls,
// so it goes through a Once and tolerates losing.
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Certificate verifier that accepts anything (dev only, behind the
/// `tls_skip_verify` switch).
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef0123";

    fn test_config(skip_verify: bool) -> AgentConfig {
        AgentConfig::with_blob(
            TOKEN,
            Bytes::from_static(b"route=internal"),
            Some("https://gw.example.com/resolve"),
            skip_verify,
        )
        .unwrap()
    }

    #[test]
    fn test_connector_construction() {
        let connector = GatewayConnector::new(&test_config(false)).unwrap();
        assert_eq!(connector.request.len(), crate::protocol::REQUEST_HEADER_LEN);
        assert_eq!(&connector.config_blob[..], b"route=internal");
    }

    #[test]
    fn test_connector_skip_verify_construction() {
        assert!(GatewayConnector::new(&test_config(true)).is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = GatewayConnector::new(&test_config(true)).unwrap();
        // Port 1 on loopback is refused, not timed out
        let err = connector.connect("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
