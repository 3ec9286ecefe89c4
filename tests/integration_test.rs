//! Integration tests for the backhaul agent
//!
//! Drives the real agent-side stack (TLS connector, handshake, session
//! layer, stream proxy) against a mock gateway built from the symmetric
//! halves of the same contract: a TLS listener with a self-signed
//! certificate that validates the handshake and opens streams back.

use backhaul::config::AgentConfig;
use backhaul::mux::{MuxConfig, Session};
use backhaul::protocol::{RequestHeader, ResponseHeader, REQUEST_HEADER_LEN};
use backhaul::proxy::{self, ProxyConfig};
use backhaul::transport::{GatewayConnector, TransportError};
use backhaul::tunnel::Tunnel;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "0123456789abcdef0123456789abcdef0123";
const CONFIG_BLOB: &[u8] = b"route=10.0.0.0/8";

fn agent_config() -> AgentConfig {
    AgentConfig::with_blob(
        TOKEN,
        Bytes::from_static(CONFIG_BLOB),
        Some("https://gw.test.internal/resolve"),
        true, // self-signed gateway certificate
    )
    .unwrap()
}

fn fast_mux() -> MuxConfig {
    MuxConfig::with_keepalive(Duration::from_millis(50))
}

fn tls_acceptor() -> TlsAcceptor {
    rustls::crypto::ring::default_provider().install_default().ok();

    let certified = rcgen::generate_simple_self_signed(vec!["gw.test.internal".to_string()])
        .expect("failed to generate test certificate");
    let cert = certified.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("invalid test certificate");
    TlsAcceptor::from(Arc::new(config))
}

/// Gateway side of the handshake: read the fixed header and config blob.
async fn read_handshake<S>(stream: &mut S) -> (RequestHeader, Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut header_buf = vec![0u8; REQUEST_HEADER_LEN];
    stream.read_exact(&mut header_buf).await.unwrap();
    let mut buf = BytesMut::from(&header_buf[..]);
    let header = RequestHeader::decode(&mut buf).unwrap();

    let mut blob = vec![0u8; header.config_size as usize];
    stream.read_exact(&mut blob).await.unwrap();
    (header, blob)
}

async fn write_verdict<S>(stream: &mut S, status: u16, message: &[u8])
where
    S: AsyncWrite + Unpin,
{
    let header = ResponseHeader::new(status, message.len() as u16);
    stream.write_all(&header.encode()).await.unwrap();
    stream.write_all(message).await.unwrap();
    stream.flush().await.unwrap();
}

async fn echo_listener() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn destination_header(addr: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&(addr.len() as u16).to_le_bytes());
    buf.extend_from_slice(addr.as_bytes());
    buf
}

/// Happy path: handshake accepted, gateway opens a stream to an internal
/// echo service, bytes come back verbatim.
#[tokio::test]
async fn test_handshake_and_stream_echo() {
    let echo_addr = echo_listener().await;

    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap().to_string();
    let acceptor = tls_acceptor();

    let gateway_task = tokio::spawn(async move {
        let (tcp, _) = gateway.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();

        let (header, blob) = read_handshake(&mut tls).await;
        assert_eq!(&header.token[..], TOKEN.as_bytes());
        assert_eq!(header.version_str(), backhaul::VERSION);
        assert_eq!(header.config_size as usize, CONFIG_BLOB.len());
        assert_eq!(blob, CONFIG_BLOB);

        write_verdict(&mut tls, 200, b"").await;

        // Now the gateway's half of the session: open one proxied stream
        let session = Session::client(tls, fast_mux());
        let mut stream = session.open().await.unwrap();

        let mut first = destination_header(&echo_addr);
        first.extend_from_slice(b"ping");
        stream.send(first.freeze()).await.unwrap();

        let echoed = stream.recv().await.unwrap();
        assert_eq!(&echoed[..], b"ping");

        // Second round trip on the same stream
        stream.send(Bytes::from_static(b"ping again")).await.unwrap();
        let echoed = stream.recv().await.unwrap();
        assert_eq!(&echoed[..], b"ping again");
    });

    // Agent side: connect + authenticate, then serve streams
    let cfg = agent_config();
    let connector = GatewayConnector::new(&cfg).unwrap();
    let conn = connector.connect(&gateway_addr).await.unwrap();

    let mut session = Session::server(conn, fast_mux());
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let serve_task = tokio::spawn(async move {
        let _ = proxy::serve(&mut session, ProxyConfig::default(), serve_cancel).await;
    });

    tokio::time::timeout(Duration::from_secs(10), gateway_task)
        .await
        .expect("gateway scenario timed out")
        .unwrap();

    cancel.cancel();
    let _ = serve_task.await;
}

/// A gateway that answers non-200 produces a status-carrying error and no
/// usable connection.
#[tokio::test]
async fn test_rejected_handshake() {
    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap().to_string();
    let acceptor = tls_acceptor();

    tokio::spawn(async move {
        let (tcp, _) = gateway.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let _ = read_handshake(&mut tls).await;
        write_verdict(&mut tls, 403, b"bad token").await;
    });

    let cfg = agent_config();
    let connector = GatewayConnector::new(&cfg).unwrap();

    let err = connector.connect(&gateway_addr).await.unwrap_err();
    match err {
        TransportError::Rejected { status, message } => {
            assert_eq!(status, 403);
            assert_eq!(message, "bad token");
        }
        other => panic!("expected rejection, got: {}", other),
    }
}

/// A gateway that accepts TCP but never speaks trips the handshake
/// deadline, not a hang.
#[tokio::test]
async fn test_handshake_deadline() {
    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (_tcp, _) = gateway.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let mut cfg = agent_config();
    cfg.handshake_timeout = Duration::from_millis(200);
    let connector = GatewayConnector::new(&cfg).unwrap();

    let started = std::time::Instant::now();
    let err = connector.connect(&gateway_addr).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// The whole supervisor loop: a gateway that drops its first connection is
/// redialed after backoff, and the second connection serves streams.
#[tokio::test]
async fn test_supervisor_reconnects_after_disconnect() {
    let echo_addr = echo_listener().await;

    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap().to_string();
    let acceptor = tls_acceptor();

    let gateway_task = tokio::spawn(async move {
        // First connection: accept the handshake, then hang up
        {
            let (tcp, _) = gateway.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let _ = read_handshake(&mut tls).await;
            write_verdict(&mut tls, 200, b"").await;
        }

        // Second connection: serve a stream end to end
        let (tcp, _) = gateway.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let _ = read_handshake(&mut tls).await;
        write_verdict(&mut tls, 200, b"").await;

        let session = Session::client(tls, fast_mux());
        let mut stream = session.open().await.unwrap();
        let mut first = destination_header(&echo_addr);
        first.extend_from_slice(b"back online");
        stream.send(first.freeze()).await.unwrap();

        let echoed = stream.recv().await.unwrap();
        assert_eq!(&echoed[..], b"back online");
    });

    let mut cfg = agent_config();
    cfg.backoff.min = Duration::from_millis(10);
    cfg.backoff.max = Duration::from_millis(40);
    cfg.keepalive_interval = Duration::from_millis(50);
    let cfg = Arc::new(cfg);
    let connector = Arc::new(GatewayConnector::new(&cfg).unwrap());
    let tunnel = Tunnel::spawn(gateway_addr, connector, cfg);

    tokio::time::timeout(Duration::from_secs(10), gateway_task)
        .await
        .expect("supervisor never came back")
        .unwrap();

    tunnel.close();
}

/// Tearing the transport down mid-session surfaces as an accept error on
/// the agent side (which is what drives the supervisor to reconnect).
#[tokio::test]
async fn test_gateway_disconnect_ends_session() {
    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap().to_string();
    let acceptor = tls_acceptor();

    tokio::spawn(async move {
        let (tcp, _) = gateway.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let _ = read_handshake(&mut tls).await;
        write_verdict(&mut tls, 200, b"").await;
        // Drop the connection without a session
    });

    let cfg = agent_config();
    let connector = GatewayConnector::new(&cfg).unwrap();
    let conn = connector.connect(&gateway_addr).await.unwrap();

    let mut session = Session::server(conn, fast_mux());
    let err = tokio::time::timeout(Duration::from_secs(5), session.accept())
        .await
        .expect("accept should fail once the transport is gone")
        .unwrap_err();

    // EOF, reset, or a lapsed keep-alive, depending on timing
    let _ = err;
}
