//! Proxy transport through a node

use bytes::Bytes;
use http::{header, Request, StatusCode};
use rustls::RootCertStore;
use std::sync::Arc;
use tailnode_config::{AppConfig, MapEnv};
use tailnode_lib::{NodeTransport, ReleaseOutcome, TransportError};
use tailnode_proto::RuntimeFactory;
use tailnode_registry::testing::FakeFactory;
use tailnode_registry::NodeRegistry;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

fn registry_in(dir: &std::path::Path, factory: &Arc<FakeFactory>) -> NodeRegistry {
    let config = AppConfig {
        state_dir: dir.display().to_string(),
        ..Default::default()
    };
    NodeRegistry::new(
        Arc::new(config),
        Arc::new(MapEnv::new()),
        Arc::clone(factory) as Arc<dyn RuntimeFactory>,
    )
}

/// Read one request head, answer with `body`, return the head
async fn serve_once<S>(mut stream: S, body: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        head.extend_from_slice(&buf[..n]);
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_default_node_name() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let transport = NodeTransport::new(registry_in(dir.path(), &factory), None);

    assert_eq!(transport.name(), "caddy-proxy");
    assert!(!transport.tls_enabled());
}

#[tokio::test]
async fn test_provision_and_cleanup_hold_one_reference() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let registry = registry_in(dir.path(), &factory);
    let transport = NodeTransport::new(registry.clone(), Some("proxy"));

    transport.provision().await.unwrap();
    transport.provision().await.unwrap();
    assert_eq!(registry.references("proxy"), 1);

    assert_eq!(transport.cleanup().await.unwrap(), ReleaseOutcome::ShutDown);
    assert_eq!(transport.cleanup().await.unwrap(), ReleaseOutcome::NotFound);
    assert_eq!(factory.shutdowns(), 1);
}

#[tokio::test]
async fn test_round_trip_requires_provision() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let transport = NodeTransport::new(registry_in(dir.path(), &factory), Some("proxy"));

    let request = Request::get("http://127.0.0.1:1/").body(Bytes::new()).unwrap();
    let err = transport.round_trip(request).await.unwrap_err();
    assert!(matches!(err, TransportError::NotProvisioned(name) if name == "proxy"));
}

#[tokio::test]
async fn test_round_trip_defaults_to_http() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let transport = NodeTransport::new(registry_in(dir.path(), &factory), Some("proxy"));
    transport.provision().await.unwrap();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = upstream.accept().await.unwrap();
        serve_once(stream, "upstream").await
    });

    // Scheme-less request: the upstream comes from the Host header
    let request = Request::get("/api/items?page=2")
        .header(header::HOST, addr.to_string())
        .body(Bytes::new())
        .unwrap();
    let response = transport.round_trip(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"upstream");

    let head = server.await.unwrap();
    assert!(head.starts_with("GET /api/items?page=2 HTTP/1.1\r\n"));

    transport.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_missing_host_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let transport = NodeTransport::new(registry_in(dir.path(), &factory), Some("proxy"));
    transport.provision().await.unwrap();

    let request = Request::get("/").body(Bytes::new()).unwrap();
    let err = transport.round_trip(request).await.unwrap_err();
    assert!(matches!(err, TransportError::MissingHost));

    transport.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_round_trip_with_tls_enabled() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = upstream.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (stream, _) = upstream.accept().await.unwrap();
        let tls = acceptor.accept(stream).await.unwrap();
        serve_once(tls, "secure").await
    });

    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let mut transport = NodeTransport::new(registry_in(dir.path(), &factory), Some("proxy"));
    let mut roots = RootCertStore::empty();
    roots.add(cert.der().clone()).unwrap();
    transport.enable_tls_with(roots);
    transport.provision().await.unwrap();

    let request = Request::get("/secure")
        .header(header::HOST, format!("localhost:{}", port))
        .body(Bytes::new())
        .unwrap();
    let response = transport.round_trip(request).await.unwrap();

    assert_eq!(response.body().as_ref(), b"secure");
    assert!(server.await.unwrap().starts_with("GET /secure HTTP/1.1\r\n"));

    transport.cleanup().await.unwrap();
}
