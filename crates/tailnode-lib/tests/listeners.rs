//! Plain and TLS scheme listeners on registry nodes

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tailnode_config::{AppConfig, MapEnv};
use tailnode_lib::{
    listen, listen_packet, NetworkAddress, NetworkHandler, Scheme, SchemeError, SchemeHandler,
    SchemeListener,
};
use tailnode_proto::{
    find_node_name, ControlClient, ControlError, MeshListener, MeshPacketConn, RuntimeFactory,
};
use tailnode_registry::testing::FakeFactory;
use tailnode_registry::NodeRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;

const DOMAIN: &str = "web.tailnet.ts.net";

/// Serves one certificate pair for [`DOMAIN`]
struct CertControl {
    pem: String,
}

#[async_trait]
impl ControlClient for CertControl {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ControlError> {
        let (status, body) = if request.uri().path() == format!("/localapi/v0/cert/{}", DOMAIN) {
            (StatusCode::OK, Bytes::from(self.pem.clone()))
        } else {
            (StatusCode::NOT_FOUND, Bytes::from_static(b"no cert"))
        };
        Ok(Response::builder().status(status).body(body).unwrap())
    }
}

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

/// Self-signed pair for [`DOMAIN`] plus a client config trusting it
fn certificate() -> (String, Arc<ClientConfig>) {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![DOMAIN.to_string()]).unwrap();
    let pem = format!("{}{}", key_pair.serialize_pem(), cert.pem());

    let mut roots = RootCertStore::empty();
    roots.add(cert.der().clone()).unwrap();
    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (pem, Arc::new(client))
}

async fn tls_connect(
    addr: std::net::SocketAddr,
    config: Arc<ClientConfig>,
    name: &str,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    TlsConnector::from(config)
        .connect(ServerName::try_from(name.to_string()).unwrap(), tcp)
        .await
}

#[tokio::test]
async fn test_plain_scheme_listens_on_node() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale/web:8000-8003").unwrap();
    let listener = listen(&registry, &address, 1).await.unwrap();

    assert_eq!(find_node_name(listener.as_ref()), Some("web"));
    assert_eq!(registry.references("web"), 1);

    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
    });

    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    client.await.unwrap();

    listener.close().await.unwrap();
    assert_eq!(registry.references("web"), 0);
    assert_eq!(factory.shutdowns(), 1);
}

#[tokio::test]
async fn test_default_node_for_empty_host() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale/:80").unwrap();
    let listener = listen(&registry, &address, 0).await.unwrap();

    assert_eq!(find_node_name(listener.as_ref()), Some("tailnode"));
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_offset_outside_range_takes_no_reference() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale/web:80").unwrap();
    let err = listen(&registry, &address, 3).await.unwrap_err();

    assert!(matches!(err, SchemeError::Address(_)));
    assert_eq!(factory.starts(), 0);
}

#[tokio::test]
async fn test_tls_scheme_serves_node_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let (pem, client_config) = certificate();
    factory.set_control(Arc::new(CertControl { pem }));
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale+tls/web:443").unwrap();
    let listener = listen(&registry, &address, 0).await.unwrap();
    assert_eq!(find_node_name(listener.as_ref()), Some("web"));

    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move {
        let mut stream = tls_connect(addr, client_config, DOMAIN).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    });

    let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    stream.write_all(b"pong").await.unwrap();

    assert_eq!(&client.await.unwrap(), b"pong");

    listener.close().await.unwrap();
    assert!(registry.lookup("web").is_none());
}

#[tokio::test]
async fn test_failed_handshake_does_not_stop_listener() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let (pem, client_config) = certificate();
    factory.set_control(Arc::new(CertControl { pem }));
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale+tls/web:443").unwrap();
    let listener = listen(&registry, &address, 0).await.unwrap();
    let addr = listener.local_addr().unwrap();

    // The node holds no certificate for this name
    let rejected = tls_connect(addr, Arc::clone(&client_config), "db.tailnet.ts.net").await;
    assert!(rejected.is_err());

    let client = tokio::spawn(async move {
        let mut stream = tls_connect(addr, client_config, DOMAIN).await.unwrap();
        stream.write_all(b"ok").await.unwrap();
        stream.flush().await.unwrap();
        // Hold the connection until the server has read
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf).await;
    });

    let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
    drop(stream);
    client.await.unwrap();

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_tls_close_failure_keeps_node() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let (pem, _) = certificate();
    factory.set_control(Arc::new(CertControl { pem }));
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale+tls/web:443").unwrap();
    let listener = listen(&registry, &address, 0).await.unwrap();

    factory.fail_listener_close(true);
    assert!(listener.close().await.is_err());
    assert_eq!(registry.references("web"), 1);

    factory.fail_listener_close(false);
    listener.close().await.unwrap();
    assert_eq!(registry.references("web"), 0);
}

#[tokio::test]
async fn test_dropped_tls_listener_releases_node() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let (pem, _) = certificate();
    factory.set_control(Arc::new(CertControl { pem }));
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale+tls/web:443").unwrap();
    let listener = listen(&registry, &address, 0).await.unwrap();
    assert_eq!(registry.references("web"), 1);

    drop(listener);
    for _ in 0..200 {
        if factory.shutdowns() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(factory.shutdowns(), 1);
    assert_eq!(registry.references("web"), 0);
}

#[tokio::test]
async fn test_udp_handler_binds_node_ipv4_address() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    factory.set_mesh_addresses(&["100.101.102.103", "fd7a:115c:a1e0::3"]);
    let registry = registry_in(dir.path(), &factory);

    let handler = SchemeHandler::new(Scheme::Udp);
    let opened = handler.listen(&registry, "web", "8443-8444", 1).await.unwrap();
    assert_eq!(opened.node_name(), Some("web"));
    let SchemeListener::Packet(conn) = opened else {
        panic!("expected a packet socket");
    };

    assert_eq!(
        factory.packet_binds(),
        vec![("udp4".to_string(), "100.101.102.103:8444".to_string())]
    );

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(b"quic", conn.local_addr().unwrap()).await.unwrap();
    let mut buf = [0u8; 8];
    let (n, _) = conn.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"quic");

    conn.close().await.unwrap();
    assert_eq!(registry.references("web"), 0);
}

#[tokio::test]
async fn test_udp_scheme_explicit_ipv6() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let registry = registry_in(dir.path(), &factory);

    let address = NetworkAddress::parse("tailscale/udp/web:443").unwrap();
    let conn = listen_packet(&registry, &address, "udp6", 0).await.unwrap();

    assert_eq!(factory.packet_binds()[0].0, "udp6");
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_stream_and_packet_schemes_do_not_mix() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let registry = registry_in(dir.path(), &factory);

    let udp = NetworkAddress::parse("tailscale/udp/web:443").unwrap();
    let err = listen(&registry, &udp, 0).await.unwrap_err();
    assert!(matches!(err, SchemeError::WrongKind { scheme: Scheme::Udp, .. }));

    let plain = NetworkAddress::parse("tailscale/web:443").unwrap();
    let err = listen_packet(&registry, &plain, "", 0).await.unwrap_err();
    assert!(matches!(err, SchemeError::WrongKind { scheme: Scheme::Plain, .. }));

    assert_eq!(factory.starts(), 0);
}

#[tokio::test]
async fn test_stream_handler_returns_stream_listener() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::new());
    let registry = registry_in(dir.path(), &factory);

    let opened = SchemeHandler::new(Scheme::Plain)
        .listen(&registry, "", "80", 0)
        .await
        .unwrap();
    assert_eq!(opened.node_name(), Some("tailnode"));
    let SchemeListener::Stream(listener) = opened else {
        panic!("expected a stream listener");
    };
    listener.close().await.unwrap();
}
