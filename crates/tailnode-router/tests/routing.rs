//! Control request routing across active nodes

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tailnode_config::{AppConfig, MapEnv};
use tailnode_proto::{ControlClient, ControlError, RuntimeFactory, TlsServerName};
use tailnode_registry::testing::{FakeFactory, NODE_HEADER};
use tailnode_registry::NodeRegistry;
use tailnode_router::ControlPlaneRouter;

/// Fallback client that tags its responses
struct Fallback;

#[async_trait]
impl ControlClient for Fallback {
    async fn round_trip(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, ControlError> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(NODE_HEADER, "default")
            .body(Bytes::new())
            .unwrap())
    }
}

struct Broken;

#[async_trait]
impl ControlClient for Broken {
    async fn round_trip(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, ControlError> {
        Err(ControlError::Transport("daemon not running".to_string()))
    }
}

fn request() -> Request<Bytes> {
    Request::get("/localapi/v0/status").body(Bytes::new()).unwrap()
}

fn answered_by(response: &Response<Bytes>) -> &str {
    response.headers()[NODE_HEADER].to_str().unwrap()
}

async fn setup(dir: &std::path::Path) -> (Arc<FakeFactory>, NodeRegistry) {
    let factory = Arc::new(FakeFactory::new());
    factory.set_domains("web", &["web.tailnet.ts.net"]);
    factory.set_domains("api", &["api.tailnet.ts.net", "*.api.example.com"]);

    let config = AppConfig {
        state_dir: dir.display().to_string(),
        ..Default::default()
    };
    let registry = NodeRegistry::new(
        Arc::new(config),
        Arc::new(MapEnv::new()),
        Arc::clone(&factory) as Arc<dyn RuntimeFactory>,
    );
    registry.acquire("web").await.unwrap();
    registry.acquire("api").await.unwrap();
    (factory, registry)
}

#[tokio::test]
async fn test_routes_to_owning_node() {
    let dir = tempfile::tempdir().unwrap();
    let (_factory, registry) = setup(dir.path()).await;
    let router = ControlPlaneRouter::with_default(registry, || Arc::new(Fallback));

    let response = router.route(request(), "web.tailnet.ts.net").await.unwrap();
    assert_eq!(answered_by(&response), "web");

    let response = router.route(request(), "API.tailnet.ts.net").await.unwrap();
    assert_eq!(answered_by(&response), "api");

    let response = router.route(request(), "v1.api.example.com").await.unwrap();
    assert_eq!(answered_by(&response), "api");
}

#[tokio::test]
async fn test_unclaimed_name_uses_default() {
    let dir = tempfile::tempdir().unwrap();
    let (_factory, registry) = setup(dir.path()).await;
    let router = ControlPlaneRouter::with_default(registry, || Arc::new(Fallback));

    let response = router.route(request(), "db.tailnet.ts.net").await.unwrap();
    assert_eq!(answered_by(&response), "default");

    let response = router.route(request(), "a.b.api.example.com").await.unwrap();
    assert_eq!(answered_by(&response), "default");

    assert!(router.owner_of("db.tailnet.ts.net").is_none());
}

#[tokio::test]
async fn test_released_node_no_longer_routed() {
    let dir = tempfile::tempdir().unwrap();
    let (_factory, registry) = setup(dir.path()).await;
    let router = ControlPlaneRouter::with_default(registry.clone(), || Arc::new(Fallback));

    assert_eq!(
        router.owner_of("web.tailnet.ts.net").unwrap().name(),
        "web"
    );
    registry.release("web").await.unwrap();

    let response = router.route(request(), "web.tailnet.ts.net").await.unwrap();
    assert_eq!(answered_by(&response), "default");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_default_client_built_once() {
    let dir = tempfile::tempdir().unwrap();
    let (_factory, registry) = setup(dir.path()).await;

    let builds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&builds);
    let router = Arc::new(ControlPlaneRouter::with_default(registry, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::new(Fallback)
    }));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let router = Arc::clone(&router);
        tasks.push(tokio::spawn(async move {
            router.route(request(), "nobody.example.com").await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_default_errors_propagate() {
    let dir = tempfile::tempdir().unwrap();
    let (_factory, registry) = setup(dir.path()).await;
    let router = ControlPlaneRouter::with_default(registry, || Arc::new(Broken));

    let err = router
        .route(request(), "nobody.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Transport(msg) if msg == "daemon not running"));
}

#[tokio::test]
async fn test_router_as_control_client_reads_server_name() {
    let dir = tempfile::tempdir().unwrap();
    let (_factory, registry) = setup(dir.path()).await;
    let router = ControlPlaneRouter::with_default(registry, || Arc::new(Fallback));

    let mut tagged = request();
    tagged
        .extensions_mut()
        .insert(TlsServerName("web.tailnet.ts.net".to_string()));
    let response = router.round_trip(tagged).await.unwrap();
    assert_eq!(answered_by(&response), "web");

    let response = router.round_trip(request()).await.unwrap();
    assert_eq!(answered_by(&response), "default");
}

#[cfg(unix)]
#[tokio::test]
async fn test_daemon_transport_over_unix_socket() {
    use tailnode_router::DaemonTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            head.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 7\r\n\r\ndaemon!")
            .await
            .unwrap();
        String::from_utf8(head).unwrap()
    });

    let transport = DaemonTransport::new(&socket);
    let response = transport
        .round_trip(
            Request::get("/localapi/v0/status")
                .header(http::header::HOST, tailnode_proto::LOCAL_API_HOST)
                .body(Bytes::new())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"daemon!");

    let head = server.await.unwrap();
    assert!(head.starts_with("GET /localapi/v0/status HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_missing_daemon_socket_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let transport = tailnode_router::DaemonTransport::new(dir.path().join("absent.sock"));
    assert!(transport.round_trip(request()).await.is_err());
}
