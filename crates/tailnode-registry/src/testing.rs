//! In-memory node runtime for tests
//!
//! Nodes "listen" on loopback TCP and UDP sockets and answer control requests
//! with their own name unless a control client is installed.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tailnode_proto::{
    BoxedStream, ControlClient, ControlError, MeshListener, MeshPacketConn, NodeOptions,
    NodeRuntime, RuntimeError, RuntimeFactory,
};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Response header naming the node that answered a control request
pub const NODE_HEADER: &str = "x-tailnode-node";

/// Mesh addresses every fake node reports unless overridden
pub const DEFAULT_MESH_ADDRESSES: [&str; 2] = ["100.64.0.1", "fd7a:115c:a1e0::1"];

#[derive(Default)]
struct State {
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
    fail_start: Mutex<Option<String>>,
    fail_listen: AtomicBool,
    fail_close: AtomicBool,
    domains: Mutex<HashMap<String, Vec<String>>>,
    control: Mutex<Option<Arc<dyn ControlClient>>>,
    started: Mutex<Vec<NodeOptions>>,
    mesh_addresses: Mutex<Option<Vec<IpAddr>>>,
    packet_binds: Mutex<Vec<(String, String)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory for [`FakeRuntime`]s with knobs for failure injection
pub struct FakeFactory {
    state: Arc<State>,
    gate: watch::Sender<bool>,
}

impl FakeFactory {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(State::default()),
            gate,
        }
    }

    /// Starts block until [`open_gate`](Self::open_gate) is called
    pub fn gated() -> Self {
        let factory = Self::new();
        factory.gate.send_replace(false);
        factory
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_next_start(&self, reason: &str) {
        *lock(&self.state.fail_start) = Some(reason.to_string());
    }

    pub fn fail_listen(&self, fail: bool) {
        self.state.fail_listen.store(fail, Ordering::SeqCst);
    }

    pub fn fail_listener_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn set_domains(&self, name: &str, domains: &[&str]) {
        lock(&self.state.domains).insert(
            name.to_string(),
            domains.iter().map(|d| d.to_string()).collect(),
        );
    }

    /// Mesh addresses every node reports from now on
    pub fn set_mesh_addresses(&self, addresses: &[&str]) {
        let parsed = addresses.iter().filter_map(|a| a.parse().ok()).collect();
        *lock(&self.state.mesh_addresses) = Some(parsed);
    }

    /// `(network, addr)` of every packet listen, in order
    pub fn packet_binds(&self) -> Vec<(String, String)> {
        lock(&self.state.packet_binds).clone()
    }

    /// Control client every node started from now on hands out
    pub fn set_control(&self, control: Arc<dyn ControlClient>) {
        *lock(&self.state.control) = Some(control);
    }

    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    /// Options of every start, in order
    pub fn started(&self) -> Vec<NodeOptions> {
        lock(&self.state.started).clone()
    }
}

impl Default for FakeFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeFactory for FakeFactory {
    async fn start(&self, options: NodeOptions) -> Result<Arc<dyn NodeRuntime>, RuntimeError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.state.starts.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.started).push(options.clone());

        if let Some(reason) = lock(&self.state.fail_start).take() {
            return Err(RuntimeError::Start {
                name: options.name,
                reason,
            });
        }

        let control = lock(&self.state.control).clone();
        Ok(Arc::new(FakeRuntime {
            name: options.name.clone(),
            state: Arc::clone(&self.state),
            control,
            cancel: CancellationToken::new(),
        }))
    }
}

pub struct FakeRuntime {
    name: String,
    state: Arc<State>,
    control: Option<Arc<dyn ControlClient>>,
    cancel: CancellationToken,
}

impl fmt::Debug for FakeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeRuntime")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl NodeRuntime for FakeRuntime {
    async fn listen(&self, network: &str, _addr: &str) -> io::Result<Box<dyn MeshListener>> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network {} not supported", network),
            ));
        }
        if self.state.fail_listen.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "listen refused"));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Box::new(FakeListener {
            listener,
            cancel: self.cancel.child_token(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn listen_packet(
        &self,
        network: &str,
        addr: &str,
    ) -> io::Result<Box<dyn MeshPacketConn>> {
        if network != "udp4" && network != "udp6" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network {} not supported", network),
            ));
        }
        if self.state.fail_listen.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "listen refused"));
        }

        lock(&self.state.packet_binds).push((network.to_string(), addr.to_string()));
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(Box::new(FakePacketConn {
            socket,
            cancel: self.cancel.child_token(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn mesh_addresses(&self) -> Result<Vec<IpAddr>, RuntimeError> {
        if let Some(addresses) = lock(&self.state.mesh_addresses).clone() {
            return Ok(addresses);
        }
        Ok(DEFAULT_MESH_ADDRESSES
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect())
    }

    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxedStream> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network {} not supported", network),
            ));
        }
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }

    fn control_client(&self) -> Result<Arc<dyn ControlClient>, RuntimeError> {
        Ok(self.control.clone().unwrap_or_else(|| {
            Arc::new(EchoControl {
                node: self.name.clone(),
            })
        }))
    }

    fn cert_domains(&self) -> Vec<String> {
        lock(&self.state.domains)
            .get(&self.name)
            .cloned()
            .unwrap_or_default()
    }

    async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.cancel.cancel();
        self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeListener {
    listener: TcpListener,
    cancel: CancellationToken,
    state: Arc<State>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State").finish_non_exhaustive()
    }
}

#[async_trait]
impl MeshListener for FakeListener {
    async fn accept(&self) -> io::Result<(BoxedStream, SocketAddr)> {
        tokio::select! {
            accepted = self.listener.accept() => {
                let (stream, peer) = accepted?;
                Ok((Box::new(stream) as BoxedStream, peer))
            }
            _ = self.cancel.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn close(&self) -> io::Result<()> {
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("close refused"));
        }
        self.cancel.cancel();
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakePacketConn {
    socket: UdpSocket,
    cancel: CancellationToken,
    state: Arc<State>,
}

#[async_trait]
impl MeshPacketConn for FakePacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::select! {
            received = self.socket.recv_from(buf) => received,
            _ = self.cancel.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
            }
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        self.socket.send_to(buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn close(&self) -> io::Result<()> {
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("close refused"));
        }
        self.cancel.cancel();
        Ok(())
    }
}

/// Answers every control request with the node's name
pub struct EchoControl {
    pub node: String,
}

#[async_trait]
impl ControlClient for EchoControl {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ControlError> {
        Response::builder()
            .status(StatusCode::OK)
            .header(NODE_HEADER, self.node.as_str())
            .body(Bytes::from(format!("{} {}", self.node, request.uri().path())))
            .map_err(|e| ControlError::InvalidResponse(e.to_string()))
    }
}
