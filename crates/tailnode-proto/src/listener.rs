//! Listener abstractions for node-backed sockets
//!
//! Every layer that wraps another listener (refcount tracking, TLS, host
//! adapters) implements [`MeshListener::unwrap_listener`], and the layer that
//! belongs to a node answers [`MeshListener::node_name`]. Discovering which
//! node serves a listener is a plain walk down that chain.

use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream accepted from or dialed through a node
pub trait MeshStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> MeshStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn MeshStream>;

/// Server-side listener bound on a node's network interface
#[async_trait]
pub trait MeshListener: Send + Sync + Debug {
    /// Accept the next incoming connection
    async fn accept(&self) -> io::Result<(BoxedStream, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stop accepting connections
    async fn close(&self) -> io::Result<()>;

    /// The listener this one wraps, if any
    fn unwrap_listener(&self) -> Option<&dyn MeshListener> {
        None
    }

    /// Name of the node that owns this listener, if this layer is node-backed
    fn node_name(&self) -> Option<&str> {
        None
    }
}

/// Datagram socket bound on a node's network interface
#[async_trait]
pub trait MeshPacketConn: Send + Sync + Debug {
    /// Receive one datagram into `buf`
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `target`
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stop receiving; pending receives fail
    async fn close(&self) -> io::Result<()>;

    /// Name of the node that owns this socket, if this layer is node-backed
    fn node_name(&self) -> Option<&str> {
        None
    }
}

/// Walk a chain of wrapped listeners until a node-backed one is found.
pub fn find_node_name(listener: &dyn MeshListener) -> Option<&str> {
    let mut current = Some(listener);
    while let Some(ln) = current {
        if let Some(name) = ln.node_name() {
            return Some(name);
        }
        current = ln.unwrap_listener();
    }
    None
}
