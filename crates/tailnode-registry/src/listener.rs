//! Node-backed listeners
//!
//! A [`NodeListener`] or [`NodePacketConn`] owns one registry reference for
//! as long as it is open. Closing it closes the underlying socket first and
//! only then gives the reference back, so a node is never shut down under a
//! socket that failed to close. Dropping an open one closes and releases in
//! the background.

use crate::error::ListenError;
use crate::node::NodeHandle;
use crate::registry::NodeRegistry;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tailnode_proto::{BoxedStream, MeshListener, MeshPacketConn};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The registry reference held by one open socket
struct Lease {
    node: Arc<NodeHandle>,
    registry: NodeRegistry,
    closed: Mutex<bool>,
}

impl Lease {
    fn new(registry: &NodeRegistry, node: Arc<NodeHandle>) -> Self {
        Self {
            node,
            registry: registry.clone(),
            closed: Mutex::new(false),
        }
    }

    fn name(&self) -> &str {
        self.node.name()
    }

    /// Run `close_socket`, then release the reference.
    ///
    /// A failed socket close keeps the reference so the call can be retried.
    /// Closing twice does nothing.
    async fn close<F>(&self, close_socket: F) -> io::Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        let mut closed = self.closed.lock().await;
        if *closed {
            debug!(node = %self.name(), "Socket already closed");
            return Ok(());
        }

        close_socket.await?;
        *closed = true;

        self.registry
            .release(self.name())
            .await
            .map(|_| ())
            .map_err(io::Error::other)
    }

    /// Reclaim the reference of a socket dropped while still open
    fn abandon<F>(&mut self, close_socket: F)
    where
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        if std::mem::replace(self.closed.get_mut(), true) {
            return;
        }

        let name = self.name().to_string();
        warn!(node = %name, "Socket dropped without close, releasing node");
        let registry = self.registry.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = close_socket.await {
                        debug!(node = %name, "Closing dropped socket failed: {}", e);
                    }
                    if let Err(e) = registry.release(&name).await {
                        warn!(node = %name, "Failed to release node: {}", e);
                    }
                });
            }
            Err(_) => registry.release_detached(&name),
        }
    }
}

/// Release `name` after a failed open and build the error
async fn release_after_error(registry: &NodeRegistry, name: &str, err: ListenError) -> ListenError {
    if let Err(e) = registry.release(name).await {
        warn!(node = %name, "Failed to release node after listen error: {}", e);
    }
    err
}

pub struct NodeListener {
    inner: Arc<dyn MeshListener>,
    lease: Lease,
}

impl NodeListener {
    /// Acquire `name` and listen on it.
    ///
    /// If the node cannot listen, the reference taken for it is released
    /// before the error is returned.
    pub async fn open(
        registry: &NodeRegistry,
        name: &str,
        network: &str,
        addr: &str,
    ) -> Result<Self, ListenError> {
        let node = registry.acquire(name).await?;

        let inner = match node.runtime().listen(network, addr).await {
            Ok(inner) => inner,
            Err(source) => {
                warn!(node = %name, "Listen on {} {} failed: {}", network, addr, source);
                let err = ListenError::Listen {
                    name: name.to_string(),
                    network: network.to_string(),
                    addr: addr.to_string(),
                    source,
                };
                return Err(release_after_error(registry, name, err).await);
            }
        };

        info!(node = %name, network = %network, addr = %addr, "Listening on node");
        Ok(Self {
            inner: Arc::from(inner),
            lease: Lease::new(registry, node),
        })
    }

    pub fn node(&self) -> &Arc<NodeHandle> {
        &self.lease.node
    }

    pub async fn is_closed(&self) -> bool {
        *self.lease.closed.lock().await
    }
}

impl fmt::Debug for NodeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeListener")
            .field("node", &self.lease.name())
            .field("inner", &self.inner)
            .finish()
    }
}

#[async_trait]
impl MeshListener for NodeListener {
    async fn accept(&self) -> io::Result<(BoxedStream, SocketAddr)> {
        self.inner.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Close the socket, then release the node reference.
    async fn close(&self) -> io::Result<()> {
        self.lease.close(self.inner.close()).await
    }

    fn unwrap_listener(&self) -> Option<&dyn MeshListener> {
        Some(self.inner.as_ref())
    }

    fn node_name(&self) -> Option<&str> {
        Some(self.lease.name())
    }
}

impl Drop for NodeListener {
    fn drop(&mut self) {
        let inner = Arc::clone(&self.inner);
        self.lease.abandon(async move { inner.close().await });
    }
}

/// Datagram socket bound to one of a node's mesh addresses
pub struct NodePacketConn {
    inner: Arc<dyn MeshPacketConn>,
    lease: Lease,
}

impl NodePacketConn {
    /// Acquire `name` and bind `port` on its first mesh address of the
    /// family `network` names (`udp4` or `udp6`).
    ///
    /// The reference is released again if the node has no such address or
    /// the bind fails.
    pub async fn open(
        registry: &NodeRegistry,
        name: &str,
        network: &str,
        port: u16,
    ) -> Result<Self, ListenError> {
        let node = registry.acquire(name).await?;

        let addresses = match node.runtime().mesh_addresses().await {
            Ok(addresses) => addresses,
            Err(source) => {
                let err = ListenError::Status {
                    name: name.to_string(),
                    source,
                };
                return Err(release_after_error(registry, name, err).await);
            }
        };

        let Some(ip) = pick_address(&addresses, network) else {
            let err = ListenError::NoMeshAddress {
                name: name.to_string(),
                network: network.to_string(),
            };
            return Err(release_after_error(registry, name, err).await);
        };

        let addr = SocketAddr::new(ip, port).to_string();
        let inner = match node.runtime().listen_packet(network, &addr).await {
            Ok(inner) => inner,
            Err(source) => {
                warn!(node = %name, "Packet listen on {} {} failed: {}", network, addr, source);
                let err = ListenError::Listen {
                    name: name.to_string(),
                    network: network.to_string(),
                    addr,
                    source,
                };
                return Err(release_after_error(registry, name, err).await);
            }
        };

        info!(node = %name, network = %network, addr = %addr, "Packet listening on node");
        Ok(Self {
            inner: Arc::from(inner),
            lease: Lease::new(registry, node),
        })
    }

    pub fn node(&self) -> &Arc<NodeHandle> {
        &self.lease.node
    }
}

fn pick_address(addresses: &[IpAddr], network: &str) -> Option<IpAddr> {
    addresses.iter().copied().find(|ip| match network {
        "udp4" => ip.is_ipv4(),
        "udp6" => ip.is_ipv6(),
        _ => false,
    })
}

impl fmt::Debug for NodePacketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePacketConn")
            .field("node", &self.lease.name())
            .field("inner", &self.inner)
            .finish()
    }
}

#[async_trait]
impl MeshPacketConn for NodePacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    async fn close(&self) -> io::Result<()> {
        self.lease.close(self.inner.close()).await
    }

    fn node_name(&self) -> Option<&str> {
        Some(self.lease.name())
    }
}

impl Drop for NodePacketConn {
    fn drop(&mut self) {
        let inner = Arc::clone(&self.inner);
        self.lease.abandon(async move { inner.close().await });
    }
}
