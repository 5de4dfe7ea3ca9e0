//! Mesh runtime boundary
//!
//! A [`NodeRuntime`] is one running network identity: it can listen, bind
//! datagram sockets and dial on the mesh, exposes a local control-plane
//! client, and knows which DNS names it can present certificates for. The
//! registry never constructs runtimes directly; it asks a [`RuntimeFactory`].

use crate::control::ControlClient;
use crate::listener::{BoxedStream, MeshListener, MeshPacketConn};
use crate::secret::Secret;
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Fully resolved settings handed to the runtime when a node starts
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Registry key for the node
    pub name: String,
    /// Hostname to register on the mesh
    pub hostname: String,
    /// Registration credential (empty means interactive login)
    pub auth_key: Secret,
    /// Coordination server URL (empty means the runtime default)
    pub control_url: String,
    pub ephemeral: bool,
    /// Run the administrative web UI
    pub webui: bool,
    /// UDP port for the mesh transport (0 picks one)
    pub port: u16,
    /// Directory the runtime persists its state into
    pub state_dir: PathBuf,
    pub tags: Vec<String>,
    /// Forward the runtime's debug output
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to start node {name}: {reason}")]
    Start { name: String, reason: String },

    #[error("control client unavailable: {0}")]
    ControlUnavailable(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A running network identity
#[async_trait]
pub trait NodeRuntime: Send + Sync + Debug {
    /// Listen on the node's mesh interface, e.g. `("tcp", ":443")`
    async fn listen(&self, network: &str, addr: &str) -> io::Result<Box<dyn MeshListener>>;

    /// Open a datagram socket on the node, e.g. `("udp4", "100.64.0.1:443")`
    async fn listen_packet(
        &self,
        network: &str,
        addr: &str,
    ) -> io::Result<Box<dyn MeshPacketConn>>;

    /// Mesh IP addresses assigned to the node, waiting until it is up
    async fn mesh_addresses(&self) -> Result<Vec<IpAddr>, RuntimeError>;

    /// Dial a peer through the mesh
    async fn dial(&self, network: &str, addr: &str) -> io::Result<BoxedStream>;

    /// Local administrative API of this node
    fn control_client(&self) -> Result<Arc<dyn ControlClient>, RuntimeError>;

    /// DNS names this node can currently present certificates for.
    ///
    /// Computed from the node's live state on every call.
    fn cert_domains(&self) -> Vec<String>;

    /// Shut the node down and release its resources
    async fn shutdown(&self) -> Result<(), RuntimeError>;
}

/// Starts runtimes on behalf of the registry
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn start(&self, options: NodeOptions) -> Result<Arc<dyn NodeRuntime>, RuntimeError>;
}
