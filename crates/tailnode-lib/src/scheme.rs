//! Listener construction for the `tailscale`, `tailscale+tls` and
//! `tailscale/udp` schemes

use crate::address::{AddressError, NetworkAddress, Scheme};
use crate::tls::TlsNodeListener;
use async_trait::async_trait;
use tailnode_proto::{MeshListener, MeshPacketConn};
use tailnode_registry::{ListenError, NodeListener, NodePacketConn, NodeRegistry};
use thiserror::Error;
use tracing::{debug, warn};

/// Network the stream schemes listen on inside the node
pub const DEFAULT_NETWORK: &str = "tcp";

/// Network the packet scheme binds when none, or plain `udp`, is asked for
pub const DEFAULT_PACKET_NETWORK: &str = "udp4";

#[derive(Debug, Error)]
pub enum SchemeError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Listen(#[from] ListenError),

    #[error("node {name} has no control client for certificates: {message}")]
    NoCertificates { name: String, message: String },

    #[error("scheme {scheme} does not provide {kind} sockets")]
    WrongKind { scheme: Scheme, kind: &'static str },
}

/// Open a stream listener for `address`, picking port `offset` from its
/// range.
///
/// The node is acquired for the lifetime of the returned listener and
/// released when it is closed or dropped.
pub async fn listen(
    registry: &NodeRegistry,
    address: &NetworkAddress,
    offset: u32,
) -> Result<Box<dyn MeshListener>, SchemeError> {
    if address.scheme.is_packet() {
        return Err(SchemeError::WrongKind {
            scheme: address.scheme,
            kind: "stream",
        });
    }

    let addr = address.listen_addr(offset)?;
    debug!(node = %address.node, "Opening {} listener on {}", address.scheme, addr);

    let listener = NodeListener::open(registry, &address.node, DEFAULT_NETWORK, &addr).await?;

    match address.scheme {
        Scheme::Tls => {
            let control = match listener.node().control_client() {
                Ok(control) => control,
                Err(e) => {
                    if let Err(close_err) = listener.close().await {
                        warn!(node = %address.node, "Failed to close listener: {}", close_err);
                    }
                    return Err(SchemeError::NoCertificates {
                        name: address.node.clone(),
                        message: e.to_string(),
                    });
                }
            };
            Ok(Box::new(TlsNodeListener::new(listener, control)))
        }
        _ => Ok(Box::new(listener)),
    }
}

/// Datagram network actually bound for a requested one
pub fn packet_network(requested: &str) -> &str {
    match requested {
        "" | "udp" => DEFAULT_PACKET_NETWORK,
        other => other,
    }
}

/// Bind a datagram socket for a `tailscale/udp` address on the node's first
/// mesh address of the requested family.
pub async fn listen_packet(
    registry: &NodeRegistry,
    address: &NetworkAddress,
    network: &str,
    offset: u32,
) -> Result<Box<dyn MeshPacketConn>, SchemeError> {
    if !address.scheme.is_packet() {
        return Err(SchemeError::WrongKind {
            scheme: address.scheme,
            kind: "packet",
        });
    }

    let port = address.port_at(offset)?;
    let network = packet_network(network);
    debug!(node = %address.node, "Opening {} socket on port {}", network, port);

    let conn = NodePacketConn::open(registry, &address.node, network, port).await?;
    Ok(Box::new(conn))
}

/// What a scheme handler hands back to the host
#[derive(Debug)]
pub enum SchemeListener {
    Stream(Box<dyn MeshListener>),
    Packet(Box<dyn MeshPacketConn>),
}

impl SchemeListener {
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Self::Stream(listener) => tailnode_proto::find_node_name(listener.as_ref()),
            Self::Packet(conn) => conn.node_name(),
        }
    }
}

/// Listener constructor a host invokes for one network scheme
#[async_trait]
pub trait NetworkHandler: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// `host` is the node name (empty for the default node) and
    /// `port_range` a single port or `start-end`.
    async fn listen(
        &self,
        registry: &NodeRegistry,
        host: &str,
        port_range: &str,
        offset: u32,
    ) -> Result<SchemeListener, SchemeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SchemeHandler {
    scheme: Scheme,
}

impl SchemeHandler {
    pub fn new(scheme: Scheme) -> Self {
        Self { scheme }
    }
}

#[async_trait]
impl NetworkHandler for SchemeHandler {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    async fn listen(
        &self,
        registry: &NodeRegistry,
        host: &str,
        port_range: &str,
        offset: u32,
    ) -> Result<SchemeListener, SchemeError> {
        let address = NetworkAddress::from_parts(self.scheme, host, port_range)?;
        if self.scheme.is_packet() {
            listen_packet(registry, &address, "", offset)
                .await
                .map(SchemeListener::Packet)
        } else {
            listen(registry, &address, offset)
                .await
                .map(SchemeListener::Stream)
        }
    }
}
