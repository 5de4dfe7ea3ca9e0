//! Host-facing tailnode API
//!
//! Everything a server needs to put its sites on the mesh:
//!
//! - [`register`] publishes the configuration key, network schemes and the
//!   control transport for certificate lookups
//! - [`listen`] opens plain or TLS listeners on a named node, and
//!   [`listen_packet`] binds datagram sockets on its mesh address
//! - [`IdentityAuthenticator`] identifies the mesh user behind a request
//! - [`NodeTransport`] proxies requests to upstreams through a node
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tailnode_lib::{listen, NetworkAddress, NodeRegistry};
//!
//! let registry = NodeRegistry::new(config, env, runtime_factory);
//! let address = NetworkAddress::parse("tailscale+tls/web:443")?;
//! let listener = listen(&registry, &address, 0).await?;
//! let (stream, peer) = listener.accept().await?;
//! ```

pub mod address;
pub mod identity;
pub mod module;
pub mod scheme;
pub mod tls;
pub mod transport;

pub use address::{
    AddressError, NetworkAddress, Scheme, DEFAULT_NODE_NAME, PLAIN_SCHEME, TLS_SCHEME,
    UDP_SCHEME,
};
pub use identity::{Identity, IdentityAuthenticator, IdentityError};
pub use module::{register, AppParsers, HostRegistrar, APP_KEY};
pub use scheme::{
    listen, listen_packet, packet_network, NetworkHandler, SchemeError, SchemeHandler,
    SchemeListener, DEFAULT_NETWORK, DEFAULT_PACKET_NETWORK,
};
pub use tls::{TlsNodeListener, HANDSHAKE_TIMEOUT};
pub use transport::{NodeTransport, TransportError, DEFAULT_TRANSPORT_NODE};

// Re-export the pieces hosts wire together
pub use tailnode_config::{AppConfig, EnvSource, NodeConfig, ProcessEnv};
pub use tailnode_proto::{ControlClient, MeshListener, MeshPacketConn, NodeRuntime, RuntimeFactory};
pub use tailnode_registry::{NodeRegistry, ReleaseOutcome};
pub use tailnode_router::ControlPlaneRouter;
