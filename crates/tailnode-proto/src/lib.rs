//! Boundary types shared by every tailnode crate
//!
//! The mesh-network client library, the host's listener plumbing and the
//! node's local administrative API are all external collaborators. This crate
//! describes them as traits so the rest of the workspace can be written (and
//! tested) without linking any particular implementation.

pub mod control;
pub mod http1;
pub mod listener;
pub mod runtime;
pub mod secret;

pub use control::{
    cert_pair, who_is, CertificatePair, ControlClient, ControlError, Hostinfo, TlsServerName,
    UserProfile, WhoIsNode, WhoIsResponse, LOCAL_API_HOST,
};
pub use http1::send_http1;
pub use listener::{find_node_name, BoxedStream, MeshListener, MeshPacketConn, MeshStream};
pub use runtime::{NodeOptions, NodeRuntime, RuntimeError, RuntimeFactory};
pub use secret::Secret;

// Re-export so implementors don't need their own dependency
pub use async_trait::async_trait;
