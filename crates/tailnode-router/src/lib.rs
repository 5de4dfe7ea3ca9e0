//! Control-plane routing across nodes
//!
//! Certificate and identity lookups must reach the node that actually holds
//! the certificate for a TLS server name. This crate picks that node from the
//! registry, falling back to a shared default client.

pub mod daemon;
pub mod router;
pub mod wildcard;

pub use daemon::{DaemonTransport, DEFAULT_DAEMON_SOCKET};
pub use router::ControlPlaneRouter;
pub use wildcard::match_domain;
