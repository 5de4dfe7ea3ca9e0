//! Registry of running mesh nodes
//!
//! At most one node runs per name. Every listener, packet socket or
//! transport that needs a node acquires a reference; the node starts on the
//! first acquire and shuts down when the last reference is released.

pub mod error;
pub mod listener;
pub mod node;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ListenError, RegistryError};
pub use listener::{NodeListener, NodePacketConn};
pub use node::NodeHandle;
pub use registry::{NodeRegistry, ReleaseOutcome};
