use std::sync::Arc;
use tailnode_proto::{ControlClient, NodeRuntime, RuntimeError};

/// A running node as handed out by the registry
#[derive(Debug)]
pub struct NodeHandle {
    name: String,
    hostname: String,
    runtime: Arc<dyn NodeRuntime>,
}

impl NodeHandle {
    pub fn new(name: String, hostname: String, runtime: Arc<dyn NodeRuntime>) -> Self {
        Self {
            name,
            hostname,
            runtime,
        }
    }

    /// Registry key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname the node registered with
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn runtime(&self) -> &Arc<dyn NodeRuntime> {
        &self.runtime
    }

    pub fn control_client(&self) -> Result<Arc<dyn ControlClient>, RuntimeError> {
        self.runtime.control_client()
    }

    pub fn cert_domains(&self) -> Vec<String> {
        self.runtime.cert_domains()
    }
}
