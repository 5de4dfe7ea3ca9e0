//! ControlPlaneRouter
//!
//! Sends a control request to the active node whose certificate domains cover
//! the TLS server name it was made for. Requests no node claims go to a
//! shared default client built on first use.

use crate::daemon::DaemonTransport;
use crate::wildcard::match_domain;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tailnode_proto::{ControlClient, ControlError, TlsServerName};
use tailnode_registry::{NodeHandle, NodeRegistry};
use tracing::debug;

type DefaultFactory = Box<dyn Fn() -> Arc<dyn ControlClient> + Send + Sync>;

pub struct ControlPlaneRouter {
    registry: NodeRegistry,
    default: OnceLock<Arc<dyn ControlClient>>,
    make_default: DefaultFactory,
}

impl ControlPlaneRouter {
    /// Router whose fallback is the system daemon
    pub fn new(registry: NodeRegistry) -> Self {
        Self::with_default(registry, || {
            Arc::new(DaemonTransport::default()) as Arc<dyn ControlClient>
        })
    }

    /// Router with a custom fallback; `make_default` runs at most once.
    pub fn with_default<F>(registry: NodeRegistry, make_default: F) -> Self
    where
        F: Fn() -> Arc<dyn ControlClient> + Send + Sync + 'static,
    {
        Self {
            registry,
            default: OnceLock::new(),
            make_default: Box::new(make_default),
        }
    }

    fn default_client(&self) -> Arc<dyn ControlClient> {
        Arc::clone(self.default.get_or_init(|| {
            debug!("Building default control client");
            (self.make_default)()
        }))
    }

    /// First active node with a certificate domain covering `server_name`.
    /// Overlapping domains across nodes resolve arbitrarily.
    pub fn owner_of(&self, server_name: &str) -> Option<Arc<NodeHandle>> {
        self.registry.active_nodes().into_iter().find(|node| {
            node.cert_domains()
                .iter()
                .any(|domain| match_domain(server_name, domain))
        })
    }

    /// Client that should answer for `server_name`
    pub fn client_for(&self, server_name: &str) -> Result<Arc<dyn ControlClient>, ControlError> {
        match self.owner_of(server_name) {
            Some(node) => {
                debug!(node = %node.name(), server_name = %server_name, "Routing control request to node");
                node.control_client()
                    .map_err(|e| ControlError::Transport(e.to_string()))
            }
            None => {
                debug!(server_name = %server_name, "No node owns server name, using default control client");
                Ok(self.default_client())
            }
        }
    }

    /// Dispatch `request` on behalf of `server_name`. Errors from the chosen
    /// client are returned as they are.
    pub async fn route(
        &self,
        request: Request<Bytes>,
        server_name: &str,
    ) -> Result<Response<Bytes>, ControlError> {
        self.client_for(server_name)?.round_trip(request).await
    }
}

impl fmt::Debug for ControlPlaneRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlaneRouter")
            .field("registry", &self.registry)
            .field("default_built", &self.default.get().is_some())
            .finish()
    }
}

/// Routes by the request's [`TlsServerName`] extension; requests without one
/// go to the default client.
#[async_trait]
impl ControlClient for ControlPlaneRouter {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ControlError> {
        let server_name = request
            .extensions()
            .get::<TlsServerName>()
            .map(|name| name.0.clone());

        match server_name {
            Some(name) => self.route(request, &name).await,
            None => self.default_client().round_trip(request).await,
        }
    }
}
