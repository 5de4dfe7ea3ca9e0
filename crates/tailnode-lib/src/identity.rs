//! Mesh identity of inbound peers
//!
//! A request that arrived on a node-backed listener is identified by asking
//! that node who owns the remote address. Requests on ordinary listeners ask
//! the system daemon instead.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tailnode_proto::{find_node_name, who_is, ControlClient, ControlError, MeshListener};
use tailnode_registry::NodeRegistry;
use tailnode_router::DaemonTransport;
use thiserror::Error;
use tracing::debug;

pub const LOGIN_KEY: &str = "tailscale_login";
pub const USER_KEY: &str = "tailscale_user";
pub const NAME_KEY: &str = "tailscale_name";
pub const PROFILE_PICTURE_KEY: &str = "tailscale_profile_picture";
pub const TAILNET_KEY: &str = "tailscale_tailnet";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("node {0} is not running")]
    NodeNotRunning(String),

    #[error("node {name} control client unavailable: {message}")]
    ControlUnavailable { name: String, message: String },

    #[error("node {0} has tags")]
    Tagged(String),

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// An authenticated mesh user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Full login name, e.g. `alice@example.com`
    pub id: String,
    pub metadata: BTreeMap<String, String>,
}

type DefaultFactory = Box<dyn Fn() -> Arc<dyn ControlClient> + Send + Sync>;

pub struct IdentityAuthenticator {
    registry: NodeRegistry,
    default: OnceLock<Arc<dyn ControlClient>>,
    make_default: DefaultFactory,
}

impl IdentityAuthenticator {
    /// Falls back to the system daemon for non-node listeners
    pub fn new(registry: NodeRegistry) -> Self {
        Self::with_default(registry, || {
            Arc::new(DaemonTransport::default()) as Arc<dyn ControlClient>
        })
    }

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

    /// Control client for a server with the given listeners.
    ///
    /// The first listener chain that leads to a node decides.
    pub fn client(
        &self,
        listeners: &[&dyn MeshListener],
    ) -> Result<Arc<dyn ControlClient>, IdentityError> {
        let Some(name) = listeners.iter().find_map(|ln| find_node_name(*ln)) else {
            return Ok(Arc::clone(
                self.default.get_or_init(|| (self.make_default)()),
            ));
        };

        let node = self
            .registry
            .lookup(name)
            .ok_or_else(|| IdentityError::NodeNotRunning(name.to_string()))?;
        node.control_client()
            .map_err(|e| IdentityError::ControlUnavailable {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Identify the user behind `remote`.
    ///
    /// Tagged peers are machines rather than users and are rejected.
    pub async fn authenticate(
        &self,
        listeners: &[&dyn MeshListener],
        remote: SocketAddr,
    ) -> Result<Identity, IdentityError> {
        let client = self.client(listeners)?;
        let info = who_is(client.as_ref(), remote).await?;

        if !info.node.tags.is_empty() {
            return Err(IdentityError::Tagged(info.node.hostinfo.hostname));
        }

        let tailnet = if info.node.hostinfo.sharee_node {
            String::new()
        } else {
            info.node
                .name
                .strip_prefix(&format!("{}.", info.node.computed_name))
                .map(|rest| rest.trim_end_matches('.').to_string())
                .unwrap_or_default()
        };

        let profile = info.user_profile;
        let login = profile
            .login_name
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();

        debug!(remote = %remote, user = %profile.login_name, "Authenticated mesh peer");

        let metadata = BTreeMap::from([
            (LOGIN_KEY.to_string(), login),
            (USER_KEY.to_string(), profile.login_name.clone()),
            (NAME_KEY.to_string(), profile.display_name),
            (PROFILE_PICTURE_KEY.to_string(), profile.profile_pic_url),
            (TAILNET_KEY.to_string(), tailnet),
        ]);

        Ok(Identity {
            id: profile.login_name,
            metadata,
        })
    }
}

impl fmt::Debug for IdentityAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityAuthenticator")
            .field("registry", &self.registry)
            .field("default_built", &self.default.get().is_some())
            .finish()
    }
}
