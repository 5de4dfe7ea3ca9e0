use std::io;
use std::sync::Arc;
use tailnode_auth::CredentialError;
use tailnode_config::ConfigError;
use tailnode_proto::RuntimeError;
use thiserror::Error;

/// Node creation and shutdown errors.
///
/// Cloneable so one failed creation can be reported to every caller that was
/// waiting on it.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node {name}: {source}")]
    Credential {
        name: String,
        #[source]
        source: CredentialError,
    },

    #[error("node {name}: cannot create state directory {path}: {message}")]
    StateDir {
        name: String,
        path: String,
        message: String,
    },

    #[error("node {name}: {source}")]
    Start {
        name: String,
        #[source]
        source: Arc<RuntimeError>,
    },

    #[error("node {name}: shutdown failed: {source}")]
    Shutdown {
        name: String,
        #[source]
        source: Arc<RuntimeError>,
    },

    #[error("node {name}: background task failed: {message}")]
    Aborted { name: String, message: String },
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("node {name}: listen on {network} {addr} failed: {source}")]
    Listen {
        name: String,
        network: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("node {name}: cannot read mesh addresses: {source}")]
    Status {
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("node {name} has no mesh address for {network}")]
    NoMeshAddress { name: String, network: String },
}

impl From<ListenError> for io::Error {
    fn from(err: ListenError) -> Self {
        match err {
            ListenError::Listen { source, .. } => source,
            other => io::Error::other(other),
        }
    }
}
