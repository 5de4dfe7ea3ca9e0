//! Control client for a system-wide mesh daemon
//!
//! Used when no node of this process owns the requested server name. Each
//! request opens a fresh connection to the daemon's unix socket.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use std::path::{Path, PathBuf};
use tailnode_proto::{ControlClient, ControlError};
use tracing::trace;

pub const DEFAULT_DAEMON_SOCKET: &str = "/var/run/tailscale/tailscaled.sock";

#[derive(Debug, Clone)]
pub struct DaemonTransport {
    socket_path: PathBuf,
}

impl DaemonTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for DaemonTransport {
    fn default() -> Self {
        Self::new(DEFAULT_DAEMON_SOCKET)
    }
}

#[async_trait]
impl ControlClient for DaemonTransport {
    #[cfg(unix)]
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ControlError> {
        trace!("Daemon request {} via {}", request.uri(), self.socket_path.display());
        let stream = tokio::net::UnixStream::connect(&self.socket_path).await?;
        tailnode_proto::send_http1(Box::new(stream), request).await
    }

    #[cfg(not(unix))]
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ControlError> {
        trace!("Daemon request {} unsupported", request.uri());
        Err(ControlError::Unsupported(format!(
            "daemon socket {} requires a unix platform",
            self.socket_path.display()
        )))
    }
}
