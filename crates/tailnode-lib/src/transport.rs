//! Reverse-proxy transport that dials upstreams through a node

use crate::tls::ensure_crypto_provider;
use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{header, Request, Response, Uri};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tailnode_proto::{send_http1, BoxedStream, ControlError};
use tailnode_registry::{NodeHandle, NodeRegistry, RegistryError, ReleaseOutcome};
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Node a transport uses when none is named
pub const DEFAULT_TRANSPORT_NODE: &str = "caddy-proxy";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport for node {0} is not provisioned")]
    NotProvisioned(String),

    #[error("request has no upstream host")]
    MissingHost,

    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("dial {addr} through node {node} failed: {source}")]
    Dial {
        node: String,
        addr: String,
        source: io::Error,
    },

    #[error("TLS to {host} failed: {source}")]
    Tls { host: String, source: io::Error },

    #[error(transparent)]
    Http(#[from] ControlError),
}

pub struct NodeTransport {
    name: String,
    registry: NodeRegistry,
    tls: Option<Arc<ClientConfig>>,
    node: Mutex<Option<Arc<NodeHandle>>>,
}

impl NodeTransport {
    /// Transport over node `name`, or [`DEFAULT_TRANSPORT_NODE`] when `None`
    pub fn new(registry: NodeRegistry, name: Option<&str>) -> Self {
        Self {
            name: name.unwrap_or(DEFAULT_TRANSPORT_NODE).to_string(),
            registry,
            tls: None,
            node: Mutex::new(None),
        }
    }

    /// Speak TLS to upstreams, verified against the webpki roots
    pub fn enable_tls(&mut self) {
        self.enable_tls_with(default_roots());
    }

    /// Speak TLS to upstreams, verified against `roots`
    pub fn enable_tls_with(&mut self, roots: RootCertStore) {
        self.tls = Some(client_config(roots));
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> Option<Arc<NodeHandle>> {
        self.node
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Acquire the node. Calling it again while provisioned does nothing.
    pub async fn provision(&self) -> Result<(), RegistryError> {
        if self.current().is_some() {
            return Ok(());
        }

        let node = self.registry.acquire(&self.name).await?;
        let raced = {
            let mut slot = self.node.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                true
            } else {
                *slot = Some(node);
                false
            }
        };

        if raced {
            // Another provision won; give back the extra reference
            self.registry.release(&self.name).await?;
        } else {
            info!(node = %self.name, "Proxy transport provisioned");
        }
        Ok(())
    }

    /// Release the node taken by [`provision`](Self::provision)
    pub async fn cleanup(&self) -> Result<ReleaseOutcome, RegistryError> {
        let taken = self
            .node
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(_) => self.registry.release(&self.name).await,
            None => Ok(ReleaseOutcome::NotFound),
        }
    }

    /// Send `request` to its upstream through the node.
    ///
    /// The upstream comes from the URI authority or, failing that, the
    /// `Host` header. A missing URI scheme defaults to `https` when TLS is
    /// enabled and `http` otherwise.
    pub async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, TransportError> {
        let node = self
            .current()
            .ok_or_else(|| TransportError::NotProvisioned(self.name.clone()))?;

        let (mut parts, body) = request.into_parts();

        let authority = match parts.uri.authority() {
            Some(authority) => authority.clone(),
            None => parts
                .headers
                .get(header::HOST)
                .and_then(|host| host.to_str().ok())
                .ok_or(TransportError::MissingHost)?
                .parse::<Authority>()
                .map_err(|e| TransportError::InvalidUpstream(e.to_string()))?,
        };

        let scheme = match parts.uri.scheme() {
            Some(scheme) => scheme.clone(),
            None if self.tls_enabled() => Scheme::HTTPS,
            None => Scheme::HTTP,
        };
        let secure = scheme == Scheme::HTTPS;

        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::builder()
            .scheme(scheme)
            .authority(authority.clone())
            .path_and_query(path)
            .build()
            .map_err(|e| TransportError::InvalidUpstream(e.to_string()))?;

        let port = authority
            .port_u16()
            .unwrap_or(if secure { 443 } else { 80 });
        let addr = format!("{}:{}", authority.host(), port);

        debug!(node = %self.name, "Proxying {} {} via {}", parts.method, parts.uri, addr);
        let stream = node
            .runtime()
            .dial("tcp", &addr)
            .await
            .map_err(|source| TransportError::Dial {
                node: self.name.clone(),
                addr: addr.clone(),
                source,
            })?;

        let stream = if secure {
            self.wrap_tls(stream, authority.host()).await?
        } else {
            stream
        };

        Ok(send_http1(stream, Request::from_parts(parts, body)).await?)
    }

    async fn wrap_tls(
        &self,
        stream: BoxedStream,
        host: &str,
    ) -> Result<BoxedStream, TransportError> {
        // An explicit https URI works even when TLS was never enabled
        let config = match &self.tls {
            Some(config) => Arc::clone(config),
            None => client_config(default_roots()),
        };

        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(bare_host.to_string())
            .map_err(|e| TransportError::InvalidUpstream(e.to_string()))?;

        let tls = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|source| TransportError::Tls {
                host: host.to_string(),
                source,
            })?;
        Ok(Box::new(tls))
    }
}

fn default_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn client_config(roots: RootCertStore) -> Arc<ClientConfig> {
    ensure_crypto_provider();
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

impl std::fmt::Debug for NodeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTransport")
            .field("name", &self.name)
            .field("tls", &self.tls_enabled())
            .field("provisioned", &self.current().is_some())
            .finish()
    }
}
