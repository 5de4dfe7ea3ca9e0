//! TLS termination on node listeners
//!
//! Certificates are not configured up front. Each handshake reads the SNI
//! from the ClientHello and asks the node's control client for the matching
//! certificate pair, so whatever names the node currently holds are served.

use async_trait::async_trait;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tailnode_proto::{cert_pair, BoxedStream, ControlClient, MeshListener};
use tailnode_registry::NodeListener;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKLOG: usize = 64;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

type Accepted = io::Result<(BoxedStream, SocketAddr)>;

/// Node listener that hands out TLS streams.
///
/// Handshakes run in their own tasks so a slow client never holds up
/// `accept` for others; connections whose handshake fails are dropped.
pub struct TlsNodeListener {
    inner: Arc<NodeListener>,
    accepted: Mutex<mpsc::Receiver<Accepted>>,
    cancel: CancellationToken,
}

impl TlsNodeListener {
    /// Wrap `inner`, serving certificates fetched through `control`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(inner: NodeListener, control: Arc<dyn ControlClient>) -> Self {
        Self::with_timeout(inner, control, HANDSHAKE_TIMEOUT)
    }

    pub fn with_timeout(
        inner: NodeListener,
        control: Arc<dyn ControlClient>,
        handshake_timeout: Duration,
    ) -> Self {
        ensure_crypto_provider();

        let inner = Arc::new(inner);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        tokio::spawn(accept_loop(
            Arc::clone(&inner),
            control,
            handshake_timeout,
            tx,
            cancel.clone(),
        ));

        Self {
            inner,
            accepted: Mutex::new(rx),
            cancel,
        }
    }

    pub fn node_listener(&self) -> &NodeListener {
        &self.inner
    }
}

async fn accept_loop(
    listener: Arc<NodeListener>,
    control: Arc<dyn ControlClient>,
    handshake_timeout: Duration,
    tx: mpsc::Sender<Accepted>,
    cancel: CancellationToken,
) {
    let node = listener.node().name().to_string();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(node = %node, "TLS accept loop stopping: {}", e);
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        let control = Arc::clone(&control);
        let tx = tx.clone();
        let node = node.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake_timeout, handshake(stream, control.as_ref()))
                .await
            {
                Ok(Ok(tls)) => {
                    let _ = tx.send(Ok((tls, peer))).await;
                }
                Ok(Err(e)) => {
                    warn!(node = %node, "TLS handshake failed from {}: {}", peer, e);
                }
                Err(_) => {
                    warn!(node = %node, "TLS handshake from {} timed out", peer);
                }
            }
        });
    }
}

async fn handshake(stream: BoxedStream, control: &dyn ControlClient) -> io::Result<BoxedStream> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

    let server_name = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "client did not send a server name")
        })?;

    let pair = cert_pair(control, &server_name)
        .await
        .map_err(|e| io::Error::other(format!("certificate for {}: {}", server_name, e)))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(pair.cert_chain, pair.private_key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    debug!("TLS handshake for {}", server_name);
    let tls = start.into_stream(Arc::new(config)).await?;
    Ok(Box::new(tls))
}

impl fmt::Debug for TlsNodeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsNodeListener")
            .field("inner", &self.inner)
            .finish()
    }
}

#[async_trait]
impl MeshListener for TlsNodeListener {
    async fn accept(&self) -> io::Result<(BoxedStream, SocketAddr)> {
        let mut accepted = self.accepted.lock().await;
        match accepted.recv().await {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            )),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Closes the node listener; the accept loop stops only once that succeeds.
    async fn close(&self) -> io::Result<()> {
        self.inner.close().await?;
        self.cancel.cancel();
        Ok(())
    }

    fn unwrap_listener(&self) -> Option<&dyn MeshListener> {
        Some(self.inner.as_ref())
    }
}

impl Drop for TlsNodeListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
