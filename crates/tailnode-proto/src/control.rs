//! Local control-plane API client
//!
//! Each node exposes an administrative HTTP API (the "LocalAPI"). Anything that
//! can answer a request for it implements [`ControlClient`]; the identity and
//! certificate helpers below are built on top of that single operation.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::trace;

/// Host header the LocalAPI expects on every request
pub const LOCAL_API_HOST: &str = "local-tailscaled.sock";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("local API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Sends requests to a node's administrative API
#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ControlError>;
}

/// TLS server name a control request is made on behalf of.
///
/// Attach it to a request's extensions so a routing client can pick the node
/// whose certificate domains cover this name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsServerName(pub String);

/// Response of the `whois` endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WhoIsResponse {
    #[serde(default)]
    pub node: WhoIsNode,
    #[serde(default)]
    pub user_profile: UserProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WhoIsNode {
    /// Fully qualified name, e.g. `laptop.example-tailnet.ts.net.`
    #[serde(default)]
    pub name: String,
    /// Short machine name
    #[serde(default)]
    pub computed_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub hostinfo: Hostinfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hostinfo {
    #[serde(default)]
    pub hostname: String,
    /// Node is shared in from another network
    #[serde(default)]
    pub sharee_node: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserProfile {
    #[serde(default)]
    pub login_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, rename = "ProfilePicURL")]
    pub profile_pic_url: String,
}

/// Certificate chain and private key for one domain
#[derive(Debug)]
pub struct CertificatePair {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

/// Build a GET request for a LocalAPI path
fn local_api_request(path_and_query: &str) -> Result<Request<Bytes>, ControlError> {
    Request::builder()
        .method(Method::GET)
        .uri(path_and_query)
        .header(header::HOST, LOCAL_API_HOST)
        .body(Bytes::new())
        .map_err(|e| ControlError::InvalidRequest(e.to_string()))
}

fn expect_success(response: Response<Bytes>) -> Result<Bytes, ControlError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ControlError::Status {
            status,
            body: String::from_utf8_lossy(response.body()).trim().to_string(),
        });
    }
    Ok(response.into_body())
}

/// Ask the node who owns the peer at `remote`
pub async fn who_is(
    client: &dyn ControlClient,
    remote: SocketAddr,
) -> Result<WhoIsResponse, ControlError> {
    let addr: String = url::form_urlencoded::byte_serialize(remote.to_string().as_bytes()).collect();
    let request = local_api_request(&format!("/localapi/v0/whois?addr={}", addr))?;

    trace!("LocalAPI whois for {}", remote);
    let body = expect_success(client.round_trip(request).await?)?;

    serde_json::from_slice(&body).map_err(|e| ControlError::InvalidResponse(e.to_string()))
}

/// Fetch the certificate and key the node holds for `domain`
pub async fn cert_pair(
    client: &dyn ControlClient,
    domain: &str,
) -> Result<CertificatePair, ControlError> {
    if domain.is_empty() || domain.contains('/') {
        return Err(ControlError::InvalidRequest(format!(
            "invalid certificate domain: {:?}",
            domain
        )));
    }

    let request = local_api_request(&format!("/localapi/v0/cert/{}?type=pair", domain))?;

    trace!("LocalAPI cert pair for {}", domain);
    let body = expect_success(client.round_trip(request).await?)?;

    let cert_chain = rustls_pemfile::certs(&mut body.as_ref())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ControlError::InvalidResponse(format!("bad certificate PEM: {}", e)))?;
    if cert_chain.is_empty() {
        return Err(ControlError::InvalidResponse(format!(
            "no certificate returned for {}",
            domain
        )));
    }

    let private_key = rustls_pemfile::private_key(&mut body.as_ref())
        .map_err(|e| ControlError::InvalidResponse(format!("bad key PEM: {}", e)))?
        .ok_or_else(|| {
            ControlError::InvalidResponse(format!("no private key returned for {}", domain))
        })?;

    Ok(CertificatePair {
        cert_chain,
        private_key,
    })
}
