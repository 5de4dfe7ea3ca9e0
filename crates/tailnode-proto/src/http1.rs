//! Minimal HTTP/1 client over an already-connected stream

use crate::control::ControlError;
use crate::listener::BoxedStream;
use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{header, HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;

/// Send one request over `stream` and collect the full response.
///
/// Absolute-form URIs are rewritten to origin-form and their authority moved
/// into the `Host` header when one isn't already set.
pub async fn send_http1(
    stream: BoxedStream,
    request: Request<Bytes>,
) -> Result<Response<Bytes>, ControlError> {
    let (mut parts, body) = request.into_parts();

    if let Some(authority) = parts.uri.authority().cloned() {
        if !parts.headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ControlError::InvalidRequest(e.to_string()))?;
            parts.headers.insert(header::HOST, host);
        }
        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path);
    }

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ControlError::Transport(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("HTTP/1 connection closed with error: {}", e);
        }
    });

    let response = sender
        .send_request(Request::from_parts(parts, Full::new(body)))
        .await
        .map_err(|e| ControlError::Transport(e.to_string()))?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| ControlError::Transport(e.to_string()))?
        .to_bytes();

    Ok(Response::from_parts(parts, body))
}
