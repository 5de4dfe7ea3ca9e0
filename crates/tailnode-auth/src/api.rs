//! Coordination server API client for key issuance

use crate::CredentialError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tailnode_proto::Secret;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.tailscale.com";
const USER_AGENT: &str = "tailnode";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyCapabilities {
    pub devices: DeviceCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCapabilities {
    pub create: DeviceCreateCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCreateCapabilities {
    pub reusable: bool,
    pub ephemeral: bool,
    pub preauthorized: bool,
    pub tags: Vec<String>,
}

#[derive(Serialize)]
struct CreateKeyRequest<'a> {
    capabilities: &'a KeyCapabilities,
}

#[derive(Deserialize)]
struct CreateKeyResponse {
    key: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Client for the OAuth token endpoint and the key-creation endpoint
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CredentialError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Client-credentials grant; returns the bearer access token.
    pub async fn access_token(
        &self,
        client_id: &str,
        client_secret: &Secret,
    ) -> Result<Secret, CredentialError> {
        let url = format!("{}/api/v2/oauth/token", self.base_url);
        debug!("Requesting OAuth access token from {}", url);

        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret.expose()),
            ])
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        let token: TokenResponse = read_json(response).await?;
        if token.access_token.is_empty() {
            return Err(CredentialError::InvalidResponse(
                "empty access token".to_string(),
            ));
        }
        Ok(Secret::new(token.access_token))
    }

    /// Create a registration key for the caller's tailnet.
    pub async fn create_key(
        &self,
        access_token: &Secret,
        capabilities: &KeyCapabilities,
    ) -> Result<Secret, CredentialError> {
        let url = format!("{}/api/v2/tailnet/-/keys", self.base_url);
        debug!("Creating registration key at {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token.expose())
            .json(&CreateKeyRequest { capabilities })
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        let created: CreateKeyResponse = read_json(response).await?;
        if created.key.is_empty() {
            return Err(CredentialError::InvalidResponse(
                "empty registration key".to_string(),
            ));
        }
        Ok(Secret::new(created.key))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, CredentialError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| CredentialError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(CredentialError::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).trim().to_string(),
        });
    }

    serde_json::from_slice(&body).map_err(|e| CredentialError::InvalidResponse(e.to_string()))
}
