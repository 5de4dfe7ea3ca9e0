//! CredentialProvisioner

use crate::api::{
    ApiClient, DeviceCapabilities, DeviceCreateCapabilities, KeyCapabilities, DEFAULT_BASE_URL,
};
use crate::CredentialError;
use std::sync::Arc;
use std::time::Duration;
use tailnode_config::env::{BASE_URL_VAR, CLIENT_ID_VAR};
use tailnode_config::EnvSource;
use tailnode_proto::{NodeOptions, Secret};
use tracing::{debug, error, info};

/// Credentials starting with this prefix are OAuth client secrets
pub const CLIENT_SECRET_PREFIX: &str = "tskey-client-";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn is_client_secret(raw: &str) -> bool {
    raw.starts_with(CLIENT_SECRET_PREFIX)
}

/// Turns a configured credential into one the runtime can register with
pub struct CredentialProvisioner {
    env: Arc<dyn EnvSource>,
    timeout: Duration,
}

impl CredentialProvisioner {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Per-request timeout for the exchange calls
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Provision the credential for a node whose settings are already resolved
    pub async fn provision(&self, options: &NodeOptions) -> Result<Secret, CredentialError> {
        self.obtain(
            &options.auth_key,
            &options.name,
            &options.tags,
            options.ephemeral,
        )
        .await
    }

    /// Return `raw` unchanged unless it is a client secret, in which case
    /// exchange it for a fresh registration key.
    ///
    /// The issued key is single-use, pre-authorized, carries `tags` and
    /// matches the node's ephemeral setting. Nothing is retried here.
    pub async fn obtain(
        &self,
        raw: &Secret,
        name: &str,
        tags: &[String],
        ephemeral: bool,
    ) -> Result<Secret, CredentialError> {
        if !is_client_secret(raw.expose()) {
            return Ok(raw.clone());
        }

        debug!(node = %name, "OAuth client secret detected, performing token exchange");

        let client_id = self
            .env
            .var(CLIENT_ID_VAR)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                error!(node = %name, "{} must be set to use OAuth client secrets", CLIENT_ID_VAR);
                CredentialError::MissingClientId
            })?;

        if tags.is_empty() {
            error!(node = %name, "At least one tag must be configured for OAuth key issuance");
            return Err(CredentialError::NoTags);
        }

        let base_url = self
            .env
            .var(BASE_URL_VAR)
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let api = ApiClient::new(&base_url, self.timeout)?;
        let token = api.access_token(&client_id, raw).await.map_err(|e| {
            error!(node = %name, "OAuth token request failed: {}", e);
            e
        })?;

        let capabilities = KeyCapabilities {
            devices: DeviceCapabilities {
                create: DeviceCreateCapabilities {
                    reusable: false,
                    ephemeral,
                    preauthorized: true,
                    tags: tags.to_vec(),
                },
            },
        };

        let key = api.create_key(&token, &capabilities).await.map_err(|e| {
            error!(node = %name, "Failed to create registration key: {}", e);
            e
        })?;

        info!(node = %name, "Generated registration key from OAuth client secret");
        Ok(key)
    }
}
