//! Registration credential provisioning
//!
//! Most credentials are handed to the node runtime as configured. A credential
//! that is an OAuth client secret is first exchanged for a single-use,
//! pre-authorized registration key carrying the node's tags.

pub mod api;
pub mod provisioner;

pub use api::{
    ApiClient, DeviceCapabilities, DeviceCreateCapabilities, KeyCapabilities, DEFAULT_BASE_URL,
};
pub use provisioner::{is_client_secret, CredentialProvisioner, CLIENT_SECRET_PREFIX};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("TS_API_CLIENT_ID must be set to use an OAuth client secret")]
    MissingClientId,

    #[error("at least one tag must be configured to use an OAuth client secret")]
    NoTags,

    #[error("credential exchange failed: {0}")]
    Transport(String),

    #[error("credential exchange rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid credential exchange response: {0}")]
    InvalidResponse(String),
}
