use crate::placeholder::ExpandError;
use thiserror::Error;

/// Configuration errors
///
/// Directive and literal errors are fatal at load time. Expansion errors are
/// fatal only to the node start that needed the value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("line {line}: {message}")]
    Directive { line: usize, message: String },

    #[error("invalid JSON configuration: {0}")]
    Json(String),

    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid node name: {0:?}")]
    InvalidNodeName(String),

    #[error("node {node}: cannot expand {field}: {source}")]
    Expand {
        node: String,
        field: &'static str,
        #[source]
        source: ExpandError,
    },

    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("cannot determine the user configuration directory")]
    NoConfigDir,
}

impl ConfigError {
    pub(crate) fn directive(line: usize, message: impl Into<String>) -> Self {
        Self::Directive {
            line,
            message: message.into(),
        }
    }
}
