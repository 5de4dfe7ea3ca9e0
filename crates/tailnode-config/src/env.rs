//! Environment access
//!
//! Resolution never reads `std::env` directly; it goes through [`EnvSource`]
//! so tests can supply a fixed environment.

use std::collections::HashMap;

/// Default registration credential for every node
pub const AUTH_KEY_VAR: &str = "TS_AUTHKEY";
/// OAuth client ID used together with a client-secret credential
pub const CLIENT_ID_VAR: &str = "TS_API_CLIENT_ID";
/// Override for the coordination API base URL
pub const BASE_URL_VAR: &str = "TS_BASE_URL";
/// Forward runtime debug output
pub const VERBOSE_VAR: &str = "TAILNODE_VERBOSE";

/// Name-qualified credential variable, e.g. `TS_AUTHKEY_WEB` for node `web`
pub fn node_auth_key_var(name: &str) -> String {
    format!("{}_{}", AUTH_KEY_VAR, name.to_uppercase())
}

pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// A fixed set of variables
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl EnvSource for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}
