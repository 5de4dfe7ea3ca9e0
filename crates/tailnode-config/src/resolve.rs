//! Per-node settings resolution
//!
//! Precedence for every field is node override, then app default, then (for
//! credentials only) the environment. Resolved strings are expanded; a value
//! that fails to expand aborts the node start instead of becoming empty.

use crate::app::{AppConfig, NodeConfig};
use crate::directive::parse_bool;
use crate::env::{node_auth_key_var, EnvSource, AUTH_KEY_VAR, VERBOSE_VAR};
use crate::error::ConfigError;
use crate::placeholder::{expand, EnvPlaceholders};
use std::path::{Path, PathBuf};
use tailnode_proto::{NodeOptions, Secret};
use tracing::{debug, warn};

/// Prefix of the per-node default state directory
pub const STATE_DIR_PREFIX: &str = "tailnode-";

pub struct ConfigResolver<'a> {
    app: &'a AppConfig,
    env: &'a dyn EnvSource,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(app: &'a AppConfig, env: &'a dyn EnvSource) -> Self {
        Self { app, env }
    }

    pub fn app(&self) -> &AppConfig {
        self.app
    }

    pub fn env(&self) -> &dyn EnvSource {
        self.env
    }

    fn node(&self, name: &str) -> Option<&'a NodeConfig> {
        self.app.nodes.get(name)
    }

    fn expand(&self, name: &str, field: &'static str, value: &str) -> Result<String, ConfigError> {
        expand(value, &EnvPlaceholders::new(self.env)).map_err(|source| ConfigError::Expand {
            node: name.to_string(),
            field,
            source,
        })
    }

    /// Raw registration credential, before any exchange.
    ///
    /// Values taken from the environment are used verbatim. An empty result
    /// means the runtime falls back to interactive login.
    pub fn auth_key(&self, name: &str) -> Result<Secret, ConfigError> {
        if let Some(node) = self.node(name).filter(|n| !n.auth_key.is_empty()) {
            let key = self.expand(name, "auth_key", &node.auth_key)?;
            if !key.is_empty() {
                return Ok(Secret::new(key));
            }
        }

        if !self.app.default_auth_key.is_empty() {
            let key = self.expand(name, "auth_key", &self.app.default_auth_key)?;
            if !key.is_empty() {
                return Ok(Secret::new(key));
            }
        }

        let qualified = node_auth_key_var(name);
        if let Some(key) = self.env.var(&qualified).filter(|k| !k.is_empty()) {
            warn!(
                node = %name,
                var = %qualified,
                "Relying on a name-qualified credential variable is deprecated; set auth_key in the configuration instead"
            );
            return Ok(Secret::new(key));
        }

        Ok(Secret::new(self.env.var(AUTH_KEY_VAR).unwrap_or_default()))
    }

    pub fn control_url(&self, name: &str) -> Result<String, ConfigError> {
        match self.node(name).filter(|n| !n.control_url.is_empty()) {
            Some(node) => self.expand(name, "control_url", &node.control_url),
            None => self.expand(name, "control_url", &self.app.control_url),
        }
    }

    pub fn ephemeral(&self, name: &str) -> bool {
        self.node(name)
            .and_then(|n| n.ephemeral)
            .unwrap_or(self.app.ephemeral)
    }

    pub fn webui(&self, name: &str) -> bool {
        self.node(name)
            .and_then(|n| n.webui)
            .unwrap_or(self.app.webui)
    }

    /// Hostname override, or the node name itself
    pub fn hostname(&self, name: &str) -> Result<String, ConfigError> {
        match self.node(name).filter(|n| !n.hostname.is_empty()) {
            Some(node) => self.expand(name, "hostname", &node.hostname),
            None => Ok(name.to_string()),
        }
    }

    pub fn port(&self, name: &str) -> u16 {
        self.node(name).map_or(0, |n| n.port)
    }

    /// Node override as-is, else `<app state_dir>/<name>`, else
    /// `<user config dir>/tailnode-<name>`.
    pub fn state_dir(&self, name: &str) -> Result<PathBuf, ConfigError> {
        if let Some(node) = self.node(name).filter(|n| !n.state_dir.is_empty()) {
            return self.expand(name, "state_dir", &node.state_dir).map(PathBuf::from);
        }

        if !self.app.state_dir.is_empty() {
            let parent = self.expand(name, "state_dir", &self.app.state_dir)?;
            return Ok(Path::new(&parent).join(name));
        }

        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(format!("{}{}", STATE_DIR_PREFIX, name)))
    }

    /// App tags followed by node tags, without duplicates
    pub fn tags(&self, name: &str) -> Result<Vec<String>, ConfigError> {
        let node_tags = self.node(name).map(|n| n.tags.as_slice()).unwrap_or(&[]);

        let mut tags: Vec<String> = Vec::new();
        for raw in self.app.tags.iter().chain(node_tags) {
            let tag = self.expand(name, "tags", raw)?;
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Ok(tags)
    }

    /// Whether to forward the runtime's debug output
    pub fn verbose(&self) -> Result<bool, ConfigError> {
        match self.env.var(VERBOSE_VAR) {
            None => Ok(false),
            Some(value) if value.is_empty() => Ok(false),
            Some(value) => parse_bool(&value).ok_or(ConfigError::InvalidEnv {
                var: VERBOSE_VAR,
                value,
            }),
        }
    }

    /// Resolve every field for `name`.
    ///
    /// The credential in the result is the raw configured value; exchanging a
    /// client secret for a registration key happens separately.
    pub fn resolve(&self, name: &str) -> Result<NodeOptions, ConfigError> {
        let options = NodeOptions {
            name: name.to_string(),
            hostname: self.hostname(name)?,
            auth_key: self.auth_key(name)?,
            control_url: self.control_url(name)?,
            ephemeral: self.ephemeral(name),
            webui: self.webui(name),
            port: self.port(name),
            state_dir: self.state_dir(name)?,
            tags: self.tags(name)?,
            verbose: self.verbose()?,
        };

        debug!(
            node = %name,
            hostname = %options.hostname,
            ephemeral = options.ephemeral,
            webui = options.webui,
            port = options.port,
            state_dir = %options.state_dir.display(),
            "Resolved node settings"
        );

        Ok(options)
    }
}

/// Create a node state directory, readable only by the owner on unix.
pub fn create_state_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}
