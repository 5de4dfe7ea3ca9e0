//! Declarative configuration schema

use crate::directive;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u16) -> bool {
    *value == 0
}

/// App-level settings shared by every node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default registration credential
    #[serde(rename = "auth_key", default, skip_serializing_if = "String::is_empty")]
    pub default_auth_key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_url: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub ephemeral: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub webui: bool,

    /// Parent directory for per-node state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state_dir: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeConfig>,
}

/// Per-node overrides
///
/// Unset fields fall back to the app level. The two flags are tri-state so an
/// explicit `false` can override an app-level `true`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webui: Option<bool>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state_dir: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Node names become registry keys and part of listener addresses
/// (`tailscale/<name>:<port>`), so they are kept to a safe character set.
/// They also name the node's state directory, which rules out `.` and `..`.
pub fn validate_node_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidNodeName(name.to_string()))
    }
}

impl AppConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            serde_json::from_str(input).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Json(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nodes.keys().try_for_each(|name| validate_node_name(name))
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.get(name)
    }
}

/// Load configuration from disk.
///
/// Files ending in `.json` use the JSON schema; anything else is parsed as
/// directives.
pub fn load_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        AppConfig::from_json(&content)
    } else {
        directive::parse_app(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_serializes_to_empty_object() {
        assert_eq!(
            serde_json::to_string(&AppConfig::default()).unwrap(),
            "{}"
        );
    }

    #[test]
    fn test_explicit_false_survives_round_trip() {
        let config = AppConfig::from_json(
            r#"{"ephemeral": true, "nodes": {"web": {"ephemeral": false, "port": 8443}}}"#,
        )
        .unwrap();

        let web = config.node("web").unwrap();
        assert_eq!(web.ephemeral, Some(false));
        assert_eq!(web.webui, None);
        assert_eq!(web.port, 8443);

        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(json["nodes"]["web"]["ephemeral"], false);
        assert!(json["nodes"]["web"].get("webui").is_none());
    }

    #[test]
    fn test_invalid_node_name_rejected() {
        let err = AppConfig::from_json(r#"{"nodes": {"a/b": {}}}"#).unwrap_err();
        assert_eq!(err, ConfigError::InvalidNodeName("a/b".to_string()));
        assert!(validate_node_name("").is_err());
        assert!(validate_node_name(".").is_err());
        assert!(validate_node_name("..").is_err());
        assert!(validate_node_name("../x").is_err());
        assert!(validate_node_name("web-1.internal").is_ok());
        assert!(validate_node_name("..web").is_ok());
    }

    #[test]
    fn test_load_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("nodes.json");
        std::fs::File::create(&json_path)
            .unwrap()
            .write_all(br#"{"auth_key": "k"}"#)
            .unwrap();
        assert_eq!(load_file(&json_path).unwrap().default_auth_key, "k");

        let directive_path = dir.path().join("Nodefile");
        std::fs::write(&directive_path, "tailscale {\n  auth_key k2\n}\n").unwrap();
        assert_eq!(load_file(&directive_path).unwrap().default_auth_key, "k2");

        let missing = load_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
