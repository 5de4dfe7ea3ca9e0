//! Configuration for tailnode
//!
//! Settings come from three layers: per-node overrides, app-level defaults and
//! the process environment. [`ConfigResolver`] merges them for one node at a
//! time and runs every string through placeholder expansion.
//!
//! Configuration is written either as JSON (the schema of [`AppConfig`]) or in
//! the directive grammar handled by [`directive::parse_app`]:
//!
//! ```text
//! tailscale {
//!     auth_key {env.TS_AUTHKEY}
//!     ephemeral
//!     tags tag:web
//!     web {
//!         hostname web-{env.REGION}
//!         webui false
//!     }
//! }
//! ```

pub mod app;
pub mod directive;
pub mod env;
pub mod error;
pub mod placeholder;
pub mod resolve;

pub use app::{load_file, validate_node_name, AppConfig, NodeConfig};
pub use directive::parse_app;
pub use env::{EnvSource, MapEnv, ProcessEnv};
pub use error::ConfigError;
pub use placeholder::{expand, EnvPlaceholders, ExpandError, Placeholders};
pub use resolve::{create_state_dir, ConfigResolver};
