//! Registration with a host server
//!
//! A host calls [`register`] once at startup. It learns the configuration
//! key this app is stored under, how to parse that configuration, which
//! handlers build listeners for each network scheme, and the control client
//! its certificate manager should send local API requests through.

use crate::address::Scheme;
use crate::scheme::{NetworkHandler, SchemeHandler};
use std::sync::Arc;
use tailnode_config::{parse_app, AppConfig, ConfigError};
use tailnode_proto::ControlClient;
use tailnode_registry::NodeRegistry;
use tailnode_router::ControlPlaneRouter;
use tracing::debug;

/// Key the app configuration lives under in the host's config
pub const APP_KEY: &str = "tailscale";

/// Parsers for the two configuration surfaces
#[derive(Debug, Clone, Copy)]
pub struct AppParsers {
    pub json: fn(&str) -> Result<AppConfig, ConfigError>,
    pub directives: fn(&str) -> Result<AppConfig, ConfigError>,
}

impl Default for AppParsers {
    fn default() -> Self {
        Self {
            json: AppConfig::from_json,
            directives: parse_app,
        }
    }
}

/// What a host exposes to plugins at startup
pub trait HostRegistrar {
    fn register_app(&mut self, key: &'static str, parsers: AppParsers);

    fn register_network(&mut self, scheme: &'static str, handler: Arc<dyn NetworkHandler>);

    /// HTTP/3 servers on `scheme` listen on `http3_scheme` instead
    fn register_network_http3(&mut self, scheme: &'static str, http3_scheme: &'static str);

    /// Client the host's certificate manager uses for local API requests
    fn register_control_transport(&mut self, client: Arc<dyn ControlClient>);
}

pub fn register(host: &mut dyn HostRegistrar, registry: NodeRegistry) {
    host.register_app(APP_KEY, AppParsers::default());
    for scheme in Scheme::all() {
        debug!("Registering network scheme {}", scheme);
        host.register_network(scheme.as_str(), Arc::new(SchemeHandler::new(scheme)));
        if let Some(http3) = scheme.http3_scheme() {
            host.register_network_http3(scheme.as_str(), http3.as_str());
        }
    }
    host.register_control_transport(Arc::new(ControlPlaneRouter::new(registry)));
}
