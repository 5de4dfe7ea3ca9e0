//! tailnode CLI - Inspect mesh node configuration
//!
//! Validates configuration files and shows what each node resolves to once
//! app defaults, per-node overrides and the environment are combined.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tailnode_auth::is_client_secret;
use tailnode_config::{load_file, AppConfig, ConfigResolver, EnvSource, ProcessEnv};
use tailnode_proto::NodeOptions;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// tailnode - Run several mesh identities from one server
#[derive(Parser, Debug)]
#[command(name = "tailnode")]
#[command(about = "tailnode - Inspect mesh node configuration")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and validate a configuration file
    #[command(long_about = r#"
Parse and validate a configuration file. Files ending in .json are read as
JSON; anything else is read as directives.

EXAMPLES:
  tailnode check tailnode.conf
  tailnode check config.json
    "#)]
    Check {
        /// Configuration file
        file: PathBuf,
    },

    /// Print the configuration as JSON
    Adapt {
        /// Configuration file
        file: PathBuf,
    },

    /// Show the settings a node starts with
    #[command(long_about = r#"
Show the settings a node starts with. Values come from the node block, then
the app level, then the environment. The credential itself is never printed.

ENVIRONMENT VARIABLES:
  TS_AUTHKEY             Default registration credential
  TS_AUTHKEY_<NODE>      Per-node credential (deprecated)
  TS_API_CLIENT_ID       OAuth client id for client-secret credentials
  TAILNODE_VERBOSE       Forward runtime debug output
    "#)]
    Resolve {
        /// Configuration file
        file: PathBuf,

        /// Node name
        node: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Check { file } => {
            let app = load(&file)?;
            info!("{} is valid", file.display());
            println!("{}: {} node(s)", file.display(), app.nodes.len());
            for name in app.nodes.keys() {
                println!("  {}", name);
            }
        }
        Commands::Adapt { file } => {
            let app = load(&file)?;
            let output = app.to_json().context("Failed to serialize configuration")?;
            println!("{}", output);
        }
        Commands::Resolve { file, node, json } => {
            let app = load(&file)?;
            let options = resolve(&app, &ProcessEnv, &node)?;
            if json {
                let output = serde_json::to_string_pretty(&describe_json(&options))
                    .context("Failed to serialize resolved settings")?;
                println!("{}", output);
            } else {
                for line in describe(&options) {
                    println!("{}", line);
                }
            }
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load(file: &Path) -> Result<AppConfig> {
    debug!("Loading configuration from {}", file.display());
    let app = load_file(file)
        .with_context(|| format!("Failed to load configuration from {}", file.display()))?;
    app.validate()
        .with_context(|| format!("Invalid configuration in {}", file.display()))?;
    Ok(app)
}

fn resolve(app: &AppConfig, env: &dyn EnvSource, node: &str) -> Result<NodeOptions> {
    ConfigResolver::new(app, env)
        .resolve(node)
        .with_context(|| format!("Failed to resolve node {}", node))
}

fn credential_kind(options: &NodeOptions) -> &'static str {
    if options.auth_key.is_empty() {
        "absent (interactive login)"
    } else if is_client_secret(options.auth_key.expose()) {
        "OAuth client secret (exchanged at start)"
    } else {
        "present"
    }
}

fn or_default(value: &str) -> &str {
    if value.is_empty() {
        "(default)"
    } else {
        value
    }
}

fn describe(options: &NodeOptions) -> Vec<String> {
    vec![
        format!("node:        {}", options.name),
        format!("hostname:    {}", options.hostname),
        format!("auth key:    {}", credential_kind(options)),
        format!("control url: {}", or_default(&options.control_url)),
        format!("ephemeral:   {}", options.ephemeral),
        format!("webui:       {}", options.webui),
        format!("port:        {}", options.port),
        format!("state dir:   {}", options.state_dir.display()),
        format!("tags:        {}", options.tags.join(", ")),
        format!("verbose:     {}", options.verbose),
    ]
}

fn describe_json(options: &NodeOptions) -> serde_json::Value {
    json!({
        "name": options.name,
        "hostname": options.hostname,
        "auth_key": credential_kind(options),
        "control_url": options.control_url,
        "ephemeral": options.ephemeral,
        "webui": options.webui,
        "port": options.port,
        "state_dir": options.state_dir.display().to_string(),
        "tags": options.tags,
        "verbose": options.verbose,
    })
}
