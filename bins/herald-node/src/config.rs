use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use herald_engine::BusConfig;

use crate::error::NodeError;

#[derive(Parser)]
#[command(name = "herald-node", about = "Command/event bus node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a node and exchange demo commands over the in-memory broker
    Ping(PingArgs),
    /// Check that every listed wire type has a handler
    Check(CheckArgs),
}

#[derive(Args, Clone, Debug)]
pub struct PingArgs {
    /// Path to the TOML config file
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<String>,
    /// Number of Ping commands to send
    #[arg(long, default_value_t = 3)]
    pub count: u32,
    /// Text carried by each Ping
    #[arg(long, default_value = "hello")]
    pub message: String,
}

#[derive(Args, Clone, Debug)]
pub struct CheckArgs {
    /// Path to the TOML config file
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<String>,
    /// Wire types that must be handled
    #[arg(required = true)]
    pub wire_types: Vec<String>,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default)]
    pub bus: BusConfig,
}

fn default_node_name() -> String {
    "herald".into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            bus: BusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&str>) -> Result<Self, NodeError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| NodeError::Config {
            context: "read",
            detail: format!("'{path}': {e}"),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| NodeError::Config {
            context: "parse",
            detail: format!("'{path}': {e}"),
        })?;
        config.bus.validate().map_err(|e| NodeError::Config {
            context: "validate",
            detail: format!("'{path}': {e}"),
        })?;
        Ok(config)
    }
}
