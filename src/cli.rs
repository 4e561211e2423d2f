//! Command-line arguments for the relay binary.
//!
//! CLI values take precedence over the TOML configuration file.

use clap::{Parser, Subcommand};
use nul_relay::config::{ConfigError, TomlConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nul-relay")]
#[command(version = "0.1.0")]
#[command(about = "Text chat relay over NUL-delimited frames", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub role: Role,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Run a broker that relays lines between connected endpoints
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Maximum number of connected endpoints
        #[arg(long)]
        max_peers: Option<usize>,
    },
    /// Connect to a broker as an endpoint
    Connect {
        /// Broker address (host:port)
        #[arg(short, long)]
        address: Option<String>,

        /// Display name announced to the broker
        #[arg(short, long)]
        name: Option<String>,
    },
}

/// Which role to run, after merging CLI and file settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Connect,
}

/// Final resolved configuration
#[derive(Debug)]
pub struct Settings {
    pub mode: Mode,
    pub file: TomlConfig,
}

impl Settings {
    /// Parse process arguments and merge them over the optional config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut file = match cli.config {
            Some(ref path) => TomlConfig::load(path)?,
            None => TomlConfig::default(),
        };

        if let Some(level) = cli.log_level {
            file.logging.level = level;
        }

        let mode = match cli.role {
            Role::Serve { port, max_peers } => {
                if let Some(port) = port {
                    file.broker.port = port;
                }
                if let Some(max_peers) = max_peers {
                    file.broker.max_peers = max_peers;
                }
                Mode::Serve
            }
            Role::Connect { address, name } => {
                if let Some(address) = address {
                    file.endpoint.address = address;
                }
                if let Some(name) = name {
                    file.endpoint.name = name;
                }
                Mode::Connect
            }
        };

        Ok(Settings { mode, file })
    }
}
