//! Command-line interface definition using clap
//!
//! Provides structured argument parsing with automatic help generation.

use clap::{Parser, Subcommand};
use obs_remote::config::Config;
use std::path::PathBuf;

// =============================================================================
// CLI Definition
// =============================================================================

/// Remote control session for an obs-websocket server
#[derive(Parser, Debug, Default)]
#[command(name = "obs-remote")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose debug output
    #[arg(short, long)]
    pub verbose: bool,

    /// Config file to use instead of config.toml next to the executable
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Server host (overrides config)
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Server port (overrides config)
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Server password (overrides config)
    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Poll interval in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Audio input to track; repeat for several (adds to config)
    #[arg(long = "input", value_name = "NAME")]
    pub inputs: Vec<String>,

    /// Track every input that reports a volume
    #[arg(long)]
    pub discover_inputs: bool,

    /// Don't poll performance stats
    #[arg(long)]
    pub no_stats: bool,

    /// Don't reconnect after the connection drops
    #[arg(long)]
    pub no_reconnect: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one request, print the response and exit
    Call {
        /// Request type, e.g. GetVersion
        request_type: String,

        /// Request data as a JSON object
        data: Option<String>,
    },
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.connection.host = host.clone();
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        if let Some(password) = &self.password {
            config.connection.password = password.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            config.sync.interval_ms = interval_ms;
        }
        for input in &self.inputs {
            if !config.sync.inputs.contains(input) {
                config.sync.inputs.push(input.clone());
            }
        }
        if self.discover_inputs {
            config.sync.discover_inputs = true;
        }
        if self.no_stats {
            config.sync.stats = false;
        }
        if self.no_reconnect {
            config.reconnect.enabled = false;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
