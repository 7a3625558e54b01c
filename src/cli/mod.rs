//! CLI module for Portico
//!
//! Command-line interface definitions and handlers for the gateway.
//!
//! # Commands
//!
//! - `serve` - Start the gateway
//! - `config` - Configuration utilities (init)
//!
//! # Example
//!
//! ```bash
//! # Start the gateway with default config
//! portico serve
//!
//! # Write a commented example configuration
//! portico config init
//! ```

pub mod config;
pub mod serve;

pub use config::handle_config_init;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Portico - LAN gateway for a local LLM runtime
#[derive(Parser, Debug)]
#[command(
    name = "portico",
    version,
    about = "LAN gateway for a local LLM runtime"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway
    Serve(ServeArgs),
    /// Configuration utilities
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "portico.toml")]
    pub config: PathBuf,

    /// Override listener port
    #[arg(short, long, env = "PORTICO_PORT")]
    pub port: Option<u16>,

    /// Override listener host
    #[arg(short = 'H', long, env = "PORTICO_HOST")]
    pub host: Option<String>,

    /// Override backend HTTP base URL
    #[arg(short = 'b', long, env = "PORTICO_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Set log level (error, warn, info, debug)
    #[arg(short, long, env = "PORTICO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Disable backend log monitoring
    #[arg(long)]
    pub no_log_monitoring: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Write an example configuration file
    Init(ConfigInitArgs),
}

#[derive(Args, Debug)]
pub struct ConfigInitArgs {
    /// Destination path
    #[arg(short, long, default_value = "portico.toml")]
    pub output: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
