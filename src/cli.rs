// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "jumpwire")]
#[command(about = "SSH tunnels and remote command execution through jump hosts")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: discover jumpwire.yml in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print results
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Print JSON lines instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run commands on a server, stopping at the first failure
    Exec {
        /// Server id from the configuration
        server: String,

        /// Commands to run, in order
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Check whether a path exists on a server
    Exists {
        /// Server id from the configuration
        server: String,

        /// Remote path
        path: String,
    },

    /// Start all configured tunnels and keep them open until Ctrl-C
    Tunnels {
        /// How often to print tunnel stats
        #[arg(long, default_value = "30s", value_parser = humantime_serde::re::humantime::parse_duration)]
        interval: Duration,
    },
}
