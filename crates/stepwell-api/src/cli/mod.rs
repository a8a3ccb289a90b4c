//! CLI command definitions and dispatch for the `swell` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod workflow;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run durable workflow automations.
#[derive(Parser)]
#[command(name = "swell", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server with embedded workers.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:8460", env = "STEPWELL_ADDR")]
        addr: SocketAddr,

        /// Export traces via OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// Validate a workflow YAML file without publishing it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Dry-run a workflow YAML file against a sample input.
    Simulate {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Sample trigger payload as inline JSON.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
