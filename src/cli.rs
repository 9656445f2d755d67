//! Command-line interface definition using clap
//!
//! Provides structured argument parsing with automatic help generation.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

// =============================================================================
// CLI Definition
// =============================================================================

/// Polling engine for remote field stations
#[derive(Parser, Debug)]
#[command(name = "dcp-poll")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = "dcp-poll.toml", global = true)]
    pub config: PathBuf,

    /// Write each retrieved message to a file in this directory (default: stdout)
    #[arg(short, long, value_name = "DIR", global = true)]
    pub outdir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Poll every configured station once over the outbound pool
    Run,

    /// Serve stations that call in until interrupted
    Listen {
        /// Listening port (overrides config)
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Parse a poll script and print its commands
    CheckScript {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

// =============================================================================
// Tests
// =============================================================================
