//! CLI command definitions for the `chatrelay` binary.
//!
//! Uses clap derive macros for argument parsing. `serve` runs the REST and
//! WebSocket API; the other commands operate directly on the data directory.

pub mod keys;
pub mod quota;
pub mod snapshots;

use clap::{Parser, Subcommand};

/// Run and administer the chatrelay generation-session service.
#[derive(Parser)]
#[command(name = "chatrelay", version, about, long_about = None)]
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

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST and WebSocket API server.
    Serve {
        /// Port to listen on.
        #[arg(long, short, default_value_t = 8080)]
        port: u16,

        /// Host address to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// List durable session snapshots.
    #[command(alias = "ls")]
    Snapshots,

    /// Delete expired cache entries.
    Purge,

    /// Manage API keys.
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },

    /// Manage user quota and model plans.
    Quota {
        #[command(subcommand)]
        command: QuotaCommand,
    },
}

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Create an API key for a user. The key is printed once.
    Create {
        /// User id the key authenticates as.
        #[arg(long)]
        user: i64,

        /// Label for the key.
        #[arg(long, default_value = "default")]
        name: String,
    },
}

#[derive(Subcommand)]
pub enum QuotaCommand {
    /// Add quota to a user's balance, creating the account if needed.
    Grant {
        #[arg(long)]
        user: i64,

        /// Amount of quota to add.
        amount: f32,
    },

    /// Create or replace a per-model plan with a request limit.
    Subscribe {
        #[arg(long)]
        user: i64,

        #[arg(long)]
        model: String,

        /// Number of generations the plan covers.
        #[arg(long)]
        limit: i64,
    },

    /// Show a user's balance and plan usage.
    Show {
        #[arg(long)]
        user: i64,

        /// Also show plan usage for this model.
        #[arg(long)]
        model: Option<String>,
    },
}
