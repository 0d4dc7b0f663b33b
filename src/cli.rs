//! CLI definitions for Leaseq.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Leaseq CLI.
#[derive(Parser)]
#[command(name = "leaseq")]
#[command(about = "Persistent priority job queue with leased workers")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (default: ~/.leaseq/config.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Queue database path (overrides the config file)
    #[arg(long, global = true, env = "LEASEQ_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Add an item to the queue
    Enqueue {
        /// Item priority (higher runs first)
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        /// Read the payload from a file
        #[arg(short, long, conflicts_with = "payload")]
        file: Option<PathBuf>,

        /// Payload text (read from stdin when omitted)
        payload: Option<String>,
    },

    /// Claim the next eligible item
    Claim {
        /// Worker identity (default: a random one)
        #[arg(short, long)]
        worker: Option<String>,

        /// Lease duration in seconds
        #[arg(long)]
        lease_secs: Option<u64>,
    },

    /// Report a claimed item as completed
    Complete {
        /// Item ID
        id: i64,

        /// Worker identity that holds the lease
        #[arg(short, long)]
        worker: String,
    },

    /// Report a claimed item as failed
    Fail {
        /// Item ID
        id: i64,

        /// Worker identity that holds the lease
        #[arg(short, long)]
        worker: String,

        /// Failure message
        #[arg(short, long)]
        error: String,

        /// Failures allowed before the item is permanently failed
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Show item counts per status
    Stats {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Delete completed items past the retention window
    Cleanup {
        /// Retention window in days
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Show one item
    Inspect {
        /// Item ID
        id: i64,
    },

    /// List permanently failed items
    Failed {
        /// Maximum number of items
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Run a worker pool that pipes each payload to a shell command
    Work {
        /// Shell command; the payload arrives on stdin
        #[arg(short, long)]
        exec: String,

        /// Number of concurrent workers
        #[arg(long)]
        workers: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}
