use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "hoard", author, version, about = "Cache streaming media manifests for offline playback")]
pub struct Args {
    /// SQLite database holding the cache
    #[arg(long, global = true, env = "HOARD_DATABASE", default_value = hoard_engine::config::DEFAULT_DATABASE_URL)]
    pub database: String,

    /// Resources fetched at once per download
    #[arg(long, global = true, env = "HOARD_CONCURRENCY", default_value_t = hoard_engine::config::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Retries per resource after the first attempt
    #[arg(long, global = true, env = "HOARD_RETRIES", default_value_t = 5)]
    pub retries: u32,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    pub timeout: u64,

    /// Extra request header, `name=value`; repeatable
    #[arg(short = 'H', long = "header", global = true, value_name = "NAME=VALUE")]
    pub headers: Vec<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors; disables progress bars
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Cache a manifest and everything it references
    Download {
        /// Root manifest URL
        url: String,
    },
    /// Show what is cached for a manifest
    Status {
        url: String,
    },
    /// Remove a manifest and everything it owns
    Delete {
        url: String,
    },
    /// Remove orphaned records and resume unfinished downloads
    Check {
        /// Return after the check without waiting for resumed downloads
        #[arg(long)]
        no_wait: bool,
    },
    /// Write a cached resource to a file
    Export {
        /// URL the resource was cached under
        url: String,
        /// Destination file
        path: PathBuf,
    },
}
