mod cli;
mod commands;
mod error;
mod params;
mod progress;

use std::process::ExitCode;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::error;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Args, Commands};
use crate::commands::CommandExecutor;
use crate::error::Result;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const DEFAULT_FILTER: &str = "hoard=info,hoard_engine=info,sqlx=warn";
const VERBOSE_FILTER: &str = "hoard=debug,hoard_engine=debug,sqlx=warn";

#[tokio::main]
async fn main() -> ExitCode {
    // Before parsing so `.env` can supply HOARD_* defaults.
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    let json = args.json;

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                let error_json = serde_json::json!({
                    "status": "error",
                    "message": e.to_string(),
                });
                println!("{error_json}");
            } else {
                error!(error = %e, "Command failed");
                eprintln!("Error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let executor = CommandExecutor::open(&args).await?;

    match args.command {
        Commands::Download { url } => executor.download(&url).await,
        Commands::Status { url } => executor.status(&url).await,
        Commands::Delete { url } => executor.delete(&url).await,
        Commands::Check { no_wait } => executor.check(!no_wait).await,
        Commands::Export { url, path } => executor.export(&url, &path).await,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    let registry = tracing_subscriber::registry().with(filter);

    if quiet {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    } else {
        // Log lines go through the progress bars' writer so the two do not interleave.
        let indicatif_layer = IndicatifLayer::new();
        registry
            .with(
                fmt::layer()
                    .with_target(verbose)
                    .with_writer(indicatif_layer.get_stderr_writer()),
            )
            .with(indicatif_layer)
            .init();
    }
}
