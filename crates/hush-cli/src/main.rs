//! hush CLI - silent queue のデモと検査
//!
//! # Usage
//!
//! ```bash
//! # Optimistic create / update / delete against an in-process backend
//! hush demo --fail-times 2 --storage-dir ./.hush
//!
//! # Show what is persisted under a storage directory
//! hush queues --storage-dir ./.hush
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod backend;
mod commands;

use commands::{demo, queues};

#[derive(Parser)]
#[command(name = "hush", version, about = "Silent request queue demo")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the optimistic todo scenario
    Demo(demo::DemoArgs),

    /// List persisted queues and their tasks
    Queues(queues::QueuesArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Demo(args) => demo::run(args).await,
        Commands::Queues(args) => queues::run(args).await,
    }
}

/// `RUST_LOG` wins; otherwise `-v` picks the level.
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}
