//! ironpool: command-line front end for the ironpool connection pool.
//!
//! # Usage
//!
//! ```text
//! ironpool check --config pool.toml
//! ironpool simulate --config pool.toml --workers 16 --iterations 100 --fail-rate 0.05
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "ironpool",
    about = "ironpool: generic connection pool toolkit",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a pool configuration, then print the effective
    /// settings with defaults filled in.
    Check {
        /// Path to the pool TOML file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run concurrent workers against a pool backed by an in-process mock
    /// factory and print the resulting statistics.
    Simulate {
        /// Path to the pool TOML file (default settings when omitted).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of concurrent workers.
        #[arg(short, long, default_value = "8")]
        workers: usize,
        /// Handles each worker allocates and closes.
        #[arg(short, long, default_value = "100")]
        iterations: usize,
        /// Probability (0.0 to 1.0) that creating a physical connection fails.
        #[arg(long, default_value = "0.0")]
        fail_rate: f64,
        /// How long a worker holds each handle, in milliseconds.
        #[arg(long, default_value = "1")]
        hold_millis: u64,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,ironpool=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => commands::check::check(&config),
        Commands::Simulate {
            config,
            workers,
            iterations,
            fail_rate,
            hold_millis,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                workers,
                iterations,
                fail_rate,
                hold_millis,
            };
            commands::simulate::simulate(config.as_deref(), options, &format).await
        }
    }
}
