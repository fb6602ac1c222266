//! keel — offline driver for the replica placement engine.
//!
//! Loads a JSON cluster snapshot, replays it through the balancer, and
//! prints the movement plan or diagnostics.
//!
//! # Usage
//!
//! ```text
//! keel plan --snapshot cluster.json --config keel.toml --seed 7
//! keel domains --snapshot cluster.json
//! keel capacity --snapshot cluster.json --metric Memory
//! keel config > keel.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod snapshot;

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Keel — constraint-driven replica placement",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one refresh over a snapshot and print the movements.
    Plan {
        #[arg(short, long)]
        snapshot: PathBuf,
        /// TOML configuration; defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override `search.seed`.
        #[arg(long)]
        seed: Option<u64>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// List service domains and their members.
    Domains {
        #[arg(short, long)]
        snapshot: PathBuf,
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Total cluster capacity and per-node load for one metric.
    Capacity {
        #[arg(short, long)]
        snapshot: PathBuf,
        #[arg(short, long)]
        metric: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print the default configuration as TOML.
    Config,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,keel=debug"))?,
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            snapshot,
            config,
            seed,
            format,
        } => {
            let config = commands::plan::load_config(config.as_deref(), seed)?;
            commands::plan::plan(&snapshot, &config, &format)
        }
        Commands::Domains { snapshot, format } => commands::inspect::domains(&snapshot, &format),
        Commands::Capacity {
            snapshot,
            metric,
            config,
            format,
        } => {
            let config = commands::plan::load_config(config.as_deref(), None)?;
            commands::inspect::capacity(&snapshot, &config, &metric, &format)
        }
        Commands::Config => {
            print!("{}", keel_core::KeelConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}
