//! CLI for kernelscope
//!
//! Reads reports persisted by the profiler (no-RPC dumps or RPC responses
//! written to disk) and renders them for a human: PC-sample blocks, stall
//! summaries, and the calling context trees.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "kernelscope")]
#[command(about = "kernelscope - GPU-aware hybrid profiler report tooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every PC-sample block and calling context tree of a report
    Inspect(commands::inspect::InspectArgs),

    /// Summarize GPU samples per stall reason
    Stalls(commands::stalls::StallsArgs),
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect(args) => commands::inspect::run(args),
        Commands::Stalls(args) => commands::stalls::run(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
