//! Stalls command: aggregate GPU samples per stall reason

use anyhow::{Context, Result};
use clap::Args;
use kernelscope_shared::protocol::wire::load_report;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct StallsArgs {
    /// Path to a dumped profiling report
    pub report: PathBuf,

    /// Only show the N heaviest stall reasons
    #[arg(short = 'n', long)]
    pub top: Option<usize>,
}

pub fn run(args: StallsArgs) -> Result<()> {
    let report = load_report(&args.report)
        .with_context(|| format!("failed to load report {}", args.report.display()))?;

    let mut per_reason: BTreeMap<u32, u64> = BTreeMap::new();
    for block in &report.blocks {
        for record in &block.records {
            for stall in &record.stall_reasons {
                *per_reason.entry(stall.index).or_insert(0) += stall.samples;
            }
        }
    }

    let total: u64 = per_reason.values().sum();
    let mut sorted: Vec<(u32, u64)> = per_reason.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    if let Some(top) = args.top {
        sorted.truncate(top);
    }

    println!("total samples: {total}");
    for (index, samples) in sorted {
        let share = if total == 0 {
            0.0
        } else {
            samples as f64 * 100.0 / total as f64
        };
        println!("  stall reason {index:>3}: {samples:>10} samples ({share:>5.1}%)");
    }
    Ok(())
}
