//! Inspect command: dump a persisted report in readable form

use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use kernelscope_shared::protocol::wire::load_report;
use kernelscope_shared::{CctRecord, PcSampleBlock};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Path to a dumped profiling report
    pub report: PathBuf,

    /// Skip the per-PC record lines, print block headers only
    #[arg(long)]
    pub headers_only: bool,

    /// Skip the calling context trees
    #[arg(long)]
    pub no_trees: bool,
}

pub fn run(args: InspectArgs) -> Result<()> {
    let report = load_report(&args.report)
        .with_context(|| format!("failed to load report {}", args.report.display()))?;

    println!("message: {}", report.message);
    println!("session duration: {} ms", report.duration_ms());
    for warning in &report.warnings {
        output::warning(warning);
    }
    println!("pc sampling data blocks: {}", report.blocks.len());

    for (i, block) in report.blocks.iter().enumerate() {
        print_block(i, block, args.headers_only);
    }

    if !args.no_trees {
        for (i, tree) in report.trees.iter().enumerate() {
            print_tree(i + 1, tree);
        }
    }

    println!("\nnumber of collected GPU pc samples: {}", report.total_gpu_samples());
    Ok(())
}

fn print_block(index: usize, block: &PcSampleBlock, headers_only: bool) {
    output::heading(&format!("\nblock #{index}"));
    println!("  collectNumPcs={}", block.collect_num_pcs);
    println!("  totalSamples={}", block.total_samples);
    println!("  droppedSamples={}", block.dropped_samples);
    println!("  totalNumPcs={}", block.total_num_pcs);
    println!("  remainingNumPcs={}", block.remaining_num_pcs);
    println!("  rangeId={}", block.range_id);
    println!(
        "  nonUsrKernelsTotalSamples={}",
        block.non_user_kernels_total_samples
    );

    if headers_only {
        return;
    }
    for record in &block.records {
        println!(
            "  pc: cubinCrc={:#x}, pcOffset={:#x}, functionIndex={}, functionName={}, parentNodeId={}",
            record.cubin_crc,
            record.pc_offset,
            record.function_index,
            record.function_name,
            record.parent_node_id
        );
        for stall in &record.stall_reasons {
            println!("      stallReasonIndex={}, samples={}", stall.index, stall.samples);
        }
    }
}

/// Breadth-first walk, children in insertion order.
fn print_tree(number: usize, tree: &CctRecord) {
    output::heading(&format!("\n[CCT #{number}]"));
    for id in tree.bfs_ids() {
        let node = &tree.nodes[&id];
        let children: Vec<String> = node.child_ids.iter().map(|c| c.to_string()).collect();
        println!(
            "  [node] id={}, pc={:#x}, offset={}, funcName={}, children=[{}]",
            node.id,
            node.pc,
            node.offset,
            node.func_name,
            children.join(",")
        );
    }
}
