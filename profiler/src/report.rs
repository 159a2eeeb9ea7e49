//! Report assembly
//!
//! Folds the session's drained PC-sample blocks and the finalized (or
//! pruned) calling context trees into the serializable report document.

use crate::cct::{Cct, CctStore};
use crate::config::Config;
use crate::prune::Pruner;
use crate::trace::TracingRecord;
use kernelscope_shared::{
    CctNodeRecord, CctRecord, PcSampleBlock, PcSampleRecord, ProfilingReport, StallReasonSample,
};
use tracing::info;

/// Stall-reason index carrying accumulated durations in tracing mode.
pub const TRACING_DURATION_STALL_INDEX: u32 = 28;

/// Warning surfaced when producers outran the consumer.
pub const BACKPRESSURE_WARNING: &str =
    "buffers get used faster than stored; increase ring buffer count or size";

/// Serialize one tree.
pub fn serialize_cct(cct: &Cct) -> CctRecord {
    let root_id = cct.root_id().unwrap_or(0);
    let mut record = CctRecord {
        root_id,
        root_pc: cct.node(root_id).map_or(0, |n| n.pc),
        nodes: Default::default(),
    };
    for node in cct.iter() {
        record.nodes.insert(
            node.id,
            CctNodeRecord {
                id: node.id,
                pc: node.pc,
                parent_id: node.parent_id,
                parent_pc: node.parent_pc,
                offset: node.offset,
                func_name: node.func_name.clone(),
                child_ids: node.children.clone(),
                child_pcs: node
                    .children
                    .iter()
                    .filter_map(|id| cct.node(*id).map(|c| c.pc))
                    .collect(),
            },
        );
    }
    record
}

/// Synthesize the single block tracing mode contributes: one record per
/// (call path, kernel) pair, the accumulated duration riding in a
/// pseudo stall-reason entry.
pub fn tracing_block(records: &[TracingRecord]) -> PcSampleBlock {
    let mut block = PcSampleBlock::with_capacity(records.len() as u64);
    block.total_num_pcs = records.len() as u64;
    block.total_samples = records.len() as u64;
    for record in records {
        block.records.push(PcSampleRecord {
            cubin_crc: 0,
            pc_offset: 0,
            function_index: 0,
            function_name: record.func_name.clone(),
            parent_node_id: record.parent_node_id,
            stall_reasons: vec![StallReasonSample {
                index: TRACING_DURATION_STALL_INDEX,
                samples: record.duration_us,
            }],
        });
    }
    block
}

/// Build the final report for a session started at `start_time` (nanos
/// since epoch); assembly time becomes the report's end timestamp.
pub fn assemble_report(
    config: &Config,
    store: &CctStore,
    blocks: Vec<PcSampleBlock>,
    backpressure: bool,
    message: &str,
    start_time: u64,
) -> ProfilingReport {
    let trees = if config.prune_cct {
        Pruner::new(config)
            .prune_all(store)
            .iter()
            .map(|(_, cct)| serialize_cct(cct))
            .collect()
    } else {
        store.with_all(|ccts| {
            let mut tids: Vec<i32> = ccts.keys().copied().collect();
            tids.sort_unstable();
            tids.iter().map(|tid| serialize_cct(&ccts[tid])).collect()
        })
    };

    let mut report = ProfilingReport {
        message: message.to_string(),
        start_time,
        end_time: kernelscope_shared::utils::time::system_time_nanos(),
        warnings: Vec::new(),
        blocks,
        trees,
    };
    if backpressure {
        report.warnings.push(BACKPRESSURE_WARNING.to_string());
    }
    info!(
        blocks = report.blocks.len(),
        trees = report.trees.len(),
        samples = report.total_gpu_samples(),
        "report assembled"
    );
    report
}
