//! Profiling report data model
//!
//! These types mirror what the GPU driver hands back per drained buffer plus
//! the finalized per-thread calling context trees. They are what gets
//! serialized into a persisted report and what the CLI tooling reads back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-stall-reason sample count attached to one sampled GPU pc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallReasonSample {
    /// Driver-assigned stall reason index
    pub index: u32,

    /// Number of samples attributed to this stall reason
    pub samples: u64,
}

/// One sampled GPU program counter with its attribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcSampleRecord {
    /// CRC of the cubin the pc belongs to
    pub cubin_crc: u64,

    /// Offset of the pc within its function
    pub pc_offset: u64,

    /// Driver-assigned function index
    pub function_index: u32,

    /// GPU function (kernel) name
    pub function_name: String,

    /// Id of the CPU CCT node that was active when this record was pulled
    pub parent_node_id: u64,

    /// Sample counts broken down by stall reason
    pub stall_reasons: Vec<StallReasonSample>,
}

impl PcSampleRecord {
    /// Total samples across all stall reasons
    pub fn total_samples(&self) -> u64 {
        self.stall_reasons.iter().map(|s| s.samples).sum()
    }
}

/// One block of PC samples as drained from the driver in a single pull.
///
/// A block doubles as the buffer the driver fills: `collect_num_pcs` is its
/// capacity, the remaining counters are written by the driver on each pull.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcSampleBlock {
    /// Capacity of this buffer in records
    pub collect_num_pcs: u64,

    /// Total hardware samples represented by this block
    pub total_samples: u64,

    /// Samples the hardware dropped
    pub dropped_samples: u64,

    /// Number of distinct pcs filled into `records`
    pub total_num_pcs: u64,

    /// Pcs still pending on the driver side after this pull
    pub remaining_num_pcs: u64,

    /// Driver range id (advances on module reload)
    pub range_id: u64,

    /// Samples that landed in non-user kernels
    pub non_user_kernels_total_samples: u64,

    /// The sampled pcs, at most `collect_num_pcs` of them
    pub records: Vec<PcSampleRecord>,
}

impl PcSampleBlock {
    /// Create an empty block with the given record capacity.
    pub fn with_capacity(collect_num_pcs: u64) -> Self {
        Self {
            collect_num_pcs,
            ..Default::default()
        }
    }

    /// Clear driver-written state so the buffer can be reused for a new pull.
    pub fn reset(&mut self) {
        self.total_samples = 0;
        self.dropped_samples = 0;
        self.total_num_pcs = 0;
        self.remaining_num_pcs = 0;
        self.range_id = 0;
        self.non_user_kernels_total_samples = 0;
        self.records.clear();
    }

    /// True when the driver filled no records into this block.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Serialized form of one CCT node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CctNodeRecord {
    pub id: u64,
    pub pc: u64,
    pub parent_id: u64,
    pub parent_pc: u64,
    pub offset: u64,
    pub func_name: String,
    pub child_ids: Vec<u64>,
    pub child_pcs: Vec<u64>,
}

/// Serialized form of one per-thread calling context tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CctRecord {
    pub root_id: u64,
    pub root_pc: u64,
    /// Node id → node, ordered for deterministic serialization
    pub nodes: BTreeMap<u64, CctNodeRecord>,
}

impl CctRecord {
    /// Node ids in breadth-first order starting from the root.
    ///
    /// Children are visited in insertion order, which makes report output
    /// stable across runs with identical call paths.
    pub fn bfs_ids(&self) -> Vec<u64> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = std::collections::VecDeque::new();
        if self.nodes.contains_key(&self.root_id) {
            queue.push_back(self.root_id);
        }
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(node) = self.nodes.get(&id) {
                for child in &node.child_ids {
                    queue.push_back(*child);
                }
            }
        }
        order
    }
}

/// The complete profiling report for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilingReport {
    /// Human-readable completion message
    pub message: String,

    /// Session start, nanoseconds since UNIX epoch
    pub start_time: u64,

    /// Session end (report assembly), nanoseconds since UNIX epoch
    pub end_time: u64,

    /// Non-fatal conditions observed during the session (e.g. back-pressure)
    pub warnings: Vec<String>,

    /// PC-sample blocks in the order they were drained
    pub blocks: Vec<PcSampleBlock>,

    /// One finalized CCT per kernel-launching (or sampled) thread
    pub trees: Vec<CctRecord>,
}

impl ProfilingReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time) / 1_000_000
    }

    /// Total GPU samples summed over every record of every block.
    pub fn total_gpu_samples(&self) -> u64 {
        self.blocks
            .iter()
            .flat_map(|b| b.records.iter())
            .map(|r| r.total_samples())
            .sum()
    }
}
