//! GPU vendor driver seam
//!
//! The vendor PC-sampling API is an external collaborator: an opaque driver
//! that fills caller-provided buffers with PC-sample records and delivers
//! launch/resource callbacks. This module is the entire surface the core
//! depends on; the real CUPTI binding implements [`PcSamplingDriver`] and
//! forwards its C callbacks as [`CallbackEvent`]s.

use kernelscope_shared::PcSampleBlock;
use thiserror::Error;

/// Opaque handle identifying one GPU context.
pub type ContextHandle = u64;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver call failed: {0}")]
    CallFailed(String),

    #[error("unknown context {0}")]
    UnknownContext(ContextHandle),

    #[error("driver rejected configuration attribute: {0}")]
    InvalidAttribute(String),
}

/// Stall reason names and driver-assigned indexes for one context's GPU.
#[derive(Debug, Clone, Default)]
pub struct StallReasonTable {
    pub names: Vec<String>,
    pub indexes: Vec<u32>,
}

impl StallReasonTable {
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

/// How the driver batches PC samples for retrieval.
pub use crate::config::CollectionMode;

/// PC sampling configuration handed to the driver per context.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Sampling period exponent; None keeps the driver default
    pub sampling_period: Option<u32>,

    /// Scratch buffer bytes; None keeps the driver default
    pub scratch_buf_size: Option<u64>,

    /// Hardware buffer bytes; None keeps the driver default
    pub hw_buf_size: Option<u64>,

    /// Stall reasons to sample (all supported ones by default)
    pub stall_reason_indexes: Vec<u32>,

    pub collection_mode: CollectionMode,

    /// Whether sampling waits for an explicit start() after enable()
    pub enable_start_stop: bool,
}

/// Records pending on the driver side for one context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingCounts {
    /// Records already flushed into the provisioning buffer
    pub total_num_pcs: u64,

    /// Records still held back by the driver
    pub remaining_num_pcs: u64,
}

impl PendingCounts {
    pub fn any(&self) -> bool {
        self.total_num_pcs > 0 || self.remaining_num_pcs > 0
    }
}

/// Callback events delivered by the driver's subscription machinery.
///
/// All kernel-launch variants collapse into the launch pair; resource
/// events carry only the owning context.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    LaunchEnter {
        context: ContextHandle,
        correlation_id: u32,
        symbol_name: String,
    },
    LaunchExit {
        context: ContextHandle,
        correlation_id: u32,
    },
    ContextCreated {
        context: ContextHandle,
    },
    ContextDestroyStarting {
        context: ContextHandle,
    },
    ModuleLoaded {
        context: ContextHandle,
    },
}

/// The vendor PC-sampling API.
pub trait PcSamplingDriver: Send + Sync {
    fn enable(&self, ctx: ContextHandle) -> Result<(), DriverError>;

    fn disable(&self, ctx: ContextHandle) -> Result<(), DriverError>;

    fn num_stall_reasons(&self, ctx: ContextHandle) -> Result<usize, DriverError>;

    fn stall_reasons(&self, ctx: ContextHandle) -> Result<StallReasonTable, DriverError>;

    fn configure(&self, ctx: ContextHandle, config: &SamplingConfig) -> Result<(), DriverError>;

    fn start(&self, ctx: ContextHandle) -> Result<(), DriverError>;

    fn stop(&self, ctx: ContextHandle) -> Result<(), DriverError>;

    /// Records currently pending for `ctx`.
    fn pending(&self, ctx: ContextHandle) -> Result<PendingCounts, DriverError>;

    /// Drain up to `block.collect_num_pcs` records into `block`, updating
    /// its counters. The caller resets the block beforehand.
    fn get_data(&self, ctx: ContextHandle, block: &mut PcSampleBlock) -> Result<(), DriverError>;

    /// Block until outstanding device work finishes (sync barrier).
    fn synchronize(&self) -> Result<(), DriverError>;
}

/// Unwrap a driver result or terminate.
///
/// Profiling data would be unreliable past a failed driver call, so the
/// profiler logs the call and aborts rather than limping on.
pub(crate) fn driver_expect<T>(result: Result<T, DriverError>, call: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::error!("{call} failed: {err}; aborting");
            std::process::abort();
        }
    }
}
