//! Per-GPU-context bookkeeping

use crate::gpu::driver::{ContextHandle, SamplingConfig, StallReasonTable};
use kernelscope_shared::PcSampleBlock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// State kept for one GPU context while PC sampling is enabled on it.
pub struct ContextInfo {
    pub handle: ContextHandle,

    /// Driver-assigned uid, filled in on the first launch callback
    pub uid: AtomicU32,

    /// Stall reasons supported by this context's GPU
    pub stall_reasons: StallReasonTable,

    /// Configuration the driver acknowledged for this context
    pub config: SamplingConfig,

    /// Provisioning buffer: receives records the driver flushes on its own
    /// (module reload, disable). Drained through the same tagging path.
    pub provisioning: Mutex<PcSampleBlock>,
}

impl ContextInfo {
    pub fn new(
        handle: ContextHandle,
        stall_reasons: StallReasonTable,
        config: SamplingConfig,
        provision_record_count: usize,
    ) -> Self {
        Self {
            handle,
            uid: AtomicU32::new(0),
            stall_reasons,
            config,
            provisioning: Mutex::new(PcSampleBlock::with_capacity(provision_record_count as u64)),
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Relaxed)
    }

    pub fn set_uid_once(&self, uid: u32) {
        let _ = self
            .uid
            .compare_exchange(0, uid, Ordering::Relaxed, Ordering::Relaxed);
    }
}

/// Live contexts plus the deferred-free list for destroyed ones.
///
/// Destroyed contexts keep their state alive until teardown: the consumer
/// may still hold blocks that reference their uid.
#[derive(Default)]
pub struct ContextRegistry {
    live: Mutex<HashMap<ContextHandle, Arc<ContextInfo>>>,
    retired: Mutex<Vec<Arc<ContextInfo>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: Arc<ContextInfo>) {
        self.live.lock().unwrap().insert(info.handle, info);
    }

    pub fn get(&self, handle: ContextHandle) -> Option<Arc<ContextInfo>> {
        self.live.lock().unwrap().get(&handle).cloned()
    }

    /// All live contexts, in stable handle order.
    pub fn all(&self) -> Vec<Arc<ContextInfo>> {
        let live = self.live.lock().unwrap();
        let mut contexts: Vec<_> = live.values().cloned().collect();
        contexts.sort_by_key(|c| c.handle);
        contexts
    }

    /// Move a destroyed context to the deferred-free list.
    pub fn retire(&self, handle: ContextHandle) -> Option<Arc<ContextInfo>> {
        let info = self.live.lock().unwrap().remove(&handle)?;
        self.retired.lock().unwrap().push(info.clone());
        Some(info)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}
