//! In-memory driver used by the test suite
//!
//! Behaves like the vendor API from the core's point of view: records are
//! queued per context by the test and drained through `get_data` in FIFO
//! order, with the pending counters a real driver would report.

use crate::gpu::driver::{
    CallbackEvent, ContextHandle, DriverError, PcSamplingDriver, PendingCounts, SamplingConfig,
    StallReasonTable,
};
use kernelscope_shared::{PcSampleBlock, PcSampleRecord};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct MockContext {
    enabled: bool,
    started: bool,
    config: Option<SamplingConfig>,
    queued: VecDeque<PcSampleRecord>,
    range_id: u64,
}

/// Scriptable in-memory [`PcSamplingDriver`].
#[derive(Default)]
pub struct MockDriver {
    contexts: Mutex<HashMap<ContextHandle, MockContext>>,
    sync_count: AtomicU64,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue records the driver will hand back on subsequent `get_data`s.
    pub fn push_samples(&self, ctx: ContextHandle, records: Vec<PcSampleRecord>) {
        let mut contexts = self.contexts.lock().unwrap();
        contexts.entry(ctx).or_default().queued.extend(records);
    }

    pub fn enabled(&self, ctx: ContextHandle) -> bool {
        self.contexts
            .lock()
            .unwrap()
            .get(&ctx)
            .is_some_and(|c| c.enabled)
    }

    pub fn started(&self, ctx: ContextHandle) -> bool {
        self.contexts
            .lock()
            .unwrap()
            .get(&ctx)
            .is_some_and(|c| c.started)
    }

    pub fn configured(&self, ctx: ContextHandle) -> Option<SamplingConfig> {
        self.contexts
            .lock()
            .unwrap()
            .get(&ctx)
            .and_then(|c| c.config.clone())
    }

    pub fn queued_len(&self, ctx: ContextHandle) -> usize {
        self.contexts
            .lock()
            .unwrap()
            .get(&ctx)
            .map_or(0, |c| c.queued.len())
    }

    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::Relaxed)
    }

    /// Convenience constructors for the callback events a driver delivers.
    pub fn launch_enter(ctx: ContextHandle, correlation_id: u32, symbol: &str) -> CallbackEvent {
        CallbackEvent::LaunchEnter {
            context: ctx,
            correlation_id,
            symbol_name: symbol.to_string(),
        }
    }

    pub fn launch_exit(ctx: ContextHandle, correlation_id: u32) -> CallbackEvent {
        CallbackEvent::LaunchExit {
            context: ctx,
            correlation_id,
        }
    }
}

impl PcSamplingDriver for MockDriver {
    fn enable(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        self.contexts.lock().unwrap().entry(ctx).or_default().enabled = true;
        Ok(())
    }

    fn disable(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        let mut contexts = self.contexts.lock().unwrap();
        let state = contexts
            .get_mut(&ctx)
            .ok_or(DriverError::UnknownContext(ctx))?;
        state.enabled = false;
        state.started = false;
        Ok(())
    }

    fn num_stall_reasons(&self, _ctx: ContextHandle) -> Result<usize, DriverError> {
        Ok(4)
    }

    fn stall_reasons(&self, _ctx: ContextHandle) -> Result<StallReasonTable, DriverError> {
        Ok(StallReasonTable {
            names: vec![
                "memory_dependency".to_string(),
                "execution_dependency".to_string(),
                "pipe_busy".to_string(),
                "not_selected".to_string(),
            ],
            indexes: vec![0, 1, 2, 3],
        })
    }

    fn configure(&self, ctx: ContextHandle, config: &SamplingConfig) -> Result<(), DriverError> {
        let mut contexts = self.contexts.lock().unwrap();
        let state = contexts
            .get_mut(&ctx)
            .ok_or(DriverError::UnknownContext(ctx))?;
        if !state.enabled {
            return Err(DriverError::InvalidAttribute(
                "configure before enable".to_string(),
            ));
        }
        state.config = Some(config.clone());
        Ok(())
    }

    fn start(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        let mut contexts = self.contexts.lock().unwrap();
        let state = contexts
            .get_mut(&ctx)
            .ok_or(DriverError::UnknownContext(ctx))?;
        state.started = true;
        Ok(())
    }

    fn stop(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        let mut contexts = self.contexts.lock().unwrap();
        let state = contexts
            .get_mut(&ctx)
            .ok_or(DriverError::UnknownContext(ctx))?;
        state.started = false;
        Ok(())
    }

    fn pending(&self, ctx: ContextHandle) -> Result<PendingCounts, DriverError> {
        let contexts = self.contexts.lock().unwrap();
        let state = contexts.get(&ctx).ok_or(DriverError::UnknownContext(ctx))?;
        Ok(PendingCounts {
            total_num_pcs: 0,
            remaining_num_pcs: state.queued.len() as u64,
        })
    }

    fn get_data(&self, ctx: ContextHandle, block: &mut PcSampleBlock) -> Result<(), DriverError> {
        let mut contexts = self.contexts.lock().unwrap();
        let state = contexts
            .get_mut(&ctx)
            .ok_or(DriverError::UnknownContext(ctx))?;

        let take = (block.collect_num_pcs as usize).min(state.queued.len());
        for _ in 0..take {
            let record = state.queued.pop_front().expect("bounded by len");
            block.total_samples += record.total_samples();
            block.records.push(record);
        }
        block.total_num_pcs = take as u64;
        block.remaining_num_pcs = state.queued.len() as u64;
        block.range_id = state.range_id;
        state.range_id += 1;
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DriverError> {
        self.sync_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A PC record with one stall-reason entry, for test scripting.
pub fn sample_record(function_name: &str, pc_offset: u64, samples: u64) -> PcSampleRecord {
    PcSampleRecord {
        cubin_crc: 0xc0de,
        pc_offset,
        function_index: 0,
        function_name: function_name.to_string(),
        parent_node_id: 0,
        stall_reasons: vec![kernelscope_shared::StallReasonSample { index: 0, samples }],
    }
}
