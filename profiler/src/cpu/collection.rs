//! The process-wide set of CPU samplers and its collection loop

use crate::attribution::AttributionEngine;
use crate::config::Config;
use crate::cpu::sampler::{CallStack, CpuSampler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// tid → sampler, with session-wide enable/disable.
pub struct SamplerCollection {
    config: Arc<Config>,
    samplers: Mutex<HashMap<i32, CpuSampler>>,
    running: AtomicBool,
}

impl SamplerCollection {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            samplers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Open a sampler for a newly observed kernel-launching thread.
    ///
    /// A zero sampling period disables CPU sampling entirely. An open
    /// failure is resource exhaustion: profiling data would silently lose
    /// its CPU dimension, so the profiler terminates.
    pub fn register(&self, tid: i32) {
        if self.config.cpu_sampling_period == 0 {
            return;
        }
        let mut samplers = self.samplers.lock().unwrap();
        if samplers.contains_key(&tid) {
            return;
        }
        match CpuSampler::open(
            tid,
            self.config.cpu_sampling_period,
            self.config.cpu_sampling_pages,
        ) {
            Ok(sampler) => {
                samplers.insert(tid, sampler);
            }
            Err(err) => {
                error!(tid, "failed to open cpu sampler: {err:#}; aborting");
                std::process::abort();
            }
        }
    }

    /// Drop the sampler of an exited thread.
    pub fn remove(&self, tid: i32) {
        self.samplers.lock().unwrap().remove(&tid);
    }

    pub fn sampler_count(&self) -> usize {
        self.samplers.lock().unwrap().len()
    }

    pub fn enable_sampling(&self) {
        let samplers = self.samplers.lock().unwrap();
        for sampler in samplers.values() {
            sampler.enable();
        }
        self.running.store(true, Ordering::Release);
        debug!(count = samplers.len(), "cpu sampling enabled");
    }

    pub fn disable_sampling(&self) {
        let samplers = self.samplers.lock().unwrap();
        for sampler in samplers.values() {
            sampler.disable();
        }
        self.running.store(false, Ordering::Release);
        debug!("cpu sampling disabled");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One collection pass over every sampler.
    pub fn collect_round(&self) -> Vec<(i32, CallStack)> {
        let mut collected = Vec::new();
        let mut samplers = self.samplers.lock().unwrap();
        for (tid, sampler) in samplers.iter_mut() {
            match sampler.collect_one(
                self.config.cpu_sampling_timeout_ms,
                self.config.cpu_sampling_max_depth,
            ) {
                Ok(Some(stack)) => collected.push((*tid, stack)),
                Ok(None) => {}
                Err(err) => debug!(tid, "cpu sample collection failed: {err:#}"),
            }
        }
        collected
    }
}

/// Background loop: route every collected stack into the target thread's
/// tree. Runs while the collection is enabled.
pub fn run_sampler_loop(collection: Arc<SamplerCollection>, attribution: Arc<AttributionEngine>) {
    debug!("cpu sampler loop started");
    while collection.is_running() {
        let round = collection.collect_round();
        for (tid, stack) in round {
            attribution.attribute_sampled_stack(tid, &stack.pcs, &stack.func_names);
        }
        if collection.sampler_count() == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    debug!("cpu sampler loop exiting");
}
