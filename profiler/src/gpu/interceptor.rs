//! Kernel-launch interception
//!
//! Receives the driver's callback stream. Launch enters drive attribution
//! (or duration timers in tracing mode); launch exits pull PC samples;
//! context and module lifecycle events manage per-context sampling state
//! and force drains around range boundaries.

use crate::attribution::AttributionEngine;
use crate::config::Config;
use crate::cpu::SamplerCollection;
use crate::gpu::consumer::{drain_context, flush_provisioning, pull_block, QueuedBlock};
use crate::gpu::context::{ContextInfo, ContextRegistry};
use crate::gpu::driver::{
    driver_expect, CallbackEvent, ContextHandle, PcSamplingDriver, SamplingConfig,
};
use crate::gpu::ring::PcRing;
use crate::sys;
use crate::threads::ThreadRegistry;
use crate::trace::TraceAccumulator;
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The launch/resource callback handler.
pub struct Interceptor {
    pub(crate) config: Arc<Config>,
    pub(crate) driver: Arc<dyn PcSamplingDriver>,
    pub(crate) attribution: Arc<AttributionEngine>,
    pub(crate) contexts: Arc<ContextRegistry>,
    pub(crate) ring: Arc<PcRing>,
    pub(crate) queue_tx: Sender<QueuedBlock>,
    pub(crate) threads: Arc<ThreadRegistry>,
    pub(crate) samplers: Arc<SamplerCollection>,
    pub(crate) tracer: Arc<TraceAccumulator>,
    pub(crate) sampling_active: Arc<AtomicBool>,
    pub(crate) tracing_active: Arc<AtomicBool>,
}

impl Interceptor {
    /// Entry point for every driver callback. Runs on the caller's thread
    /// and must stay in the microsecond range on the launch path.
    pub fn handle_callback(&self, event: &CallbackEvent) {
        match event {
            CallbackEvent::LaunchEnter {
                correlation_id,
                symbol_name,
                ..
            } => self.on_launch_enter(*correlation_id, symbol_name),
            CallbackEvent::LaunchExit {
                context,
                correlation_id,
            } => self.on_launch_exit(*context, *correlation_id),
            CallbackEvent::ContextCreated { context } => self.on_context_created(*context),
            CallbackEvent::ContextDestroyStarting { context } => self.on_context_destroy(*context),
            CallbackEvent::ModuleLoaded { context } => self.on_module_loaded(*context),
        }
    }

    fn on_launch_enter(&self, correlation_id: u32, symbol_name: &str) {
        let tid = sys::current_tid();
        if self.threads.register(tid, sys::current_pthread()) {
            self.samplers.register(tid);
        }

        if self.config.no_sampling {
            if self.config.do_cpu_unwind && self.tracing_active.load(Ordering::Acquire) {
                self.attribution.attribute_current_thread(self.config.verbose);
                let active = self.attribution.active().active_of(tid).unwrap_or(0);
                self.tracer.on_launch_enter(correlation_id, active, symbol_name);
            }
        } else if self.config.do_cpu_unwind && self.sampling_active.load(Ordering::Acquire) {
            self.attribution.attribute_current_thread(self.config.verbose);
        }
    }

    fn on_launch_exit(&self, context: ContextHandle, correlation_id: u32) {
        if self.config.no_sampling {
            if self.config.do_cpu_unwind && self.tracing_active.load(Ordering::Acquire) {
                self.tracer.on_launch_exit(correlation_id);
            }
            return;
        }
        if !self.sampling_active.load(Ordering::Acquire) {
            return;
        }

        let Some(info) = self.contexts.get(context) else {
            error!(context, "launch exit for unknown context; aborting");
            std::process::abort();
        };
        info.set_uid_once(context as u32);

        match self.config.collection_mode {
            // Each kernel is its own range: collect everything now.
            crate::config::CollectionMode::KernelSerialized => {
                drain_context(
                    self.driver.as_ref(),
                    &info,
                    &self.ring,
                    self.attribution.active(),
                    &self.queue_tx,
                );
            }
            // Pull only once a full block's worth of samples is waiting.
            crate::config::CollectionMode::Continuous => {
                let pending = driver_expect(self.driver.pending(info.handle), "pending");
                if pending.remaining_num_pcs >= self.ring.slot_capacity() {
                    pull_block(
                        self.driver.as_ref(),
                        &info,
                        &self.ring,
                        self.attribution.active(),
                        &self.queue_tx,
                    );
                }
            }
        }
    }

    fn on_context_created(&self, context: ContextHandle) {
        debug!(context, "context created, enabling pc sampling");
        driver_expect(self.driver.enable(context), "enable");

        let stall_count = driver_expect(self.driver.num_stall_reasons(context), "num_stall_reasons");
        let stall_reasons = driver_expect(self.driver.stall_reasons(context), "stall_reasons");
        debug!(context, stall_count, "stall reasons queried");

        let sampling_config = SamplingConfig {
            sampling_period: self.config.sampling_period,
            scratch_buf_size: self.config.scratch_buf_size,
            hw_buf_size: self.config.hw_buf_size,
            stall_reason_indexes: stall_reasons.indexes.clone(),
            collection_mode: self.config.collection_mode,
            // Self-driven sampling runs start to exit; everything else is
            // started and stopped by the session.
            enable_start_stop: !(self.config.no_rpc && !self.config.no_sampling),
        };
        driver_expect(self.driver.configure(context, &sampling_config), "configure");

        let info = Arc::new(ContextInfo::new(
            context,
            stall_reasons,
            sampling_config,
            self.config.provision_record_count,
        ));
        self.contexts.insert(info);
    }

    fn on_context_destroy(&self, context: ContextHandle) {
        debug!(context, "context destroy starting");
        let Some(info) = self.contexts.get(context) else {
            warn!(context, "destroyed context was not tracked");
            return;
        };

        drain_context(
            self.driver.as_ref(),
            &info,
            &self.ring,
            self.attribution.active(),
            &self.queue_tx,
        );
        driver_expect(self.driver.disable(context), "disable");
        // The driver may flush late hardware records after disable.
        flush_provisioning(
            self.driver.as_ref(),
            &info,
            self.attribution.active(),
            &self.queue_tx,
        );
        self.contexts.retire(context);
    }

    fn on_module_loaded(&self, context: ContextHandle) {
        // Records collected so far belong to the old module mapping; drain
        // them before the new range begins.
        debug!(context, "module loaded, draining stale range");
        let Some(info) = self.contexts.get(context) else {
            return;
        };
        drain_context(
            self.driver.as_ref(),
            &info,
            &self.ring,
            self.attribution.active(),
            &self.queue_tx,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::ActiveNodeTable;
    use crate::cct::CctStore;
    use crate::config::CollectionMode;
    use crate::gpu::mock::{sample_record, MockDriver};
    use crate::unwind::Unwinder;
    use crossbeam_channel::Receiver;

    struct Harness {
        driver: Arc<MockDriver>,
        interceptor: Interceptor,
        queue_rx: Receiver<QueuedBlock>,
    }

    fn harness(config: Config) -> Harness {
        let config = Arc::new(Config {
            cpu_sampling_period: 0, // no perf samplers in unit tests
            ..config
        });
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(CctStore::new());
        let active = Arc::new(ActiveNodeTable::new());
        let attribution = Arc::new(AttributionEngine::new(
            config.clone(),
            store,
            active,
            Unwinder::new(config.clone(), None),
            None,
        ));
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let interceptor = Interceptor {
            config: config.clone(),
            driver: driver.clone(),
            attribution,
            contexts: Arc::new(ContextRegistry::new()),
            ring: Arc::new(PcRing::new(config.ring_buf_count, config.ring_buf_size)),
            queue_tx,
            threads: Arc::new(ThreadRegistry::new()),
            samplers: Arc::new(SamplerCollection::new(config.clone())),
            tracer: Arc::new(TraceAccumulator::new()),
            sampling_active: Arc::new(AtomicBool::new(false)),
            tracing_active: Arc::new(AtomicBool::new(false)),
        };
        Harness {
            driver,
            interceptor,
            queue_rx,
        }
    }

    #[test]
    fn test_context_created_enables_and_configures() {
        let h = harness(Config::default());
        h.interceptor
            .handle_callback(&CallbackEvent::ContextCreated { context: 1 });

        assert!(h.driver.enabled(1));
        let config = h.driver.configured(1).unwrap();
        assert_eq!(config.stall_reason_indexes, vec![0, 1, 2, 3]);
        assert!(config.enable_start_stop);
        assert_eq!(h.interceptor.contexts.live_count(), 1);
    }

    #[test]
    fn test_launch_registers_thread_and_attributes() {
        let h = harness(Config::default());
        h.interceptor
            .handle_callback(&CallbackEvent::ContextCreated { context: 1 });
        h.interceptor.sampling_active.store(true, Ordering::Release);

        h.interceptor
            .handle_callback(&MockDriver::launch_enter(1, 100, "Kx"));

        assert_eq!(h.interceptor.threads.len(), 1);
        let tid = sys::current_tid();
        assert!(h.interceptor.attribution.active().active_of(tid).is_some());
    }

    #[test]
    fn test_serialized_exit_drains_and_tags() {
        let h = harness(Config {
            collection_mode: CollectionMode::KernelSerialized,
            ..Default::default()
        });
        h.interceptor
            .handle_callback(&CallbackEvent::ContextCreated { context: 1 });
        h.interceptor.sampling_active.store(true, Ordering::Release);

        h.interceptor
            .handle_callback(&MockDriver::launch_enter(1, 100, "Kx"));
        h.driver.push_samples(1, vec![sample_record("Kx", 0x8, 5)]);
        h.interceptor
            .handle_callback(&MockDriver::launch_exit(1, 100));

        assert_eq!(h.driver.queued_len(1), 0);
        let tid = sys::current_tid();
        let active = h.interceptor.attribution.active().active_of(tid).unwrap();
        match h.queue_rx.try_recv().unwrap() {
            QueuedBlock::Slot { index, .. } => h.interceptor.ring.with_block(index, |block| {
                assert_eq!(block.records[0].parent_node_id, active);
            }),
            QueuedBlock::Owned { .. } => panic!("expected ring slot"),
        }
    }

    #[test]
    fn test_continuous_exit_pulls_only_full_blocks() {
        let h = harness(Config {
            ring_buf_size: 4,
            ..Default::default()
        });
        h.interceptor
            .handle_callback(&CallbackEvent::ContextCreated { context: 1 });
        h.interceptor.sampling_active.store(true, Ordering::Release);

        h.driver.push_samples(1, vec![sample_record("Kx", 0x8, 1)]);
        h.interceptor
            .handle_callback(&MockDriver::launch_exit(1, 100));
        // Less than one block pending: nothing pulled.
        assert!(h.queue_rx.try_recv().is_err());

        let records: Vec<_> = (0..4).map(|i| sample_record("Kx", i, 1)).collect();
        h.driver.push_samples(1, records);
        h.interceptor
            .handle_callback(&MockDriver::launch_exit(1, 101));
        assert!(h.queue_rx.try_recv().is_ok());
    }

    #[test]
    fn test_module_load_drains_stale_range() {
        let h = harness(Config::default());
        h.interceptor
            .handle_callback(&CallbackEvent::ContextCreated { context: 1 });
        h.driver.push_samples(1, vec![sample_record("Kx", 0x8, 2)]);

        h.interceptor
            .handle_callback(&CallbackEvent::ModuleLoaded { context: 1 });

        assert_eq!(h.driver.queued_len(1), 0);
        assert!(h.queue_rx.try_recv().is_ok());
    }

    #[test]
    fn test_context_destroy_disables_and_retires() {
        let h = harness(Config::default());
        h.interceptor
            .handle_callback(&CallbackEvent::ContextCreated { context: 1 });
        h.driver.push_samples(1, vec![sample_record("Kx", 0x8, 2)]);

        h.interceptor
            .handle_callback(&CallbackEvent::ContextDestroyStarting { context: 1 });

        assert!(!h.driver.enabled(1));
        assert_eq!(h.interceptor.contexts.live_count(), 0);
        assert_eq!(h.driver.queued_len(1), 0);
    }

    #[test]
    fn test_tracing_mode_accumulates_durations() {
        let h = harness(Config {
            no_sampling: true,
            ..Default::default()
        });
        h.interceptor.tracing_active.store(true, Ordering::Release);

        for correlation in [1u32, 2] {
            h.interceptor
                .handle_callback(&MockDriver::launch_enter(1, correlation, "Kx"));
            std::thread::sleep(std::time::Duration::from_millis(2));
            h.interceptor
                .handle_callback(&MockDriver::launch_exit(1, correlation));
        }

        let records = h.interceptor.tracer.export();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].func_name, "Kx");
        assert!(records[0].duration_us >= 4_000);
    }

    #[test]
    fn test_inactive_sampling_ignores_launches() {
        let h = harness(Config::default());
        h.interceptor
            .handle_callback(&CallbackEvent::ContextCreated { context: 1 });

        h.interceptor
            .handle_callback(&MockDriver::launch_enter(1, 1, "Kx"));
        let tid = sys::current_tid();
        assert!(h.interceptor.attribution.active().active_of(tid).is_none());
    }
}
