//! Shared harness for the integration scenarios
#![allow(dead_code)]

use kernelscope_profiler::config::CollectionMode;
use kernelscope_profiler::gpu::driver::CallbackEvent;
use kernelscope_profiler::gpu::mock::{sample_record, MockDriver};
use kernelscope_profiler::{Config, Engine};
use kernelscope_shared::CctRecord;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Base configuration for scenario tests: no perf samplers, no pruning,
/// drain on every launch exit.
pub fn scenario_config() -> Config {
    Config {
        cpu_sampling_period: 0,
        prune_cct: false,
        collection_mode: CollectionMode::KernelSerialized,
        ..Default::default()
    }
}

pub struct Scenario {
    pub driver: Arc<MockDriver>,
    pub engine: Arc<Engine>,
}

pub fn scenario(config: Config) -> Scenario {
    let driver = Arc::new(MockDriver::new());
    let engine = Engine::new(config, driver.clone(), None).expect("engine builds");
    engine.handle_callback(&CallbackEvent::ContextCreated { context: 1 });
    Scenario { driver, engine }
}

/// Block until the engine reports an active sampling session.
pub fn wait_sampling_active(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !engine.is_sampling_active() {
        assert!(Instant::now() < deadline, "sampling never became active");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Block until the engine reports an active tracing session.
pub fn wait_tracing_active(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !engine.is_tracing_active() {
        assert!(Instant::now() < deadline, "tracing never became active");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// One kernel launch with `samples` GPU PC records behind it.
pub fn launch(
    scenario: &Scenario,
    correlation_id: u32,
    kernel: &str,
    samples: u64,
) {
    scenario
        .engine
        .handle_callback(&MockDriver::launch_enter(1, correlation_id, kernel));
    if samples > 0 {
        scenario
            .driver
            .push_samples(1, vec![sample_record(kernel, 0x40, samples)]);
    }
    scenario
        .engine
        .handle_callback(&MockDriver::launch_exit(1, correlation_id));
}

/// Tree invariants every report must satisfy: distinct child pcs per
/// parent, and ids growing down every edge.
pub fn assert_tree_invariants(tree: &CctRecord) {
    for node in tree.nodes.values() {
        let mut pcs = node.child_pcs.clone();
        pcs.sort_unstable();
        pcs.dedup();
        assert_eq!(
            pcs.len(),
            node.child_ids.len(),
            "duplicate child pc under node {}",
            node.id
        );
        for child in &node.child_ids {
            assert!(node.id < *child, "child {child} not newer than parent {}", node.id);
        }
    }
}
