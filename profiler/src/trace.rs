//! Kernel-duration tracing (the no-sampling alternative to PC sampling)
//!
//! Each launch enter/exit pair contributes elapsed wall-clock time to a
//! per-(active-node, kernel-name) accumulator. In-flight launches are keyed
//! by the driver's correlation id so overlapping launches of the same kernel
//! from the same context cannot double-count.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// One accumulated tracing record.
#[derive(Debug, Clone)]
pub struct TracingRecord {
    /// CCT node that was active at launch enter (the call path)
    pub parent_node_id: u64,

    /// Kernel name
    pub func_name: String,

    /// Accumulated execution time in microseconds
    pub duration_us: u64,
}

#[derive(Default)]
struct TraceState {
    /// `<parent_node_id>::<kernel>` → accumulated record
    records: HashMap<String, TracingRecord>,
    /// correlation id → (record key, enter timestamp)
    inflight: HashMap<u32, (String, Instant)>,
}

/// Accumulator for tracing mode.
#[derive(Default)]
pub struct TraceAccumulator {
    state: Mutex<TraceState>,
}

impl TraceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing one launch.
    pub fn on_launch_enter(&self, correlation_id: u32, parent_node_id: u64, kernel: &str) {
        let key = format!("{}::{}", parent_node_id, kernel);
        let mut state = self.state.lock().unwrap();
        if !state.records.contains_key(&key) {
            debug!(key, "adding tracing record");
            state.records.insert(
                key.clone(),
                TracingRecord {
                    parent_node_id,
                    func_name: kernel.to_string(),
                    duration_us: 0,
                },
            );
        }
        state.inflight.insert(correlation_id, (key, Instant::now()));
    }

    /// Stop timing and accumulate onto the record started at enter.
    pub fn on_launch_exit(&self, correlation_id: u32) {
        let mut state = self.state.lock().unwrap();
        let Some((key, started)) = state.inflight.remove(&correlation_id) else {
            debug!(correlation_id, "correlation id not recorded at launch enter");
            return;
        };
        let elapsed_us = started.elapsed().as_micros() as u64;
        if let Some(record) = state.records.get_mut(&key) {
            record.duration_us += elapsed_us;
        }
    }

    /// Snapshot all accumulated records, sorted by key for determinism.
    pub fn export(&self) -> Vec<TracingRecord> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<&String> = state.records.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| state.records[k.as_str()].clone())
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_same_call_site_accumulates() {
        let tracer = TraceAccumulator::new();

        tracer.on_launch_enter(1, 42, "Kx");
        std::thread::sleep(Duration::from_millis(2));
        tracer.on_launch_exit(1);

        tracer.on_launch_enter(2, 42, "Kx");
        std::thread::sleep(Duration::from_millis(2));
        tracer.on_launch_exit(2);

        let records = tracer.export();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].parent_node_id, 42);
        assert_eq!(records[0].func_name, "Kx");
        assert!(records[0].duration_us >= 4_000);
    }

    #[test]
    fn test_distinct_call_paths_distinct_records() {
        let tracer = TraceAccumulator::new();
        tracer.on_launch_enter(1, 42, "Kx");
        tracer.on_launch_exit(1);
        tracer.on_launch_enter(2, 43, "Kx");
        tracer.on_launch_exit(2);

        assert_eq!(tracer.record_count(), 2);
    }

    #[test]
    fn test_exit_without_enter_is_ignored() {
        let tracer = TraceAccumulator::new();
        tracer.on_launch_exit(99);
        assert_eq!(tracer.record_count(), 0);
    }

    #[test]
    fn test_overlapping_same_key_launches() {
        let tracer = TraceAccumulator::new();
        tracer.on_launch_enter(1, 7, "Kx");
        tracer.on_launch_enter(2, 7, "Kx");
        std::thread::sleep(Duration::from_millis(1));
        tracer.on_launch_exit(1);
        tracer.on_launch_exit(2);

        let records = tracer.export();
        assert_eq!(records.len(), 1);
        // Both launches contributed.
        assert!(records[0].duration_us >= 2_000);
    }
}
