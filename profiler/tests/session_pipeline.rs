//! Session lifecycle: full profile → report → dump/load round trip,
//! tracing mode, and request rejection.

mod common;

use common::{launch, scenario, scenario_config, wait_tracing_active};
use kernelscope_profiler::report::TRACING_DURATION_STALL_INDEX;
use kernelscope_profiler::session::SessionError;
use kernelscope_profiler::{profile, Config};
use kernelscope_shared::protocol::wire::{dump_report, load_report};
use std::time::Duration;

#[test]
fn full_session_report_roundtrips_through_disk() {
    let s = scenario(scenario_config());

    let session = {
        let engine = s.engine.clone();
        std::thread::spawn(move || profile(&engine, 300).expect("session succeeds"))
    };
    common::wait_sampling_active(&s.engine);
    for correlation in 0..4u32 {
        launch(&s, correlation, "Kgemm", 2);
    }
    let report = session.join().expect("session thread");

    assert_eq!(report.message, "pc sampling completed");
    assert_eq!(report.total_gpu_samples(), 8);
    assert_eq!(report.trees.len(), 1);
    // The session slept 300ms between the timestamps; clamp loosely for
    // scheduler noise.
    assert!(report.end_time > report.start_time);
    assert!(report.duration_ms() >= 250);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("report.bin");
    dump_report(&report, &path).expect("dump succeeds");
    let loaded = load_report(&path).expect("load succeeds");

    assert_eq!(loaded.message, report.message);
    assert_eq!(loaded.start_time, report.start_time);
    assert_eq!(loaded.end_time, report.end_time);
    assert_eq!(loaded.blocks.len(), report.blocks.len());
    assert_eq!(loaded.trees.len(), report.trees.len());
    assert_eq!(loaded.total_gpu_samples(), report.total_gpu_samples());
}

#[test]
fn non_positive_duration_is_cancelled() {
    let s = scenario(scenario_config());

    let err = profile(&s.engine, 0).expect_err("zero duration rejected");
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::Cancelled)
    ));
    let err = profile(&s.engine, -5).expect_err("negative duration rejected");
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::Cancelled)
    ));
}

#[test]
fn overlapping_sessions_are_rejected() {
    let s = scenario(scenario_config());

    let session = {
        let engine = s.engine.clone();
        std::thread::spawn(move || profile(&engine, 300))
    };
    common::wait_sampling_active(&s.engine);

    let err = profile(&s.engine, 100).expect_err("second session rejected");
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::Busy)
    ));

    assert!(session.join().expect("session thread").is_ok());
}

// Tracing mode: two kernels from the same call site accumulate their
// durations on one `<active-node>::<kernel>` record.
#[test]
fn tracing_mode_accumulates_same_call_site_durations() {
    let s = scenario(Config {
        no_sampling: true,
        ..scenario_config()
    });

    let session = {
        let engine = s.engine.clone();
        std::thread::spawn(move || profile(&engine, 400).expect("session succeeds"))
    };
    wait_tracing_active(&s.engine);

    for (correlation, sleep_ms) in [(1u32, 1u64), (2, 2)] {
        s.engine.handle_callback(
            &kernelscope_profiler::gpu::mock::MockDriver::launch_enter(1, correlation, "Kx"),
        );
        std::thread::sleep(Duration::from_millis(sleep_ms));
        s.engine
            .handle_callback(&kernelscope_profiler::gpu::mock::MockDriver::launch_exit(
                1,
                correlation,
            ));
    }
    let report = session.join().expect("session thread");

    assert_eq!(report.message, "profiling completed");
    assert_eq!(report.blocks.len(), 1);
    let block = &report.blocks[0];
    assert_eq!(block.records.len(), 1, "one record per (path, kernel) pair");

    let record = &block.records[0];
    assert_eq!(record.function_name, "Kx");
    assert_ne!(record.parent_node_id, 0);
    assert_eq!(record.stall_reasons[0].index, TRACING_DURATION_STALL_INDEX);
    // ~3ms accumulated, allow generous scheduler overhead.
    assert!(record.stall_reasons[0].samples >= 3_000);
    assert!(record.stall_reasons[0].samples < 300_000);
}

// Pruned reports keep sample tags resolvable: every tagged node survives
// pruning (leaves are always critical).
#[test]
fn pruned_report_keeps_tagged_leaves() {
    let s = scenario(Config {
        prune_cct: true,
        ..scenario_config()
    });

    let session = {
        let engine = s.engine.clone();
        std::thread::spawn(move || profile(&engine, 300).expect("session succeeds"))
    };
    common::wait_sampling_active(&s.engine);
    for correlation in 0..2u32 {
        launch(&s, correlation, "Kx", 1);
    }
    let report = session.join().expect("session thread");

    let tree = &report.trees[0];
    for record in report.blocks.iter().flat_map(|b| b.records.iter()) {
        assert!(
            tree.nodes.contains_key(&record.parent_node_id),
            "tag {} survives pruning",
            record.parent_node_id
        );
    }
}
