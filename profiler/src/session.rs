//! Profiling session orchestration
//!
//! One session = start sampling everywhere, let the workload run for the
//! requested duration, stop, drain, and assemble the report. This is the
//! function an RPC layer calls; the self-driven (no-RPC) mode runs the same
//! machinery from initialization to process exit.

use crate::cpu::collection::run_sampler_loop;
use crate::gpu::consumer::{drain_context, flush_provisioning, run_consumer};
use crate::gpu::driver::driver_expect;
use crate::report;
use crate::sys;
use crate::Engine;
use anyhow::Result;
use kernelscope_shared::utils::time::system_time_nanos;
use kernelscope_shared::ProfilingReport;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Pause between polls of the start/stop flags.
const POLL: Duration = Duration::from_micros(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cancelled: duration must be a positive number of milliseconds")]
    Cancelled,

    #[error("a profiling session is already running")]
    Busy,
}

/// Run one timed profiling session and return its report.
///
/// Rejects non-positive durations and overlapping sessions.
pub fn profile(engine: &Arc<Engine>, duration_ms: i64) -> Result<ProfilingReport> {
    if duration_ms <= 0 {
        warn!(duration_ms, "rejecting profiling request");
        return Err(SessionError::Cancelled.into());
    }
    if engine.session_busy.swap(true, Ordering::AcqRel) {
        return Err(SessionError::Busy.into());
    }
    let result = run_session(engine, duration_ms as u64);
    engine.session_busy.store(false, Ordering::Release);
    result
}

fn run_session(engine: &Arc<Engine>, duration_ms: u64) -> Result<ProfilingReport> {
    info!(duration_ms, "profiling session starting");
    let start_time = system_time_nanos();

    // Launcher threads may have exited since the last session.
    for tid in engine.threads.reap_dead() {
        engine.samplers.remove(tid);
    }

    let mut consumer = None;
    if engine.config.no_sampling {
        engine.tracing_active.store(true, Ordering::Release);
    } else {
        engine.collected.lock().unwrap().clear();

        if engine.config.sync_before_start && !engine.threads.is_empty() {
            // Freeze every launcher at a device-synced point; the selected
            // one starts sampling once all are synced.
            for handle in engine.threads.handles() {
                sys::kill_thread(handle, libc::SIGUSR1);
            }
        } else {
            start_sampling_all(engine);
        }
        while !engine.sampling_active.load(Ordering::Acquire) {
            std::thread::sleep(POLL);
        }

        let (rx, ring) = (engine.queue_rx.clone(), engine.ring.clone());
        let (sink, active) = (engine.collected.clone(), engine.sampling_active.clone());
        consumer = Some(
            std::thread::Builder::new()
                .name("kscope-pc-consumer".to_string())
                .spawn(move || run_consumer(rx, ring, sink, active))
                .expect("failed to spawn pc consumer"),
        );
    }

    engine.samplers.enable_sampling();
    let sampler_loop = {
        let (collection, attribution) = (engine.samplers.clone(), engine.attribution.clone());
        std::thread::Builder::new()
            .name("kscope-cpu-loop".to_string())
            .spawn(move || run_sampler_loop(collection, attribution))
            .expect("failed to spawn cpu sampler loop")
    };

    std::thread::sleep(Duration::from_millis(duration_ms));

    engine.samplers.disable_sampling();

    if engine.config.no_sampling {
        engine.tracing_active.store(false, Ordering::Release);
    } else if engine.config.sync_before_start && !engine.threads.is_empty() {
        for handle in engine.threads.handles() {
            sys::kill_thread(handle, libc::SIGUSR2);
        }
        while engine.sampling_active.load(Ordering::Acquire) {
            std::thread::sleep(POLL);
        }
    } else {
        stop_sampling_all(engine);
    }

    if let Some(handle) = consumer {
        let _ = handle.join();
    }
    let _ = sampler_loop.join();

    let (blocks, message) = if engine.config.no_sampling {
        (
            vec![report::tracing_block(&engine.tracer.export())],
            "profiling completed",
        )
    } else {
        (
            std::mem::take(&mut *engine.collected.lock().unwrap()),
            "pc sampling completed",
        )
    };

    Ok(report::assemble_report(
        &engine.config,
        &engine.store,
        blocks,
        engine.ring.backpressure_hit(),
        message,
        start_time,
    ))
}

/// Start PC sampling for every live context, then publish the flag.
pub(crate) fn start_sampling_all(engine: &Engine) {
    for info in engine.contexts.all() {
        info!(context = info.uid(), "starting pc sampling");
        driver_expect(engine.driver.start(info.handle), "start");
    }
    engine.sampling_active.store(true, Ordering::Release);
}

/// Stop PC sampling everywhere: drain once to clear the hardware, stop,
/// drain again for records the driver flushes at stop.
pub(crate) fn stop_sampling_all(engine: &Engine) {
    if !engine.sampling_active.load(Ordering::Acquire) {
        return;
    }
    collect_all_pending(engine);
    for info in engine.contexts.all() {
        info!(context = info.uid(), "stopping pc sampling");
        driver_expect(engine.driver.stop(info.handle), "stop");
    }
    collect_all_pending(engine);

    if engine.ring.backpressure_hit() {
        warn!("{}", report::BACKPRESSURE_WARNING);
    }
    engine.sampling_active.store(false, Ordering::Release);
}

/// Drain every live context to empty.
pub(crate) fn collect_all_pending(engine: &Engine) {
    for info in engine.contexts.all() {
        drain_context(
            engine.driver.as_ref(),
            &info,
            &engine.ring,
            &engine.active,
            &engine.queue_tx,
        );
    }
}

/// No-RPC mode: sampling runs from initialization until process exit.
pub(crate) fn start_self_driven(engine: &Arc<Engine>) {
    engine.session_start_ns.store(system_time_nanos(), Ordering::Release);
    engine.sampling_active.store(true, Ordering::Release);
    engine.tracing_active.store(true, Ordering::Release);
    engine.samplers.enable_sampling();

    let mut background = engine.background.lock().unwrap();
    if !engine.config.no_sampling {
        let (rx, ring) = (engine.queue_rx.clone(), engine.ring.clone());
        let (sink, active) = (engine.collected.clone(), engine.sampling_active.clone());
        background.push(
            std::thread::Builder::new()
                .name("kscope-pc-consumer".to_string())
                .spawn(move || run_consumer(rx, ring, sink, active))
                .expect("failed to spawn pc consumer"),
        );
    }
    let (collection, attribution) = (engine.samplers.clone(), engine.attribution.clone());
    background.push(
        std::thread::Builder::new()
            .name("kscope-cpu-loop".to_string())
            .spawn(move || run_sampler_loop(collection, attribution))
            .expect("failed to spawn cpu sampler loop"),
    );
}

/// Process-exit teardown, registered as an at-exit hook.
///
/// In no-RPC mode this finalizes the self-driven session and dumps the
/// report; otherwise it only quiesces the driver side (the RPC layer owns
/// session lifecycle).
pub(crate) fn shutdown(engine: &Arc<Engine>) {
    info!("profiler teardown");

    if let Some(courier) = &engine.courier {
        courier.stop();
    }

    if engine.config.no_rpc {
        engine.samplers.disable_sampling();
        if engine.config.no_sampling {
            engine.tracing_active.store(false, Ordering::Release);
            engine.sampling_active.store(false, Ordering::Release);
        } else {
            stop_sampling_all(engine);
        }
    }

    // Disable every remaining context, catching late flushes.
    for info in engine.contexts.all() {
        drain_context(
            engine.driver.as_ref(),
            &info,
            &engine.ring,
            &engine.active,
            &engine.queue_tx,
        );
        driver_expect(engine.driver.disable(info.handle), "disable");
        flush_provisioning(
            engine.driver.as_ref(),
            &info,
            &engine.active,
            &engine.queue_tx,
        );
        engine.contexts.retire(info.handle);
    }

    if engine.ring.backpressure_hit() {
        warn!("{}", report::BACKPRESSURE_WARNING);
    }

    if !engine.config.no_rpc {
        return;
    }

    for handle in engine.background.lock().unwrap().drain(..) {
        let _ = handle.join();
    }

    // The consumer exited when sampling stopped; late flushes queued after
    // that are appended here.
    while let Ok(queued) = engine.queue_rx.try_recv() {
        crate::gpu::consumer::append(&engine.ring, &engine.collected, queued);
    }

    let (blocks, message) = if engine.config.no_sampling {
        (
            vec![report::tracing_block(&engine.tracer.export())],
            "profiling completed",
        )
    } else {
        (
            std::mem::take(&mut *engine.collected.lock().unwrap()),
            "profiling completed",
        )
    };
    let report = report::assemble_report(
        &engine.config,
        &engine.store,
        blocks,
        engine.ring.backpressure_hit(),
        message,
        engine.session_start_ns.load(Ordering::Acquire),
    );
    match kernelscope_shared::protocol::wire::dump_report(&report, &engine.config.dump_file) {
        Ok(()) => info!(path = %engine.config.dump_file, "report dumped"),
        Err(err) => warn!("failed to dump report: {err:#}"),
    }
}
