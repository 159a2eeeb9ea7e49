//! Signal plumbing
//!
//! SIGUSR1 carries two meanings, discriminated by courier state: a pending
//! remote-unwind request parks the receiving (main) thread; otherwise it is
//! the start-sampling barrier for kernel-launching threads. SIGUSR2 is the
//! stop barrier. Barrier handlers device-synchronize, mark themselves
//! synced, and the elected thread performs the actual start/stop once every
//! launcher has synced.

use crate::courier;
use crate::gpu::driver::driver_expect;
use crate::session::{start_sampling_all, stop_sampling_all};
use crate::sys;
use crate::Engine;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Engine pointer the handlers read. Replacing it leaks the previous
/// engine intentionally: a handler may still be dereferencing it.
static SIGNAL_ENGINE: AtomicPtr<Engine> = AtomicPtr::new(std::ptr::null_mut());

fn signal_engine() -> Option<&'static Engine> {
    let ptr = SIGNAL_ENGINE.load(Ordering::SeqCst);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Install the SIGUSR1/SIGUSR2 handlers and point them at `engine`.
pub fn install(engine: &Arc<Engine>) {
    let raw = Arc::into_raw(engine.clone()) as *mut Engine;
    SIGNAL_ENGINE.swap(raw, Ordering::SeqCst);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;

        action.sa_sigaction = handle_sigusr1 as libc::sighandler_t;
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());

        action.sa_sigaction = handle_sigusr2 as libc::sighandler_t;
        libc::sigaction(libc::SIGUSR2, &action, std::ptr::null_mut());
    }
    debug!("signal handlers installed");
}

extern "C" fn handle_sigusr1(_signum: libc::c_int) {
    // A pending remote-unwind request wins: park until the courier worker
    // has read this thread's interpreter frames.
    if courier::signal_observed_courier_request() {
        return;
    }
    if let Some(engine) = signal_engine() {
        on_start_barrier(engine);
    }
}

extern "C" fn handle_sigusr2(_signum: libc::c_int) {
    if let Some(engine) = signal_engine() {
        on_stop_barrier(engine);
    }
}

/// Start-barrier arm: sync the device on this launcher, wait for the rest,
/// and let the elected thread flip sampling on.
fn on_start_barrier(engine: &Engine) {
    let tid = sys::current_tid();
    driver_expect(engine.driver.synchronize(), "synchronize");
    engine.threads.mark_synced(tid, true);

    if engine.threads.is_selected(tid) {
        while !engine.threads.all_synced() {
            std::hint::spin_loop();
        }
        start_sampling_all(engine);
    } else {
        while !engine.sampling_active.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }
    engine.threads.mark_synced(tid, false);
}

/// Stop-barrier arm, mirror of the start barrier.
fn on_stop_barrier(engine: &Engine) {
    let tid = sys::current_tid();
    driver_expect(engine.driver.synchronize(), "synchronize");
    engine.threads.mark_synced(tid, true);

    if engine.threads.is_selected(tid) {
        while !engine.threads.all_synced() {
            std::hint::spin_loop();
        }
        stop_sampling_all(engine);
    } else {
        while engine.sampling_active.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }
    engine.threads.mark_synced(tid, false);
}
