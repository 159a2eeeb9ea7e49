//! Remote-frame courier
//!
//! Worker threads that launch kernels may carry no interpreter frames of
//! their own; the interpreter context that caused them lives on the main
//! thread. The courier fetches that context: the requesting thread freezes
//! the main thread with a user signal and a dedicated worker walks the main
//! thread's interpreter frames while it is parked. The signal handler itself
//! only flips atomics; the allocation-heavy walk happens outside signal
//! context.
//!
//! At most one request is in flight process-wide.

use crate::interp::{read_source_line, InterpFrame, InterpreterIntrospect};
use crate::sys;
use crate::unwind::{Frame, FrameKind};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// State shared between sender, signal handler, and the courier worker.
pub struct CourierShared {
    /// Set by the sender, cleared by the worker once the slot is filled
    pending: AtomicBool,

    /// True while the main thread spins inside its signal handler
    parked: AtomicBool,

    /// Single-slot result hand-off, cleared by the sender on take
    slot: Mutex<Option<Vec<Frame>>>,
}

impl CourierShared {
    fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }
}

/// Pointer the signal handler reads. Replacing it leaks the previous state
/// intentionally: a handler may still be dereferencing it.
static HANDLER_STATE: AtomicPtr<CourierShared> = AtomicPtr::new(std::ptr::null_mut());

fn publish_handler_state(shared: &Arc<CourierShared>) {
    let raw = Arc::into_raw(shared.clone()) as *mut CourierShared;
    HANDLER_STATE.swap(raw, Ordering::SeqCst);
}

/// Courier arm of the SIGUSR1 handler, async-signal-safe: park until the
/// worker clears the request. Returns false when no request is pending (the
/// signal then belongs to the start barrier).
pub(crate) fn signal_observed_courier_request() -> bool {
    let ptr = HANDLER_STATE.load(Ordering::SeqCst);
    if ptr.is_null() {
        return false;
    }
    let shared = unsafe { &*ptr };
    if !shared.pending.load(Ordering::Acquire) {
        return false;
    }
    shared.parked.store(true, Ordering::Release);
    while shared.pending.load(Ordering::Acquire) {
        std::hint::spin_loop();
    }
    shared.parked.store(false, Ordering::Release);
    true
}

/// Synthesize a stable pc for an interpreter frame obtained without a
/// native eval-frame anchor. The high bit keeps it out of native pc space;
/// determinism makes courier prefixes identical across requesting threads.
fn synth_interp_pc(frame: &InterpFrame) -> u64 {
    // FNV-1a over file, function, and line.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in frame
        .file
        .bytes()
        .chain(frame.func.bytes())
        .chain(frame.line.to_le_bytes())
    {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash | (1 << 63)
}

fn frames_from_interp(interp_frames: &[InterpFrame]) -> Vec<Frame> {
    // Innermost-first from the helper; the prefix is outermost-first.
    let mut frames: Vec<Frame> = interp_frames
        .iter()
        .map(|f| {
            let line_text = read_source_line(&f.file, f.line);
            Frame {
                pc: synth_interp_pc(f),
                offset: f.line as u64,
                func_name: format!("{}::{}", f.func, line_text),
                file_name: f.file.clone(),
                kind: FrameKind::Interpreted,
            }
        })
        .collect();
    frames.reverse();
    frames
}

/// The courier: request serialization, the frozen-main protocol, and the
/// worker that does the actual interpreter walk.
pub struct Courier {
    shared: Arc<CourierShared>,
    request_lock: Mutex<()>,
    main_thread: libc::pthread_t,
    introspect: Arc<dyn InterpreterIntrospect>,
    shutdown: Arc<AtomicBool>,
}

impl Courier {
    /// Create the courier and start its worker thread.
    ///
    /// `main_thread` is the pthread handle of the interpreter's main thread,
    /// recorded at library initialization.
    pub fn new(main_thread: libc::pthread_t, introspect: Arc<dyn InterpreterIntrospect>) -> Self {
        let shared = Arc::new(CourierShared::new());
        publish_handler_state(&shared);

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shared = shared.clone();
        let worker_introspect = introspect.clone();
        let worker_shutdown = shutdown.clone();
        thread::Builder::new()
            .name("kscope-courier".to_string())
            .spawn(move || {
                courier_worker(worker_shared, worker_introspect, worker_shutdown);
            })
            .expect("failed to spawn courier worker");

        Self {
            shared,
            request_lock: Mutex::new(()),
            main_thread,
            introspect,
            shutdown,
        }
    }

    /// Fetch the main thread's interpreter frames as an outermost-first
    /// prefix. Returns an empty vector when the main thread has none or the
    /// signal could not be delivered.
    pub fn request_main_frames(&self) -> Vec<Frame> {
        // The main thread asking about itself needs no freeze.
        if sys::current_pthread() == self.main_thread {
            return frames_from_interp(&self.introspect.main_thread_frames());
        }

        let _guard = self.request_lock.lock().unwrap();
        *self.shared.slot.lock().unwrap() = None;
        self.shared.pending.store(true, Ordering::Release);

        if sys::kill_thread(self.main_thread, libc::SIGUSR1) != 0 {
            self.shared.pending.store(false, Ordering::Release);
            warn!("courier signal delivery failed, skipping remote unwind");
            return Vec::new();
        }

        // Bounded by signal delivery plus the worker's walk; the sender
        // holds no lock the handler touches.
        while self.shared.pending.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }

        let frames = self.shared.slot.lock().unwrap().take().unwrap_or_default();
        debug!(frames = frames.len(), "courier delivered main-thread frames");
        frames
    }

    /// Stop the worker thread (tests and teardown).
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn courier_worker(
    shared: Arc<CourierShared>,
    introspect: Arc<dyn InterpreterIntrospect>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        // Act only while the main thread is parked in its handler: its
        // frame chain cannot move under the walk.
        if shared.pending.load(Ordering::Acquire) && shared.parked.load(Ordering::Acquire) {
            let frames = frames_from_interp(&introspect.main_thread_frames());
            *shared.slot.lock().unwrap() = Some(frames);
            shared.pending.store(false, Ordering::Release);
        }
        thread::sleep(Duration::from_micros(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synth_pc_deterministic_and_tagged() {
        let frame = InterpFrame {
            file: "main.py".to_string(),
            func: "train".to_string(),
            line: 12,
        };
        let a = synth_interp_pc(&frame);
        let b = synth_interp_pc(&frame);
        assert_eq!(a, b);
        assert_ne!(a & (1 << 63), 0);

        let other = InterpFrame {
            line: 13,
            ..frame.clone()
        };
        assert_ne!(synth_interp_pc(&frame), synth_interp_pc(&other));
    }

    #[test]
    fn test_frames_from_interp_outermost_first() {
        let innermost_first = vec![
            InterpFrame {
                file: "model.py".to_string(),
                func: "forward".to_string(),
                line: 3,
            },
            InterpFrame {
                file: "main.py".to_string(),
                func: "train".to_string(),
                line: 9,
            },
        ];
        let frames = frames_from_interp(&innermost_first);

        assert_eq!(frames.len(), 2);
        assert!(frames[0].func_name.starts_with("train::"));
        assert!(frames[1].func_name.starts_with("forward::"));
        assert!(frames.iter().all(|f| f.kind == FrameKind::Interpreted));
    }

    #[test]
    fn test_main_thread_request_short_circuits() {
        struct FixedInterp;
        impl InterpreterIntrospect for FixedInterp {
            fn current_thread_frames(&self) -> Vec<InterpFrame> {
                Vec::new()
            }
            fn main_thread_frames(&self) -> Vec<InterpFrame> {
                vec![InterpFrame {
                    file: "main.py".to_string(),
                    func: "train".to_string(),
                    line: 1,
                }]
            }
        }

        let courier = Courier::new(sys::current_pthread(), Arc::new(FixedInterp));
        let frames = courier.request_main_frames();
        assert_eq!(frames.len(), 1);
        courier.stop();
    }
}
