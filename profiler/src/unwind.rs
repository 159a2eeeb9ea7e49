//! Native stack unwinding with interpreter-frame fusion
//!
//! Produces the outermost-first frame sequence the attribution engine merges
//! into a calling context tree. Native frames come from the `backtrace`
//! frame cursor; when interpreter unwinding is enabled, every native
//! eval-frame is replaced by the matching interpreter frame (the fusion
//! rule), so interpreted call sites become first-class tree nodes.

use crate::config::Config;
use crate::interp::{read_source_line, InterpFrame, InterpreterIntrospect};
use crate::sys;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Origin of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Native,
    Interpreted,
}

/// One unwound frame. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Instruction pointer; for interpreted frames this is synthesized as
    /// `native_eval_pc + line` by the fusion rule (0 until fused)
    pub pc: u64,

    /// Intra-function offset for native frames, source line for interpreted
    pub offset: u64,

    /// Demangled function name; `name::line_text` for interpreted frames
    pub func_name: String,

    /// Source file for interpreted frames, empty otherwise
    pub file_name: String,

    pub kind: FrameKind,
}

impl Frame {
    pub fn native(pc: u64, offset: u64, func_name: String) -> Self {
        Self {
            pc,
            offset,
            func_name,
            file_name: String::new(),
            kind: FrameKind::Native,
        }
    }

    pub fn interpreted(frame: &InterpFrame) -> Self {
        let line_text = read_source_line(&frame.file, frame.line);
        Self {
            pc: 0,
            offset: frame.line as u64,
            func_name: format!("{}::{}", frame.func, line_text),
            file_name: frame.file.clone(),
            kind: FrameKind::Interpreted,
        }
    }
}

/// Whether an unwound stack carried any interpreter frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStackStatus {
    HasInterp,
    NoInterp,
}

/// Demangle a raw symbol token, falling back to the token itself.
pub fn demangle_symbol(raw: &str) -> String {
    format!("{:#}", rustc_demangle::demangle(raw))
}

/// A native frame before exclusion/fusion, innermost-first.
#[derive(Debug, Clone)]
pub(crate) struct RawNativeFrame {
    pub pc: u64,
    pub offset: u64,
    pub func_name: String,
}

/// Apply exclusion and the fusion rule, returning frames outermost-first.
pub(crate) fn assemble_frames(
    native: Vec<RawNativeFrame>,
    mut interp_frames: VecDeque<InterpFrame>,
    config: &Config,
) -> Vec<Frame> {
    let mut innermost_first = Vec::with_capacity(native.len());
    for raw in native {
        if config.is_excluded(&raw.func_name) {
            continue;
        }
        if config.do_interp_unwind && raw.func_name.contains(&config.eval_frame_symbol) {
            if let Some(py) = interp_frames.pop_front() {
                let mut frame = Frame::interpreted(&py);
                // Native pc plus line number keeps synthesized pcs unique
                // per source line within one eval site.
                frame.pc = raw.pc + py.line as u64;
                innermost_first.push(frame);
                continue;
            }
        }
        innermost_first.push(Frame::native(raw.pc, raw.offset, raw.func_name));
    }
    innermost_first.reverse();
    innermost_first
}

/// The stack unwinder.
pub struct Unwinder {
    config: Arc<Config>,
    interp: Option<Arc<dyn InterpreterIntrospect>>,
}

impl Unwinder {
    pub fn new(config: Arc<Config>, interp: Option<Arc<dyn InterpreterIntrospect>>) -> Self {
        Self { config, interp }
    }

    /// Unwind the calling thread.
    ///
    /// Returns frames outermost-first (ready to be pushed onto a stack so
    /// the innermost frame ends up on top) and whether interpreter frames
    /// were observed.
    pub fn unwind(&self, verbose: bool) -> (Vec<Frame>, CallStackStatus) {
        let interp_frames: VecDeque<InterpFrame> = match (&self.interp, self.config.do_interp_unwind)
        {
            (Some(helper), true) => helper.current_thread_frames().into(),
            _ => VecDeque::new(),
        };
        let status = if interp_frames.is_empty() {
            CallStackStatus::NoInterp
        } else {
            CallStackStatus::HasInterp
        };

        let native = collect_native_frames();
        let frames = assemble_frames(native, interp_frames, &self.config);

        if verbose {
            let tid = sys::current_tid();
            for frame in frames.iter().rev() {
                debug!(
                    tid,
                    "unwinding: pc={:#x}:[{}+{:#x}]", frame.pc, frame.func_name, frame.offset
                );
            }
        }

        (frames, status)
    }
}

/// Walk the native stack of the calling thread, innermost-first.
fn collect_native_frames() -> Vec<RawNativeFrame> {
    let mut raw = Vec::new();
    backtrace::trace(|frame| {
        let pc = frame.ip() as u64;
        if pc == 0 {
            return false;
        }

        let mut func_name = None;
        let mut offset = 0u64;
        backtrace::resolve_frame(frame, |symbol| {
            if func_name.is_some() {
                // Keep the first (outermost inline) symbol for this frame.
                return;
            }
            func_name = Some(match symbol.name() {
                // SymbolName's Display demangles both Rust and C++ names.
                Some(name) => format!("{}", name),
                None => format!("{:#x}", pc),
            });
            if let Some(addr) = symbol.addr() {
                offset = pc.saturating_sub(addr as u64);
            }
        });

        raw.push(RawNativeFrame {
            pc,
            offset,
            func_name: func_name.unwrap_or_else(|| format!("{:#x}", pc)),
        });
        true
    });
    raw
}
