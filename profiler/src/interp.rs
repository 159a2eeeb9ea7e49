//! Interpreter frame introspection seam
//!
//! The interpreted-language runtime (e.g. CPython) is an external
//! collaborator: the profiler only needs an ordered list of frames for a
//! thread. Implementations are expected to hold the interpreter's global
//! lock while walking the frame chain.

use std::fs::File;
use std::io::{BufRead, BufReader};

/// One interpreter frame as reported by the runtime helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpFrame {
    /// Source file path
    pub file: String,

    /// Function (code object) name
    pub func: String,

    /// Current source line number, 1-based
    pub line: u32,
}

/// Access to the interpreter's frame chains.
///
/// Frames are returned innermost-first, matching the order in which the
/// unwinder consumes them while fusing eval frames.
pub trait InterpreterIntrospect: Send + Sync {
    /// Frames of the calling OS thread; empty when the thread has none.
    fn current_thread_frames(&self) -> Vec<InterpFrame>;

    /// Frames of the interpreter's main thread (remote-courier path).
    fn main_thread_frames(&self) -> Vec<InterpFrame>;
}

/// Read one source line, whitespace-stripped, for frame labeling.
///
/// Returns an empty string when the file cannot be read or the line does not
/// exist; frame labels degrade to `name::` in that case.
pub fn read_source_line(path: &str, line: u32) -> String {
    let Ok(file) = File::open(path) else {
        return String::new();
    };
    let reader = BufReader::new(file);
    match reader.lines().nth(line.saturating_sub(1) as usize) {
        Some(Ok(text)) => text.chars().filter(|c| !c.is_whitespace()).collect(),
        _ => String::new(),
    }
}
