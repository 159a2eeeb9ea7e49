//! Output formatting utilities for CLI commands

use colored::Colorize;

/// Print a section heading
pub fn heading(msg: &str) {
    println!("{}", msg.bold());
}

/// Print a warning from the report
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}
