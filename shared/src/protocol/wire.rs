//! Binary envelope for persisted profiling reports.
//!
//! Uses bincode behind a small versioned envelope so readers can reject
//! reports written by an incompatible profiler build.

use crate::types::report::ProfilingReport;
use anyhow::{Context, Result};
use std::path::Path;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Versioned envelope around a serialized report
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub report: ProfilingReport,
}

impl Envelope {
    pub fn new(report: ProfilingReport) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            report,
        }
    }

    /// Serialize envelope to bytes (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize envelope from bytes (bincode), validating the version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = bincode::deserialize(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            anyhow::bail!(
                "report version mismatch: expected {}, got {}",
                PROTOCOL_VERSION,
                envelope.version
            );
        }
        Ok(envelope)
    }
}

/// Write a report to `path` as a single binary document.
pub fn dump_report<P: AsRef<Path>>(report: &ProfilingReport, path: P) -> Result<()> {
    let bytes = Envelope::new(report.clone()).to_bytes()?;
    std::fs::write(path.as_ref(), bytes)
        .with_context(|| format!("failed to write report to {}", path.as_ref().display()))
}

/// Read a report previously written with [`dump_report`].
pub fn load_report<P: AsRef<Path>>(path: P) -> Result<ProfilingReport> {
    let bytes = std::fs::read(path.as_ref())
        .with_context(|| format!("failed to read report from {}", path.as_ref().display()))?;
    Ok(Envelope::from_bytes(&bytes)?.report)
}
