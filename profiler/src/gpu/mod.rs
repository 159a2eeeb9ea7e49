//! GPU-facing half of the profiler: the driver seam, per-context state, the
//! PC-sample ring, and the launch interceptor.

pub mod consumer;
pub mod context;
pub mod driver;
pub mod interceptor;
pub mod mock;
pub mod ring;
