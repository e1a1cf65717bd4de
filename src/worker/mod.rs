//! Local execution primitives used by jobs.
//!
//! - [`ProcessRunner`]: spawns a child with redirected streams and polls
//!   it without blocking
//! - [`PerformanceRecorder`]: optional instrumentation prefix and trailer
//!   parsing
//! - [`check_completion_marker`]: the authoritative success check
//!
//! Children are polled with `try_wait` on their own handle only, so
//! several batches can run side by side without stealing each other's
//! exit events.

pub mod instrument;
pub mod marker;
pub mod process;

pub use instrument::{
    Column, ExecContext, Field, Instrument, PerfStatWrapper, PerformanceRecorder,
    PerformanceSample, TimeWrapper,
};
pub use marker::check_completion_marker;
pub use process::{LocalProcess, ProcessRunner};
