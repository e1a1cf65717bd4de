//! Batch scheduling of external-process jobs.
//!
//! - [`Job`]: one command, its cost, dependency and lifecycle
//! - [`Scheduler`]: admission/reap loop over a batch under a thread
//!   budget and an optional throttle sub-limit
//! - [`report`]: run report, machine-parsable table, failure list
//!
//! A batch succeeds only when every job's completion marker was found.

pub mod batch;
pub mod job;
pub mod report;

pub use batch::Scheduler;
pub use job::{Job, JobContext, JobId, JobState, JobTarget, StartOutcome};
pub use report::format_duration;
