//! Cancellable background jobs.
//!
//! A [`JobManager`] owns a fixed set of worker threads. Each scheduled
//! [`Job`] is paired with a [`JobHandle`], a shared state machine that the
//! scheduler, the job body and any number of observers use to track or
//! cancel the work. Cancellation is cooperative: aborting a handle stops a
//! queued job from ever starting, and running jobs poll the handle.

mod handle;
mod manager;

pub use handle::{JobHandle, JobHandleGroup, JobState};
pub use manager::{Job, JobManager};
