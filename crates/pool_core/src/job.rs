//! The unit of work the pool executes.

use std::time::Duration;

/// Identifies a [`Job`] for its whole lifetime.
///
/// `0` is a valid id. `NO_JOB` (`-1`) is the reserved sentinel meaning "no
/// active job", published by a worker that is currently idle between jobs.
pub type JobId = i64;

/// Sentinel stored in a worker's `current_job_id` when it has no job
/// in flight.
pub const NO_JOB: JobId = -1;

/// A callable submitted to the pool, opaque beyond its timeout and id.
///
/// The pool owns a `Job` from the moment `submit` returns until the worker
/// that ran it has observed the outcome. A job must not hold non-trivial
/// process-wide resources (file handles, locks, heap allocations it expects
/// to free itself) across its own body, because a preempted job is unwound
/// without running its local cleanup.
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) timeout: Duration,
    pub(crate) call: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        timeout_ms: u64,
        call: Box<dyn FnOnce() + Send + 'static>,
    ) -> Self {
        Self {
            id,
            timeout: Duration::from_millis(timeout_ms),
            call,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// How a job's execution ended.
#[derive(Debug)]
pub enum Outcome {
    /// The job returned normally.
    Completed,
    /// The timer armed for this job fired before it returned.
    TimedOut,
    /// An external `cancel` targeting this job's id interrupted it.
    Cancelled,
    /// The job panicked. Carries a message when the panic payload could be
    /// formatted as a string.
    Threw(String),
}
