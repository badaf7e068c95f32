//! A fixed-size worker pool with preemptible per-job timeouts and
//! cancellation.
//!
//! Jobs are arbitrary `FnOnce() + Send` closures. Each worker runs at most
//! one job at a time behind a platform [`TimedExecutor`](executor) that can
//! be asked, from any other thread, to hijack the worker's control flow
//! back to a safe resume point — either because the job's wall-clock
//! budget expired or because [`Pool::cancel`] targeted it directly. Both
//! mechanisms are preemptive: an uncooperative, CPU-bound job that never
//! checks a flag is still interrupted.
//!
//! # Hazards
//!
//! A preempted job is unwound via a non-local jump, not Rust's normal
//! unwinding — its destructors do not run and any lock, file handle, or
//! heap allocation it held is leaked. Only submit jobs that either finish
//! on their own well within their timeout or hold no resources they
//! expect to free themselves. A preempted job is retired; it never
//! resumes from where it left off.

mod executor;
mod job;
mod pool;
mod queue;
mod worker;

pub use job::{JobId, Outcome};
pub use pool::{Pool, PoolConfig, PoolError};
