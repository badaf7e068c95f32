//! Construction, submission, and teardown of the worker pool itself.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::job::{Job, JobId};
use crate::queue::Queue;
use crate::worker::{self, WorkerHandle};

/// Construction knobs for [`Pool::new`].
///
/// `realtime_signal` only matters on Unix, where it picks the real-time
/// signal number the pool installs its directed-interrupt handler on
/// (§4.3.1); it is accepted and ignored, with a debug log, everywhere
/// else, mirroring the C++ original's `ConfigurableThreadPool<taSignalNo>`
/// template parameter, expressed here as a runtime field since the value
/// is only ever known at construction time.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: NonZeroUsize,
    pub realtime_signal: i32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .unwrap_or_else(|_| NonZeroUsize::new(1).expect("1 is nonzero"));
        Self {
            workers,
            realtime_signal: default_realtime_signal(),
        }
    }
}

#[cfg(target_os = "linux")]
fn default_realtime_signal() -> i32 {
    // SAFETY: `SIGRTMIN` takes no arguments and just reads a libc constant
    // computed at process start.
    unsafe { libc::SIGRTMIN() }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn default_realtime_signal() -> i32 {
    libc::SIGRTMIN
}

#[cfg(not(unix))]
fn default_realtime_signal() -> i32 {
    0
}

/// Why [`Pool::new`] failed to bring up the requested number of workers.
#[derive(Debug)]
pub enum PoolError {
    /// The OS refused to spawn one of the worker threads.
    SpawnFailed(std::io::Error),
    /// A worker thread started but could not bring up its platform
    /// [`TimedExecutor`](crate::executor), so the pool as configured
    /// cannot honor the timeout/cancel contract at all.
    TimerUnavailable,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::SpawnFailed(err) => write!(f, "failed to spawn worker thread: {err}"),
            PoolError::TimerUnavailable => {
                write!(f, "a worker's timed executor could not be initialized")
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::SpawnFailed(err) => Some(err),
            PoolError::TimerUnavailable => None,
        }
    }
}

/// A fixed-size pool of worker threads, each capable of running a job
/// under a wall-clock timeout and being cancelled mid-flight by id.
///
/// Dropping a `Pool` stops it: the queue is closed to new submissions,
/// already-running jobs are allowed to finish or be preempted, and any
/// jobs still waiting in the queue are dropped unrun.
pub struct Pool {
    queue: Arc<Queue>,
    workers: Vec<WorkerHandle>,
    next_job_id: AtomicI64,
    stopped: bool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.workers)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Brings up `config.workers` worker threads. If any fails to start,
    /// every worker already started is stopped and joined before this
    /// returns the error — the pool never hands back a partially-alive
    /// set of workers.
    pub fn new(config: PoolConfig) -> Result<Pool, PoolError> {
        let queue = Arc::new(Queue::new());
        let mut workers = Vec::with_capacity(config.workers.get());

        for index in 0..config.workers.get() {
            match worker::spawn(index, config.realtime_signal, Arc::clone(&queue)) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    queue.stop();
                    for worker in &mut workers {
                        worker.join();
                    }
                    return Err(classify_spawn_error(err));
                }
            }
        }

        Ok(Pool {
            queue,
            workers,
            next_job_id: AtomicI64::new(0),
            stopped: false,
        })
    }

    /// Enqueues `call` to run on the next available worker within
    /// `timeout_ms` (`0` meaning no timeout), returning its assigned id.
    /// Returns `None` without running `call` if the pool has already been
    /// stopped.
    pub fn submit<F>(&self, timeout_ms: u64, call: F) -> Option<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(id, timeout_ms, Box::new(call));
        if self.queue.push(job) {
            Some(id)
        } else {
            None
        }
    }

    /// Best-effort: if the worker currently running `id` can be found, it
    /// is preempted. No-op if `id` has already finished, has not started,
    /// or is still waiting in the queue — removing a queued-but-not-yet-
    /// running job is out of scope (§4.4).
    pub fn cancel(&self, id: JobId) {
        for worker in &self.workers {
            worker.cancel(id);
        }
    }

    /// Closes the queue to new submissions and joins every worker. Jobs
    /// still queued are dropped without running. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.queue.stop();
        for worker in &mut self.workers {
            worker.join();
        }
        drop(self.queue.drain());
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify_spawn_error(err: anyhow::Error) -> PoolError {
    err.downcast::<std::io::Error>()
        .map(PoolError::SpawnFailed)
        .unwrap_or(PoolError::TimerUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn tiny_pool(workers: usize) -> Pool {
        Pool::new(PoolConfig {
            workers: NonZeroUsize::new(workers).unwrap(),
            ..PoolConfig::default()
        })
        .expect("pool construction should succeed in a test environment")
    }

    #[test]
    fn submitted_job_runs_and_reports_completion() {
        let pool = tiny_pool(1);
        let (tx, rx) = mpsc::channel();
        pool.submit(0, move || tx.send(()).unwrap());
        rx.recv_timeout(std::time::Duration::from_secs(1))
            .expect("job should have run");
    }

    #[test]
    fn submit_after_stop_is_rejected() {
        let mut pool = tiny_pool(1);
        pool.stop();
        assert!(pool.submit(0, || {}).is_none());
    }

    #[test]
    fn jobs_run_on_a_fixed_number_of_workers() {
        let pool = tiny_pool(2);
        assert_eq!(pool.workers.len(), 2);
    }
}
