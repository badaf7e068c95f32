//! The long-lived worker thread: owns one [`TimedExecutor`], pops jobs off
//! the shared [`Queue`], drives the executor, and classifies the result.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::executor::{self, ExecResult, TimedExecutor};
use crate::job::{Job, JobId, Outcome, NO_JOB};
use crate::queue::{Popped, Queue};

/// The slice of a worker's state the `Pool` needs to reach it from another
/// thread: the id of whatever it is currently running, and a handle to its
/// executor once that executor exists.
///
/// `executor` starts `None` and is published once, right after the worker
/// thread brings its `TimedExecutor` up, then cleared on the way out. A
/// `cancel(id)` that observes `None` here has lost the race against either
/// startup or shutdown and is simply a no-op, matching §4.4's "cancel does
/// not guarantee delivery" contract.
pub(crate) struct WorkerHandle {
    pub(crate) current_job_id: Arc<AtomicI64>,
    executor: Arc<Mutex<Option<Arc<TimedExecutor>>>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("current_job_id", &self.current_job_id.load(Ordering::Acquire))
            .field("alive", &self.thread.is_some())
            .finish()
    }
}

impl WorkerHandle {
    /// Best-effort: interrupt this worker if (and only if) it is currently
    /// running `id`. The executor re-validates the id itself before
    /// acting, closing the race between this check and the job finishing
    /// on its own.
    pub(crate) fn cancel(&self, id: JobId) {
        if self.current_job_id.load(Ordering::Acquire) != id {
            return;
        }
        if let Some(executor) = self.executor.lock().as_ref() {
            executor.cancel(id);
        }
    }

    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawns one worker thread, blocking the caller until the worker has
/// published its executor handle (or failed to start one), so that by the
/// time `spawn` returns, `Pool::new` can trust every `WorkerHandle` it
/// holds is either ready or already reported as an error.
pub(crate) fn spawn(
    index: usize,
    realtime_signal: i32,
    queue: Arc<Queue>,
) -> anyhow::Result<WorkerHandle> {
    let current_job_id = Arc::new(AtomicI64::new(NO_JOB));
    let executor_slot: Arc<Mutex<Option<Arc<TimedExecutor>>>> = Arc::new(Mutex::new(None));

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let thread_current_job_id = Arc::clone(&current_job_id);
    let thread_executor_slot = Arc::clone(&executor_slot);
    let thread = std::thread::Builder::new()
        .name(format!("pool-worker-{index}"))
        .spawn(move || {
            run(
                realtime_signal,
                thread_current_job_id,
                thread_executor_slot,
                queue,
                ready_tx,
            )
        })?;

    ready_rx
        .recv()
        .map_err(|_| anyhow::anyhow!("worker {index} exited before reporting readiness"))??;

    Ok(WorkerHandle {
        current_job_id,
        executor: executor_slot,
        thread: Some(thread),
    })
}

fn run(
    realtime_signal: i32,
    current_job_id: Arc<AtomicI64>,
    executor_slot: Arc<Mutex<Option<Arc<TimedExecutor>>>>,
    queue: Arc<Queue>,
    ready_tx: std::sync::mpsc::Sender<anyhow::Result<()>>,
) {
    let executor = match executor::new_for_current_thread(realtime_signal, Arc::clone(&current_job_id)) {
        Ok(executor) => Arc::new(executor),
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    *executor_slot.lock() = Some(Arc::clone(&executor));
    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    pool_log::trace!("worker thread starting");

    loop {
        let job = match queue.pop_blocking() {
            Popped::Job(job) => job,
            Popped::Stop => break,
        };
        run_one(&executor, &current_job_id, job);
    }

    *executor_slot.lock() = None;
    pool_log::trace!("worker thread terminating");
}

fn run_one(executor: &TimedExecutor, current_job_id: &AtomicI64, job: Job) {
    let Job { id, timeout, call } = job;

    current_job_id.store(id, Ordering::Release);
    let result = executor.run(call, timeout, id);
    current_job_id.store(NO_JOB, Ordering::Release);

    let outcome = match result {
        ExecResult::Completed => Outcome::Completed,
        ExecResult::TimedOut => Outcome::TimedOut,
        ExecResult::Cancelled => Outcome::Cancelled,
        ExecResult::Threw(message) => Outcome::Threw(message),
    };
    report(id, &outcome);
}

fn report(id: JobId, outcome: &Outcome) {
    match outcome {
        Outcome::Completed => pool_log::info!("job {id} finished"),
        Outcome::TimedOut => pool_log::warn!("job {id} timed out"),
        Outcome::Cancelled => pool_log::warn!("job {id} cancelled"),
        Outcome::Threw(message) => pool_log::error!("job {id} threw: {message}"),
    }
}
