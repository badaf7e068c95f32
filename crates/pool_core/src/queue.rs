//! The pool's FIFO job queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::job::Job;

/// What a worker woke up to.
pub(crate) enum Popped {
    /// A job to run.
    Job(Job),
    /// `stop` was requested and the queue is empty; the worker should exit.
    Stop,
}

/// FIFO queue of pending [`Job`]s, guarded by one mutex and signalled on one
/// condition variable, matching the mutex+condvar pairing the worker loop
/// waits on (see [`ExecutionProgress::wait_for_no_pending_tasks`] in the
/// thread pool this crate descends from).
#[derive(Debug)]
pub(crate) struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    non_empty_or_stopped: Condvar,
    stopped: AtomicBool,
}

impl Queue {
    pub(crate) fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            non_empty_or_stopped: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Appends a job and wakes one waiting worker. No-op if the queue has
    /// already been stopped.
    pub(crate) fn push(&self, job: Job) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.jobs.lock().push_back(job);
        self.non_empty_or_stopped.notify_one();
        true
    }

    /// Blocks until a job is available or the queue is stopped. `stop` is
    /// checked before dequeuing, not after: once stopped, no job still
    /// sitting in the queue is allowed to begin execution (spec.md §4.2
    /// step 2, invariant 5). Jobs left behind are reclaimed by `drain`.
    pub(crate) fn pop_blocking(&self) -> Popped {
        let mut jobs = self.jobs.lock();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Popped::Stop;
            }
            if let Some(job) = jobs.pop_front() {
                return Popped::Job(job);
            }
            self.non_empty_or_stopped.wait(&mut jobs);
        }
    }

    /// Marks the queue stopped and wakes every waiting worker. Idempotent.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // Hold the lock while notifying so a worker that is about to wait
        // can't miss this wakeup (the classic lost-wakeup race).
        let _guard = self.jobs.lock();
        self.non_empty_or_stopped.notify_all();
    }

    /// Drains remaining jobs without running them. Called during teardown.
    pub(crate) fn drain(&self) -> Vec<Job> {
        self.jobs.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = Queue::new();
        queue.push(Job::new(0, 0, Box::new(|| {})));
        queue.push(Job::new(1, 0, Box::new(|| {})));

        let Popped::Job(first) = queue.pop_blocking() else {
            panic!("expected a job");
        };
        let Popped::Job(second) = queue.pop_blocking() else {
            panic!("expected a job");
        };
        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
    }

    #[test]
    fn push_after_stop_is_rejected() {
        let queue = Queue::new();
        queue.stop();
        assert!(!queue.push(Job::new(0, 0, Box::new(|| {}))));
    }

    #[test]
    fn pop_returns_stop_once_drained_and_stopped() {
        let queue = Queue::new();
        queue.stop();
        assert!(matches!(queue.pop_blocking(), Popped::Stop));
    }

    #[test]
    fn stop_takes_priority_over_jobs_already_queued() {
        // A job pushed before `stop` must never be popped for execution
        // afterwards; it is only reachable through `drain`.
        let queue = Queue::new();
        queue.push(Job::new(0, 0, Box::new(|| {})));
        queue.stop();
        assert!(matches!(queue.pop_blocking(), Popped::Stop));
        assert_eq!(queue.drain().len(), 1);
    }
}
