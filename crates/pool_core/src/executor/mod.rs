//! The per-worker timed, preemptible executor.
//!
//! This module defines the contract shared by both platform
//! implementations (§4.3 of the design): arm a wall-clock timer, run an
//! opaque callable, and be capable of hijacking the worker's control flow
//! back to a captured resume point on timeout or on an external
//! [`cancel`](TimedExecutor::cancel) call targeting the job currently in
//! flight.
//!
//! Exactly one of [`posix`] or [`win32`] is compiled in, selected by
//! `cfg(unix)` / `cfg(windows)`, matching the C++ original's
//! `TimedExecutorInterface.h` choosing between `PosixTimedExecutor` and
//! `Win32TimedExecutor` at compile time.

use std::any::Any;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub(crate) use posix::PosixExecutor as TimedExecutor;

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub(crate) use win32::Win32Executor as TimedExecutor;

#[cfg(not(any(unix, windows)))]
compile_error!(
    "pool_core needs either POSIX directed thread signals or the Windows \
     thread-suspend/context-rewrite fallback; timeout/cancel cannot be \
     implemented preemptively on this platform"
);

/// Builds the platform `TimedExecutor` for one worker. Must be called on
/// the thread that will own it: the POSIX side captures `pthread_self()`
/// and the Windows side duplicates the calling thread's pseudo-handle.
///
/// `realtime_signal` is the Unix real-time signal number to arm
/// (`PoolConfig::realtime_signal`); it is accepted but ignored, with a
/// debug log, on platforms where it has no meaning.
pub(crate) fn new_for_current_thread(
    realtime_signal: i32,
    current_job_id: Arc<AtomicI64>,
) -> anyhow::Result<TimedExecutor> {
    #[cfg(unix)]
    {
        TimedExecutor::new(realtime_signal, current_job_id)
    }
    #[cfg(windows)]
    {
        pool_log::debug!(
            "realtime_signal={realtime_signal} has no meaning on this platform; ignoring"
        );
        TimedExecutor::new(current_job_id)
    }
}

/// Outcome of [`TimedExecutor::run`].
pub(crate) enum ExecResult {
    Completed,
    TimedOut,
    Cancelled,
    Threw(String),
}

/// Formats a `catch_unwind` panic payload the way `std`'s default panic
/// hook does: prefer a `&str` or `String` payload, fall back to a generic
/// message.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked with a non-string payload".to_owned()
    }
}
