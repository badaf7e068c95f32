//! POSIX implementation: a directed real-time signal plus a non-local jump
//! back to a resume point captured at the top of [`PosixExecutor::run`].
//!
//! # Safety
//!
//! This module is the one place in the crate that steps outside what safe
//! Rust (or even ordinary `unsafe` Rust) can express. `setjmp`/`longjmp`
//! are not part of any maintained Rust binding because a long jump out of
//! an arbitrary call stack does not run Rust destructors and is not a
//! sanctioned unwind mechanism — this is precisely the "resources held by
//! a preempted job are leaked" hazard the pool's contract calls out
//! (§4.3.3). We declare the two functions ourselves, exactly as the C++
//! original does, and restrict their use to the narrow pattern that
//! original relies on: `setjmp` at the top of `run`, `longjmp` only from
//! the signal handler running synchronously on the same thread, never
//! crossing a `catch_unwind` boundary on the way back out.
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use crate::job::JobId;

use super::{panic_message, ExecResult};

/// Opaque, over-sized jump buffer. The real `jmp_buf` layout is
/// architecture-specific (glibc x86-64 uses roughly 200 bytes); 256 bytes,
/// 16-byte aligned, leaves headroom on every target we support.
#[repr(C, align(16))]
struct JmpBuf([u8; 256]);

impl JmpBuf {
    const fn new() -> Self {
        Self([0; 256])
    }
}

extern "C" {
    // Declared by hand: see the module safety note above.
    #[link_name = "setjmp"]
    fn raw_setjmp(env: *mut JmpBuf) -> i32;
    #[link_name = "longjmp"]
    fn raw_longjmp(env: *mut JmpBuf, val: i32) -> !;

    // `pthread_sigqueue` is a glibc extension (directed `sigqueue` to a
    // specific thread, carrying a payload) — not part of every libc
    // binding, so we bind it ourselves rather than depend on a crate
    // feature that may not exist everywhere `libc` does.
    fn pthread_sigqueue(thread: libc::pthread_t, sig: i32, value: libc::sigval) -> i32;
}

/// Which mechanism delivered the preempting signal.
const SOURCE_TIMER: u8 = 0;
const SOURCE_ABORT: u8 = 1;

/// Why the executor was preempted, decided by the handler before it jumps.
const REASON_NONE: u8 = 0;
const REASON_TIMEOUT: u8 = 1;
const REASON_CANCELLED: u8 = 2;

/// State shared between the owning worker thread and the signal handler
/// that may run on it. Guardrails (§4.3) are evaluated against this by the
/// handler before it ever touches `buf`.
struct Handshake {
    interruptible: AtomicBool,
    handler_active: AtomicBool,
    current_job_id: Arc<AtomicI64>,
    preempt_reason: AtomicU8,
    buf: UnsafeCell<JmpBuf>,
}

// SAFETY: `buf` is only written by `run` (on the owning thread) and only
// read by the handler when it runs synchronously on that same thread in
// response to a signal targeted at it; the two never execute concurrently
// with each other.
unsafe impl Sync for Handshake {}

/// What a signal delivery (timer expiry or directed `cancel`) carries as
/// its payload, mirroring `handlerData` in the C++ original.
struct SignalPayload {
    handshake: *const Handshake,
    source: u8,
    expected_job_id: AtomicI64,
}

// SAFETY: the raw pointer is valid for the lifetime of the `PosixExecutor`
// that owns both the `Handshake` and this payload, and is only ever
// dereferenced from the signal handler running on the executor's thread.
unsafe impl Send for SignalPayload {}
unsafe impl Sync for SignalPayload {}

static HANDLER_INSTALLED: Once = Once::new();

extern "C" fn handler(signo: i32, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    if info.is_null() {
        return;
    }
    // SAFETY: delivered by the kernel for the signal we registered this
    // handler against; `si_value` was populated by us at `timer_create`
    // or `pthread_sigqueue` time.
    let sival = unsafe { (*info).si_value() };
    let payload_ptr = sival.sival_ptr as *const SignalPayload;
    if payload_ptr.is_null() {
        return;
    }
    // SAFETY: see `SignalPayload`'s invariant above.
    let payload = unsafe { &*payload_ptr };
    // SAFETY: see `Handshake`'s invariant above.
    let handshake = unsafe { &*payload.handshake };

    let _ = signo;

    // Guardrail 0: serialize against re-entry from another delivery of the
    // same signal on this worker before the kernel unblocks it for us.
    if handshake
        .handler_active
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    // Guardrail 1: are we between jobs, or past the job body?
    if !handshake.interruptible.load(Ordering::Acquire) {
        handshake.handler_active.store(false, Ordering::Release);
        return;
    }

    // Guardrail 2: does this delivery still target the job in flight?
    let expected = payload.expected_job_id.load(Ordering::Relaxed);
    if expected != handshake.current_job_id.load(Ordering::Acquire) {
        handshake.handler_active.store(false, Ordering::Release);
        return;
    }

    let reason = if payload.source == SOURCE_TIMER {
        REASON_TIMEOUT
    } else {
        REASON_CANCELLED
    };
    handshake.preempt_reason.store(reason, Ordering::Release);

    // SAFETY: `run` set up `buf` via `setjmp` before making itself
    // interruptible, and we have just confirmed we are interrupting that
    // same, still-running invocation.
    unsafe { raw_longjmp(handshake.buf.get(), 1) }
}

fn install_handler_once(signal_no: i32) {
    HANDLER_INSTALLED.call_once(|| {
        // SAFETY: standard `sigaction` setup; `handler` never touches
        // anything beyond the two atomics and the payload pointer it is
        // handed, so it is safe to run with all other signals blocked.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = libc::SA_SIGINFO;
            action.sa_sigaction = handler as usize;
            libc::sigaction(signal_no, &action, std::ptr::null_mut());
        }
    });
}

fn gettid() -> libc::pid_t {
    // SAFETY: `SYS_gettid` takes no arguments and always succeeds.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

pub(crate) struct PosixExecutor {
    signal_no: i32,
    pthread_id: libc::pthread_t,
    handshake: Box<Handshake>,
    timer_payload: Box<SignalPayload>,
    abort_payload: Box<SignalPayload>,
    timer_id: Option<libc::timer_t>,
}

impl PosixExecutor {
    pub(crate) fn new(signal_no: i32, current_job_id: Arc<AtomicI64>) -> anyhow::Result<Self> {
        install_handler_once(signal_no);

        let handshake = Box::new(Handshake {
            interruptible: AtomicBool::new(false),
            handler_active: AtomicBool::new(false),
            current_job_id,
            preempt_reason: AtomicU8::new(REASON_NONE),
            buf: UnsafeCell::new(JmpBuf::new()),
        });
        let handshake_ptr: *const Handshake = &*handshake;

        let timer_payload = Box::new(SignalPayload {
            handshake: handshake_ptr,
            source: SOURCE_TIMER,
            expected_job_id: AtomicI64::new(crate::job::NO_JOB),
        });
        let abort_payload = Box::new(SignalPayload {
            handshake: handshake_ptr,
            source: SOURCE_ABORT,
            expected_job_id: AtomicI64::new(crate::job::NO_JOB),
        });

        let pthread_id = unsafe { libc::pthread_self() };

        let mut executor = Self {
            signal_no,
            pthread_id,
            handshake,
            timer_payload,
            abort_payload,
            timer_id: None,
        };

        if let Err(err) = executor.create_timer() {
            pool_log::warn!(
                "timer_create failed for worker {:?}: {err}; running without timeouts",
                gettid()
            );
        }

        Ok(executor)
    }

    fn create_timer(&mut self) -> io::Result<()> {
        let mut sevp: libc::sigevent = unsafe { std::mem::zeroed() };
        sevp.sigev_notify = libc::SIGEV_THREAD_ID;
        sevp.sigev_signo = self.signal_no;
        sevp.sigev_value.sival_ptr = &*self.timer_payload as *const SignalPayload as *mut c_void;
        // SIGEV_THREAD_ID delivers to this specific thread, not the process.
        sevp.sigev_notify_thread_id = gettid();

        let mut timer_id: libc::timer_t = std::ptr::null_mut();
        let rc = unsafe { libc::timer_create(libc::CLOCK_REALTIME, &mut sevp, &mut timer_id) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.timer_id = Some(timer_id);
        Ok(())
    }

    fn arm_timer(&self, timeout: Duration) {
        let Some(timer_id) = self.timer_id else {
            return;
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: timeout.as_secs() as i64,
                tv_nsec: i64::from(timeout.subsec_nanos()),
            },
        };
        unsafe {
            libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut());
        }
    }

    fn disarm_timer(&self) {
        let Some(timer_id) = self.timer_id else {
            return;
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        };
        unsafe {
            libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut());
        }
    }

    /// The kernel blocks our preemption signal for the duration of a
    /// handler invocation that never returns (because it long-jumped
    /// instead). We must unblock it ourselves or this worker goes
    /// permanently deaf to future timeouts and cancels.
    fn unblock_signal(&self) {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, self.signal_no);
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        }
    }

    pub(crate) fn run(
        &self,
        call: Box<dyn FnOnce() + Send>,
        timeout: Duration,
        id: JobId,
    ) -> ExecResult {
        self.timer_payload.expected_job_id.store(id, Ordering::Relaxed);
        self.handshake.preempt_reason.store(REASON_NONE, Ordering::Relaxed);

        let use_timeout = self.timer_id.is_some() && !timeout.is_zero();

        // SAFETY: see the module-level safety note. `buf` is written here
        // and only ever jumped to by `handler` while it is executing
        // synchronously on this same thread in response to a signal we
        // armed below.
        let jumped = unsafe { raw_setjmp(self.handshake.buf.get()) };

        if jumped == 0 {
            self.handshake.interruptible.store(true, Ordering::Release);
            if use_timeout {
                self.arm_timer(timeout);
            }

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(call));

            self.handshake.interruptible.store(false, Ordering::Release);
            if use_timeout {
                self.disarm_timer();
            }

            match result {
                Ok(()) => ExecResult::Completed,
                Err(payload) => ExecResult::Threw(panic_message(payload)),
            }
        } else {
            // We got here by longjmp: the signal handler did not return.
            self.unblock_signal();
            self.handshake.handler_active.store(false, Ordering::Release);
            self.handshake.interruptible.store(false, Ordering::Release);
            if use_timeout {
                self.disarm_timer();
            }

            match self.handshake.preempt_reason.load(Ordering::Acquire) {
                REASON_CANCELLED => ExecResult::Cancelled,
                _ => ExecResult::TimedOut,
            }
        }
    }

    /// Cross-thread: best-effort interrupt of whatever this executor is
    /// currently running, iff it is running `id`.
    pub(crate) fn cancel(&self, id: JobId) {
        self.abort_payload.expected_job_id.store(id, Ordering::Relaxed);
        let value = libc::sigval {
            sival_ptr: &*self.abort_payload as *const SignalPayload as *mut c_void,
        };
        unsafe {
            pthread_sigqueue(self.pthread_id, self.signal_no, value);
        }
    }
}

impl Drop for PosixExecutor {
    fn drop(&mut self) {
        if let Some(timer_id) = self.timer_id.take() {
            unsafe {
                libc::timer_delete(timer_id);
            }
        }
    }
}

impl std::fmt::Debug for PosixExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixExecutor")
            .field("signal_no", &self.signal_no)
            .field("timer_enabled", &self.timer_id.is_some())
            .finish()
    }
}
