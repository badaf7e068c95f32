//! Windows implementation: suspend the worker thread, rewrite its saved
//! instruction pointer to a trampoline, resume it, and let the trampoline
//! perform the non-local jump back to the resume point captured at the top
//! of [`Win32Executor::run`].
//!
//! Windows has no analogue of a directed `SIGEV_THREAD_ID` timer or a
//! signal handler that runs on the target thread with its own stack
//! already in place, so the preemption has to be driven entirely from
//! outside the worker: `SuspendThread` stops it wherever it happens to be,
//! `GetThreadContext`/`SetThreadContext` overwrite its instruction pointer,
//! and `ResumeThread` lets it continue — now inside [`trampoline`] instead
//! of wherever the job actually was. The trampoline has no arguments (there
//! is no portable way to hand it one through a rewritten context), so it
//! recovers the executor to jump through from thread-local storage that
//! `run` populated before arming anything.
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE};
use windows_sys::Win32::System::Diagnostics::Debug::{
    GetThreadContext, SetThreadContext, CONTEXT, CONTEXT_FULL_AMD64,
};
use windows_sys::Win32::System::Threading::{
    CreateTimerQueue, CreateTimerQueueTimer, DeleteTimerQueueEx, DeleteTimerQueueTimer,
    GetCurrentProcess, GetCurrentThread, ResumeThread, SuspendThread, WT_EXECUTEONLYONCE,
};

use crate::job::JobId;

use super::{panic_message, ExecResult};

#[repr(C, align(16))]
struct JmpBuf([u8; 256]);

impl JmpBuf {
    const fn new() -> Self {
        Self([0; 256])
    }
}

extern "C" {
    #[link_name = "setjmp"]
    fn raw_setjmp(env: *mut JmpBuf) -> i32;
    #[link_name = "longjmp"]
    fn raw_longjmp(env: *mut JmpBuf, val: i32) -> !;
}

const REASON_NONE: u8 = 0;
const REASON_TIMEOUT: u8 = 1;
const REASON_CANCELLED: u8 = 2;

struct Handshake {
    interruptible: AtomicBool,
    preempting: AtomicBool,
    current_job_id: Arc<AtomicI64>,
    expected_job_id: AtomicI64,
    preempt_reason: AtomicU8,
    buf: std::cell::UnsafeCell<JmpBuf>,
}

unsafe impl Sync for Handshake {}

thread_local! {
    /// Points at the `Handshake` of whichever `run` call is currently live
    /// on this thread. Read only by `trampoline`, which only ever executes
    /// on this same thread because it is reached by rewriting this
    /// thread's own suspended context.
    static ACTIVE: Cell<*const Handshake> = Cell::new(std::ptr::null());
}

/// Control-flow target installed in place of the worker's real instruction
/// pointer. Runs on the worker thread, with the worker's original stack
/// still under it, immediately after `ResumeThread` restarts it.
extern "system" fn trampoline() -> ! {
    let handshake_ptr = ACTIVE.with(|cell| cell.get());
    // SAFETY: populated by `run` on this same thread before it became
    // interruptible; the thread can only reach `trampoline` via a context
    // rewrite performed while `interruptible` was observed set.
    let handshake = unsafe { &*handshake_ptr };
    handshake.preempting.store(false, Ordering::Release);
    handshake.interruptible.store(false, Ordering::Release);
    // SAFETY: `buf` was captured by the matching `setjmp` in `run`.
    unsafe { raw_longjmp(handshake.buf.get(), 1) }
}

/// Suspends `thread`, re-checks both preemption guardrails (§4.3) with the
/// thread frozen, and only then either rewrites its saved instruction
/// pointer to [`trampoline`] or resumes it unmodified. The guardrails must
/// be evaluated *after* the suspend, not before: suspending is what makes
/// the check atomic with respect to the job finishing and the next one
/// starting on the same worker. Checking first and suspending second would
/// reopen the race the two-field handshake exists to close — the old job
/// could pass both checks, then finish and be succeeded by a new one in
/// the window before `SuspendThread` actually freezes the thread, and the
/// rewrite would hijack that new job instead.
///
/// No-op (silently, after resuming the thread unmodified) if the thread
/// cannot be suspended, its context cannot be read, or either guardrail
/// fails — the job simply keeps running in that case, the same fail-open
/// posture the POSIX side takes when `timer_create` is unavailable.
/// Returns `true` if the thread was actually redirected to the trampoline
/// (in which case `preempting` remains the trampoline's responsibility to
/// clear once it runs), `false` if the thread was resumed unmodified (in
/// which case the caller must clear `preempting` itself, since nothing
/// else ever will).
fn suspend_check_and_redirect(handshake: &Handshake, thread: HANDLE, reason: u8, id: JobId) -> bool {
    unsafe {
        if SuspendThread(thread) == u32::MAX {
            return false;
        }

        if !handshake.interruptible.load(Ordering::Acquire)
            || id != handshake.current_job_id.load(Ordering::Acquire)
        {
            ResumeThread(thread);
            return false;
        }

        let mut ctx: CONTEXT = std::mem::zeroed();
        ctx.ContextFlags = CONTEXT_FULL_AMD64;
        if GetThreadContext(thread, &mut ctx) == 0 {
            ResumeThread(thread);
            return false;
        }

        handshake.preempt_reason.store(reason, Ordering::Release);

        ctx.Rip = trampoline as usize as u64;
        // Keep the stack pointer 16-byte aligned as the x86-64 calling
        // convention requires on entry to a function.
        ctx.Rsp &= !0xf;

        SetThreadContext(thread, &ctx);
        ResumeThread(thread);
        true
    }
}

pub(crate) struct Win32Executor {
    thread_handle: HANDLE,
    handshake: Box<Handshake>,
    timer_queue: HANDLE,
    timer_handle: std::cell::Cell<HANDLE>,
}

// SAFETY: `thread_handle`/`timer_queue` are Win32 handles, inert without a
// syscall; all mutation of executor state goes through the atomics in
// `Handshake` or the single-slot `timer_handle` cell guarded by the same
// happens-before relationship `run` already establishes around arming.
unsafe impl Send for Win32Executor {}
unsafe impl Sync for Win32Executor {}

extern "system" fn on_timer_fire(param: *mut std::ffi::c_void, _timer_or_wait_fired: u8) {
    let executor = param as *const Win32Executor;
    // SAFETY: the timer is deleted in `Drop` before the executor is freed,
    // so any callback that manages to run still sees a live executor.
    let executor = unsafe { &*executor };
    let id = executor.handshake.expected_job_id.load(Ordering::Relaxed);
    executor.preempt(REASON_TIMEOUT, id);
}

impl Win32Executor {
    pub(crate) fn new(current_job_id: Arc<AtomicI64>) -> anyhow::Result<Self> {
        let handshake = Box::new(Handshake {
            interruptible: AtomicBool::new(false),
            preempting: AtomicBool::new(false),
            current_job_id,
            expected_job_id: AtomicI64::new(crate::job::NO_JOB),
            preempt_reason: AtomicU8::new(REASON_NONE),
            buf: std::cell::UnsafeCell::new(JmpBuf::new()),
        });

        let thread_handle = unsafe {
            let mut duped: HANDLE = std::ptr::null_mut();
            let current = GetCurrentThread();
            let ok = DuplicateHandle(
                GetCurrentProcess(),
                current,
                GetCurrentProcess(),
                &mut duped,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            );
            if ok == 0 {
                anyhow::bail!("DuplicateHandle failed while setting up a worker's timed executor");
            }
            duped
        };

        let timer_queue = unsafe { CreateTimerQueue() };
        if timer_queue.is_null() {
            pool_log::warn!("CreateTimerQueue failed; this worker will run without timeouts");
        }

        Ok(Self {
            thread_handle,
            handshake,
            timer_queue,
            timer_handle: std::cell::Cell::new(std::ptr::null_mut()),
        })
    }

    /// Serializes concurrent preempt attempts against each other (timer
    /// fire racing an explicit `cancel`); the two guardrails from §4.3
    /// themselves are evaluated with the target thread suspended, inside
    /// [`suspend_check_and_redirect`], not here. `preempting` is only
    /// cleared here when that call did *not* redirect the thread — once it
    /// has, only [`trampoline`], running later on the worker thread itself,
    /// is allowed to clear it.
    fn preempt(&self, reason: u8, id: JobId) {
        if self
            .handshake
            .preempting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let redirected = suspend_check_and_redirect(&self.handshake, self.thread_handle, reason, id);
        if !redirected {
            self.handshake.preempting.store(false, Ordering::Release);
        }
    }

    fn arm_timer(&self, timeout: Duration) {
        if self.timer_queue.is_null() {
            return;
        }
        let mut handle: HANDLE = std::ptr::null_mut();
        let ms = timeout.as_millis().min(u128::from(u32::MAX)) as u32;
        let ok = unsafe {
            CreateTimerQueueTimer(
                &mut handle,
                self.timer_queue,
                Some(on_timer_fire),
                self as *const Self as *mut std::ffi::c_void,
                ms,
                0,
                WT_EXECUTEONLYONCE,
            )
        };
        if ok != 0 {
            self.timer_handle.set(handle);
        }
    }

    fn disarm_timer(&self) {
        let handle = self.timer_handle.replace(std::ptr::null_mut());
        if !handle.is_null() {
            unsafe {
                DeleteTimerQueueTimer(self.timer_queue, handle, std::ptr::null_mut());
            }
        }
    }

    pub(crate) fn run(
        &self,
        call: Box<dyn FnOnce() + Send>,
        timeout: Duration,
        id: JobId,
    ) -> ExecResult {
        self.handshake.expected_job_id.store(id, Ordering::Relaxed);
        self.handshake.preempt_reason.store(REASON_NONE, Ordering::Relaxed);
        ACTIVE.with(|cell| cell.set(&*self.handshake as *const Handshake));

        let use_timeout = !self.timer_queue.is_null() && !timeout.is_zero();

        // SAFETY: matched by the `raw_longjmp` in `trampoline`, which only
        // ever runs on this thread after a context rewrite performed while
        // `interruptible` (set immediately below) was observed true.
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
    /// currently running, iff it is running `id`. `preempt` re-checks both
    /// guardrails itself, so this is safe even if `id` has already finished
    /// and been succeeded by another job by the time this call is
    /// scheduled.
    pub(crate) fn cancel(&self, id: JobId) {
        self.preempt(REASON_CANCELLED, id);
    }
}

impl Drop for Win32Executor {
    fn drop(&mut self) {
        self.disarm_timer();
        unsafe {
            if !self.timer_queue.is_null() {
                DeleteTimerQueueEx(self.timer_queue, std::ptr::null_mut());
            }
            CloseHandle(self.thread_handle);
        }
    }
}

impl std::fmt::Debug for Win32Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Win32Executor")
            .field("timer_enabled", &!self.timer_queue.is_null())
            .finish()
    }
}
