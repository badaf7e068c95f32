//! End-to-end scenarios exercising real OS threads, timers, and wall-clock
//! delays. Kept separate from the fast synchronous unit tests colocated
//! with each module, the way the teacher keeps `msft-runtime`'s
//! integration-style `tests/work.rs` apart from its unit tests.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pool_core::{Pool, PoolConfig};

fn pool_with(workers: usize) -> Pool {
    let _ = env_logger::builder().is_test(true).try_init();
    Pool::new(PoolConfig {
        workers: NonZeroUsize::new(workers).unwrap(),
        ..PoolConfig::default()
    })
    .expect("pool construction should succeed in a test environment")
}

#[derive(Clone, Default)]
struct EventLog {
    events: Arc<Mutex<Vec<(i64, &'static str)>>>,
}

impl EventLog {
    fn record(&self, id: i64, kind: &'static str) {
        self.events.lock().unwrap().push((id, kind));
    }

    fn count(&self, kind: &'static str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }

    fn count_for(&self, id: i64, kind: &'static str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, k)| *i == id && *k == kind)
            .count()
    }
}

fn spin_until(stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        std::hint::spin_loop();
    }
}

/// Scenario 1: a single job that returns normally produces exactly one
/// `finished` event and nothing else.
#[test]
fn scenario_one_job_completes_cleanly() {
    let pool = pool_with(4);
    let log = EventLog::default();

    let l = log.clone();
    let id = pool.submit(0, move || l.record(0, "ran")).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(log.count("ran"), 1);
    assert_eq!(id, 0);
}

/// Scenario 2: a job that panics is reported and destroyed without taking
/// the worker down with it; the next job on the same worker still runs.
#[test]
fn scenario_panic_does_not_kill_the_worker() {
    let pool = pool_with(1);
    let done = Arc::new(AtomicBool::new(false));

    pool.submit(0, || panic!("boom"));

    let d = Arc::clone(&done);
    pool.submit(0, move || d.store(true, Ordering::Release));

    let deadline = Instant::now() + Duration::from_secs(2);
    while !done.load(Ordering::Acquire) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(done.load(Ordering::Acquire), "worker should survive a panicking job");
}

/// Scenario 3: a tight infinite loop with a 2s timeout is preempted and
/// reported within a loose bound on that timeout.
#[test]
#[cfg(unix)]
fn scenario_timeout_preempts_a_spinning_job() {
    let pool = pool_with(1);
    let finished = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&finished);
    let never_stops = Arc::new(AtomicBool::new(false));

    let start = Instant::now();
    pool.submit(2000, move || {
        spin_until(&never_stops);
        f.store(true, Ordering::Release);
    });

    let deadline = Instant::now() + Duration::from_millis(10_000);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let elapsed = start.elapsed();

    assert!(!finished.load(Ordering::Acquire), "the spin body must never return");
    assert!(elapsed >= Duration::from_millis(2000));
    assert!(elapsed <= Duration::from_millis(10_000));
}

/// Scenario 4: a job with no timeout is interrupted purely via an external
/// `cancel` after 10s of wall-clock time.
#[test]
#[cfg(unix)]
fn scenario_explicit_cancel_preempts_an_untimed_job() {
    let pool = pool_with(1);
    let never_stops = Arc::new(AtomicBool::new(false));
    let id = pool.submit(0, move || spin_until(&never_stops)).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    pool.cancel(id);

    // Give the preemption a generous window; the worker should be free to
    // accept further work once this returns.
    std::thread::sleep(Duration::from_millis(500));

    let ran = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&ran);
    pool.submit(0, move || r.store(true, Ordering::Release));

    let deadline = Instant::now() + Duration::from_secs(2);
    while !ran.load(Ordering::Acquire) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(ran.load(Ordering::Acquire), "worker should be free again after cancel");
}

/// Scenario 5: `cancel` against a job that has already finished must not
/// reach a later, different job scheduled onto the same worker — the
/// race the two-field handshake exists to close.
#[test]
#[cfg(unix)]
fn scenario_cancel_does_not_cross_into_the_next_job() {
    let pool = pool_with(1);

    pool.submit(1000, || {
        std::thread::sleep(Duration::from_millis(10));
    });

    let b_running = Arc::new(AtomicBool::new(true));
    let b_flag = Arc::clone(&b_running);
    let id_b = pool
        .submit(0, move || {
            let deadline = Instant::now() + Duration::from_millis(800);
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
            b_flag.store(false, Ordering::Release);
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    pool.cancel(0);

    std::thread::sleep(Duration::from_millis(1200));
    assert!(!b_running.load(Ordering::Acquire), "job B must have run to completion");
    let _ = id_b;
}

/// Scenario 6: a mixed batch across four workers, torn down mid-flight via
/// `stop`, produces the expected mix of terminal outcomes: exactly one
/// `threw`, exactly one `finished` for the returner, exactly one `finished`
/// for the bounded loop, and three jobs preempted on their timeout.
///
/// The pool reports outcomes only through the logging sink (§6), so this
/// test can't read an `Outcome` back for each job id. It instead has every
/// job closure record its own "started"/"finished" milestones directly:
/// a job that panics or is preempted never reaches its "finished" record,
/// which is enough to tell the four outcome classes apart without
/// reaching into the pool's internals.
#[test]
#[cfg(unix)]
fn scenario_mixed_batch_then_stop() {
    let mut pool = pool_with(4);
    let log = EventLog::default();

    let l = log.clone();
    pool.submit(1000, move || {
        l.record(0, "started");
        panic!("deliberate failure");
    });

    let l = log.clone();
    pool.submit(0, move || {
        l.record(1, "started");
        l.record(1, "finished");
    });

    let never_stops = Arc::new(AtomicBool::new(false));
    let l = log.clone();
    let n = Arc::clone(&never_stops);
    pool.submit(2000, move || {
        l.record(2, "started");
        spin_until(&n);
        l.record(2, "finished");
    });

    let l = log.clone();
    let n = Arc::clone(&never_stops);
    pool.submit(2500, move || {
        l.record(3, "started");
        spin_until(&n);
        l.record(3, "finished");
    });

    let iterations = Arc::new(AtomicUsize::new(0));
    let iters = Arc::clone(&iterations);
    let l = log.clone();
    pool.submit(0, move || {
        l.record(4, "started");
        for _ in 0..1_000_000 {
            iters.fetch_add(1, Ordering::Relaxed);
        }
        l.record(4, "finished");
    });

    let l = log.clone();
    let n = Arc::clone(&never_stops);
    pool.submit(3000, move || {
        l.record(5, "started");
        spin_until(&n);
        l.record(5, "finished");
    });

    std::thread::sleep(Duration::from_secs(5));

    let stop_started = Instant::now();
    pool.stop();
    let stop_elapsed = stop_started.elapsed();

    assert_eq!(iterations.load(Ordering::Relaxed), 1_000_000);

    for id in 0_i64..6 {
        assert_eq!(log.count_for(id, "started"), 1, "job {id} should have started exactly once");
    }

    // The panicking job (threw) never reaches its own "finished" record.
    assert_eq!(log.count_for(0, "finished"), 0, "job 0 panicked; must not report finished");
    // The returner and the bounded loop (finished) each complete exactly once.
    assert_eq!(log.count_for(1, "finished"), 1);
    assert_eq!(log.count_for(4, "finished"), 1);
    // The three tight spin loops have no cooperative exit of their own; the
    // only way any of them stops running is by being preempted on its
    // configured timeout (none of them is ever `cancel`led in this
    // scenario), so none should ever reach its own "finished" record.
    for id in [2_i64, 3, 5] {
        assert_eq!(log.count_for(id, "finished"), 0, "job {id} must never return on its own");
    }
    // `Pool::stop` joins every worker thread. If any of the three spinning
    // jobs had not actually been preempted, the worker still running it
    // would never return from the job body and `stop` could not have
    // returned at all, let alone promptly.
    assert!(
        stop_elapsed < Duration::from_secs(5),
        "stop() took {stop_elapsed:?}; a worker may still be stuck in an unpreempted job"
    );
}
