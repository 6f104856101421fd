//! Black-box end-to-end scenarios against the public surface, run under real
//! OS threads rather than a model checker.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use skein::{run, spawn, spawn_next, yield_now, PoolError, PoolOptions};

fn options(max_threads: usize) -> PoolOptions {
    PoolOptions { max_threads, stack_size: None }
}

#[test]
fn hello_task() {
    let result = run(options(1), async { 42 });
    assert_eq!(result.unwrap(), 42);
}

#[test]
fn fan_out_sums_ten_thousand_children() {
    let result = run(options(4), async {
        let handles: Vec<_> = (0..10_000).map(|_| spawn(async { 1u64 })).collect();
        let mut sum = 0u64;
        for handle in handles {
            sum += handle.await;
        }
        sum
    });
    assert_eq!(result.unwrap(), 10_000);
}

#[test]
fn yield_fairness_interleaves_on_a_single_worker() {
    static A: AtomicUsize = AtomicUsize::new(0);
    static B: AtomicUsize = AtomicUsize::new(0);
    static INTERLEAVED: AtomicUsize = AtomicUsize::new(0);

    let result = run(options(1), async {
        let a = spawn(async {
            for _ in 0..100 {
                A.fetch_add(1, Ordering::Relaxed);
                if A.load(Ordering::Relaxed) <= B.load(Ordering::Relaxed) + 1 {
                    INTERLEAVED.fetch_add(1, Ordering::Relaxed);
                }
                yield_now().await;
            }
        });
        let b = spawn(async {
            for _ in 0..100 {
                B.fetch_add(1, Ordering::Relaxed);
                yield_now().await;
            }
        });
        a.await;
        b.await;
    });
    result.unwrap();
    assert_eq!(A.load(Ordering::Relaxed), 100);
    assert_eq!(B.load(Ordering::Relaxed), 100);
    assert!(INTERLEAVED.load(Ordering::Relaxed) > 0, "expected at least one interleaving");
}

/// Scenario 4: `spawn_next(B)` then `spawn(C)` then suspend must run `B`
/// before `C` — the LIFO direct-hop chain takes priority over the local
/// ring's FIFO order.
#[test]
fn lifo_hint_runs_the_direct_successor_before_the_ring() {
    static ORDER: Mutex<Vec<&str>> = Mutex::new(Vec::new());

    let result = run(options(1), async {
        let b = spawn_next(async {
            ORDER.lock().unwrap().push("B");
        });
        let c = spawn(async {
            ORDER.lock().unwrap().push("C");
        });
        yield_now().await;
        b.await;
        c.await;
    });
    result.unwrap();
    assert_eq!(*ORDER.lock().unwrap(), vec!["B", "C"]);
}

/// Scenario 5: scheduling more children than the local ring's capacity (256,
/// see `local_queue::N`) in a single burst must still run every one of them
/// exactly once; the overflow-to-global-queue mechanism itself is unit-tested
/// directly in `local_queue.rs`'s `overflow_reports_a_remainder_batch`.
#[test]
fn overflow_burst_runs_every_child() {
    static COMPLETED: AtomicU64 = AtomicU64::new(0);

    let result = run(options(4), async {
        let handles: Vec<_> = (0..1024).map(|_| spawn(async { COMPLETED.fetch_add(1, Ordering::Relaxed); })).collect();
        for handle in handles {
            handle.await;
        }
    });
    result.unwrap();
    assert_eq!(COMPLETED.load(Ordering::Relaxed), 1024);
}

#[test]
fn deadlock_is_reported_once_every_worker_parks() {
    let result: Result<(), PoolError> = run(options(2), std::future::pending());
    assert!(matches!(result, Err(PoolError::AsyncFnDeadlocked)));
}
