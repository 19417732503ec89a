//! A bounded queue shared by producers and consumers, coordinated with a
//! mutex and two condition variables, terminated by sentinels.

use std::cell::UnsafeCell;
use std::time::Duration;

use ult::{sleep, spawn, Cond, DestroyError, Entry, Mutex, NotifyError};

const CAPACITY: usize = 20;
const PRODUCERS: usize = 3;
const BATCHES: usize = 10;
const BATCH: usize = 10;
const CONSUMERS: usize = 5;
const TOTAL: usize = PRODUCERS * BATCHES * BATCH;
const SENTINEL: usize = 0;

/// Shared data guarded by a runtime mutex rather than a host lock. Every
/// access happens between `lock` and `unlock` on the same [`Mutex`].
struct Guarded<T>(UnsafeCell<T>);

// Safety: all threads run on the one OS thread the runtime owns, and the
// runtime mutex serializes every access.
unsafe impl<T> Sync for Guarded<T> {}

static QUEUE: Guarded<Vec<usize>> = Guarded(UnsafeCell::new(Vec::new()));
static CONSUMED: Guarded<Vec<usize>> = Guarded(UnsafeCell::new(Vec::new()));

fn queue() -> &'static mut Vec<usize> {
    // Safety: called only while holding the queue mutex; see `Guarded`.
    unsafe { &mut *QUEUE.0.get() }
}

fn consumed() -> &'static mut Vec<usize> {
    // Safety: called only while holding the queue mutex; see `Guarded`.
    unsafe { &mut *CONSUMED.0.get() }
}

fn produce(m: Mutex, not_empty: Cond, not_full: Cond, index: usize) -> usize {
    for batch in 0..BATCHES {
        m.lock().unwrap();
        for i in 0..BATCH {
            while queue().len() == CAPACITY {
                not_full.wait(m).unwrap();
            }
            queue().push(index * BATCHES * BATCH + batch * BATCH + i + 1);
            let _ = not_empty.signal();
        }
        m.unlock().unwrap();
    }
    0
}

fn consume(m: Mutex, not_empty: Cond, not_full: Cond) -> usize {
    let mut count = 0;
    loop {
        m.lock().unwrap();
        while queue().is_empty() {
            not_empty.wait(m).unwrap();
        }
        let v = queue().remove(0);
        let _ = not_full.signal();
        if v != SENTINEL {
            consumed().push(v);
        }
        m.unlock().unwrap();
        if v == SENTINEL {
            break;
        }
        count += 1;
    }
    count
}

#[test]
fn every_produced_value_is_consumed_exactly_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let m = Mutex::new();
    let not_empty = Cond::new();
    let not_full = Cond::new();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| spawn(Entry::Closure(Box::new(move || consume(m, not_empty, not_full)))))
        .collect();
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| spawn(Entry::Closure(Box::new(move || produce(m, not_empty, not_full, p)))))
        .collect();

    for p in producers {
        assert_eq!(p.join(), Ok(0));
    }

    // One sentinel per consumer, pushed under the same capacity protocol.
    m.lock().unwrap();
    for _ in 0..CONSUMERS {
        while queue().len() == CAPACITY {
            not_full.wait(m).unwrap();
        }
        queue().push(SENTINEL);
        let _ = not_empty.signal();
    }
    m.unlock().unwrap();

    let mut total = 0;
    for c in consumers {
        total += c.join().unwrap();
    }
    assert_eq!(total, TOTAL);

    m.lock().unwrap();
    let mut seen = consumed().clone();
    assert!(queue().is_empty());
    m.unlock().unwrap();
    seen.sort_unstable();
    let expected: Vec<usize> = (1..=TOTAL).collect();
    assert_eq!(seen, expected);

    // Waking nobody reports it and leaves everything intact.
    assert_eq!(not_empty.signal(), Err(NotifyError::NoWaiters));
    assert_eq!(not_empty.broadcast(), Err(NotifyError::NoWaiters));

    // A signaled waiter owns the mutex again once `wait` returns, even
    // when the signaler is holding it at signal time.
    let w = spawn(Entry::Closure(Box::new(move || {
        m.lock().unwrap();
        not_empty.wait(m).unwrap();
        m.unlock().unwrap();
        5
    })));
    sleep(Duration::from_millis(10)); // let the waiter park
    m.lock().unwrap();
    assert_eq!(not_empty.destroy(), Err(DestroyError::InUse));
    not_empty.signal().unwrap();
    m.unlock().unwrap();
    assert_eq!(w.join(), Ok(5));

    not_empty.destroy().unwrap();
    not_full.destroy().unwrap();
    m.destroy().unwrap();
}
