//! Two threads take two mutexes in opposite orders and stop making
//! progress; the out-of-band probe reports the ring while the rest of the
//! process keeps running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ult::{request_deadlock_probe, sleep, spawn, Entry, Mutex};

static PROGRESS: AtomicUsize = AtomicUsize::new(0);

fn grab_both(first: Mutex, second: Mutex) -> usize {
    first.lock().unwrap();
    // Give the other thread time to take its first mutex.
    sleep(Duration::from_millis(20));
    second.lock().unwrap();
    PROGRESS.fetch_add(1, Ordering::Relaxed);
    second.unlock().unwrap();
    first.unlock().unwrap();
    0
}

#[test]
fn probe_reports_a_lock_order_ring_without_stopping_the_world() {
    let _ = env_logger::builder().is_test(true).try_init();

    let m1 = Mutex::new();
    let m2 = Mutex::new();
    spawn(Entry::Closure(Box::new(move || grab_both(m1, m2))));
    spawn(Entry::Closure(Box::new(move || grab_both(m2, m1))));

    // Both threads are parked on each other's mutex by now.
    sleep(Duration::from_millis(100));
    assert_eq!(PROGRESS.load(Ordering::Relaxed), 0);

    // The probe runs on the scheduler's next pass and logs the cycle; this
    // thread stays runnable throughout.
    request_deadlock_probe();
    sleep(Duration::from_millis(50));
    assert_eq!(PROGRESS.load(Ordering::Relaxed), 0);

    // Both mutexes are wedged inside the ring, so destroy must refuse.
    assert!(m1.destroy().is_err());
    assert!(m2.destroy().is_err());
}
