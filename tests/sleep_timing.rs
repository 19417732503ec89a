//! Sleeping threads, the zero-duration yield, and result propagation
//! through join.

use std::time::{Duration, Instant};

use ult::{spawn, Entry, Thread};

fn sleeper(_: usize) -> usize {
    ult::sleep(Duration::from_millis(100));
    0xDEAD_BEEF
}

fn yielder(_: usize) -> usize {
    for _ in 0..10 {
        // Zero sleep degenerates to a yield; the thread stays runnable.
        ult::sleep(Duration::ZERO);
    }
    7
}

#[test]
fn sleep_blocks_for_the_duration_and_join_returns_the_result() {
    let _ = env_logger::builder().is_test(true).try_init();

    // The adopted initial thread is id 1; spawned ids count up from there.
    assert_eq!(Thread::current().id().get(), 1);

    let started = Instant::now();
    let t = spawn(Entry::Fn(sleeper, 0));
    assert_eq!(t.id().get(), 2);
    assert_eq!(t.join(), Ok(0xDEAD_BEEF));
    assert!(started.elapsed() >= Duration::from_millis(100));

    let y = spawn(Entry::Fn(yielder, 0));
    assert_eq!(y.join(), Ok(7));
}
