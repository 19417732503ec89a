//! Join semantics: single-joiner enforcement, joining finished threads,
//! explicit exit, and reaped-id rejection.

use std::time::Duration;

use ult::{sleep, spawn, Entry, JoinError};

fn target(_: usize) -> usize {
    ult::sleep(Duration::from_millis(50));
    11
}

fn exiter(x: usize) -> usize {
    ult::exit(x * 11)
}

fn quick(x: usize) -> usize {
    x
}

#[test]
fn only_one_thread_may_join_a_target() {
    let _ = env_logger::builder().is_test(true).try_init();

    let t = spawn(Entry::Fn(target, 0));
    let first = spawn(Entry::Closure(Box::new(move || t.join().unwrap())));
    sleep(Duration::from_millis(10)); // let `first` park in its join
    assert_eq!(t.join(), Err(JoinError::AlreadyJoined));
    assert_eq!(first.join(), Ok(11));
    // `first` reaped the target; the id no longer resolves.
    assert_eq!(t.join(), Err(JoinError::BadId));

    // exit() stands in for returning from the entry.
    let e = spawn(Entry::Fn(exiter, 3));
    assert_eq!(e.join(), Ok(33));

    // Joining a thread that already finished reaps it immediately.
    let f = spawn(Entry::Fn(quick, 9));
    sleep(Duration::from_millis(10));
    assert_eq!(f.join(), Ok(9));
}
