//! Thread records and the thread-level operations: spawn, join, sleep,
//! and the exit transition.

use std::time::{Duration, Instant};

use crate::sched;
use crate::threading::Context;
use crate::utils::fatal;
use crate::{Id, JoinError, Runtime};

/// Fixed per-thread stack size.
pub(crate) const DEFAULT_STACK_SIZE: usize = 0x4000;

/// Backing storage for a spawned thread's stack.
#[repr(align(16))]
#[derive(Debug)]
pub(crate) struct StackStorage([u8; DEFAULT_STACK_SIZE]);

impl StackStorage {
    pub(crate) const LEN: usize = DEFAULT_STACK_SIZE;

    /// Allocate a zeroed stack directly on the heap. Building the array on
    /// the caller's stack first would overflow a thread spawning from its
    /// own fixed-size stack.
    pub(crate) fn new_boxed() -> Box<StackStorage> {
        let layout = std::alloc::Layout::new::<StackStorage>();
        // Safety: `StackStorage` is a plain byte array, so the all-zero
        // bit pattern is a valid value and the layout matches the type.
        unsafe {
            let p = std::alloc::alloc_zeroed(layout) as *mut StackStorage;
            if p.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(p)
        }
    }

    pub(crate) fn base_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

/// What a spawned thread runs.
pub enum Entry {
    /// A plain function and its argument.
    Fn(fn(usize) -> usize, usize),
    /// A boxed closure. `Send` is not required: every thread runs on the
    /// one OS thread the runtime is installed on.
    Closure(Box<dyn FnOnce() -> usize>),
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Entry::Fn(_, arg) => f.debug_tuple("Fn").field(arg).finish(),
            Entry::Closure(_) => f.write_str("Closure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Running,
    Waiting,
    Sleeping,
    Finished,
}

/// Per-thread record. Owns the thread's stack and saved context; everything
/// else is scheduler state guarded by the protected zone.
#[derive(Debug)]
pub(crate) struct Tcb {
    pub(crate) id: Id,
    pub(crate) status: Status,
    pub(crate) entry: Option<Entry>,
    pub(crate) result: usize,
    /// Meaningful only while `status == Sleeping`.
    pub(crate) sleep_deadline: Option<Instant>,
    /// The thread (at most one) blocked joining on this one.
    pub(crate) joined_by: Option<Id>,
    /// The thread this one is blocked joining on.
    pub(crate) waiting_to_join: Option<Id>,
    pub(crate) waiting_mutex: Option<Id>,
    pub(crate) waiting_cond: Option<Id>,
    /// Visit stamp for the wait-graph scan.
    pub(crate) explore_mark: u32,
    /// Keeps the stack alive for the context's lifetime; `None` for the
    /// adopted initial thread, which runs on the stack the process started
    /// with.
    pub(crate) _stack: Option<Box<StackStorage>>,
    pub(crate) context: Context,
}

impl Tcb {
    pub(crate) fn new(id: Id, entry: Entry, stack: Box<StackStorage>, context: Context) -> Self {
        Self {
            id,
            status: Status::Running,
            entry: Some(entry),
            result: 0,
            sleep_deadline: None,
            joined_by: None,
            waiting_to_join: None,
            waiting_mutex: None,
            waiting_cond: None,
            explore_mark: 0,
            _stack: Some(stack),
            context,
        }
    }

    /// Record for a thread the runtime adopts rather than creates. Its
    /// context is captured by the first switch out of it.
    pub(crate) fn adopted(id: Id) -> Self {
        Self {
            id,
            status: Status::Running,
            entry: None,
            result: 0,
            sleep_deadline: None,
            joined_by: None,
            waiting_to_join: None,
            waiting_mutex: None,
            waiting_cond: None,
            explore_mark: 0,
            _stack: None,
            context: Context::empty(),
        }
    }
}

/// First frame of every spawned thread. Runs the entry, then performs the
/// same transition as an explicit exit.
pub(crate) extern "C" fn thread_trampoline() {
    let rt = Runtime::get();
    // The context was built with an empty signal mask and the scheduler
    // cleared the zone flag before dispatching us.
    rt.zone.enter();
    let entry = {
        let mut state = rt.sched.lock();
        state.current_mut().entry.take()
    };
    rt.zone.leave();
    let entry = entry.expect("spawned thread has no entry");
    let result = match entry {
        Entry::Fn(f, arg) => f(arg),
        Entry::Closure(f) => f(),
    };
    finish_current(rt, result)
}

pub(crate) fn spawn(rt: &'static Runtime, entry: Entry) -> Id {
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let mut stack = StackStorage::new_boxed();
    let context = Context::for_entry(&mut stack, thread_trampoline, rt.scheduler_ctx(), false);
    let id = state.next_thread_id();
    state.insert_thread(Tcb::new(id, entry, stack, context));
    state.run_queue.push_back(id);
    state.not_finished.push(id);
    drop(state);
    rt.zone.leave();
    log::debug!("spawned thread {}", id);
    id
}

pub(crate) fn current_thread_id(rt: &'static Runtime) -> Id {
    rt.zone.enter();
    let state = rt.sched.lock();
    let id = state.current_id();
    drop(state);
    rt.zone.leave();
    id
}

/// Wait for `target` to finish and reap it, releasing its stack.
pub(crate) fn join(rt: &'static Runtime, target: Id) -> Result<usize, JoinError> {
    log::trace!("join({})", target);
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let current = state.current_id();
    let (status, joined_by) = match state.tcb(target) {
        Some(t) => (t.status, t.joined_by),
        None => {
            drop(state);
            rt.zone.leave();
            return Err(JoinError::BadId);
        }
    };
    if joined_by.is_some() {
        drop(state);
        rt.zone.leave();
        return Err(JoinError::AlreadyJoined);
    }
    if status == Status::Finished {
        let result = state.reap(target);
        drop(state);
        rt.zone.leave();
        return Ok(result);
    }

    // Self-join falls through here: the thread parks itself forever and the
    // wait-graph scan reports the one-node cycle.
    state.tcb_mut(target).joined_by = Some(current);
    {
        let cur = state.current_mut();
        cur.waiting_to_join = Some(target);
        cur.status = Status::Waiting;
    }
    state.run_queue.pop_front();
    let from = state.tcb_mut(current).context.as_mut_ptr();
    drop(state);
    sched::switch_to_scheduler(rt, from);
    // The exit transition of `target` moved us back to the run queue and
    // cleared `waiting_to_join`; all that remains is the reap.
    rt.zone.enter();
    let mut state = rt.sched.lock();
    debug_assert_eq!(state.tcb(target).map(|t| t.status), Some(Status::Finished));
    let result = state.reap(target);
    drop(state);
    rt.zone.leave();
    Ok(result)
}

/// Put the current thread to sleep for at least `dur`. The thread stays in
/// the run queue in sleeping form; the scheduler's sweep wakes it once the
/// deadline elapses. `sleep(Duration::ZERO)` degenerates to a yield.
pub(crate) fn sleep(rt: &'static Runtime, dur: Duration) {
    log::trace!("sleep({:?})", dur);
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let current = state.current_id();
    {
        let cur = state.current_mut();
        cur.sleep_deadline = Some(Instant::now() + dur);
        cur.status = Status::Sleeping;
    }
    rt.should_rotate.store(true, core::sync::atomic::Ordering::Release);
    let from = state.tcb_mut(current).context.as_mut_ptr();
    drop(state);
    sched::switch_to_scheduler(rt, from);
    rt.zone.leave_after_resume();
}

/// The exit transition: mark the current thread finished, leave the run
/// queue and the not-finished set, wake the joiner if one is parked, and
/// switch away for good. Shared by the trampoline and the public `exit`.
pub(crate) fn finish_current(rt: &'static Runtime, result: usize) -> ! {
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let current = state.current_id();
    log::debug!("thread {} finished", current);
    {
        let cur = state.current_mut();
        cur.status = Status::Finished;
        cur.result = result;
    }
    state.run_queue.pop_front();
    state.not_finished.retain(|&id| id != current);
    if let Some(joiner) = state.tcb(current).and_then(|t| t.joined_by) {
        let j = state.tcb_mut(joiner);
        debug_assert_eq!(j.status, Status::Waiting);
        debug_assert_eq!(j.waiting_to_join, Some(current));
        j.status = Status::Running;
        j.waiting_to_join = None;
        state.run_queue.push_back(joiner);
    }
    let from = state.tcb_mut(current).context.as_mut_ptr();
    drop(state);
    sched::switch_to_scheduler(rt, from);
    fatal!("finished thread was scheduled again")
}
