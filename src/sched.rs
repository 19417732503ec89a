//! Scheduler state and the scheduler loop.
//!
//! The scheduler runs on its own context and stack. Every transition —
//! a preemption tick or a blocking primitive — switches into it; it
//! services any pending deadlock probe, rotates the run queue when a tick
//! asked for it, resolves sleep expiry, and switches into the new head.
//! The head of the run queue is always the thread that executes next, and
//! the zone flag is set by whichever side performed the switch in, so the
//! scheduler body runs entirely inside the protected zone.

use std::collections::VecDeque;
use std::time::Instant;

use crate::deadlock;
use crate::sync::{CondCb, MutexCb};
use crate::task::{Status, Tcb};
use crate::threading;
use crate::utils::fatal;
use crate::{Id, Runtime};

fn slot(id: Id) -> usize {
    id.get() as usize - 1
}

fn id_from_slot(index: usize) -> Id {
    Id::new(index as u64 + 1).unwrap()
}

/// All mutable runtime state: the thread arena, the queues, and the
/// mutex/cond tables. Guarded by a lock that is only ever taken inside a
/// protected zone and never held across a context switch.
pub(crate) struct SchedState {
    /// Thread records, slot = id − 1. Ids are never recycled; a reaped
    /// thread leaves a `None` behind. Boxing keeps stacks and saved
    /// contexts at stable addresses while the vector grows.
    threads: Vec<Option<Box<Tcb>>>,
    /// Threads eligible to run or sleeping; the head is current.
    pub(crate) run_queue: VecDeque<Id>,
    /// Enumeration root for the wait-graph scan: every thread that has not
    /// yet run to completion.
    pub(crate) not_finished: Vec<Id>,
    mutexes: Vec<Option<MutexCb>>,
    conds: Vec<Option<CondCb>>,
    /// Visit-stamp generation for the wait-graph scan.
    pub(crate) scan_generation: u32,
}

// The runtime is confined to the OS thread it was installed on (checked on
// every entry), so the raw context pointers inside are never shared.
unsafe impl Send for SchedState {}

impl SchedState {
    pub(crate) fn new() -> Self {
        Self {
            threads: Vec::new(),
            run_queue: VecDeque::new(),
            not_finished: Vec::new(),
            mutexes: Vec::new(),
            conds: Vec::new(),
            scan_generation: 0,
        }
    }

    pub(crate) fn with_initial_thread(main: Tcb) -> Self {
        let mut state = Self::new();
        let id = main.id;
        debug_assert_eq!(id, state.next_thread_id());
        state.insert_thread(main);
        state.run_queue.push_back(id);
        state.not_finished.push(id);
        state
    }

    pub(crate) fn next_thread_id(&self) -> Id {
        id_from_slot(self.threads.len())
    }

    pub(crate) fn insert_thread(&mut self, tcb: Tcb) {
        debug_assert_eq!(tcb.id, self.next_thread_id());
        self.threads.push(Some(Box::new(tcb)));
    }

    pub(crate) fn tcb(&self, id: Id) -> Option<&Tcb> {
        self.threads.get(slot(id))?.as_deref()
    }

    pub(crate) fn tcb_mut(&mut self, id: Id) -> &mut Tcb {
        self.threads[slot(id)]
            .as_deref_mut()
            .expect("stale thread id")
    }

    pub(crate) fn current_id(&self) -> Id {
        *self.run_queue.front().expect("run queue is empty")
    }

    pub(crate) fn current_mut(&mut self) -> &mut Tcb {
        let id = self.current_id();
        self.tcb_mut(id)
    }

    /// Drop a finished thread's record, releasing its stack. Returns the
    /// thread's result.
    pub(crate) fn reap(&mut self, id: Id) -> usize {
        let tcb = self.threads[slot(id)].take().expect("stale thread id");
        debug_assert_eq!(tcb.status, Status::Finished);
        debug_assert!(!self.not_finished.contains(&id));
        tcb.result
    }

    /// Move the head to the tail.
    pub(crate) fn rotate(&mut self) {
        if self.run_queue.len() > 1 {
            self.run_queue.rotate_left(1);
        }
    }

    /// Resolve the head of the run queue to a runnable thread: wake a
    /// sleeper whose deadline has elapsed, rotate past sleepers whose has
    /// not. Returns `None` when every queued thread is sleeping with a
    /// future deadline (the caller retries with a fresh `now`) — or when
    /// the queue is empty.
    pub(crate) fn select_runnable(&mut self, now: Instant) -> Option<Id> {
        for _ in 0..self.run_queue.len() {
            let head = self.current_id();
            let tcb = self.tcb_mut(head);
            match tcb.status {
                Status::Running => return Some(head),
                Status::Sleeping => {
                    let deadline = tcb.sleep_deadline.expect("sleeping thread has no deadline");
                    if deadline <= now {
                        tcb.status = Status::Running;
                        tcb.sleep_deadline = None;
                        return Some(head);
                    }
                    self.rotate();
                }
                Status::Waiting | Status::Finished => {
                    unreachable!("blocked thread in the run queue")
                }
            }
        }
        None
    }

    pub(crate) fn insert_mutex(&mut self, cb: MutexCb) -> Id {
        self.mutexes.push(Some(cb));
        id_from_slot(self.mutexes.len() - 1)
    }

    pub(crate) fn mutex(&self, id: Id) -> Option<&MutexCb> {
        self.mutexes.get(slot(id))?.as_ref()
    }

    pub(crate) fn mutex_mut(&mut self, id: Id) -> Option<&mut MutexCb> {
        self.mutexes.get_mut(slot(id))?.as_mut()
    }

    pub(crate) fn remove_mutex(&mut self, id: Id) {
        self.mutexes[slot(id)] = None;
    }

    pub(crate) fn insert_cond(&mut self, cb: CondCb) -> Id {
        self.conds.push(Some(cb));
        id_from_slot(self.conds.len() - 1)
    }

    pub(crate) fn cond(&self, id: Id) -> Option<&CondCb> {
        self.conds.get(slot(id))?.as_ref()
    }

    pub(crate) fn cond_mut(&mut self, id: Id) -> Option<&mut CondCb> {
        self.conds.get_mut(slot(id))?.as_mut()
    }

    pub(crate) fn remove_cond(&mut self, id: Id) {
        self.conds[slot(id)] = None;
    }

    pub(crate) fn live_threads(&self) -> impl Iterator<Item = &Tcb> {
        self.threads.iter().filter_map(|t| t.as_deref())
    }

    /// Structural invariants, checked on every scheduler pass in debug
    /// builds.
    #[cfg(debug_assertions)]
    pub(crate) fn validate(&self) {
        let mut queued = std::collections::HashSet::new();
        for &id in &self.run_queue {
            assert!(queued.insert(id), "thread {} queued twice", id);
        }
        for m in self.mutexes.iter().filter_map(|m| m.as_ref()) {
            if let Some(owner) = m.owner {
                assert!(!m.waiters.contains(&owner));
            }
            for &w in &m.waiters {
                assert!(queued.insert(w), "thread {} queued twice", w);
            }
        }
        for c in self.conds.iter().filter_map(|c| c.as_ref()) {
            for &w in &c.waiters {
                assert!(queued.insert(w), "thread {} queued twice", w);
            }
        }
        for t in self.live_threads() {
            let in_run_queue = self.run_queue.contains(&t.id);
            match t.status {
                Status::Running | Status::Sleeping => {
                    assert!(in_run_queue, "runnable thread {} not queued", t.id)
                }
                Status::Waiting => {
                    assert!(!in_run_queue);
                    let edges = [t.waiting_to_join, t.waiting_mutex, t.waiting_cond];
                    assert_eq!(
                        edges.iter().filter(|e| e.is_some()).count(),
                        1,
                        "waiting thread {} has no single wait edge",
                        t.id
                    );
                }
                Status::Finished => assert!(!in_run_queue),
            }
            if t.status != Status::Finished {
                if let Some(joiner) = t.joined_by {
                    assert_eq!(self.tcb(joiner).unwrap().waiting_to_join, Some(t.id));
                }
                if let Some(target) = t.waiting_to_join {
                    assert_eq!(self.tcb(target).unwrap().joined_by, Some(t.id));
                }
                if let Some(m) = t.waiting_mutex {
                    assert_ne!(self.mutex(m).unwrap().owner, Some(t.id));
                }
            }
        }
    }
}

/// Switch from the current thread into the scheduler. The caller must hold
/// the protected zone (ownership transfers with the switch) and must have
/// released the state lock. Returns once the thread is dispatched again.
pub(crate) fn switch_to_scheduler(rt: &Runtime, from: *mut libc::ucontext_t) {
    debug_assert!(rt.zone.is_inside());
    unsafe { threading::switch_context(from, rt.scheduler_ctx()) };
}

/// The scheduler loop, entered via context switch on every transition.
pub(crate) extern "C" fn scheduler_main() {
    let rt = Runtime::get();
    loop {
        // Whoever switched in set the zone flag; our own saved mask keeps
        // the tick blocked for the whole pass.
        debug_assert!(rt.zone.is_inside());
        let mut state = rt.sched.lock();

        if rt.probe_requested.swap(false, core::sync::atomic::Ordering::AcqRel) {
            let cycles = deadlock::scan(&mut state);
            report_cycles(&cycles);
        }

        if rt.should_rotate.swap(false, core::sync::atomic::Ordering::AcqRel) {
            state.rotate();
        }

        if state.run_queue.is_empty() {
            let cycles = deadlock::scan(&mut state);
            report_cycles(&cycles);
            for cycle in &cycles {
                eprintln!("wait cycle: {}", format_cycle(cycle));
            }
            fatal!("no runnable threads remain; all live threads are blocked on one another");
        }

        let next = loop {
            match state.select_runnable(Instant::now()) {
                Some(id) => break id,
                // Every queued thread is asleep; poll until the earliest
                // deadline passes.
                None => continue,
            }
        };

        #[cfg(debug_assertions)]
        state.validate();

        let to = state.tcb_mut(next).context.as_mut_ptr();
        rt.current_ctx
            .store(to, core::sync::atomic::Ordering::Release);
        drop(state);

        // Hand the zone to the dispatched thread: clear the flag here, let
        // the switch restore whatever mask the target saved.
        rt.zone.clear_for_dispatch();
        unsafe { threading::switch_context(rt.scheduler_ctx(), to) };
    }
}

fn report_cycles(cycles: &[Vec<Id>]) {
    for cycle in cycles {
        log::error!("deadlock: wait cycle {}", format_cycle(cycle));
    }
}

fn format_cycle(cycle: &[Id]) -> String {
    let mut out = String::new();
    for (i, id) in cycle.iter().enumerate() {
        if i > 0 {
            out.push_str(" -> ");
        }
        out.push_str(&id.to_string());
    }
    if let Some(first) = cycle.first() {
        out.push_str(" -> ");
        out.push_str(&first.to_string());
    }
    out
}
