//! Mutex and condition-variable control blocks and their operations.
//!
//! Wake-ups preserve FIFO order within each waiter queue. An unlock with
//! waiters hands the mutex directly to the queue head: ownership is
//! assigned before anyone else can observe the mutex free, so there is no
//! window for a third thread to steal the lock. Signaling a condition
//! variable does not transfer the associated mutex; the woken thread
//! re-contends for it on its way out of `wait`.

use std::collections::VecDeque;

use crate::sched::{self, SchedState};
use crate::task::Status;
use crate::{DestroyError, Id, LockError, NotifyError, Runtime, UnlockError, WaitError};

#[derive(Debug)]
pub(crate) struct MutexCb {
    pub(crate) owner: Option<Id>,
    pub(crate) waiters: VecDeque<Id>,
}

impl MutexCb {
    pub(crate) fn new() -> Self {
        Self {
            owner: None,
            waiters: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CondCb {
    pub(crate) waiters: VecDeque<Id>,
}

impl CondCb {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }
}

pub(crate) fn mutex_init(rt: &'static Runtime) -> Id {
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let id = state.insert_mutex(MutexCb::new());
    drop(state);
    rt.zone.leave();
    log::debug!("mutex {} created", id);
    id
}

pub(crate) fn mutex_destroy(rt: &'static Runtime, mutex: Id) -> Result<(), DestroyError> {
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let result = match state.mutex(mutex) {
        None => Err(DestroyError::BadId),
        Some(m) if m.owner.is_some() || !m.waiters.is_empty() => Err(DestroyError::InUse),
        Some(_) => {
            state.remove_mutex(mutex);
            Ok(())
        }
    };
    drop(state);
    rt.zone.leave();
    result
}

/// Acquire `mutex`, blocking while another thread owns it.
///
/// Locking a mutex the caller already owns succeeds immediately. This is
/// not a counted recursive mutex: unlock does not track depth, so a thread
/// that locks twice observes the mutex released after one unlock.
pub(crate) fn mutex_lock(rt: &'static Runtime, mutex: Id) -> Result<(), LockError> {
    log::trace!("mutex_lock({})", mutex);
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let current = state.current_id();
    let m = match state.mutex_mut(mutex) {
        Some(m) => m,
        None => {
            drop(state);
            rt.zone.leave();
            return Err(LockError::BadId);
        }
    };
    match m.owner {
        None => {
            m.owner = Some(current);
            drop(state);
            rt.zone.leave();
        }
        Some(owner) if owner == current => {
            drop(state);
            rt.zone.leave();
        }
        Some(_) => {
            m.waiters.push_back(current);
            {
                let cur = state.current_mut();
                cur.status = Status::Waiting;
                cur.waiting_mutex = Some(mutex);
            }
            state.run_queue.pop_front();
            let from = state.tcb_mut(current).context.as_mut_ptr();
            drop(state);
            sched::switch_to_scheduler(rt, from);
            // The releasing thread handed ownership to us before requeueing
            // us, so there is nothing left to claim.
            rt.zone.leave_after_resume();
        }
    }
    Ok(())
}

/// Release `mutex` while the scheduler state is already locked. Shared by
/// `mutex_unlock` and the atomic release inside `cond_wait`.
fn release_owned_mutex(
    state: &mut SchedState,
    mutex: Id,
    current: Id,
) -> Result<(), UnlockError> {
    let m = match state.mutex_mut(mutex) {
        Some(m) => m,
        None => return Err(UnlockError::BadId),
    };
    if m.owner != Some(current) {
        return Err(UnlockError::NotOwner);
    }
    m.owner = None;
    if let Some(next) = m.waiters.pop_front() {
        // Direct handoff: the head waiter owns the mutex from this point.
        m.owner = Some(next);
        let t = state.tcb_mut(next);
        debug_assert_eq!(t.status, Status::Waiting);
        debug_assert_eq!(t.waiting_mutex, Some(mutex));
        t.status = Status::Running;
        t.waiting_mutex = None;
        state.run_queue.push_back(next);
    }
    Ok(())
}

/// Release `mutex`. Does not yield; the woken waiter (if any) runs when
/// round-robin order reaches it.
pub(crate) fn mutex_unlock(rt: &'static Runtime, mutex: Id) -> Result<(), UnlockError> {
    log::trace!("mutex_unlock({})", mutex);
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let current = state.current_id();
    let result = release_owned_mutex(&mut state, mutex, current);
    drop(state);
    rt.zone.leave();
    result
}

pub(crate) fn cond_init(rt: &'static Runtime) -> Id {
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let id = state.insert_cond(CondCb::new());
    drop(state);
    rt.zone.leave();
    log::debug!("cond {} created", id);
    id
}

pub(crate) fn cond_destroy(rt: &'static Runtime, cond: Id) -> Result<(), DestroyError> {
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let result = match state.cond(cond) {
        None => Err(DestroyError::BadId),
        Some(c) if !c.waiters.is_empty() => Err(DestroyError::InUse),
        Some(_) => {
            state.remove_cond(cond);
            Ok(())
        }
    };
    drop(state);
    rt.zone.leave();
    result
}

/// Atomically release `mutex` and wait on `cond`; re-acquire `mutex`
/// before returning. There are no spurious wakeups: only `signal` and
/// `broadcast` remove entries from the waiter queue.
pub(crate) fn cond_wait(rt: &'static Runtime, cond: Id, mutex: Id) -> Result<(), WaitError> {
    log::trace!("cond_wait({}, {})", cond, mutex);
    rt.zone.enter();
    let mut state = rt.sched.lock();
    if state.cond(cond).is_none() {
        drop(state);
        rt.zone.leave();
        return Err(WaitError::BadId);
    }
    let current = state.current_id();
    // Release inline rather than through mutex_unlock: the zone is already
    // held and the release must be indivisible from the enqueue below.
    if let Err(e) = release_owned_mutex(&mut state, mutex, current) {
        drop(state);
        rt.zone.leave();
        return Err(match e {
            UnlockError::BadId => WaitError::BadId,
            UnlockError::NotOwner => WaitError::NotOwner,
        });
    }
    state.cond_mut(cond).unwrap().waiters.push_back(current);
    {
        let cur = state.current_mut();
        cur.status = Status::Waiting;
        cur.waiting_cond = Some(cond);
    }
    state.run_queue.pop_front();
    let from = state.tcb_mut(current).context.as_mut_ptr();
    drop(state);
    sched::switch_to_scheduler(rt, from);
    rt.zone.leave_after_resume();
    // Signaled; the mutex was not handed over with the wakeup.
    mutex_lock(rt, mutex).map_err(|_| WaitError::BadId)
}

fn wake_one(state: &mut SchedState, cond: Id) -> Option<Id> {
    let next = state.cond_mut(cond).unwrap().waiters.pop_front()?;
    let t = state.tcb_mut(next);
    debug_assert_eq!(t.status, Status::Waiting);
    debug_assert_eq!(t.waiting_cond, Some(cond));
    t.status = Status::Running;
    t.waiting_cond = None;
    state.run_queue.push_back(next);
    Some(next)
}

/// Wake the head waiter. Waking an empty queue is reported as
/// [`NotifyError::NoWaiters`]; state is unchanged.
pub(crate) fn cond_signal(rt: &'static Runtime, cond: Id) -> Result<(), NotifyError> {
    log::trace!("cond_signal({})", cond);
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let result = if state.cond(cond).is_none() {
        Err(NotifyError::BadId)
    } else if wake_one(&mut state, cond).is_some() {
        Ok(())
    } else {
        Err(NotifyError::NoWaiters)
    };
    drop(state);
    rt.zone.leave();
    result
}

/// Wake every waiter, preserving queue order in the run queue.
pub(crate) fn cond_broadcast(rt: &'static Runtime, cond: Id) -> Result<(), NotifyError> {
    log::trace!("cond_broadcast({})", cond);
    rt.zone.enter();
    let mut state = rt.sched.lock();
    let result = if state.cond(cond).is_none() {
        Err(NotifyError::BadId)
    } else if wake_one(&mut state, cond).is_some() {
        while wake_one(&mut state, cond).is_some() {}
        Ok(())
    } else {
        Err(NotifyError::NoWaiters)
    };
    drop(state);
    rt.zone.leave();
    result
}
