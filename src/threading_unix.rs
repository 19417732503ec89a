//! Platform glue: context switching, the preemption signal, and the
//! protected-zone discipline.
//!
//! The execution-state primitive is the `ucontext` family. `swapcontext`
//! saves the caller's registers and signal mask into one context and resumes
//! another, so a function that switches away observes the switch as a call
//! that eventually returns. The preemption source is a `CLOCK_MONOTONIC`
//! interval timer that delivers [`PREEMPT_SIGNAL`] to the specific OS thread
//! the runtime was installed on; a second signal, [`DEADLOCK_SIGNAL`], asks
//! the scheduler to run a wait-graph scan on its next pass.

use core::sync::atomic::{AtomicBool, Ordering};
use std::mem;
use std::ptr;

use crate::task::StackStorage;
use crate::utils::fatal;
use crate::Runtime;

/// Signal used for the periodic preemption tick.
pub(crate) const PREEMPT_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Signal used to request an out-of-band deadlock scan.
pub(crate) const DEADLOCK_SIGNAL: libc::c_int = libc::SIGUSR2;

/// Preemption tick period. Advisory; correctness does not depend on it.
const TIMER_INTERVAL_NS: libc::c_long = 1_000_000;

/// A saved execution state: registers, signal mask, and (for spawned
/// threads) a stack to run on.
///
/// The `ucontext_t` is boxed so its address stays stable while thread
/// records move around their arena; `swapcontext` targets are raw pointers
/// into these boxes.
pub(crate) struct Context {
    inner: Box<libc::ucontext_t>,
}

impl Context {
    /// A zeroed context. The first `swapcontext` *out* of it fills it in,
    /// so this is the right initial state for an adopted thread.
    pub(crate) fn empty() -> Self {
        Self {
            inner: Box::new(unsafe { mem::zeroed() }),
        }
    }

    /// Build a context that begins executing `entry` on `stack` the first
    /// time it is switched into. `link` is resumed if `entry` ever returns;
    /// thread entries never do, but the scheduler context is wired in as a
    /// backstop anyway.
    ///
    /// `swapcontext` carries the signal mask with every save and restore,
    /// so the mask chosen here sticks to the context for good: thread
    /// contexts start preemptible (`start_masked = false`), while the
    /// scheduler context keeps the tick blocked for its entire life — a
    /// tick landing on the scheduler stack between the zone handoff and
    /// the outgoing switch would save scheduler state into some thread's
    /// context slot.
    pub(crate) fn for_entry(
        stack: &mut StackStorage,
        entry: extern "C" fn(),
        link: *mut libc::ucontext_t,
        start_masked: bool,
    ) -> Self {
        let mut ctx = Self::empty();
        let p = ctx.as_mut_ptr();
        if unsafe { libc::getcontext(p) } != 0 {
            fatal!("getcontext failed");
        }
        unsafe {
            (*p).uc_stack.ss_sp = stack.base_ptr() as *mut libc::c_void;
            (*p).uc_stack.ss_size = StackStorage::LEN;
            (*p).uc_stack.ss_flags = 0;
            (*p).uc_link = link;
            libc::sigemptyset(&mut (*p).uc_sigmask);
            if start_masked {
                libc::sigaddset(&mut (*p).uc_sigmask, PREEMPT_SIGNAL);
            }
            libc::makecontext(p, entry, 0);
        }
        ctx
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut *self.inner
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Context")
    }
}

/// Save the current execution state into `from` and resume `to`.
///
/// # Safety
///
/// Both pointers must refer to live contexts, and `to` must either have
/// been built by [`Context::for_entry`] or hold a state previously saved
/// here. The caller's stack must remain valid until the saved state is
/// resumed.
pub(crate) unsafe fn switch_context(from: *mut libc::ucontext_t, to: *const libc::ucontext_t) {
    if unsafe { libc::swapcontext(from, to) } != 0 {
        fatal!("swapcontext failed");
    }
}

/// The protected zone: an interval during which the preemption signal is
/// masked and runtime invariants may be temporarily violated.
///
/// Zones are not reentrant. The `inside` flag backs up the mask: the tick
/// handler checks it and defers, so a delivery that slips in before the
/// mask takes effect cannot reenter the runtime. Ownership of the zone
/// transfers across every switch into the scheduler — the switching side
/// sets the flag, the scheduler clears it just before dispatching the next
/// thread — and the signal mask itself travels with each saved context.
pub(crate) struct Zone {
    inside: AtomicBool,
}

impl Zone {
    pub(crate) const fn new() -> Self {
        Self {
            inside: AtomicBool::new(false),
        }
    }

    pub(crate) fn enter(&self) {
        block_preempt_signal();
        let was_inside = self.inside.swap(true, Ordering::AcqRel);
        assert!(!was_inside, "protected zone is not reentrant");
    }

    pub(crate) fn leave(&self) {
        let was_inside = self.inside.swap(false, Ordering::AcqRel);
        assert!(was_inside, "leaving a protected zone that was never entered");
        unblock_preempt_signal();
    }

    /// Rearm preemption after returning from a voluntary switch.
    ///
    /// A thread that blocked resumes with the mask it saved on the way out
    /// (signal blocked) but with the flag already cleared by the scheduler;
    /// only the mask needs undoing.
    pub(crate) fn leave_after_resume(&self) {
        debug_assert!(!self.inside.load(Ordering::Acquire));
        unblock_preempt_signal();
    }

    /// Flag half of the handoff to a dispatched thread. The scheduler's own
    /// mask stays blocked; the outgoing `swapcontext` restores whatever
    /// mask the target saved.
    pub(crate) fn clear_for_dispatch(&self) {
        self.inside.store(false, Ordering::Release);
    }

    /// Signal-handler entry: claim the zone if it is free. Returns `false`
    /// when some primitive already holds it, in which case the handler must
    /// back off and leave the flag alone.
    pub(crate) fn try_acquire_for_switch(&self) -> bool {
        !self.inside.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_inside(&self) -> bool {
        self.inside.load(Ordering::Acquire)
    }
}

fn preempt_sigset() -> libc::sigset_t {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PREEMPT_SIGNAL);
    }
    set
}

fn block_preempt_signal() {
    let set = preempt_sigset();
    if unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) } != 0 {
        fatal!("pthread_sigmask(SIG_BLOCK) failed");
    }
}

fn unblock_preempt_signal() {
    let set = preempt_sigset();
    if unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut()) } != 0 {
        fatal!("pthread_sigmask(SIG_UNBLOCK) failed");
    }
}

/// The preemption tick. Records the rotate request and, if no primitive is
/// inside a protected zone, switches from the running thread into the
/// scheduler. Nothing here allocates or logs; `swapcontext` is the entire
/// body of the "switch" arm.
extern "C" fn preempt_handler(_signum: libc::c_int) {
    let rt = match Runtime::try_get() {
        Some(rt) => rt,
        None => return,
    };
    rt.should_rotate.store(true, Ordering::Release);
    if !rt.zone.try_acquire_for_switch() {
        // A primitive owns the zone; it will reach the scheduler on its
        // own and honor the rotate request then.
        return;
    }
    let from = rt.current_ctx.load(Ordering::Acquire);
    let to = rt.scheduler_ctx();
    if unsafe { libc::swapcontext(from, to) } != 0 {
        // Nothing printable is signal-safe here.
        unsafe { libc::abort() };
    }
    // Resumed: the scheduler cleared the zone flag before dispatching us
    // and the saved (unmasked) state was restored. Plain return unwinds
    // the signal frame.
}

/// The deadlock probe. Only records the request; the scheduler services it
/// at the top of its next pass, inside its own protected zone.
extern "C" fn probe_handler(_signum: libc::c_int) {
    if let Some(rt) = Runtime::try_get() {
        rt.probe_requested.store(true, Ordering::Release);
    }
}

pub(crate) fn install_handlers() {
    install_handler(PREEMPT_SIGNAL, preempt_handler);
    install_handler(DEADLOCK_SIGNAL, probe_handler);
}

fn install_handler(signum: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = handler as usize;
    // SA_NODEFER keeps the mask saved inside the handler clean: a preempted
    // thread must resume preemptible. Reentry is bounded by the zone flag.
    sa.sa_flags = libc::SA_NODEFER | libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
    }
    if unsafe { libc::sigaction(signum, &sa, ptr::null_mut()) } != 0 {
        fatal!("sigaction({}) failed", signum);
    }
}

/// Start the periodic tick, directed at the OS thread `tid` so a
/// multi-threaded host process cannot receive it on the wrong thread.
pub(crate) fn start_preemption_timer(tid: libc::pid_t) {
    let mut sev: libc::sigevent = unsafe { mem::zeroed() };
    sev.sigev_notify = libc::SIGEV_THREAD_ID;
    sev.sigev_signo = PREEMPT_SIGNAL;
    sev.sigev_notify_thread_id = tid;
    let mut timer: libc::timer_t = unsafe { mem::zeroed() };
    if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) } != 0 {
        fatal!("timer_create failed");
    }
    let tick = libc::timespec {
        tv_sec: 0,
        tv_nsec: TIMER_INTERVAL_NS,
    };
    let spec = libc::itimerspec {
        it_interval: tick,
        it_value: tick,
    };
    if unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) } != 0 {
        fatal!("timer_settime failed");
    }
}

pub(crate) fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Deliver the deadlock-probe signal to the runtime's OS thread. Callable
/// from any thread.
pub(crate) fn raise_deadlock_probe(tid: libc::pid_t) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid() as libc::c_long,
            tid as libc::c_long,
            DEADLOCK_SIGNAL as libc::c_long,
        )
    };
    if rc != 0 {
        log::warn!("deadlock probe delivery failed");
    }
}
