//! A preemptive user-level threading runtime for hosted Linux
//! environments.
//!
//! The runtime multiplexes any number of user threads onto the one OS
//! thread it is installed on, switching between them with the `ucontext`
//! primitives. Switches happen both voluntarily — blocking on a mutex,
//! condition variable, join, or sleep — and involuntarily, driven by a
//! periodic timer signal at roughly 1 kHz. Scheduling is strictly
//! round-robin: the run queue's head is the executing thread, a tick moves
//! it to the tail, and newly runnable threads join at the tail.
//!
//! The runtime installs itself lazily on the first call into the crate,
//! adopting the calling OS thread's execution as user thread 1. All
//! subsequent calls must come from that same OS thread.
//!
//! Blocked threads form a wait-for graph across join, mutex, and
//! condition-variable edges. A scan over that graph runs when the
//! [`request_deadlock_probe`] signal asks for it, and when the run queue
//! drains completely — at which point the runtime reports every wait cycle
//! it can find and aborts, since no thread can ever run again.
//!
//! The runtime consumes `SIGUSR1` (the preemption tick, delivered by a
//! per-thread interval timer) and `SIGUSR2` (the deadlock probe). Programs
//! that raise these signals themselves will interfere with it.
//!
//! ```no_run
//! use ult::{spawn, Entry, Mutex};
//!
//! fn worker(arg: usize) -> usize {
//!     arg * 2
//! }
//!
//! let t = spawn(Entry::Fn(worker, 21));
//! assert_eq!(t.join(), Ok(42));
//!
//! let m = Mutex::new();
//! m.lock().unwrap();
//! m.unlock().unwrap();
//! m.destroy().unwrap();
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

use core::sync::atomic::{AtomicBool, AtomicPtr};
use std::cell::Cell;
use std::time::Duration;

use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;

mod deadlock;
mod sched;
mod sync;
mod task;
#[cfg(target_os = "linux")]
#[path = "threading_unix.rs"]
mod threading;
#[cfg(not(target_os = "linux"))]
#[path = "threading_unsupported.rs"]
mod threading;
mod utils;

use sched::SchedState;
use task::Tcb;
use threading::{Context, Zone};

pub use task::Entry;

/// Numeric value identifying a thread, mutex, or condition variable.
///
/// Each object kind draws from its own monotonic sequence starting at 1;
/// ids are never recycled. Zero is unrepresentable, encoding the "id 0 is
/// invalid" convention in the type.
pub type Id = core::num::NonZeroU64;

/// Error returned by [`Thread::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The handle does not refer to a live (unreaped) thread.
    BadId,
    /// Another thread is already joining the target.
    AlreadyJoined,
}

/// Error returned by [`Mutex::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The handle does not refer to a live mutex.
    BadId,
}

/// Error returned by [`Mutex::unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockError {
    /// The handle does not refer to a live mutex.
    BadId,
    /// The calling thread does not own the mutex.
    NotOwner,
}

/// Error returned by [`Mutex::destroy`] and [`Cond::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyError {
    /// The handle does not refer to a live object.
    BadId,
    /// The mutex is owned or has waiters; the cond has waiters.
    InUse,
}

/// Error returned by [`Cond::signal`] and [`Cond::broadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// The handle does not refer to a live condition variable.
    BadId,
    /// The waiter queue was empty; nothing was woken.
    NoWaiters,
}

/// Error returned by [`Cond::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// A handle does not refer to a live object.
    BadId,
    /// The calling thread does not own the mutex it asked to release.
    NotOwner,
}

/// The runtime's global state: the scheduler state behind its lock, the
/// protected-zone flag, and the plumbing the signal handlers need.
pub(crate) struct Runtime {
    pub(crate) sched: SpinMutex<SchedState>,
    pub(crate) zone: Zone,
    /// Set by the tick handler (and by `sleep`); consumed by the scheduler,
    /// which rotates the run queue once per observation.
    pub(crate) should_rotate: AtomicBool,
    /// Set by the probe handler; consumed by the scheduler, which runs a
    /// wait-graph scan.
    pub(crate) probe_requested: AtomicBool,
    /// The running thread's saved-context slot; what the tick handler
    /// switches out of. Updated by the scheduler before every dispatch.
    pub(crate) current_ctx: AtomicPtr<libc::ucontext_t>,
    scheduler_ctx: AtomicPtr<libc::ucontext_t>,
    tid: libc::pid_t,
}

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

thread_local! {
    static ON_RUNTIME_THREAD: Cell<bool> = Cell::new(false);
}

impl Runtime {
    /// The global runtime, installing it on first use. Panics when called
    /// from any OS thread other than the one the runtime was installed on.
    pub(crate) fn get() -> &'static Runtime {
        let rt = RUNTIME.get_or_init(Runtime::install);
        assert!(
            ON_RUNTIME_THREAD.with(|c| c.get()),
            "the threading runtime is confined to the OS thread that first used it"
        );
        rt
    }

    /// The global runtime if it is installed. Signal-handler safe (a
    /// single atomic load) and free of the calling-thread assertion.
    pub(crate) fn try_get() -> Option<&'static Runtime> {
        RUNTIME.get()
    }

    /// Adopt the calling OS thread: build the scheduler context, register
    /// the current execution as user thread 1, install the signal
    /// handlers, and start the preemption timer.
    fn install() -> Runtime {
        ON_RUNTIME_THREAD.with(|c| c.set(true));
        let tid = threading::current_tid();

        // The scheduler's stack and context live for the whole process.
        let scheduler_stack = Box::leak(task::StackStorage::new_boxed());
        let scheduler_ctx = Box::leak(Box::new(Context::for_entry(
            scheduler_stack,
            sched::scheduler_main,
            core::ptr::null_mut(),
            true,
        )));

        let main_id = Id::new(1).unwrap();
        let mut main = Tcb::adopted(main_id);
        let main_ctx = main.context.as_mut_ptr();
        let state = SchedState::with_initial_thread(main);

        let rt = Runtime {
            sched: SpinMutex::new(state),
            zone: Zone::new(),
            should_rotate: AtomicBool::new(false),
            probe_requested: AtomicBool::new(false),
            current_ctx: AtomicPtr::new(main_ctx),
            scheduler_ctx: AtomicPtr::new(scheduler_ctx.as_mut_ptr()),
            tid,
        };
        threading::install_handlers();
        threading::start_preemption_timer(tid);
        log::debug!("runtime installed on tid {}", tid);
        rt
    }

    pub(crate) fn scheduler_ctx(&self) -> *mut libc::ucontext_t {
        self.scheduler_ctx.load(core::sync::atomic::Ordering::Acquire)
    }
}

/// Handle to a user thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread(Id);

impl Thread {
    /// The currently executing thread. The first call from a fresh process
    /// installs the runtime and returns the adopted thread 1.
    pub fn current() -> Thread {
        Thread(task::current_thread_id(Runtime::get()))
    }

    /// The thread's id. Thread 1 is the adopted initial thread.
    pub fn id(self) -> Id {
        self.0
    }

    /// Wait until the thread finishes and return its result, releasing its
    /// stack. Each thread can be joined by at most one other thread; a
    /// concurrent second join fails with [`JoinError::AlreadyJoined`].
    ///
    /// Joining the current thread is not rejected: it blocks forever and
    /// shows up as a one-node cycle in the deadlock report.
    pub fn join(self) -> Result<usize, JoinError> {
        task::join(Runtime::get(), self.0)
    }
}

/// Start a new thread at the tail of the run queue.
pub fn spawn(entry: Entry) -> Thread {
    Thread(task::spawn(Runtime::get(), entry))
}

/// Block the current thread for at least `dur`. A zero duration yields the
/// remainder of the time slice and leaves the thread immediately runnable.
pub fn sleep(dur: Duration) {
    task::sleep(Runtime::get(), dur)
}

/// Finish the current thread with `result`, exactly as if its entry had
/// returned it. A thread parked in a join on this thread is woken.
pub fn exit(result: usize) -> ! {
    task::finish_current(Runtime::get(), result)
}

/// Ask the scheduler to run a wait-graph scan on its next pass and log any
/// cycles it finds. Unlike the rest of the crate this may be called from
/// any OS thread, so a watchdog can probe a runtime it suspects is stuck.
pub fn request_deadlock_probe() {
    if let Some(rt) = Runtime::try_get() {
        threading::raise_deadlock_probe(rt.tid);
    }
}

/// Handle to a runtime mutex.
///
/// Unlocking hands ownership directly to the first waiter, so a thread
/// that calls [`lock`](Mutex::lock) after the handoff queues behind it
/// rather than stealing the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mutex(Id);

impl Mutex {
    /// Create a mutex. Mutex ids form their own sequence starting at 1.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Mutex {
        Mutex(sync::mutex_init(Runtime::get()))
    }

    pub fn id(self) -> Id {
        self.0
    }

    /// Destroy the mutex. Fails while it is owned or has waiters.
    pub fn destroy(self) -> Result<(), DestroyError> {
        sync::mutex_destroy(Runtime::get(), self.0)
    }

    /// Acquire the mutex, blocking while another thread owns it. Locking a
    /// mutex the caller already owns succeeds immediately; this is not a
    /// counted recursive mutex, and the next unlock releases it outright.
    pub fn lock(self) -> Result<(), LockError> {
        sync::mutex_lock(Runtime::get(), self.0)
    }

    /// Release the mutex. Fails unless the caller owns it. Does not yield.
    pub fn unlock(self) -> Result<(), UnlockError> {
        sync::mutex_unlock(Runtime::get(), self.0)
    }
}

/// Handle to a runtime condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cond(Id);

impl Cond {
    /// Create a condition variable. Cond ids form their own sequence
    /// starting at 1.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Cond {
        Cond(sync::cond_init(Runtime::get()))
    }

    pub fn id(self) -> Id {
        self.0
    }

    /// Destroy the condition variable. Fails while threads are waiting.
    pub fn destroy(self) -> Result<(), DestroyError> {
        sync::cond_destroy(Runtime::get(), self.0)
    }

    /// Atomically release `mutex` and wait; re-acquire `mutex` before
    /// returning. Wakeups come only from [`signal`](Cond::signal) and
    /// [`broadcast`](Cond::broadcast) — never spuriously — and do not
    /// carry the mutex with them.
    pub fn wait(self, mutex: Mutex) -> Result<(), WaitError> {
        sync::cond_wait(Runtime::get(), self.0, mutex.0)
    }

    /// Wake the first waiter in FIFO order.
    pub fn signal(self) -> Result<(), NotifyError> {
        sync::cond_signal(Runtime::get(), self.0)
    }

    /// Wake every waiter, preserving FIFO order in the run queue.
    pub fn broadcast(self) -> Result<(), NotifyError> {
        sync::cond_broadcast(Runtime::get(), self.0)
    }
}
