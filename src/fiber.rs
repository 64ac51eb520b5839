//! Stackful fiber primitive and the ready-fiber handoff record.
//!
//! A fiber is a user-mode execution context with its own stack. The
//! scheduler creates one fiber per task on demand; a task that waits on a
//! counter suspends its fiber back to the worker's dispatch loop, which
//! parks it inside a [`ReadyFiberBundle`] until the counter fires. The
//! parked fiber may then be resumed by any worker (or only by its pinned
//! worker), continuing exactly where it suspended.
//!
//! Context switching is provided by `corosensei`, which preserves the
//! callee-saved register set and performs no heap allocation per switch.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, UnsafeCell};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

type FiberYielder = Yielder<(), Arc<ReadyFiberBundle>>;
type FiberCoroutine = Coroutine<(), Arc<ReadyFiberBundle>, (), DefaultStack>;

/// Identifies a fiber for callbacks and tracing. Id 0 is the main fiber,
/// the native stack of the thread that initialized the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) usize);

impl FiberId {
    /// The main thread's native execution context.
    pub const MAIN: FiberId = FiberId(0);

    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Raw pointer to the fiber currently executing on this thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FiberHandle(pub(crate) *mut Fiber);

unsafe impl Send for FiberHandle {}

// Set around every resume so code running inside the fiber can find its own
// context (and through it, the yielder used to suspend).
thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberHandle>> = const { Cell::new(None) };
}

/// A stackful execution context with its own stack.
///
/// Suspending and resuming migrate freely across worker threads; the
/// `yielder` pointer is written once on first entry and only dereferenced
/// from whichever thread is currently running the fiber.
pub(crate) struct Fiber {
    coroutine: FiberCoroutine,
    /// Valid from first entry until the coroutine returns.
    yielder: UnsafeCell<*const FiberYielder>,
}

// SAFETY: the raw yielder pointer is only dereferenced while the fiber is
// executing, and exactly one thread runs a fiber at any instant (a parked
// fiber is handed over through ReadyFiberBundle's release/acquire protocol).
unsafe impl Send for Fiber {}

/// Outcome of one resume.
pub(crate) enum FiberState {
    /// The fiber suspended; the bundle it parked itself in is returned so
    /// the worker can install the fiber and publish it as switched.
    Yielded(Arc<ReadyFiberBundle>),
    /// The entry function ran to completion; the fiber is dead.
    Complete,
    /// The entry function panicked. The payload is caught at the resume
    /// boundary so it never crosses a fiber switch.
    Panicked(Box<dyn std::any::Any + Send>),
}

impl Fiber {
    /// Creates a fiber whose first resume will invoke `entry` on a fresh
    /// stack of `stack_size` bytes.
    pub(crate) fn new<F>(stack_size: usize, entry: F) -> io::Result<Box<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(stack_size)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder, ()| {
            // First entry: stash the yielder in the fiber record so that
            // wait operations deep in the task's call stack can suspend.
            let handle = Fiber::current().expect("fiber entry without a current fiber");
            // SAFETY: the handle was set by the resume() that invoked us and
            // points at the boxed fiber owning this coroutine.
            unsafe {
                *(*handle.0).yielder.get() = yielder as *const FiberYielder;
            }
            entry();
        });

        Ok(Box::new(Fiber {
            coroutine,
            yielder: UnsafeCell::new(std::ptr::null()),
        }))
    }

    pub(crate) fn id(&self) -> FiberId {
        FiberId(self as *const Fiber as usize)
    }

    /// Transfers control into the fiber until it suspends or completes.
    pub(crate) fn resume(&mut self) -> FiberState {
        let handle = FiberHandle(self as *mut Fiber);
        CURRENT_FIBER.set(Some(handle));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.coroutine.resume(())
        }));

        CURRENT_FIBER.set(None);

        match result {
            Ok(CoroutineResult::Yield(bundle)) => FiberState::Yielded(bundle),
            Ok(CoroutineResult::Return(())) => FiberState::Complete,
            Err(payload) => FiberState::Panicked(payload),
        }
    }

    /// Handle to the fiber currently executing on this thread, if any.
    pub(crate) fn current() -> Option<FiberHandle> {
        CURRENT_FIBER.get()
    }
}

/// Id of the fiber currently executing on this thread.
pub(crate) fn current_fiber_id() -> Option<FiberId> {
    Fiber::current().map(|handle| FiberId(handle.0 as usize))
}

/// Suspends the fiber currently executing on this thread, handing `bundle`
/// to the worker's dispatch loop.
///
/// The loop installs the fiber into the bundle and release-publishes
/// `fiber_is_switched` once the outgoing switch has completed; until then
/// the bundle is visible to other workers but not resumable. The call
/// returns when some worker resumes the parked fiber.
pub(crate) fn suspend_current(bundle: Arc<ReadyFiberBundle>) {
    let handle = Fiber::current().expect("suspend_current called outside a fiber");
    // SAFETY: the yielder was stored at fiber entry and stays valid while
    // the coroutine is live; we are running inside it right now.
    unsafe {
        let yielder = *(*handle.0).yielder.get();
        debug_assert!(!yielder.is_null(), "fiber suspended before entry ran");
        (*yielder).suspend(bundle);
    }
}

/// Heap record tying a parked continuation to its readiness state; the
/// handoff token between the parker and the resumer.
///
/// One bundle is created per wait. The parker registers it (with a counter,
/// a pinned list, or as a resume marker in a queue) *before* the outgoing
/// switch completes, so a consumer must observe `fiber_is_switched` before
/// taking the fiber out.
pub(crate) struct ReadyFiberBundle {
    /// The parked fiber, installed by the source worker after the switch.
    fiber: UnsafeCell<Option<Box<Fiber>>>,
    /// True once the source worker has fully left the fiber's stack.
    fiber_is_switched: AtomicBool,
    /// Consumption-delay budget: consumers that encounter the bundle after
    /// the switch spend one unit each and only take the fiber once it is
    /// exhausted.
    spin_count: AtomicI32,
    /// Worker index this continuation must resume on, if any.
    pub(crate) pinned_thread: Option<usize>,
    /// A registered non-fiber thread (the main thread) waiting inline; it
    /// has no stack to hand over, so the bundle is born switched.
    pub(crate) thread_waiter: bool,
}

// SAFETY: the fiber slot is written by the source worker before the
// release store of `fiber_is_switched` and read by a consumer only after
// its acquire load observed the flag, so accesses never overlap.
unsafe impl Sync for ReadyFiberBundle {}

impl ReadyFiberBundle {
    pub(crate) fn for_fiber(pinned_thread: Option<usize>, spin_count: i32) -> Arc<Self> {
        Arc::new(ReadyFiberBundle {
            fiber: UnsafeCell::new(None),
            fiber_is_switched: AtomicBool::new(false),
            spin_count: AtomicI32::new(spin_count),
            pinned_thread,
            thread_waiter: false,
        })
    }

    pub(crate) fn for_thread(worker_index: usize) -> Arc<Self> {
        Arc::new(ReadyFiberBundle {
            fiber: UnsafeCell::new(None),
            fiber_is_switched: AtomicBool::new(true),
            spin_count: AtomicI32::new(0),
            pinned_thread: Some(worker_index),
            thread_waiter: true,
        })
    }

    /// Installs the parked fiber and publishes it as safely resumable.
    /// Called by the source worker once the outgoing switch has completed.
    pub(crate) fn install_fiber(&self, fiber: Box<Fiber>) {
        // SAFETY: no consumer touches the slot until the release store below.
        unsafe {
            *self.fiber.get() = Some(fiber);
        }
        self.fiber_is_switched.store(true, Ordering::Release);
    }

    /// The switched handshake. A consumer may resume the fiber only after
    /// the source worker has published `fiber_is_switched`; until then the
    /// caller skips this bundle and picks it up on a later pass. A positive
    /// `spin_count` additionally delays consumption for that many
    /// encounters after the switch, so a self-requeued yield cannot
    /// monopolize its worker before other queued work gets a turn.
    pub(crate) fn is_resumable(&self) -> bool {
        self.fiber_is_switched.load(Ordering::Acquire)
            && self.spin_count.fetch_sub(1, Ordering::Relaxed) <= 0
    }

    /// Takes the parked fiber out. Only valid after `is_resumable` returned
    /// true on this bundle.
    pub(crate) fn take_fiber(&self) -> Option<Box<Fiber>> {
        debug_assert!(self.fiber_is_switched.load(Ordering::Acquire));
        // SAFETY: the acquire load above synchronized with install_fiber's
        // release store; the source no longer touches the slot.
        unsafe { (*self.fiber.get()).take() }
    }
}
