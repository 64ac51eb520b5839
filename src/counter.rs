//! Waitable counters: atomic values with a waiting list of parked fibers.
//!
//! Three variants share one base: [`AtomicFlag`] (one-shot event),
//! [`TaskCounter`] (pending-task count, waiters release at zero) and
//! [`FullAtomicCounter`] (free-valued, waiters name arbitrary targets).
//!
//! A waiter registers *before* its fiber has switched away, and a notifier
//! may fire concurrently with registration. Two mechanisms close the races:
//! the waiter list mutex serializes the value check in
//! `add_fiber_to_waiting_list` against the extraction scan in
//! `check_waiting_fibers` (no lost wakeups), and the `lock` counter marks
//! the notification window so a zero-wait fast path can drain in-flight
//! notifiers before returning.

use crate::fiber::ReadyFiberBundle;
use crate::scheduler::{SchedulerInner, TaskScheduler};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct WaitEntry {
    bundle: Arc<ReadyFiberBundle>,
    target: u32,
}

/// Shared state of all counter variants.
pub(crate) struct BaseCounter {
    value: AtomicU32,
    /// Count of notifiers currently inside their critical section.
    lock: AtomicUsize,
    waiters: Mutex<SmallVec<[WaitEntry; 4]>>,
    scheduler: Arc<SchedulerInner>,
}

impl BaseCounter {
    fn new(scheduler: Arc<SchedulerInner>, initial: u32) -> BaseCounter {
        BaseCounter {
            value: AtomicU32::new(initial),
            lock: AtomicUsize::new(0),
            waiters: Mutex::new(SmallVec::new()),
            scheduler,
        }
    }

    pub(crate) fn value(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Registers a waiter, unless the counter is already at `target`.
    ///
    /// Returns true ("already done") when the caller must not park. The
    /// value check and the insertion happen under the waiter mutex, so a
    /// concurrent state change either sees the new entry in its extraction
    /// scan or has already published the value this check observes.
    pub(crate) fn add_fiber_to_waiting_list(
        &self,
        bundle: Arc<ReadyFiberBundle>,
        target: u32,
    ) -> bool {
        self.lock.fetch_add(1, Ordering::AcqRel);
        let already_done = {
            let mut waiters = self.waiters.lock().unwrap();
            if self.value.load(Ordering::SeqCst) == target {
                true
            } else {
                waiters.push(WaitEntry { bundle, target });
                false
            }
        };
        self.lock.fetch_sub(1, Ordering::Release);
        already_done
    }

    /// Extracts every waiter whose target equals `value` and makes each one
    /// runnable through the scheduler.
    fn check_waiting_fibers(&self, value: u32) {
        self.lock.fetch_add(1, Ordering::AcqRel);
        let ready: SmallVec<[Arc<ReadyFiberBundle>; 4]> = {
            let mut waiters = self.waiters.lock().unwrap();
            let mut ready = SmallVec::new();
            waiters.retain(|entry| {
                if entry.target == value {
                    ready.push(Arc::clone(&entry.bundle));
                    false
                } else {
                    true
                }
            });
            ready
        };
        for bundle in ready {
            let pinned = bundle.pinned_thread;
            self.scheduler.add_ready_fiber(pinned, bundle);
        }
        self.lock.fetch_sub(1, Ordering::Release);
    }

    /// Spins until no notifier is inside its critical section. Used by the
    /// zero-wait fast path so a racing notifier cannot still hold
    /// references this caller is about to invalidate.
    pub(crate) fn wait_until_unlocked(&self) {
        while self.lock.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }
}

/// Tracks outstanding tasks. Starts at zero; `add` is called once per
/// submitted task (the scheduler does this in `add_task`/`add_tasks`) and
/// each completed task decrements. Waiters release when the count returns
/// to zero.
#[derive(Clone)]
pub struct TaskCounter {
    pub(crate) base: Arc<BaseCounter>,
}

impl TaskCounter {
    pub fn new(scheduler: &TaskScheduler) -> TaskCounter {
        TaskCounter {
            base: Arc::new(BaseCounter::new(scheduler.inner_arc(), 0)),
        }
    }

    pub fn add(&self, n: u32) {
        self.base.value.fetch_add(n, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        let previous = self.base.value.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "task counter decremented below zero");
        self.base.check_waiting_fibers(previous.wrapping_sub(1));
    }

    pub fn value(&self) -> u32 {
        self.base.value()
    }

    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }
}

/// One-shot binary event: transitions from unset to set once; every waiter
/// is released at that moment.
#[derive(Clone)]
pub struct AtomicFlag {
    pub(crate) base: Arc<BaseCounter>,
}

impl AtomicFlag {
    pub fn new(scheduler: &TaskScheduler) -> AtomicFlag {
        AtomicFlag {
            base: Arc::new(BaseCounter::new(scheduler.inner_arc(), 0)),
        }
    }

    pub fn set(&self) {
        self.base.value.store(1, Ordering::SeqCst);
        self.base.check_waiting_fibers(1);
    }

    /// Re-arms the flag. No waiters are notified.
    pub fn clear(&self) {
        self.base.value.store(0, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.base.value() != 0
    }
}

/// Free-valued atomic counter; waiters name the exact value they wait for.
#[derive(Clone)]
pub struct FullAtomicCounter {
    pub(crate) base: Arc<BaseCounter>,
}

impl FullAtomicCounter {
    pub fn new(scheduler: &TaskScheduler, initial: u32) -> FullAtomicCounter {
        FullAtomicCounter {
            base: Arc::new(BaseCounter::new(scheduler.inner_arc(), initial)),
        }
    }

    pub fn add(&self, n: u32) {
        let new = self.base.value.fetch_add(n, Ordering::SeqCst).wrapping_add(n);
        self.base.check_waiting_fibers(new);
    }

    pub fn decrement(&self) {
        let new = self.base.value.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1);
        self.base.check_waiting_fibers(new);
    }

    pub fn store(&self, value: u32) {
        self.base.value.store(value, Ordering::SeqCst);
        self.base.check_waiting_fibers(value);
    }

    pub fn load(&self) -> u32 {
        self.base.value()
    }
}
