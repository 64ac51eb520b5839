//! Closure-style front-end over the scheduler core.
//!
//! Mirrors the bound-scheduler model of engine task systems: bind a
//! scheduler to the current thread once, then use the free functions
//! without threading a handle through every call site. Worker threads bind
//! themselves, so [`schedule`] and [`sync`] work inside task bodies too.
//! Because tasks run on stackful fibers, a scheduled closure may wait
//! directly; no suspension-point annotations are needed.
//!
//! ```no_run
//! use weft::{SchedulerInitOptions, TaskScheduler};
//! use weft::co::{self, Event};
//!
//! let mut scheduler = TaskScheduler::new();
//! scheduler.init(SchedulerInitOptions::default()).unwrap();
//! co::bind(&scheduler);
//!
//! let event = Event::new();
//! let done = event.clone();
//! co::schedule(move || {
//!     // ... do work ...
//!     done.notify();
//! });
//! co::sync(&event);
//!
//! co::unbind();
//! ```

use crate::counter::{AtomicFlag, TaskCounter};
use crate::scheduler::TaskScheduler;
use crate::task::{Task, TaskPriority};
use std::cell::RefCell;

thread_local! {
    static BOUND: RefCell<Option<TaskScheduler>> = const { RefCell::new(None) };
}

/// Binds `scheduler` as the current thread's scheduler.
pub fn bind(scheduler: &TaskScheduler) {
    BOUND.with(|slot| {
        *slot.borrow_mut() = Some(scheduler.view_clone());
    });
}

/// Releases the current thread's binding.
pub fn unbind() {
    BOUND.with(|slot| {
        slot.borrow_mut().take();
    });
}

// A clone is taken out of the slot rather than a borrow held across the
// call: waits suspend the fiber, and a RefCell borrow must not travel to
// another thread with it.
fn bound() -> TaskScheduler {
    BOUND.with(|slot| {
        slot.borrow()
            .as_ref()
            .expect("no task scheduler bound on this thread")
            .view_clone()
    })
}

/// Submits `f` as a Normal-priority task on the bound scheduler.
pub fn schedule<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    bound().add_task(Task::new(move |_| f()), TaskPriority::Normal, None);
}

/// Suspends until `event` is notified.
pub fn sync(event: &Event) {
    bound().wait_for_flag(&event.flag, false);
}

/// Suspends until `counter` returns to zero.
pub fn wait(counter: &TaskCounter) {
    bound().wait_for_counter(counter, false);
}

/// Creates a counter on the bound scheduler.
pub fn counter() -> TaskCounter {
    TaskCounter::new(&bound())
}

/// A one-shot completion event; clones share the same state.
#[derive(Clone)]
pub struct Event {
    flag: AtomicFlag,
}

impl Event {
    /// Creates an event on the bound scheduler.
    pub fn new() -> Event {
        Event {
            flag: AtomicFlag::new(&bound()),
        }
    }

    /// Releases every waiter, current and future.
    pub fn notify(&self) {
        self.flag.set();
    }

    pub fn finished(&self) -> bool {
        self.flag.is_set()
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}
