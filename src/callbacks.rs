//! Event hooks for profilers and engine integration.

use crate::fiber::FiberId;

/// Observer hooks invoked by the scheduler around its lifecycle events.
///
/// All methods default to no-ops; implement only what you need. One
/// indirect call per event, nothing more. Implementations must not panic:
/// callbacks run on worker threads and on fiber stacks, and a panic there
/// leaves the scheduler in an undefined state.
pub trait EventCallbacks: Send + Sync {
    /// The worker thread records have been allocated; `n` includes the
    /// calling thread, which participates as worker 0.
    fn on_threads_created(&self, n: usize) {
        let _ = n;
    }

    /// Fibers created at init time (the main fiber).
    fn on_fibers_created(&self, n: usize) {
        let _ = n;
    }

    fn on_worker_thread_started(&self, index: usize) {
        let _ = index;
    }

    fn on_worker_thread_ended(&self, index: usize) {
        let _ = index;
    }

    /// A fiber is about to execute on the current worker.
    fn on_fiber_attached(&self, fiber: FiberId) {
        let _ = fiber;
    }

    /// A fiber left the current worker; `mid_task` is true when it
    /// suspended inside a wait rather than completing.
    fn on_fiber_detached(&self, fiber: FiberId, mid_task: bool) {
        let _ = (fiber, mid_task);
    }
}
