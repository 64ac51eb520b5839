//! Work-stealing deque, one per worker per priority class.
//!
//! Chase-Lev contract: the owner pushes and pops from one end (LIFO), any
//! other thread steals from the opposite end (FIFO from the owner's
//! perspective). A steal may spuriously report [`Steal::Retry`] under
//! contention; callers retry. Backed by `crossbeam`'s deque.

use crossbeam::deque::{Stealer, Worker as Deque};

pub(crate) use crossbeam::deque::Steal;

/// Owner end of the deque. Push/pop must only be called from the worker
/// thread that owns the queue.
pub(crate) struct WorkStealingQueue<T> {
    deque: Deque<T>,
}

/// Thief end; shareable across all workers.
pub(crate) struct WorkStealer<T> {
    stealer: Stealer<T>,
}

impl<T> WorkStealingQueue<T> {
    pub(crate) fn new() -> (Self, WorkStealer<T>) {
        let deque = Deque::new_lifo();
        let stealer = deque.stealer();
        (WorkStealingQueue { deque }, WorkStealer { stealer })
    }

    /// Owner only. Never blocks.
    pub(crate) fn push(&self, value: T) {
        self.deque.push(value);
    }

    /// Owner only. Returns the most recently pushed item.
    pub(crate) fn pop(&self) -> Option<T> {
        self.deque.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }
}

impl<T> WorkStealer<T> {
    /// Any thread. Returns the oldest item; a failed race leaves the queue
    /// intact and reports `Retry`.
    pub(crate) fn steal(&self) -> Steal<T> {
        self.stealer.steal()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stealer.is_empty()
    }
}
