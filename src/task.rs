//! Task definitions: the unit of work handed to the scheduler.

use crate::counter::TaskCounter;
use crate::fiber::ReadyFiberBundle;
use crate::scheduler::TaskScheduler;
use std::sync::Arc;

/// Scheduling class. Ready-fiber resume markers always travel through the
/// High queue so suspended work is never starved by fresh submissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
}

/// A unit of work. The closure runs on a fiber and may therefore call the
/// scheduler's wait operations; captures stay alive until the task
/// completes and are dropped afterwards.
pub struct Task {
    pub(crate) function: Box<dyn FnOnce(&TaskScheduler) + Send + 'static>,
}

impl Task {
    pub fn new<F>(function: F) -> Task
    where
        F: FnOnce(&TaskScheduler) + Send + 'static,
    {
        Task {
            function: Box::new(function),
        }
    }
}

/// What a queue slot actually carries: a runnable task, or a marker that
/// resumes a parked fiber. The marker flows through the same queues as
/// ordinary work so resumption inherits the stealing and ordering rules.
pub(crate) enum Work {
    Run(Box<dyn FnOnce(&TaskScheduler) + Send + 'static>),
    Resume(Arc<ReadyFiberBundle>),
}

/// A task plus the counter whose `add(1)` was performed at enqueue time.
pub(crate) struct TaskBundle {
    pub(crate) work: Work,
    pub(crate) counter: Option<TaskCounter>,
}
