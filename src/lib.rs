//! # weft - Fiber-Based Task Scheduler
//!
//! A task scheduler for highly parallel, latency-sensitive workloads,
//! following the architecture pioneered by Naughty Dog's engine. Thousands
//! of short tasks per frame are dispatched across all hardware threads, and
//! any task may suspend on a counter while keeping its call stack alive on a
//! lightweight user-mode stack (a fiber). When the counter reaches its
//! target, the suspended fiber becomes runnable again - possibly on a
//! different worker thread - and resumes exactly where it left off.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful execution contexts that can be suspended mid-task
//!   and resumed on any worker
//! - **Work-stealing queues**: one deque per worker per priority class;
//!   LIFO for the owner, FIFO for thieves
//! - **Waitable counters**: atomic counters with a waiting list of fibers
//!   that resume when the counter reaches a target value
//! - **Worker threads**: OS threads running the dispatch loop; the thread
//!   that initializes the scheduler participates as worker 0 whenever it
//!   waits
//!
//! ## Example
//!
//! ```no_run
//! use weft::{SchedulerInitOptions, Task, TaskCounter, TaskPriority, TaskScheduler};
//!
//! let mut scheduler = TaskScheduler::new();
//! scheduler.init(SchedulerInitOptions::default()).unwrap();
//!
//! let counter = TaskCounter::new(&scheduler);
//! scheduler.add_task(
//!     Task::new(|_| println!("hello from a fiber task")),
//!     TaskPriority::Normal,
//!     Some(&counter),
//! );
//! scheduler.wait_for_counter(&counter, false);
//! ```

pub mod callbacks;
pub mod co;
pub mod counter;
pub mod fiber;
pub mod scheduler;
pub mod task;
pub mod trace;
pub(crate) mod wsq;

pub use callbacks::EventCallbacks;
pub use counter::{AtomicFlag, FullAtomicCounter, TaskCounter};
pub use fiber::FiberId;
pub use scheduler::{EmptyQueueBehavior, SchedulerError, SchedulerInitOptions, TaskScheduler};
pub use task::{Task, TaskPriority};
