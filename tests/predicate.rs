//! Cooperative predicate waits: the waiter yields its worker until some
//! other task flips the condition.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use weft::{
    EmptyQueueBehavior, SchedulerInitOptions, Task, TaskCounter, TaskPriority, TaskScheduler,
};

fn scheduler(threads: u32) -> TaskScheduler {
    let mut scheduler = TaskScheduler::new();
    scheduler
        .init(SchedulerInitOptions {
            thread_pool_size: threads,
            behavior: EmptyQueueBehavior::Yield,
            ..Default::default()
        })
        .expect("scheduler init failed");
    scheduler
}

#[test]
fn fiber_predicate_wait_sees_flip() {
    let scheduler = scheduler(4);
    let flag = Arc::new(AtomicBool::new(false));
    let order = Arc::new(AtomicUsize::new(0));
    let done = TaskCounter::new(&scheduler);

    {
        let flag = flag.clone();
        let order = order.clone();
        scheduler.add_task(
            Task::new(move |sched| {
                sched.wait_for_predicate(|| flag.load(Ordering::SeqCst), false);
                order.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            Some(&done),
        );
    }
    {
        let flag = flag.clone();
        scheduler.add_task(
            Task::new(move |_| {
                thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            None,
        );
    }

    scheduler.wait_for_counter(&done, false);
    assert_eq!(order.load(Ordering::SeqCst), 1);
}

#[test]
fn main_predicate_wait_dispatches_inline() {
    let scheduler = scheduler(1);
    let flag = Arc::new(AtomicBool::new(false));

    // With a single worker only the waiting main thread can run the task,
    // so the predicate wait must keep dispatching while it checks.
    {
        let flag = flag.clone();
        scheduler.add_task(
            Task::new(move |_| {
                flag.store(true, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            None,
        );
    }

    scheduler.wait_for_predicate(|| flag.load(Ordering::SeqCst), false);
    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn predicate_true_returns_without_suspending() {
    let scheduler = scheduler(2);
    scheduler.wait_for_predicate(|| true, false);

    let done = TaskCounter::new(&scheduler);
    scheduler.add_task(
        Task::new(|sched| {
            sched.wait_for_predicate(|| true, false);
        }),
        TaskPriority::Normal,
        Some(&done),
    );
    scheduler.wait_for_counter(&done, false);
}

#[test]
fn many_waiters_on_one_predicate() {
    let scheduler = scheduler(4);
    let flag = Arc::new(AtomicBool::new(false));
    let resumed = Arc::new(AtomicUsize::new(0));
    let done = TaskCounter::new(&scheduler);

    for _ in 0..8 {
        let flag = flag.clone();
        let resumed = resumed.clone();
        scheduler.add_task(
            Task::new(move |sched| {
                sched.wait_for_predicate(|| flag.load(Ordering::SeqCst), false);
                resumed.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            Some(&done),
        );
    }

    thread::sleep(Duration::from_millis(5));
    flag.store(true, Ordering::SeqCst);
    scheduler.wait_for_counter(&done, false);
    assert_eq!(resumed.load(Ordering::SeqCst), 8);
}
