//! Sleep-mode correctness: no worker stays blocked on the condvar while
//! work is queued anywhere in the system.

use std::sync::atomic::{AtomicUsize, Ordering};
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
            behavior: EmptyQueueBehavior::Sleep,
            ..Default::default()
        })
        .expect("scheduler init failed");
    scheduler
}

#[test]
fn tasks_complete_under_sleep() {
    let scheduler = scheduler(4);
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = TaskCounter::new(&scheduler);

    for _ in 0..100 {
        let executed = executed.clone();
        scheduler.add_task(
            Task::new(move |_| {
                executed.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            Some(&counter),
        );
    }

    scheduler.wait_for_counter(&counter, false);
    assert_eq!(executed.load(Ordering::SeqCst), 100);
}

#[test]
fn submission_after_idle_wakes_sleepers() {
    let scheduler = scheduler(4);
    let executed = Arc::new(AtomicUsize::new(0));

    // Let every worker reach the condvar first.
    thread::sleep(Duration::from_millis(50));

    let counter = TaskCounter::new(&scheduler);
    let executed_clone = executed.clone();
    scheduler.add_task(
        Task::new(move |_| {
            executed_clone.fetch_add(1, Ordering::SeqCst);
        }),
        TaskPriority::High,
        Some(&counter),
    );

    scheduler.wait_for_counter(&counter, false);
    assert_eq!(executed.load(Ordering::SeqCst), 1);
}

#[test]
fn batch_submission_wakes_all_sleepers() {
    let scheduler = scheduler(4);
    let executed = Arc::new(AtomicUsize::new(0));

    thread::sleep(Duration::from_millis(50));

    let counter = TaskCounter::new(&scheduler);
    let tasks: Vec<Task> = (0..32)
        .map(|_| {
            let executed = executed.clone();
            Task::new(move |_| {
                // Linger so completion requires more than one worker awake.
                thread::sleep(Duration::from_millis(2));
                executed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    scheduler.add_tasks(tasks, TaskPriority::Normal, Some(&counter));

    scheduler.wait_for_counter(&counter, false);
    assert_eq!(executed.load(Ordering::SeqCst), 32);
}

#[test]
fn waiters_resume_after_idle_notify() {
    let scheduler = scheduler(4);
    let done = TaskCounter::new(&scheduler);
    let gate = TaskCounter::new(&scheduler);
    gate.add(1);
    let resumed = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let gate = gate.clone();
        let resumed = resumed.clone();
        scheduler.add_task(
            Task::new(move |sched| {
                sched.wait_for_counter(&gate, false);
                resumed.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            Some(&done),
        );
    }

    // All eight park, then every worker goes to sleep on the condvar.
    thread::sleep(Duration::from_millis(50));
    gate.decrement();

    scheduler.wait_for_counter(&done, false);
    assert_eq!(resumed.load(Ordering::SeqCst), 8);
}
