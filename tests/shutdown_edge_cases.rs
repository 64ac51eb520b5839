//! Scheduler lifecycle: init failures, repeated shutdown, and teardown
//! with work still in the system.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use weft::{
    EmptyQueueBehavior, SchedulerError, SchedulerInitOptions, Task, TaskCounter, TaskPriority,
    TaskScheduler,
};

#[test]
fn init_and_shutdown_without_work() {
    let mut scheduler = TaskScheduler::new();
    scheduler
        .init(SchedulerInitOptions {
            thread_pool_size: 4,
            ..Default::default()
        })
        .expect("init failed");
    assert_eq!(scheduler.num_threads(), 4);
    scheduler.shutdown();
}

#[test]
fn double_init_is_rejected() {
    let mut scheduler = TaskScheduler::new();
    scheduler
        .init(SchedulerInitOptions {
            thread_pool_size: 2,
            ..Default::default()
        })
        .expect("first init failed");

    match scheduler.init(SchedulerInitOptions::default()) {
        Err(SchedulerError::AlreadyInitialized) => {}
        other => panic!("expected AlreadyInitialized, got {other:?}"),
    }
}

#[test]
fn reinit_after_shutdown() {
    let mut scheduler = TaskScheduler::new();
    for _ in 0..3 {
        scheduler
            .init(SchedulerInitOptions {
                thread_pool_size: 2,
                ..Default::default()
            })
            .expect("init failed");

        let counter = TaskCounter::new(&scheduler);
        scheduler.add_task(Task::new(|_| {}), TaskPriority::Normal, Some(&counter));
        scheduler.wait_for_counter(&counter, false);

        scheduler.shutdown();
    }
}

#[test]
fn shutdown_is_idempotent() {
    let mut scheduler = TaskScheduler::new();
    scheduler
        .init(SchedulerInitOptions {
            thread_pool_size: 2,
            ..Default::default()
        })
        .expect("init failed");
    scheduler.shutdown();
    scheduler.shutdown();
}

#[test]
fn shutdown_during_job_execution() {
    let mut scheduler = TaskScheduler::new();
    scheduler
        .init(SchedulerInitOptions {
            thread_pool_size: 2,
            behavior: EmptyQueueBehavior::Yield,
            ..Default::default()
        })
        .expect("init failed");

    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let executed = executed.clone();
        scheduler.add_task(
            Task::new(move |_| {
                thread::sleep(Duration::from_millis(10));
                executed.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            None,
        );
    }

    // In-flight tasks finish their current dispatch; queued-but-unstarted
    // tasks are discarded. Either way this must not hang or crash.
    thread::sleep(Duration::from_millis(5));
    scheduler.shutdown();
}

#[test]
fn shutdown_with_sleeping_workers() {
    let mut scheduler = TaskScheduler::new();
    scheduler
        .init(SchedulerInitOptions {
            thread_pool_size: 4,
            behavior: EmptyQueueBehavior::Sleep,
            ..Default::default()
        })
        .expect("init failed");

    // Workers are parked on the condvar; shutdown must wake and join them.
    thread::sleep(Duration::from_millis(50));
    scheduler.shutdown();
}

#[test]
fn shutdown_with_a_fiber_parked_forever() {
    let mut scheduler = TaskScheduler::new();
    scheduler
        .init(SchedulerInitOptions {
            thread_pool_size: 2,
            behavior: EmptyQueueBehavior::Yield,
            ..Default::default()
        })
        .expect("init failed");

    let started = TaskCounter::new(&scheduler);
    started.add(1);
    let never = TaskCounter::new(&scheduler);
    never.add(1);

    {
        let started = started.clone();
        let never = never.clone();
        scheduler.add_task(
            Task::new(move |sched| {
                started.decrement();
                // Parks forever; shutdown must still complete with the
                // fiber left in the counter's waiting list.
                sched.wait_for_counter(&never, false);
            }),
            TaskPriority::Normal,
            None,
        );
    }

    scheduler.wait_for_counter(&started, false);
    scheduler.shutdown();
    drop(never);
}
