//! Task scheduler core: worker threads, fiber lifecycle, per-worker
//! work-stealing queues and the dispatch loop.
//!
//! The thread that calls [`TaskScheduler::init`] is registered as worker 0
//! and keeps its native stack as the *main fiber*; it only executes the
//! dispatch loop while inside a wait. `N-1` additional worker threads run
//! the dispatch loop for their whole lifetime. Each worker owns one queue
//! per priority class; idle workers steal from peers in round-robin order
//! starting from the last victim that yielded work.
//!
//! A task that waits parks its fiber in a ready-fiber bundle. Resumption
//! flows through the same queues as ordinary work: an unpinned bundle is
//! wrapped in a resume marker and pushed to the notifier's High queue,
//! while a pinned bundle goes on the target worker's pinned list and is
//! only picked up there.

use crate::callbacks::EventCallbacks;
use crate::counter::{AtomicFlag, BaseCounter, FullAtomicCounter, TaskCounter};
use crate::fiber::{self, Fiber, FiberId, FiberState, ReadyFiberBundle};
use crate::task::{Task, TaskBundle, TaskPriority, Work};
use crate::trace::{fiber_span, zone};
use crate::wsq::{Steal, WorkStealer, WorkStealingQueue};
use core_affinity::CoreId;
use crossbeam::deque::Injector;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use thiserror::Error;

/// Consecutive empty dispatch passes before a worker yields or sleeps.
const FAILED_POP_ATTEMPTS_HEURISTIC: u32 = 25;

/// Consumption-delay budget granted to predicate-wait bundles. They are
/// published before the source fiber has switched away and re-enqueue
/// themselves on every failed check, so consumers must hold off both until
/// the switch lands and for enough further encounters that other queued
/// work gets a turn in between.
const PREDICATE_SPIN_COUNT: i32 = 15;

/// Native stack size for spawned worker threads.
const WORKER_STACK_SIZE: usize = 512 * 1024;

/// Default stack size for task fibers.
const DEFAULT_FIBER_STACK_SIZE: usize = 512 * 1024;

/// Backoff ceiling for waits issued from threads the scheduler does not own.
const MAX_BACKOFF_US: u64 = 1000;

/// What an idle worker does when every queue is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyQueueBehavior {
    /// Busy-spin on the queues.
    #[default]
    Spin,
    /// Yield the OS thread after repeated empty passes.
    Yield,
    /// Block on a condition variable until new work is signalled.
    Sleep,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task scheduler is already initialized")]
    AlreadyInitialized,
    #[error("failed to create a worker thread: {0}")]
    WorkerThreadCreate(#[from] std::io::Error),
}

pub struct SchedulerInitOptions {
    /// Worker thread count, including the initializing thread. 0 means one
    /// per hardware thread.
    pub thread_pool_size: u32,
    /// Pin each worker to a core (worker i to core i modulo core count).
    pub set_affinity: bool,
    pub behavior: EmptyQueueBehavior,
    /// Stack size for task fibers.
    pub fiber_stack_size: usize,
    pub callbacks: Option<Arc<dyn EventCallbacks>>,
}

impl Default for SchedulerInitOptions {
    fn default() -> Self {
        SchedulerInitOptions {
            thread_pool_size: 0,
            set_affinity: false,
            behavior: EmptyQueueBehavior::default(),
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            callbacks: None,
        }
    }
}

/// Per-worker record: the TLS block of the original design.
struct WorkerState {
    hi_queue: UnsafeCell<WorkStealingQueue<TaskBundle>>,
    lo_queue: UnsafeCell<WorkStealingQueue<TaskBundle>>,
    hi_stealer: WorkStealer<TaskBundle>,
    lo_stealer: WorkStealer<TaskBundle>,
    /// Victim index hints: start the next steal scan where the last one
    /// succeeded.
    hi_last_steal: AtomicUsize,
    lo_last_steal: AtomicUsize,
    /// Ready fibers that must resume on this worker.
    pinned_ready_fibers: Mutex<Vec<Arc<ReadyFiberBundle>>>,
}

// SAFETY: the UnsafeCell-wrapped queue owner ends are only touched from the
// worker's own thread (enforced by the thread-index checks at every access
// site); everything else is Sync on its own.
unsafe impl Sync for WorkerState {}

impl WorkerState {
    fn new(index: usize) -> WorkerState {
        let (hi_queue, hi_stealer) = WorkStealingQueue::new();
        let (lo_queue, lo_stealer) = WorkStealingQueue::new();
        WorkerState {
            hi_queue: UnsafeCell::new(hi_queue),
            lo_queue: UnsafeCell::new(lo_queue),
            hi_stealer,
            lo_stealer,
            hi_last_steal: AtomicUsize::new(index),
            lo_last_steal: AtomicUsize::new(index),
            pinned_ready_fibers: Mutex::new(Vec::new()),
        }
    }

    /// Owner end of a priority queue.
    ///
    /// SAFETY: callers must be running on this worker's thread.
    unsafe fn queue(&self, priority: TaskPriority) -> &WorkStealingQueue<TaskBundle> {
        match priority {
            TaskPriority::High => &*self.hi_queue.get(),
            TaskPriority::Normal => &*self.lo_queue.get(),
        }
    }
}

pub(crate) struct SchedulerInner {
    workers: Vec<WorkerState>,
    thread_ids: Vec<OnceLock<ThreadId>>,
    /// Submission path for threads the scheduler does not own; workers
    /// drain these between their own queue and stealing from peers.
    hi_injector: Injector<TaskBundle>,
    lo_injector: Injector<TaskBundle>,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    behavior: EmptyQueueBehavior,
    fiber_stack_size: usize,
    callbacks: Option<Arc<dyn EventCallbacks>>,
    initialized: AtomicBool,
    quit: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<SchedulerInner>,
}

/// The scheduler. Create with [`TaskScheduler::new`], bring up the worker
/// pool with [`TaskScheduler::init`]; dropping the initialized scheduler
/// (or calling [`TaskScheduler::shutdown`]) stops and joins the workers.
///
/// Task closures receive a borrowed `TaskScheduler` so they can submit and
/// wait; those borrows do not own the worker pool.
pub struct TaskScheduler {
    inner: Option<Arc<SchedulerInner>>,
    owner: bool,
}

impl TaskScheduler {
    pub fn new() -> TaskScheduler {
        TaskScheduler {
            inner: None,
            owner: false,
        }
    }

    /// Brings up the worker pool. The calling thread becomes worker 0 and
    /// its native stack the main fiber; `thread_pool_size - 1` workers are
    /// spawned. Fails with [`SchedulerError::AlreadyInitialized`] on a
    /// second call and [`SchedulerError::WorkerThreadCreate`] if a worker
    /// thread cannot be spawned (in which case nothing leaks and the
    /// scheduler stays uninitialized).
    pub fn init(&mut self, options: SchedulerInitOptions) -> Result<(), SchedulerError> {
        if self.inner.is_some() {
            return Err(SchedulerError::AlreadyInitialized);
        }

        let num_threads = if options.thread_pool_size == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            options.thread_pool_size as usize
        };

        let inner = Arc::new_cyclic(|weak_self| SchedulerInner {
            workers: (0..num_threads).map(WorkerState::new).collect(),
            thread_ids: (0..num_threads).map(|_| OnceLock::new()).collect(),
            hi_injector: Injector::new(),
            lo_injector: Injector::new(),
            sleep_lock: Mutex::new(()),
            sleep_cv: Condvar::new(),
            behavior: options.behavior,
            fiber_stack_size: options.fiber_stack_size,
            callbacks: options.callbacks,
            initialized: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        });

        if let Some(callbacks) = &inner.callbacks {
            callbacks.on_threads_created(num_threads);
            callbacks.on_fibers_created(1);
        }

        // The calling thread is worker 0.
        inner.thread_ids[0]
            .set(thread::current().id())
            .expect("worker 0 registered twice");
        #[cfg(feature = "trace")]
        crate::trace::register_worker(0);

        let core_ids = if options.set_affinity {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        if let Some(&core) = core_ids.first() {
            core_affinity::set_for_current(core);
        }

        let mut spawned = Vec::with_capacity(num_threads.saturating_sub(1));
        for index in 1..num_threads {
            let inner_clone = Arc::clone(&inner);
            let core = core_ids.get(index % core_ids.len().max(1)).copied();
            let result = thread::Builder::new()
                .name(format!("weft-worker-{index}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || inner_clone.worker_main(index, core));
            match result {
                Ok(handle) => spawned.push(handle),
                Err(error) => {
                    // Unblock the workers that did start so they can exit,
                    // then report the failure with nothing left running.
                    inner.quit.store(true, Ordering::Release);
                    inner.initialized.store(true, Ordering::Release);
                    for handle in spawned {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::WorkerThreadCreate(error));
                }
            }
        }
        *inner.threads.lock().unwrap() = spawned;

        if let Some(callbacks) = &inner.callbacks {
            callbacks.on_fiber_attached(FiberId::MAIN);
        }

        // Publish: workers spin on this before dispatching.
        inner.initialized.store(true, Ordering::Release);

        self.inner = Some(inner);
        self.owner = true;
        Ok(())
    }

    /// Stops the workers and joins them. Idempotent; called by `Drop`.
    /// Tasks still queued at this point are discarded, so callers should
    /// wait on their counters first.
    pub fn shutdown(&mut self) {
        if !self.owner {
            return;
        }
        let Some(inner) = self.inner.take() else {
            return;
        };
        self.owner = false;

        if let Some(callbacks) = &inner.callbacks {
            callbacks.on_fiber_detached(FiberId::MAIN, false);
        }

        inner.quit.store(true, Ordering::Release);
        {
            // Taking the lock orders the store against sleepers' re-check,
            // so none can slip into a wait after missing the notification.
            let _guard = inner.sleep_lock.lock().unwrap();
            inner.sleep_cv.notify_all();
        }

        let handles = std::mem::take(&mut *inner.threads.lock().unwrap());
        for handle in handles {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                log::error!(
                    "worker thread {} panicked before shutdown",
                    name.as_deref().unwrap_or("<unnamed>")
                );
            }
        }
    }

    fn inner(&self) -> &Arc<SchedulerInner> {
        self.inner
            .as_ref()
            .expect("task scheduler is not initialized")
    }

    pub(crate) fn inner_arc(&self) -> Arc<SchedulerInner> {
        Arc::clone(self.inner())
    }

    pub(crate) fn view_clone(&self) -> TaskScheduler {
        TaskScheduler {
            inner: self.inner.clone(),
            owner: false,
        }
    }

    /// Number of workers, including the initializing thread.
    pub fn num_threads(&self) -> usize {
        self.inner().workers.len()
    }

    /// Index of the calling thread within this scheduler's pool, or `None`
    /// for threads the scheduler does not own.
    pub fn current_thread_index(&self) -> Option<usize> {
        self.inner().current_thread_index()
    }

    /// Id of the execution context the caller is running on: a task fiber,
    /// or [`FiberId::MAIN`] on the initializing thread outside any task.
    pub fn current_fiber(&self) -> Option<FiberId> {
        fiber::current_fiber_id()
            .or_else(|| (self.current_thread_index() == Some(0)).then_some(FiberId::MAIN))
    }

    pub fn is_main_fiber(&self) -> bool {
        self.current_fiber() == Some(FiberId::MAIN)
    }

    /// Submits one task. If `counter` is given it is incremented by one
    /// here and decremented when the task body completes.
    pub fn add_task(&self, task: Task, priority: TaskPriority, counter: Option<&TaskCounter>) {
        let inner = self.inner();
        if let Some(counter) = counter {
            counter.add(1);
        }
        inner.submit(
            TaskBundle {
                work: Work::Run(task.function),
                counter: counter.cloned(),
            },
            priority,
        );
        inner.wake_one();
    }

    /// Submits a batch, incrementing `counter` once by the batch size.
    /// Pushes happen in order; all sleepers are woken since several may
    /// find work.
    pub fn add_tasks(
        &self,
        tasks: Vec<Task>,
        priority: TaskPriority,
        counter: Option<&TaskCounter>,
    ) {
        let inner = self.inner();
        if let Some(counter) = counter {
            counter.add(tasks.len() as u32);
        }
        for task in tasks {
            inner.submit(
                TaskBundle {
                    work: Work::Run(task.function),
                    counter: counter.cloned(),
                },
                priority,
            );
        }
        inner.wake_all();
    }

    /// Suspends until `counter` returns to zero. With
    /// `pin_to_current_thread` the fiber resumes on the worker it suspended
    /// on; waits from the main fiber are always pinned to worker 0.
    pub fn wait_for_counter(&self, counter: &TaskCounter, pin_to_current_thread: bool) {
        self.wait_internal(&counter.base, 0, pin_to_current_thread);
    }

    /// Suspends until the flag is set.
    pub fn wait_for_flag(&self, flag: &AtomicFlag, pin_to_current_thread: bool) {
        self.wait_internal(&flag.base, 1, pin_to_current_thread);
    }

    /// Suspends until the counter holds exactly `value`.
    pub fn wait_for_value(
        &self,
        counter: &FullAtomicCounter,
        value: u32,
        pin_to_current_thread: bool,
    ) {
        self.wait_internal(&counter.base, value, pin_to_current_thread);
    }

    fn wait_internal(&self, counter: &BaseCounter, target: u32, pin_to_current_thread: bool) {
        // Fast out: drain notifiers still inside their critical section so
        // we do not return while one holds references into this wait.
        if counter.value() == target {
            zone!(WaitThread);
            counter.wait_until_unlocked();
            return;
        }

        let inner = self.inner();

        if fiber::current_fiber_id().is_some() {
            // On a task fiber: park it and let the dispatch loop take over.
            let index = inner
                .current_thread_index()
                .expect("task fiber running on an unregistered thread");
            let pinned = if pin_to_current_thread { Some(index) } else { None };

            let bundle = ReadyFiberBundle::for_fiber(pinned, 0);
            if counter.add_fiber_to_waiting_list(Arc::clone(&bundle), target) {
                zone!(ReleaseFiberBundle);
                return;
            }
            fiber::suspend_current(bundle);
            // Resumed - possibly on a different worker.
            return;
        }

        match inner.current_thread_index() {
            Some(index) => {
                // The main fiber: run the dispatch loop inline until our
                // bundle comes back on this worker's pinned list, so the
                // main continuation only ever resumes here.
                let bundle = ReadyFiberBundle::for_thread(index);
                if counter.add_fiber_to_waiting_list(Arc::clone(&bundle), target) {
                    return;
                }
                inner.dispatch_until(index, Some(&bundle), true, || false);
            }
            None => {
                // Not our thread; poll with exponential backoff.
                let mut backoff_us = 1u64;
                while counter.value() != target {
                    thread::sleep(Duration::from_micros(backoff_us));
                    backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
                }
                counter.wait_until_unlocked();
            }
        }
    }

    /// Cooperatively yields until `predicate` returns true.
    ///
    /// Each failed check parks the fiber in an immediately-reschedulable
    /// bundle, published *before* the switch; its consumption-delay budget
    /// keeps eager consumers off it until the switch lands and lets other
    /// queued work run between re-checks. The predicate must be flipped by
    /// some other task: under `Sleep` behavior with a single worker, a
    /// predicate only satisfiable from this worker deadlocks.
    pub fn wait_for_predicate<F>(&self, predicate: F, pin_to_current_thread: bool)
    where
        F: Fn() -> bool,
    {
        let inner = self.inner();

        if fiber::current_fiber_id().is_some() {
            while !predicate() {
                let index = inner
                    .current_thread_index()
                    .expect("task fiber running on an unregistered thread");
                let pinned = if pin_to_current_thread { Some(index) } else { None };

                let bundle = ReadyFiberBundle::for_fiber(pinned, PREDICATE_SPIN_COUNT);
                inner.add_ready_fiber(pinned, Arc::clone(&bundle));
                fiber::suspend_current(bundle);
            }
            return;
        }

        match inner.current_thread_index() {
            Some(index) => {
                // The main fiber has no stack to recycle; alternate
                // predicate checks with inline dispatch passes. Sleeping is
                // suppressed because nothing re-registers us for a wakeup.
                inner.dispatch_until(index, None, false, &predicate);
            }
            None => {
                let mut backoff_us = 1u64;
                while !predicate() {
                    thread::sleep(Duration::from_micros(backoff_us));
                    backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
                }
            }
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        TaskScheduler::new()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SchedulerInner {
    fn current_thread_index(&self) -> Option<usize> {
        let id = thread::current().id();
        self.thread_ids
            .iter()
            .position(|slot| slot.get() == Some(&id))
    }

    fn view(&self) -> TaskScheduler {
        TaskScheduler {
            inner: Some(
                self.weak_self
                    .upgrade()
                    .expect("scheduler internals dropped while dispatching"),
            ),
            owner: false,
        }
    }

    fn worker_main(self: Arc<SchedulerInner>, index: usize, core: Option<CoreId>) {
        self.thread_ids[index]
            .set(thread::current().id())
            .expect("worker registered twice");
        if let Some(core) = core {
            core_affinity::set_for_current(core);
        }

        // Wait for init to finish publishing the pool.
        while !self.initialized.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }

        #[cfg(feature = "trace")]
        crate::trace::register_worker(index);

        if let Some(callbacks) = &self.callbacks {
            callbacks.on_worker_thread_started(index);
        }

        let view = self.view();
        crate::co::bind(&view);
        self.dispatch_until(index, None, true, || self.quit.load(Ordering::Acquire));
        crate::co::unbind();

        if let Some(callbacks) = &self.callbacks {
            callbacks.on_worker_thread_ended(index);
        }
        #[cfg(feature = "trace")]
        crate::trace::flush_thread();
    }

    /// Runs the dispatch loop on the calling thread (which must be worker
    /// `index`) until `stop` holds, or - when `me` is given - until that
    /// thread-waiter bundle arrives on this worker's pinned list.
    fn dispatch_until(
        &self,
        index: usize,
        me: Option<&Arc<ReadyFiberBundle>>,
        allow_sleep: bool,
        stop: impl Fn() -> bool,
    ) {
        let mut task_buffer = Vec::new();
        let mut failed_pop_attempts = 0u32;
        while !stop() {
            if self.dispatch_iteration(index, me, allow_sleep, &mut task_buffer, &mut failed_pop_attempts)
            {
                break;
            }
        }
    }

    /// One pass of the dispatch loop. Returns true when `me` was dequeued.
    fn dispatch_iteration(
        &self,
        index: usize,
        me: Option<&Arc<ReadyFiberBundle>>,
        allow_sleep: bool,
        task_buffer: &mut Vec<TaskBundle>,
        failed_pop_attempts: &mut u32,
    ) -> bool {
        let state = &self.workers[index];
        let mut waiting_fiber: Option<Box<Fiber>> = None;
        // Pinned entries seen but not yet consumable; suppresses sleeping.
        let mut ready_waiting_fibers = false;

        {
            let mut pinned = state.pinned_ready_fibers.lock().unwrap();
            let mut i = 0;
            while i < pinned.len() {
                ready_waiting_fibers = true;
                let bundle = &pinned[i];
                if bundle.thread_waiter {
                    if me.is_some_and(|own| Arc::ptr_eq(own, bundle)) {
                        pinned.remove(i);
                        return true;
                    }
                    i += 1;
                    continue;
                }
                if bundle.is_resumable() {
                    let bundle = pinned.remove(i);
                    waiting_fiber = bundle.take_fiber();
                    break;
                }
                i += 1;
            }
        }

        let mut next_task: Option<(Box<dyn FnOnce(&TaskScheduler) + Send>, Option<TaskCounter>)> =
            None;
        if waiting_fiber.is_none() {
            if let Some(task) = self.next_hi_pri_task(index, task_buffer) {
                let TaskBundle { work, counter } = task;
                match work {
                    Work::Resume(ready) => {
                        let fiber = ready.take_fiber();
                        debug_assert!(fiber.is_some(), "resume marker without installed fiber");
                        waiting_fiber = fiber;
                    }
                    Work::Run(function) => next_task = Some((function, counter)),
                }
            }
        }
        if waiting_fiber.is_none() && next_task.is_none() {
            if let Some(task) = self.next_lo_pri_task(index) {
                let TaskBundle { work, counter } = task;
                match work {
                    Work::Run(function) => next_task = Some((function, counter)),
                    Work::Resume(_) => {
                        debug_assert!(false, "resume markers never travel the Normal queue");
                    }
                }
            }
        }

        if let Some(fiber) = waiting_fiber {
            *failed_pop_attempts = 0;
            self.run_fiber(fiber);
        } else if let Some((function, counter)) = next_task {
            *failed_pop_attempts = 0;
            let fiber = self.new_task_fiber(function, counter);
            self.run_fiber(fiber);
        } else if !ready_waiting_fibers {
            self.back_off(index, allow_sleep, failed_pop_attempts);
        }
        false
    }

    /// High-priority acquisition: own queue, then the injector, then
    /// round-robin stealing. Resume markers whose fiber has not switched
    /// yet are buffered and re-pushed (restoring order) on the way out.
    fn next_hi_pri_task(&self, index: usize, task_buffer: &mut Vec<TaskBundle>) -> Option<TaskBundle> {
        let state = &self.workers[index];
        // SAFETY: we are on this worker's thread.
        let queue = unsafe { state.queue(TaskPriority::High) };
        let mut result = None;

        while let Some(bundle) = queue.pop() {
            if self.task_is_ready(&bundle) {
                result = Some(bundle);
                break;
            }
            task_buffer.push(bundle);
        }

        if result.is_none() {
            loop {
                match self.hi_injector.steal() {
                    Steal::Success(bundle) => {
                        if self.task_is_ready(&bundle) {
                            result = Some(bundle);
                            break;
                        }
                        task_buffer.push(bundle);
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        if result.is_none() {
            let start = state.hi_last_steal.load(Ordering::Relaxed);
            'victims: for offset in 0..self.workers.len() {
                let victim = (start + offset) % self.workers.len();
                if victim == index {
                    continue;
                }
                loop {
                    match self.workers[victim].hi_stealer.steal() {
                        Steal::Success(bundle) => {
                            state.hi_last_steal.store(victim, Ordering::Relaxed);
                            if self.task_is_ready(&bundle) {
                                result = Some(bundle);
                                break 'victims;
                            }
                            task_buffer.push(bundle);
                        }
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
        }

        if !task_buffer.is_empty() {
            // Re-push in reverse pop order to restore the original order.
            while let Some(bundle) = task_buffer.pop() {
                queue.push(bundle);
            }
            // Other workers may have found nothing and gone to sleep while
            // these tasks sat in the buffer.
            self.wake_all();
        }

        result
    }

    fn next_lo_pri_task(&self, index: usize) -> Option<TaskBundle> {
        let state = &self.workers[index];
        // SAFETY: we are on this worker's thread.
        let queue = unsafe { state.queue(TaskPriority::Normal) };

        if let Some(bundle) = queue.pop() {
            return Some(bundle);
        }

        loop {
            match self.lo_injector.steal() {
                Steal::Success(bundle) => return Some(bundle),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        let start = state.lo_last_steal.load(Ordering::Relaxed);
        for offset in 0..self.workers.len() {
            let victim = (start + offset) % self.workers.len();
            if victim == index {
                continue;
            }
            loop {
                match self.workers[victim].lo_stealer.steal() {
                    Steal::Success(bundle) => {
                        state.lo_last_steal.store(victim, Ordering::Relaxed);
                        return Some(bundle);
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Real tasks are always ready; a resume marker is ready once its
    /// fiber passes the switched handshake.
    fn task_is_ready(&self, bundle: &TaskBundle) -> bool {
        match &bundle.work {
            Work::Run(_) => true,
            Work::Resume(ready) => ready.is_resumable(),
        }
    }

    fn back_off(&self, index: usize, allow_sleep: bool, failed_pop_attempts: &mut u32) {
        let behavior = if allow_sleep || self.behavior != EmptyQueueBehavior::Sleep {
            self.behavior
        } else {
            EmptyQueueBehavior::Yield
        };
        match behavior {
            EmptyQueueBehavior::Spin => {}
            EmptyQueueBehavior::Yield => {
                *failed_pop_attempts += 1;
                if *failed_pop_attempts >= FAILED_POP_ATTEMPTS_HEURISTIC {
                    thread::yield_now();
                    *failed_pop_attempts = 0;
                }
            }
            EmptyQueueBehavior::Sleep => {
                *failed_pop_attempts += 1;
                if *failed_pop_attempts >= FAILED_POP_ATTEMPTS_HEURISTIC {
                    let guard = self.sleep_lock.lock().unwrap();
                    // Re-check under the sleep lock: every wake-up path
                    // notifies while holding it, so either we observe the
                    // new state here or the notification finds us waiting.
                    let pinned_empty = self.workers[index]
                        .pinned_ready_fibers
                        .lock()
                        .unwrap()
                        .is_empty();
                    if pinned_empty
                        && !self.quit.load(Ordering::Acquire)
                        && !self.any_work_visible(index)
                    {
                        let _guard = self.sleep_cv.wait(guard).unwrap();
                    }
                    *failed_pop_attempts = 0;
                }
            }
        }
    }

    fn any_work_visible(&self, index: usize) -> bool {
        if !self.hi_injector.is_empty() || !self.lo_injector.is_empty() {
            return true;
        }
        // SAFETY: we are on this worker's thread.
        unsafe {
            let state = &self.workers[index];
            if !state.queue(TaskPriority::High).is_empty()
                || !state.queue(TaskPriority::Normal).is_empty()
            {
                return true;
            }
        }
        self.workers.iter().enumerate().any(|(i, worker)| {
            i != index && (!worker.hi_stealer.is_empty() || !worker.lo_stealer.is_empty())
        })
    }

    /// Creates the fiber that will run a task body, decrement the bundle's
    /// counter and drop the captures.
    fn new_task_fiber(
        &self,
        function: Box<dyn FnOnce(&TaskScheduler) + Send>,
        counter: Option<TaskCounter>,
    ) -> Box<Fiber> {
        let scheduler = self.view();
        Fiber::new(self.fiber_stack_size, move || {
            {
                zone!(Task);
                function(&scheduler);
            }
            if let Some(counter) = counter {
                {
                    zone!(TaskEnd);
                    counter.decrement();
                }
                zone!(PostTask);
                drop(counter);
            }
        })
        .expect("failed to allocate a fiber stack")
    }

    /// Resumes a fiber. On completion the fiber is freed; on suspension it
    /// is installed into its bundle, which release-publishes it as safely
    /// resumable (the deferred cleanup of the original design).
    fn run_fiber(&self, mut fiber: Box<Fiber>) {
        let id = fiber.id();
        if let Some(callbacks) = &self.callbacks {
            callbacks.on_fiber_attached(id);
        }

        let state = {
            fiber_span!(id);
            fiber.resume()
        };

        match state {
            FiberState::Complete => {
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_fiber_detached(id, false);
                }
            }
            FiberState::Yielded(bundle) => {
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_fiber_detached(id, true);
                }
                bundle.install_fiber(fiber);
            }
            FiberState::Panicked(payload) => {
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_fiber_detached(id, false);
                }
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    *s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic payload"
                };
                log::error!("task panicked: {message}");
            }
        }
    }

    /// Pushes into the submitter's own queue; threads the scheduler does
    /// not own go through the shared injector instead (their owner end is
    /// not safe to touch from here).
    fn submit(&self, bundle: TaskBundle, priority: TaskPriority) {
        match self.current_thread_index() {
            Some(index) => {
                // SAFETY: the submitting thread is this worker.
                unsafe { self.workers[index].queue(priority) }.push(bundle);
            }
            None => match priority {
                TaskPriority::High => self.hi_injector.push(bundle),
                TaskPriority::Normal => self.lo_injector.push(bundle),
            },
        }
    }

    /// Makes a parked continuation runnable again.
    pub(crate) fn add_ready_fiber(&self, pinned_thread: Option<usize>, bundle: Arc<ReadyFiberBundle>) {
        match pinned_thread {
            None => {
                let marker = TaskBundle {
                    work: Work::Resume(bundle),
                    counter: None,
                };
                match self.current_thread_index() {
                    // SAFETY: push on our own queue.
                    Some(index) => {
                        unsafe { self.workers[index].queue(TaskPriority::High) }.push(marker)
                    }
                    None => self.hi_injector.push(marker),
                }
                self.wake_one();
            }
            Some(target) => {
                self.workers[target]
                    .pinned_ready_fibers
                    .lock()
                    .unwrap()
                    .push(bundle);
                // The wake must reach the pinned worker specifically, and
                // we cannot know which condvar slot it occupies.
                if self.behavior == EmptyQueueBehavior::Sleep
                    && self.current_thread_index() != Some(target)
                {
                    let _guard = self.sleep_lock.lock().unwrap();
                    self.sleep_cv.notify_all();
                }
            }
        }
    }

    fn wake_one(&self) {
        if self.behavior == EmptyQueueBehavior::Sleep {
            let _guard = self.sleep_lock.lock().unwrap();
            self.sleep_cv.notify_one();
        }
    }

    fn wake_all(&self) {
        if self.behavior == EmptyQueueBehavior::Sleep {
            let _guard = self.sleep_lock.lock().unwrap();
            self.sleep_cv.notify_all();
        }
    }
}
