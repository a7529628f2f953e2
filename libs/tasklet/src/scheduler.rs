// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing tasklet scheduler.
//!
//! N worker threads each own a [`WorkStealingQueue`] of runnable tasklets
//! and a pool of fibers to run them on. A shared [`MpmcQueue`] receives
//! work from non-worker threads and I/O completions. A worker's loop is:
//! pop local, pop shared, steal from a random victim, park briefly.
//!
//! Tasklets run to completion or until they suspend; there is no
//! preemption and no cancellation. A suspended tasklet keeps its fiber
//! parked off to the side until some wakeup re-enqueues it, at which point
//! whichever worker picks it up switches into the preserved fiber.

use crate::error::SchedulerError;
use crate::future::Future;
use crate::io::{self, IoShared};
use crate::tasklet::{self, PromiseHeader, RawTasklet};
use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread;
use vane_fiber::{Fiber, FiberState};
use vane_queue::{MpmcQueue, WorkStealingQueue};

/// How long a worker sleeps when it finds no work anywhere. Bounds the
/// latency of wakeups that lose the race against a worker going to sleep.
const PARK_INTERVAL: Duration = Duration::from_micros(100);

const RUN_QUEUE_CAPACITY: usize = 1024;
const INJECTOR_CAPACITY: usize = 1024;

/// What a fiber last did before switching back to the scheduler context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Finished,
    Yielded,
    Suspended,
}

std::thread_local! {
    /// The shared scheduler state of the worker running on this thread.
    static WORKER_SHARED: Cell<*const Shared> = const { Cell::new(ptr::null()) };
    static WORKER_ID: Cell<usize> = const { Cell::new(0) };
    /// Set by the fiber side right before switching out, read by the worker
    /// right after the switch returns. Never held across a switch.
    static PENDING: Cell<Transition> = const { Cell::new(Transition::Finished) };
}

/// Wrapper making tasklet pointers routable through the shared queue.
#[derive(Clone, Copy)]
pub(crate) struct TaskletPtr(pub(crate) NonNull<RawTasklet>);

// Safety: tasklet allocations are Send; the pointer is just in transit
// between threads.
unsafe impl Send for TaskletPtr {}

pub(crate) struct Shared {
    workers: Box<[WorkerShared]>,
    injector: MpmcQueue<TaskletPtr>,
    running: AtomicBool,
    /// Round-robin cursor for picking which parked worker to wake.
    unpark_cursor: AtomicUsize,
    /// Owning registry of every fiber ever created; fibers are recycled
    /// through per-worker free lists but freed only here, after all workers
    /// have exited.
    fibers: StdMutex<Vec<Box<Fiber>>>,
    pub(crate) io: IoShared,
}

struct WorkerShared {
    run_queue: WorkStealingQueue<RawTasklet>,
    parker: Parker,
}

/// The process-wide scheduler, for wakeups arriving from threads that are
/// not workers (the I/O worker, external threads).
static ACTIVE: StdMutex<Option<Arc<Shared>>> = StdMutex::new(None);

// === impl Parker ===

/// A binary semaphore workers park on when idle.
struct Parker {
    notified: StdMutex<bool>,
    condvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            notified: StdMutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn park_timeout(&self, timeout: Duration) {
        let mut notified = self.notified.lock().unwrap();
        if !*notified {
            let (guard, _) = self.condvar.wait_timeout(notified, timeout).unwrap();
            notified = guard;
        }
        *notified = false;
    }

    fn unpark(&self) {
        *self.notified.lock().unwrap() = true;
        self.condvar.notify_one();
    }
}

// === impl Shared ===

impl Shared {
    fn new(worker_count: usize) -> Self {
        let workers = (0..worker_count)
            .map(|_| WorkerShared {
                run_queue: WorkStealingQueue::with_capacity(RUN_QUEUE_CAPACITY),
                parker: Parker::new(),
            })
            .collect();

        Self {
            workers,
            injector: MpmcQueue::with_capacity(INJECTOR_CAPACITY),
            running: AtomicBool::new(false),
            unpark_cursor: AtomicUsize::new(0),
            fibers: StdMutex::new(Vec::new()),
            io: IoShared::new(),
        }
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for worker in &self.workers {
            worker.parker.unpark();
        }
        self.io.ring_doorbell();
    }

    fn unpark_one(&self) {
        let cursor = self.unpark_cursor.fetch_add(1, Ordering::Relaxed);
        self.workers[cursor % self.workers.len()].parker.unpark();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn io_shared(&self) -> &IoShared {
        &self.io
    }
}

/// Enqueues a runnable tasklet: onto the caller's local deque if the caller
/// is a worker of this scheduler, otherwise onto the shared queue.
pub(crate) fn enqueue(shared: &Shared, tasklet: NonNull<RawTasklet>) {
    if WORKER_SHARED.with(Cell::get) == ptr::from_ref(shared) {
        let id = WORKER_ID.with(Cell::get);
        if shared.workers[id].run_queue.enqueue(tasklet) {
            return;
        }
        // Local deque full; overflow to the shared queue below.
    }

    push_injector(shared, tasklet);
}

fn push_injector(shared: &Shared, tasklet: NonNull<RawTasklet>) {
    let mut holder = TaskletPtr(tasklet);
    loop {
        match shared.injector.enqueue(holder) {
            Ok(()) => break,
            Err(back) => {
                holder = back;
                // Shared queue full: let consumers catch up.
                thread::yield_now();
            }
        }
    }
    shared.unpark_one();
}

/// Requeues a tasklet that cooperatively yielded. If other work is already
/// queued locally it goes through the shared queue instead: pushing it back
/// onto the head of the LIFO deque would just pop it straight back out and
/// starve the work it yielded for.
fn enqueue_yielded(shared: &Shared, tasklet: NonNull<RawTasklet>) {
    let id = WORKER_ID.with(Cell::get);
    if shared.workers[id].run_queue.is_empty() {
        enqueue(shared, tasklet);
    } else {
        push_injector(shared, tasklet);
    }
}

/// Reschedules a woken tasklet on whatever scheduler it belongs to. Called
/// from promise fulfillment, which may happen on any thread.
pub(crate) fn schedule_raw(tasklet: NonNull<RawTasklet>) {
    // Safety: tasklets never outlive their scheduler; the backpointer was
    // set when the tasklet was created.
    let shared = unsafe { &*tasklet.as_ref().scheduler.get() };
    enqueue(shared, tasklet);
}

fn current_shared() -> (*const Shared, Option<Arc<Shared>>) {
    let tls = WORKER_SHARED.with(Cell::get);
    if !tls.is_null() {
        return (tls, None);
    }
    let active = ACTIVE
        .lock()
        .unwrap()
        .clone()
        .expect("no scheduler is running");
    (Arc::as_ptr(&active), Some(active))
}

/// Schedules `callable` to run on the current scheduler, returning a future
/// of its result.
///
/// # Panics
///
/// Panics when called while no scheduler is running.
pub fn schedule<F, R>(callable: F) -> Future<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    // Keep the Arc (if any) alive across the enqueue.
    let (shared_ptr, _guard) = current_shared();
    let header = tasklet::new_promised(callable, shared_ptr);
    let future = Future::from_header(header);
    // Safety: the pointer comes from current_shared and is alive.
    enqueue(unsafe { &*shared_ptr }, header.cast());
    future
}

/// Allocates a tasklet for `callable` without enqueueing it; the caller
/// registers it on some promise. Used by `Future::and_then`.
pub(crate) fn new_chained<F, R>(callable: F) -> (NonNull<RawTasklet>, Future<R>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (shared_ptr, _guard) = current_shared();
    let header: NonNull<PromiseHeader<R>> = tasklet::new_promised(callable, shared_ptr);
    (header.cast(), Future::from_header(header))
}

/// Cooperatively gives up the current fiber; the tasklet is re-enqueued on
/// the local queue and resumes after other runnable work.
///
/// Outside of tasklet context this is a plain OS thread yield.
pub fn yield_now() {
    let Some(fiber) = Fiber::current() else {
        thread::yield_now();
        return;
    };
    PENDING.with(|pending| pending.set(Transition::Yielded));
    // Safety: the current fiber pointer is valid while running on it.
    unsafe { fiber.as_ref().switch_out() }
}

/// Suspends the current tasklet without re-enqueueing it.
///
/// The caller must have parked the tasklet on some wait list first,
/// otherwise it will never run again.
///
/// # Panics
///
/// Panics when called outside of tasklet context.
pub fn suspend() {
    let fiber = Fiber::current().expect("suspend called outside of tasklet context");
    PENDING.with(|pending| pending.set(Transition::Suspended));
    // Safety: the current fiber pointer is valid while running on it.
    unsafe { fiber.as_ref().switch_out() }
}

// === impl Scheduler ===

/// Builder and entry point for the tasklet runtime.
#[derive(Debug)]
pub struct Scheduler {
    worker_count: usize,
    fiber_stack_size: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let parallelism = thread::available_parallelism().map_or(1, usize::from);
        Self {
            worker_count: (parallelism / 2).max(1),
            fiber_stack_size: vane_fiber::DEFAULT_STACK_SIZE,
        }
    }

    #[must_use]
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    #[must_use]
    pub fn with_fiber_stack_size(mut self, size: usize) -> Self {
        self.fiber_stack_size = size;
        self
    }

    /// A handle to the currently running scheduler.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler is running.
    pub fn current() -> SchedulerHandle {
        SchedulerHandle {
            shared: ACTIVE
                .lock()
                .unwrap()
                .clone()
                .expect("no scheduler is running"),
        }
    }

    /// Boots the workers, runs `root` as the initial tasklet and returns
    /// its result once the scheduler has stopped.
    ///
    /// The scheduler stops when the root callable returns or when any
    /// tasklet calls [`SchedulerHandle::stop`]; workers drain their queues
    /// before exiting.
    ///
    /// # Panics
    ///
    /// Worker thread creation failure is fatal.
    pub fn run<F, R>(self, root: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let shared = Arc::new(Shared::new(self.worker_count));
        shared.running.store(true, Ordering::Release);
        *ACTIVE.lock().unwrap() = Some(shared.clone());

        let io_worker = io::spawn_io_worker(shared.clone());

        // The root tasklet stores its result out-of-band and stops the
        // scheduler when it returns.
        let result = Arc::new(StdMutex::new(None));
        {
            let result = result.clone();
            let stop_shared = shared.clone();
            let header = tasklet::new_promised(
                move || {
                    let value = root();
                    *result.lock().unwrap() = Some(value);
                    stop_shared.stop();
                },
                Arc::as_ptr(&shared),
            );
            // The root's future is not observable; release its reference.
            // Safety: new_promised handed us two references.
            unsafe { tasklet::drop_ref(header.cast()) };
            enqueue(&shared, header.cast());
        }

        let workers: Vec<_> = (0..self.worker_count)
            .map(|id| {
                let shared = shared.clone();
                let stack_size = self.fiber_stack_size;
                thread::Builder::new()
                    .name(format!("vane-worker-{id}"))
                    .spawn(move || worker_loop(id, &shared, stack_size))
                    .unwrap_or_else(|err| {
                        tracing::error!("{}", SchedulerError::ThreadCreationFailed(err));
                        std::process::abort();
                    })
            })
            .collect();

        for worker in workers {
            let _ = worker.join();
        }
        let _ = io_worker.join();

        *ACTIVE.lock().unwrap() = None;

        let value = result.lock().unwrap().take();
        value.expect("root tasklet did not run to completion")
    }
}

/// A cloneable handle used to stop a running scheduler from any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Requests shutdown: workers finish the queued work and exit.
    pub fn stop(&self) {
        tracing::debug!("scheduler stop requested");
        self.shared.stop();
    }

    pub(crate) fn io_shared(&self) -> &IoShared {
        self.shared.io_shared()
    }
}

// === worker loop ===

fn worker_loop(id: usize, shared: &Arc<Shared>, fiber_stack_size: usize) {
    let _ = vane_fiber::init_fault_handler();
    pin_to_core(id);

    WORKER_SHARED.with(|cell| cell.set(Arc::as_ptr(shared)));
    WORKER_ID.with(|cell| cell.set(id));

    let mut rng = fastrand::Rng::with_seed(0x9e37_79b9_7f4a_7c15 ^ id as u64);
    let mut free_fibers: Vec<NonNull<Fiber>> = Vec::new();
    let local = &shared.workers[id];

    tracing::debug!(worker = id, "worker started");

    loop {
        let tasklet = local
            .run_queue
            .dequeue()
            .or_else(|| shared.injector.dequeue().map(|ptr| ptr.0))
            .or_else(|| steal(shared, id, &mut rng));

        let Some(tasklet) = tasklet else {
            if !shared.running.load(Ordering::Acquire) {
                // Keep draining until every queue is visibly empty.
                if local.run_queue.is_empty() && shared.injector.is_empty() {
                    break;
                }
                continue;
            }
            local.parker.park_timeout(PARK_INTERVAL);
            continue;
        };

        run_tasklet(shared, tasklet, &mut free_fibers, fiber_stack_size);
    }

    WORKER_SHARED.with(|cell| cell.set(ptr::null()));
    tracing::debug!(worker = id, "worker exited");
}

fn steal(shared: &Shared, id: usize, rng: &mut fastrand::Rng) -> Option<NonNull<RawTasklet>> {
    if shared.workers.len() <= 1 {
        return None;
    }
    let victim = rng.usize(0..shared.workers.len());
    if victim == id {
        // Never steal from ourselves; we know the queue is empty.
        return None;
    }
    shared.workers[victim].run_queue.steal()
}

fn run_tasklet(
    shared: &Arc<Shared>,
    tasklet: NonNull<RawTasklet>,
    free_fibers: &mut Vec<NonNull<Fiber>>,
    fiber_stack_size: usize,
) {
    // Safety: queued tasklets are alive until their run completes. The
    // borrow is kept short: once the fiber runs, the tasklet may finish and
    // free itself.
    let owner = unsafe { tasklet.as_ref().owner.get() };

    let fiber = match NonNull::new(owner.cast_mut()) {
        None => {
            // First run: bind a free fiber.
            let fiber = free_fibers
                .pop()
                .unwrap_or_else(|| allocate_fiber(shared, fiber_stack_size));
            // Safety: as above; the fiber is idle and owned by us until the
            // switch below.
            unsafe {
                tasklet.as_ref().owner.set(fiber.as_ptr());
                fiber.as_ref().bind_tasklet(tasklet.as_ptr().cast());
            }
            fiber
        }
        Some(fiber) => {
            // Resuming a suspended tasklet. Its wakeup may have raced the
            // suspending worker's switch; wait for the fiber context to be
            // fully parked before switching into it.
            // Safety: fibers outlive every tasklet bound to them.
            while unsafe { fiber.as_ref() }.is_running() {
                core::hint::spin_loop();
            }
            fiber
        }
    };

    // Safety: see above.
    let fiber = unsafe { fiber.as_ref() };
    fiber.switch_in();

    // The fiber told us why it switched back right before doing so.
    match PENDING.with(Cell::get) {
        Transition::Finished => {
            // The tasklet fulfilled its promise and released its run
            // reference inside invoke; it must not be touched anymore.
            fiber.bind_tasklet(ptr::null_mut());
            fiber.set_state(FiberState::Runnable);
            free_fibers.push(NonNull::from(fiber));
        }
        Transition::Yielded => {
            // Publish the parked context before the tasklet becomes
            // visible to other workers again.
            fiber.set_state(FiberState::Yielding);
            enqueue_yielded(shared, tasklet);
        }
        Transition::Suspended => {
            // The tasklet parked itself on a wait list; the state store
            // publishes the fiber context to whichever worker resumes it.
            fiber.set_state(FiberState::Suspended);
        }
    }
}

fn allocate_fiber(shared: &Shared, stack_size: usize) -> NonNull<Fiber> {
    let fiber = Fiber::with_stack_size("tasklet-fiber", stack_size, fiber_entry).unwrap_or_else(
        |err| {
            tracing::error!("{}", SchedulerError::FiberAllocationFailed(err));
            std::process::abort();
        },
    );
    let ptr = NonNull::from(&*fiber);
    shared.fibers.lock().unwrap().push(fiber);
    ptr
}

/// Body of every scheduler fiber: run the bound tasklet to completion,
/// report back, wait to be rebound.
fn fiber_entry() {
    loop {
        let fiber = Fiber::current().expect("fiber entry outside of a fiber");
        // Safety: the fiber is alive while code runs on it.
        let fiber = unsafe { fiber.as_ref() };

        let tasklet = fiber.bound_tasklet().cast::<RawTasklet>();
        let tasklet = NonNull::new(tasklet).expect("fiber resumed without a tasklet");

        // Safety: the scheduler binds each tasklet to exactly one fiber and
        // invokes it exactly once.
        unsafe { (tasklet.as_ref().invoke)(tasklet) };

        PENDING.with(|pending| pending.set(Transition::Finished));
        fiber.switch_out();
    }
}

fn pin_to_core(id: usize) {
    #[cfg(target_os = "linux")]
    // Safety: cpu_set_t is POD and sched_setaffinity only reads it; failure
    // is ignored (pinning is best-effort).
    unsafe {
        let parallelism = thread::available_parallelism().map_or(1, usize::from);
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(id % parallelism, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::debug!(worker = id, "failed to pin worker to core");
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = id;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Latch;
    use core::sync::atomic::AtomicUsize;

    // The ACTIVE scheduler slot is process-wide, so tests that boot a
    // scheduler must not overlap.
    pub(crate) static SCHEDULER_TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn run_returns_root_result() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        let result = Scheduler::new().with_workers(2).run(|| 41 + 1);
        assert_eq!(result, 42);
    }

    #[test]
    fn await_void_future() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        COUNTER.store(0, Ordering::Relaxed);

        Scheduler::new().with_workers(2).run(|| {
            let future = schedule(|| {
                COUNTER.fetch_add(1, Ordering::Relaxed);
            });
            future.wait();
            assert_eq!(COUNTER.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn future_chain_maps_values() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        fn mult_by_2(value: i32) -> i32 {
            value * 2
        }

        let result = Scheduler::new().with_workers(2).run(|| {
            schedule(|| 5)
                .and_then(|value| value + 1)
                .and_then(mult_by_2)
                .wait()
        });
        assert_eq!(result, 12);
    }

    #[test]
    fn chain_on_completed_future_runs_immediately() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        let result = Scheduler::new().with_workers(2).run(|| {
            let future = schedule(|| 10);
            // Wait for completion first, then chain; the continuation must
            // still run.
            let value = future.wait();
            assert_eq!(value, 10);
            future.and_then(|value| value > 0).wait()
        });
        assert!(result);
    }

    #[test]
    fn latch_gates_sixteen_tasklets() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        let posts = Scheduler::new().with_workers(4).run(|| {
            let latch = Arc::new(Latch::new(16));
            let semaphore = Arc::new(Latch::new(16));
            let posts = Arc::new(AtomicUsize::new(0));

            for _ in 0..16 {
                let latch = latch.clone();
                let semaphore = semaphore.clone();
                let posts = posts.clone();
                drop(schedule(move || {
                    latch.arrive(1);
                    posts.fetch_add(1, Ordering::Relaxed);
                    semaphore.count_down(1);
                }));
            }

            latch.wait();
            // All sixteen arrivals happened; wait for the posts too.
            semaphore.wait();
            posts.load(Ordering::Relaxed)
        });
        assert_eq!(posts, 16);
    }

    #[test]
    fn yield_now_round_robins() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        static TICKS: AtomicUsize = AtomicUsize::new(0);
        TICKS.store(0, Ordering::Relaxed);

        Scheduler::new().with_workers(1).run(|| {
            let future = schedule(|| {
                TICKS.fetch_add(1, Ordering::Relaxed);
            });
            while !future.is_complete() {
                yield_now();
            }
            assert_eq!(TICKS.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn mutex_serialises_tasklets() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        let total = Scheduler::new().with_workers(4).run(|| {
            let counter = Arc::new(crate::Mutex::new(0u64));
            let done = Arc::new(Latch::new(64));

            for _ in 0..64 {
                let counter = counter.clone();
                let done = done.clone();
                drop(schedule(move || {
                    for _ in 0..100 {
                        *counter.lock() += 1;
                    }
                    done.count_down(1);
                }));
            }

            done.wait();
            *counter.lock()
        });
        assert_eq!(total, 64 * 100);
    }

    #[test]
    fn stop_from_handle_shuts_down() {
        let _guard = SCHEDULER_TEST_LOCK.lock().unwrap();
        init_tracing();

        Scheduler::new().with_workers(2).run(|| {
            // Explicitly stopping is idempotent with the implicit stop when
            // the root returns.
            Scheduler::current().stop();
        });
    }
}
