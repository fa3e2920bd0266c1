//! Work-stealing scheduler.
//!
//! Each worker owns a `StealQueue` of continuations: it pushes and pops at
//! the back, everyone else steals from the front. Continuations scheduled
//! from threads that are not workers of this scheduler (IO completion
//! thread, external callers) land on a shared overflow stack that workers
//! drain between their own queue and stealing.
//!
//! Idle workers park on a futex with a timeout. Before the last awake
//! worker parks it spawns one more worker, so a scheduler that still has
//! runnable work cannot quietly go entirely to sleep.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use corio_core::env::env_get;
use corio_core::{kdebug, kwarn, OverflowStack, SpinLock, StealQueue};

use crate::park::Parking;
use crate::task::Continuation;

/// Fixed worker table size; growth stops here.
pub const MAX_WORKERS: usize = 64;

const STATUS_READY: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_SUSPENDED: u8 = 2;

static SCHEDULER_COUNT: AtomicU32 = AtomicU32::new(0);

thread_local! {
    /// (scheduler id, worker index) of this OS thread, if it is a worker.
    static WORKER: std::cell::Cell<(u32, usize)> = const { std::cell::Cell::new((0, usize::MAX)) };
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Workers spawned up front. `CORIO_WORKERS` overrides.
    pub workers: usize,
    /// How long an idle worker sleeps before rechecking for work.
    /// `CORIO_PARK_TIMEOUT_MS` overrides.
    pub park_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        SchedulerConfig {
            workers: env_get("CORIO_WORKERS", cpus).clamp(1, MAX_WORKERS),
            park_timeout: Duration::from_millis(env_get("CORIO_PARK_TIMEOUT_MS", 100)),
        }
    }
}

struct WorkerContext {
    queue: StealQueue<Continuation>,
    status: AtomicU8,
}

impl WorkerContext {
    fn new() -> Self {
        WorkerContext {
            queue: StealQueue::default(),
            status: AtomicU8::new(STATUS_READY),
        }
    }
}

pub struct Scheduler {
    id: u32,
    contexts: [OnceLock<Arc<WorkerContext>>; MAX_WORKERS],
    total: AtomicUsize,
    suspended: AtomicUsize,
    stop: AtomicBool,
    overflow: OverflowStack<Continuation>,
    parking: Parking,
    spawn_lock: Mutex<()>,
    handles: SpinLock<Vec<JoinHandle<()>>>,
    park_timeout: Duration,
}

impl Scheduler {
    /// Build a scheduler and spawn its initial workers.
    pub fn new() -> Arc<Scheduler> {
        Scheduler::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Arc<Scheduler> {
        let sched = Arc::new(Scheduler {
            id: SCHEDULER_COUNT.fetch_add(1, Ordering::Relaxed) + 1,
            contexts: [const { OnceLock::new() }; MAX_WORKERS],
            total: AtomicUsize::new(0),
            suspended: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            overflow: OverflowStack::default(),
            parking: Parking::new(),
            spawn_lock: Mutex::new(()),
            handles: SpinLock::new(Vec::new()),
            park_timeout: config.park_timeout,
        });
        sched.spawn_workers(config.workers);
        sched
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn worker_count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Make `cont` runnable.
    ///
    /// From one of this scheduler's workers the continuation goes on that
    /// worker's own queue (back, LIFO); from anywhere else it goes on the
    /// overflow stack. Either way one sleeping worker is woken.
    pub fn schedule(&self, cont: Continuation) {
        let (sched_id, worker) = WORKER.with(|cell| cell.get());
        if sched_id == self.id && worker < self.total.load(Ordering::Acquire) {
            self.context(worker).queue.push(cont);
        } else {
            self.overflow.push(cont);
        }
        self.parking.wake_one();
    }

    /// Ask the scheduler to wind down. Workers finish their current task,
    /// drain nothing further, and exit; the call blocks until all worker
    /// threads have joined. Must not be called from a worker.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.parking.wake_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        kdebug!("scheduler {} stopped", self.id);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn context(&self, worker: usize) -> &Arc<WorkerContext> {
        self.contexts[worker]
            .get()
            .expect("worker context initialized before thread start")
    }

    /// Next continuation for `worker`: own queue first, then the overflow
    /// stack, then stealing.
    fn next_task(&self, worker: usize) -> Option<Continuation> {
        if let Some(cont) = self.context(worker).queue.pop() {
            return Some(cont);
        }
        if let Some(cont) = self.overflow.pop() {
            return Some(cont);
        }
        self.steal_task(worker)
    }

    /// Round-robin over the other workers, restarting the sweep as long as
    /// any queue looked non-empty, so a losing CAS retries rather than
    /// parking with work in sight.
    fn steal_task(&self, worker: usize) -> Option<Continuation> {
        let total = self.total.load(Ordering::Acquire);
        if total <= 1 {
            return None;
        }
        loop {
            let mut contended = false;
            for step in 1..total {
                let victim = (worker + step) % total;
                let ctx = self.context(victim);
                // A worker flags itself suspended only after finding its
                // own queue empty, and only the owner pushes to it, so a
                // parked victim cannot be holding work.
                if ctx.status.load(Ordering::Acquire) == STATUS_SUSPENDED {
                    continue;
                }
                if let Some(cont) = ctx.queue.steal() {
                    return Some(cont);
                }
                contended = contended || !ctx.queue.is_empty();
            }
            if !contended {
                return None;
            }
        }
    }

    /// Spawn `count` additional workers, up to `MAX_WORKERS`.
    fn spawn_workers(self: &Arc<Self>, count: usize) {
        let _guard = self.spawn_lock.lock().expect("spawn lock poisoned");
        for _ in 0..count {
            let index = self.total.load(Ordering::Relaxed);
            if index >= MAX_WORKERS {
                kwarn!("scheduler {}: worker limit {} reached", self.id, MAX_WORKERS);
                return;
            }
            let _ = self.contexts[index].set(Arc::new(WorkerContext::new()));
            self.total.store(index + 1, Ordering::Release);

            let sched = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("corio-worker-{}-{}", self.id, index))
                .spawn(move || worker_main(sched, index))
                .expect("failed to spawn worker thread");
            self.handles.lock().push(handle);
        }
    }

    /// Called by a worker with nothing to do. If it is about to be the last
    /// one awake, bring up a spare first so newly scheduled work always has
    /// a runner.
    fn park(self: &Arc<Self>, worker: usize) {
        let ctx = self.context(worker);
        ctx.status.store(STATUS_SUSPENDED, Ordering::Release);
        let asleep = self.suspended.fetch_add(1, Ordering::SeqCst) + 1;
        if asleep >= self.total.load(Ordering::Acquire)
            && self.total.load(Ordering::Acquire) < MAX_WORKERS
            && !self.stop.load(Ordering::Acquire)
        {
            self.spawn_workers(1);
        }

        self.parking.park(self.park_timeout);

        self.suspended.fetch_sub(1, Ordering::SeqCst);
        ctx.status.store(STATUS_READY, Ordering::Release);
    }
}

fn worker_main(sched: Arc<Scheduler>, worker: usize) {
    WORKER.with(|cell| cell.set((sched.id, worker)));
    kdebug!("scheduler {} worker {} up", sched.id, worker);

    let ctx = Arc::clone(sched.context(worker));
    while !sched.stop.load(Ordering::Acquire) {
        match sched.next_task(worker) {
            Some(cont) => {
                ctx.status.store(STATUS_RUNNING, Ordering::Release);
                // Tail-running: a finished task may hand back the
                // continuation that was waiting on it.
                let mut next = Some(cont);
                while let Some(cont) = next {
                    next = cont.run();
                }
                ctx.status.store(STATUS_READY, Ordering::Release);
            }
            None => sched.park(worker),
        }
    }

    kdebug!("scheduler {} worker {} down", sched.id, worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::closure_continuation;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn small_sched() -> Arc<Scheduler> {
        Scheduler::with_config(SchedulerConfig {
            workers: 2,
            park_timeout: Duration::from_millis(20),
        })
    }

    #[test]
    fn test_runs_scheduled_work() {
        let sched = small_sched();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let hits = Arc::clone(&hits);
            sched.schedule(closure_continuation(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::Relaxed) < 100 {
            assert!(Instant::now() < deadline, "work not drained");
            thread::yield_now();
        }
        sched.shutdown();
        assert_eq!(hits.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_wakes_sleeping_worker() {
        let sched = small_sched();
        // Let the workers go idle and park.
        thread::sleep(Duration::from_millis(100));

        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = Arc::clone(&hit);
        let start = Instant::now();
        sched.schedule(closure_continuation(move || {
            hit2.store(1, Ordering::Release);
        }));
        while hit.load(Ordering::Acquire) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "worker never woke");
            thread::yield_now();
        }
        sched.shutdown();
    }

    #[test]
    fn test_external_schedule_goes_through_overflow() {
        // This thread is not a worker, so schedule() must still deliver.
        let sched = small_sched();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = Arc::clone(&hits);
            sched.schedule(closure_continuation(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::Relaxed) < 10 {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
        sched.shutdown();
    }

    #[test]
    fn test_drains_with_parked_peers() {
        // Steal sweeps skip suspended workers; work landing while most of
        // the pool is parked must still get picked up and finished.
        let sched = small_sched();
        thread::sleep(Duration::from_millis(100));

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            let hits = Arc::clone(&hits);
            sched.schedule(closure_continuation(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::Relaxed) < 200 {
            assert!(Instant::now() < deadline, "work not drained");
            thread::yield_now();
        }
        sched.shutdown();
    }

    #[test]
    fn test_shutdown_idempotent() {
        let sched = small_sched();
        sched.shutdown();
        sched.shutdown();
        assert!(sched.stop_requested());
    }
}
