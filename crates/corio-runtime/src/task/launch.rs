//! Root tasks joined from plain OS threads.
//!
//! `Launch` bridges the synchronous world into the runtime: the wrapped
//! future runs as an ordinary task, publishes its value into a
//! mutex-and-condvar slot, and `join` blocks the calling thread until the
//! value lands. This is how `main` (and the test suite) drives async code.

use std::future::Future;
use std::sync::{Arc, Condvar, Mutex};

use crate::scheduler::Scheduler;
use crate::task::{Continuation, CoreHandle, TaskCore};

struct ResultSlot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        ResultSlot {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn put(&self, value: T) {
        *self.value.lock().expect("result slot poisoned") = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self) -> T {
        let mut slot = self.value.lock().expect("result slot poisoned");
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self.ready.wait(slot).expect("result slot poisoned");
        }
    }
}

pub struct Launch<T> {
    core: Arc<dyn CoreHandle<()>>,
    cont: Continuation,
    slot: Arc<ResultSlot<T>>,
}

/// Create a joinable root task. It does nothing until
/// [`Launch::schedule_on`] places it on a scheduler.
pub fn launch<F>(future: F) -> Launch<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let slot = Arc::new(ResultSlot::new());
    let task_slot = Arc::clone(&slot);
    let core = Arc::new(TaskCore::new(async move {
        task_slot.put(future.await);
    }));
    Launch {
        cont: Continuation::new(core.clone()),
        core,
        slot,
    }
}

impl<T: Send + 'static> Launch<T> {
    pub fn schedule_on(self, sched: &Arc<Scheduler>) -> Self {
        if self.core.bind(sched) {
            sched.schedule(self.cont.clone());
        }
        self
    }

    /// Request cooperative cancellation; the task still runs to completion
    /// (observing its stop token) and `join` still yields its value.
    pub fn cancel(&self) {
        self.core.request_stop();
    }

    /// Block until the task completes and take its value. Call from a
    /// non-worker thread; the task must have been scheduled.
    pub fn join(self) -> T {
        self.slot.wait()
    }
}
