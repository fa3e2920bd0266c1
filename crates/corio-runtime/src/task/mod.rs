//! Task flavors.
//!
//! Every task is a reference-counted core that the scheduler knows only as
//! a [`Continuation`]: something it can run, and that may hand back the
//! next continuation to run in its place (the tail-run handoff a worker
//! performs when a finishing task resumes its consumer on the same
//! scheduler).
//!
//! Four flavors wrap that core:
//! - [`Spawn`]: an independently scheduled task whose result is awaited by
//!   at most one consumer,
//! - [`Chain`]: an inline subtask driven by its consumer's own poll, with
//!   its own stop scope,
//! - [`Launch`]: a root task joined from a plain OS thread,
//! - [`Generator`]: a resumable producer of a stream of values.

use std::sync::Arc;

mod chain;
mod generator;
mod launch;
mod raw;
mod spawn;

pub use chain::{chain, Chain};
pub use generator::{generator, Generator, GeneratorResume, Yielder};
pub use launch::{launch, Launch};
pub use spawn::{spawn, CancelRequest, Spawn};

pub(crate) use raw::{CoreHandle, TaskCore};

/// Something a worker can run.
pub(crate) trait Runnable: Send + Sync {
    /// Run until the underlying future suspends or finishes. May return a
    /// follow-up continuation for the worker to run immediately.
    fn run(self: Arc<Self>) -> Option<Continuation>;

    /// Move the task toward a run for a resumption: an idle task becomes
    /// scheduled, a poll in flight is flagged to re-run. Returns whether
    /// the caller is now responsible for delivering the continuation to a
    /// worker.
    fn prepare_resume(&self) -> bool;
}

/// A scheduler-runnable handle to a task.
#[derive(Clone)]
pub struct Continuation {
    inner: Arc<dyn Runnable>,
}

impl Continuation {
    pub(crate) fn new(inner: Arc<dyn Runnable>) -> Self {
        Continuation { inner }
    }

    pub(crate) fn run(self) -> Option<Continuation> {
        self.inner.run()
    }

    /// Claim responsibility for a resumption. `Some` hands the claimed
    /// continuation back for enqueueing or tail-running; `None` means the
    /// wake folded into a run already pending (or in flight) elsewhere.
    pub(crate) fn claim(self) -> Option<Continuation> {
        if self.inner.prepare_resume() {
            Some(self)
        } else {
            None
        }
    }
}

#[cfg(test)]
pub(crate) fn closure_continuation(f: impl FnOnce() + Send + 'static) -> Continuation {
    use corio_core::SpinLock;

    struct Closure(SpinLock<Option<Box<dyn FnOnce() + Send>>>);
    impl Runnable for Closure {
        fn run(self: Arc<Self>) -> Option<Continuation> {
            if let Some(f) = self.0.lock().take() {
                f();
            }
            None
        }

        fn prepare_resume(&self) -> bool {
            true
        }
    }
    Continuation::new(Arc::new(Closure(SpinLock::new(Some(Box::new(f))))))
}
