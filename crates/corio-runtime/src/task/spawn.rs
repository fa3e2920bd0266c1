//! Independently scheduled tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::context::{current_scheduler, resume_target_for};
use crate::scheduler::Scheduler;
use crate::task::{Continuation, CoreHandle, TaskCore};

/// Handle to a scheduled task producing a `T`.
///
/// The task starts running when [`Spawn::schedule_on`] (or [`Spawn::via`])
/// hands it to a scheduler, or implicitly on first await from inside the
/// runtime, on the awaiting task's scheduler. At most one consumer may
/// await the value; dropping the handle without awaiting lets the task run
/// to completion unobserved.
pub struct Spawn<T> {
    core: Arc<dyn CoreHandle<T>>,
    cont: Continuation,
    consumed: bool,
}

/// Create a task from `future` without scheduling it yet.
pub fn spawn<F>(future: F) -> Spawn<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let core = Arc::new(TaskCore::new(future));
    Spawn {
        cont: Continuation::new(core.clone()),
        core,
        consumed: false,
    }
}

impl<T: Send + 'static> Spawn<T> {
    /// Start the task on `sched`. A second scheduling attempt is ignored.
    pub fn schedule_on(self, sched: &Arc<Scheduler>) -> Self {
        if self.core.bind(sched) {
            sched.schedule(self.cont.clone());
        }
        self
    }

    /// Start the task (if not already started) and resume the eventual
    /// consumer on `sched` instead of its own scheduler.
    pub fn via(self, sched: &Arc<Scheduler>) -> Self {
        self.core.set_via(sched);
        self.schedule_on(sched)
    }

    pub fn is_complete(&self) -> bool {
        self.core.is_complete()
    }

    /// Request cooperative cancellation and return a future that resolves
    /// once the task has fully wound down (its future dropped, its result
    /// published). Cancelling an already finished task resolves
    /// immediately. The task itself decides how far it runs before
    /// honoring the request.
    pub fn cancel(&self) -> CancelRequest<'_, T> {
        CancelRequest {
            core: &self.core,
            requested: false,
        }
    }
}

impl<T: Send + 'static> Future for Spawn<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if this.consumed {
            debug_assert!(false, "task result awaited twice");
            return Poll::Pending;
        }

        // Awaiting is an implicit start when nobody scheduled us yet.
        if let Some(sched) = current_scheduler() {
            if this.core.bind(&sched) {
                sched.schedule(this.cont.clone());
            }
        }

        match this.core.arm_completed(resume_target_for(cx.waker())) {
            None => Poll::Pending,
            Some(_) => {
                this.consumed = true;
                match this.core.take_value() {
                    Some(value) => Poll::Ready(value),
                    None => {
                        debug_assert!(false, "task value taken twice");
                        Poll::Pending
                    }
                }
            }
        }
    }
}

/// Future returned by [`Spawn::cancel`].
pub struct CancelRequest<'a, T> {
    core: &'a Arc<dyn CoreHandle<T>>,
    requested: bool,
}

impl<T: Send + 'static> Future for CancelRequest<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if !this.requested {
            this.requested = true;
            this.core.request_stop();
        }
        match this.core.arm_cancel(resume_target_for(cx.waker())) {
            None => Poll::Pending,
            Some(_) => Poll::Ready(()),
        }
    }
}

impl<T> Unpin for Spawn<T> {}
impl<T> Unpin for CancelRequest<'_, T> {}
