//! Type-erased task core.
//!
//! `TaskCore<F>` owns the future, its result slot, and the two rendezvous
//! cells a task completes on: one for the consumer awaiting its value, one
//! for a canceller awaiting teardown. Task handles (`Spawn`, `Launch`, ...)
//! see it through the object-safe [`CoreHandle`] so they can be generic
//! over the output type without carrying the future type around.
//!
//! The poll state machine keeps a task from being polled on two workers at
//! once while never losing a wake:
//!
//! ```text
//! IDLE --wake--> SCHEDULED --worker--> POLLING --Ready--> COMPLETE
//!   ^                                   |   ^--wake-- NOTIFIED
//!   +------------Pending----------------+        (reschedule self)
//! ```
//!
//! A wake during POLLING parks in NOTIFIED; the worker converts that into
//! an immediate tail-run of the same task instead of a queue round-trip.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use corio_core::{Rendezvous, SpinLock, StopSource};

use crate::context::{self, ResumeTarget, TaskContext};
use crate::scheduler::Scheduler;
use crate::task::{Continuation, Runnable};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const POLLING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

/// Object-safe view of a `TaskCore` for a given output type.
pub(crate) trait CoreHandle<T>: Send + Sync {
    /// Record the home scheduler. Returns true on the first bind; the
    /// caller is then responsible for enqueueing the continuation.
    fn bind(&self, sched: &Arc<Scheduler>) -> bool;

    /// Override the scheduler the consumer is resumed on.
    fn set_via(&self, sched: &Arc<Scheduler>);

    /// Ask the task to stop cooperatively.
    fn request_stop(&self);

    /// Park a consumer on the value. `Some` means the task already
    /// completed and the handle is returned for an inline continue.
    fn arm_completed(&self, target: ResumeTarget) -> Option<ResumeTarget>;

    /// Park a canceller on teardown. Same contract as `arm_completed`.
    fn arm_cancel(&self, target: ResumeTarget) -> Option<ResumeTarget>;

    fn take_value(&self) -> Option<T>;

    fn is_complete(&self) -> bool;
}

pub(crate) struct TaskCore<F: Future> {
    state: AtomicU8,
    sched: SpinLock<Option<Arc<Scheduler>>>,
    via: SpinLock<Option<Arc<Scheduler>>>,
    future: UnsafeCell<Option<F>>,
    value: SpinLock<Option<F::Output>>,
    completed: Rendezvous<ResumeTarget>,
    cancel_done: Rendezvous<ResumeTarget>,
    stop: StopSource,
}

// Safety: the future is only touched while the state machine holds POLLING,
// which at most one worker can win; everything else is internally
// synchronized.
unsafe impl<F> Send for TaskCore<F>
where
    F: Future + Send,
    F::Output: Send,
{
}
unsafe impl<F> Sync for TaskCore<F>
where
    F: Future + Send,
    F::Output: Send,
{
}

impl<F> TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    pub(crate) fn new(future: F) -> Self {
        TaskCore {
            state: AtomicU8::new(IDLE),
            sched: SpinLock::new(None),
            via: SpinLock::new(None),
            future: UnsafeCell::new(Some(future)),
            value: SpinLock::new(None),
            completed: Rendezvous::new(),
            cancel_done: Rendezvous::new(),
            stop: StopSource::new(),
        }
    }

    /// Transition towards a run: schedule if idle, flag if mid-poll.
    fn notify(self: &Arc<Self>) {
        if self.prepare_resume() {
            let sched = self.sched.lock().clone();
            if let Some(sched) = sched {
                sched.schedule(Continuation::new(Arc::clone(self) as Arc<dyn Runnable>));
            }
            // An unbound task stays SCHEDULED; bind() enqueues it.
        }
    }

    /// Route the consumer's continuation after completion: tail-run when it
    /// resumes on this worker's own scheduler, schedule otherwise. The
    /// consumer is claimed first so a wake landing mid-poll folds into the
    /// consumer's own reschedule instead of racing it.
    fn dispatch(&self, my_sched: &Arc<Scheduler>, target: ResumeTarget) -> Option<Continuation> {
        match target {
            ResumeTarget::Thread(waker) => {
                waker.wake();
                None
            }
            ResumeTarget::Task { sched, cont } => {
                let Some(cont) = cont.claim() else {
                    return None;
                };
                let resume_on = self.via.lock().clone().unwrap_or(sched);
                if Arc::ptr_eq(&resume_on, my_sched) {
                    Some(cont)
                } else {
                    resume_on.schedule(cont);
                    None
                }
            }
        }
    }
}

impl<F> Wake for TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notify();
    }
}

impl<F> Runnable for TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn run(self: Arc<Self>) -> Option<Continuation> {
        if self
            .state
            .compare_exchange(SCHEDULED, POLLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let Some(my_sched) = self.sched.lock().clone() else {
            return None;
        };

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let _guard = context::enter(TaskContext {
                sched: Arc::clone(&my_sched),
                stop: self.stop.token(),
                cont: Continuation::new(Arc::clone(&self) as Arc<dyn Runnable>),
            });
            // Safety: POLLING is exclusive, so no one else touches the
            // future; the core is heap-pinned behind the Arc.
            unsafe {
                match (*self.future.get()).as_mut() {
                    Some(future) => Pin::new_unchecked(future).poll(&mut cx),
                    None => return None,
                }
            }
        };

        match poll {
            Poll::Ready(value) => {
                // Drop the future's captured state before anyone can see
                // the completion.
                unsafe { *self.future.get() = None };
                *self.value.lock() = Some(value);
                self.state.store(COMPLETE, Ordering::Release);

                // A parked canceller is resumed through its scheduler; the
                // tail-run slot is reserved for the value consumer.
                if let Some(target) = self.cancel_done.complete() {
                    target.resume();
                }
                if let Some(target) = self.completed.complete() {
                    return self.dispatch(&my_sched, target);
                }
                None
            }
            Poll::Pending => {
                match self
                    .state
                    .compare_exchange(POLLING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => None,
                    Err(_) => {
                        // Woken mid-poll; run again right away.
                        self.state.store(SCHEDULED, Ordering::Release);
                        Some(Continuation::new(self as Arc<dyn Runnable>))
                    }
                }
            }
        }
    }

    fn prepare_resume(&self) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                POLLING => {
                    if self
                        .state
                        .compare_exchange(POLLING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return false;
                    }
                }
                // SCHEDULED and NOTIFIED already imply a pending run;
                // COMPLETE has nothing left to wake.
                _ => return false,
            }
        }
    }
}

impl<F> CoreHandle<F::Output> for TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn bind(&self, sched: &Arc<Scheduler>) -> bool {
        let mut slot = self.sched.lock();
        if slot.is_none() {
            *slot = Some(Arc::clone(sched));
            self.state.store(SCHEDULED, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn set_via(&self, sched: &Arc<Scheduler>) {
        *self.via.lock() = Some(Arc::clone(sched));
    }

    fn request_stop(&self) {
        self.stop.request_stop();
    }

    fn arm_completed(&self, target: ResumeTarget) -> Option<ResumeTarget> {
        self.completed.arm(target)
    }

    fn arm_cancel(&self, target: ResumeTarget) -> Option<ResumeTarget> {
        self.cancel_done.arm(target)
    }

    fn take_value(&self) -> Option<F::Output> {
        self.value.lock().take()
    }

    fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }
}
