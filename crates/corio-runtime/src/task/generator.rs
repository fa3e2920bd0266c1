//! Resumable generator tasks.
//!
//! A generator is a task that produces a stream of values on demand. The
//! protocol is strictly alternating and built from two rendezvous cells
//! plus a value cell:
//!
//! - `resume()` arms `consumer_rdv`, then kicks the generator (initial
//!   schedule, or completing `next_rdv` where it parked after the last
//!   yield) and suspends;
//! - `yield_value()` stores the value, re-arms `next_rdv` for the next
//!   request, then completes `consumer_rdv`, waking the consumer;
//! - when the body returns, `done` is flagged and a waiting consumer is
//!   woken with no value, so `resume()` yields `None` from then on.
//!
//! Cancellation is cooperative: `cancel()` raises the body's stop token
//! and drives one more round so the body can observe it, emit a final
//! sentinel if it wants, and return. A value already sitting in the cell
//! is never lost; the next `resume()` (or the `cancel()` itself) returns
//! it before anything else.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use corio_core::{Rendezvous, SpinLock};

use crate::context::{current_scheduler, resume_target_for, ResumeTarget};
use crate::scheduler::Scheduler;
use crate::task::{Continuation, CoreHandle, TaskCore};

struct GenShared<Y> {
    /// In-flight value, set by the generator, taken by the consumer.
    value: SpinLock<Option<Y>>,
    /// Armed by the consumer awaiting a value; completed by the generator.
    consumer_rdv: Rendezvous<ResumeTarget>,
    /// Armed by the generator awaiting the next request; completed by the
    /// consumer.
    next_rdv: Rendezvous<ResumeTarget>,
    done: AtomicBool,
    /// Set when the consumer handle is dropped: no request is ever coming,
    /// so yields stop parking in `next_rdv` (a parked target there holds
    /// the body's own continuation and would keep the task alive forever).
    detached: AtomicBool,
}

impl<Y> GenShared<Y> {
    fn new() -> Self {
        GenShared {
            value: SpinLock::new(None),
            consumer_rdv: Rendezvous::new(),
            next_rdv: Rendezvous::new(),
            done: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }
}

/// Handle the generator body yields through.
pub struct Yielder<Y> {
    shared: Arc<GenShared<Y>>,
}

impl<Y: Send + 'static> Yielder<Y> {
    /// Publish `value` and suspend until the consumer asks for the next
    /// one.
    pub fn yield_value(&self, value: Y) -> YieldValue<'_, Y> {
        YieldValue {
            shared: &self.shared,
            value: Some(value),
            parked: false,
        }
    }
}

pub struct YieldValue<'a, Y> {
    shared: &'a GenShared<Y>,
    value: Option<Y>,
    parked: bool,
}

impl<Y: Send + 'static> Future for YieldValue<'_, Y> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.parked {
            // Re-polled after the consumer completed next_rdv.
            return Poll::Ready(());
        }

        if this.shared.detached.load(Ordering::SeqCst) {
            // The consumer handle is gone; nobody will ask for this value.
            this.value.take();
            return Poll::Ready(());
        }

        *this.shared.value.lock() = this.value.take();

        // Park for the next request before waking the consumer: the moment
        // consumer_rdv completes, the consumer may issue that request from
        // another worker.
        this.shared.next_rdv.reset();
        let immediate = this
            .shared
            .next_rdv
            .arm(resume_target_for(cx.waker()))
            .is_some();

        if let Some(target) = this.shared.consumer_rdv.complete() {
            target.resume();
        }

        if immediate {
            return Poll::Ready(());
        }

        // A drop landing between the check above and the arm completes
        // next_rdv itself; whichever side wins the completion unparks this
        // yield.
        if this.shared.detached.load(Ordering::SeqCst)
            && this.shared.next_rdv.complete().is_some()
        {
            return Poll::Ready(());
        }

        this.parked = true;
        Poll::Pending
    }
}

impl<Y> Unpin for YieldValue<'_, Y> {}

/// A generator task handle. Single consumer; `resume()` borrows the
/// handle mutably for the duration of each round.
pub struct Generator<Y> {
    shared: Arc<GenShared<Y>>,
    core: Arc<dyn CoreHandle<()>>,
    cont: Continuation,
    via: Option<Arc<Scheduler>>,
    started: bool,
}

/// Build a generator from a body taking the [`Yielder`].
///
/// The body observes cancellation through `current_stop_token()`.
pub fn generator<Y, F, Fut>(body: F) -> Generator<Y>
where
    Y: Send + 'static,
    F: FnOnce(Yielder<Y>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shared = Arc::new(GenShared::new());
    let future = body(Yielder {
        shared: Arc::clone(&shared),
    });
    let task_shared = Arc::clone(&shared);
    let core = Arc::new(TaskCore::new(async move {
        future.await;
        task_shared.done.store(true, Ordering::Release);
        // Wake a consumer stuck waiting for a value that will never come.
        if let Some(target) = task_shared.consumer_rdv.complete() {
            target.resume();
        }
    }));
    Generator {
        shared,
        cont: Continuation::new(core.clone()),
        core,
        via: None,
        started: false,
    }
}

impl<Y: Send + 'static> Generator<Y> {
    /// Run the generator body on `sched` instead of the first consumer's
    /// scheduler.
    pub fn via(mut self, sched: &Arc<Scheduler>) -> Self {
        self.via = Some(Arc::clone(sched));
        self
    }

    /// Whether the body can still produce values.
    pub fn is_active(&self) -> bool {
        !self.shared.done.load(Ordering::Acquire)
    }

    /// Drive the generator to its next value. Resolves to `None` once the
    /// body has returned.
    pub fn resume(&mut self) -> GeneratorResume<'_, Y> {
        GeneratorResume {
            gen: self,
            armed: false,
        }
    }

    /// Raise the body's stop token and drive one more round, handing back
    /// any value already in flight first.
    pub fn cancel(&mut self) -> GeneratorResume<'_, Y> {
        self.core.request_stop();
        self.resume()
    }

    fn kick(&mut self) {
        if !self.started {
            self.started = true;
            let sched = self
                .via
                .clone()
                .or_else(current_scheduler)
                .expect("generator resumed outside the runtime; give it a scheduler with via()");
            if self.core.bind(&sched) {
                sched.schedule(self.cont.clone());
            }
        } else if let Some(target) = self.shared.next_rdv.complete() {
            target.resume();
        }
    }
}

impl<Y> Drop for Generator<Y> {
    fn drop(&mut self) {
        self.shared.detached.store(true, Ordering::SeqCst);
        self.core.request_stop();
        // Unpark a body waiting in a yield so it can observe the stop and
        // run to completion, releasing everything it captured.
        if let Some(target) = self.shared.next_rdv.complete() {
            target.resume();
        }
    }
}

/// Future returned by [`Generator::resume`] and [`Generator::cancel`].
pub struct GeneratorResume<'a, Y> {
    gen: &'a mut Generator<Y>,
    armed: bool,
}

impl<Y: Send + 'static> Future for GeneratorResume<'_, Y> {
    type Output = Option<Y>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Y>> {
        let this = self.get_mut();

        // An in-flight value always wins, even after cancellation.
        if let Some(value) = this.gen.shared.value.lock().take() {
            return Poll::Ready(Some(value));
        }
        if this.gen.shared.done.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }

        if !this.armed {
            this.armed = true;
            // Fresh round: the generator is parked (or unstarted), so the
            // cell is quiet and can be rewound and re-armed.
            this.gen.shared.consumer_rdv.reset();
            let handed_back = this
                .gen
                .shared
                .consumer_rdv
                .arm(resume_target_for(cx.waker()))
                .is_some();
            this.gen.kick();
            if !handed_back {
                return Poll::Pending;
            }
            // arm() observed a completion that landed before the kick can
            // only happen once the generator finished; fall through.
        }

        // Woken: either a value landed or the body finished.
        if let Some(value) = this.gen.shared.value.lock().take() {
            Poll::Ready(Some(value))
        } else if this.gen.shared.done.load(Ordering::Acquire) {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

impl<Y> Unpin for GeneratorResume<'_, Y> {}
