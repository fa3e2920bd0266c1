//! Awaitable counting event.
//!
//! `set(n)` accumulates; `wait().await` drains the whole count and returns
//! it. One waiter at a time. Any thread may set, including ones far
//! outside the runtime, which makes this the cheapest way to hand a signal
//! into a task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use corio_core::SpinLock;

use crate::context::{resume_target_for, ResumeTarget};

pub struct Event {
    count: AtomicU64,
    waiter: SpinLock<Option<ResumeTarget>>,
    armed: AtomicBool,
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            count: AtomicU64::new(0),
            waiter: SpinLock::new(None),
            armed: AtomicBool::new(false),
        }
    }

    /// Add `n` to the count and wake the waiter, if one is parked.
    pub fn set(&self, n: u64) {
        self.count.fetch_add(n, Ordering::AcqRel);
        if self.armed.swap(false, Ordering::AcqRel) {
            if let Some(target) = self.waiter.lock().take() {
                target.resume();
            }
        }
    }

    /// Await a non-zero count, draining it.
    pub fn wait(&self) -> EventWait<'_> {
        EventWait { event: self }
    }
}

pub struct EventWait<'a> {
    event: &'a Event,
}

impl std::future::Future for EventWait<'_> {
    type Output = u64;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u64> {
        let event = self.event;

        let n = event.count.swap(0, Ordering::AcqRel);
        if n > 0 {
            return Poll::Ready(n);
        }

        *event.waiter.lock() = Some(resume_target_for(cx.waker()));
        event.armed.store(true, Ordering::Release);

        // A set() that raced past the first check lands here.
        let n = event.count.swap(0, Ordering::AcqRel);
        if n > 0 {
            if event.armed.swap(false, Ordering::AcqRel) {
                event.waiter.lock().take();
            }
            return Poll::Ready(n);
        }
        Poll::Pending
    }
}
