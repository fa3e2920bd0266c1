//! Per-thread task context.
//!
//! While a worker polls a task it publishes the task's identity here, so
//! code deep inside the future can ask "which scheduler am I on" and "what
//! is my stop token" without threading them through every call. Completion
//! sources capture a `ResumeTarget` from the same context: inside the
//! runtime that is the task's own continuation plus its scheduler; outside
//! it degrades to the caller's `Waker`.

use std::cell::RefCell;
use std::sync::Arc;
use std::task::Waker;

use corio_core::StopToken;

use crate::scheduler::Scheduler;
use crate::task::Continuation;

/// Where to deliver a completion.
pub enum ResumeTarget {
    /// A runtime task: hand the continuation back to its scheduler.
    Task {
        sched: Arc<Scheduler>,
        cont: Continuation,
    },
    /// A plain future consumer outside the runtime.
    Thread(Waker),
}

impl ResumeTarget {
    /// Make the consumer runnable again. Never runs the consumer inline;
    /// tail-running is the scheduler's decision, made elsewhere.
    pub fn resume(self) {
        match self {
            ResumeTarget::Task { sched, cont } => {
                // Claim moves the task out of IDLE (or folds the wake into a
                // poll in flight); only a successful claim gets enqueued.
                if let Some(cont) = cont.claim() {
                    sched.schedule(cont);
                }
            }
            ResumeTarget::Thread(waker) => waker.wake(),
        }
    }
}

pub(crate) struct TaskContext {
    pub(crate) sched: Arc<Scheduler>,
    pub(crate) stop: StopToken,
    pub(crate) cont: Continuation,
}

thread_local! {
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
    static STOP_OVERRIDE: RefCell<Vec<StopToken>> = const { RefCell::new(Vec::new()) };
}

/// Install `ctx` for the duration of a task poll.
pub(crate) fn enter(ctx: TaskContext) -> ContextGuard {
    let prev = CURRENT.with(|cell| cell.borrow_mut().replace(ctx));
    ContextGuard { prev }
}

pub(crate) struct ContextGuard {
    prev: Option<TaskContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = self.prev.take();
        });
    }
}

/// Scheduler of the task currently being polled on this thread, if any.
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(|ctx| Arc::clone(&ctx.sched)))
}

/// Stop token of the current task, or a token that never fires when called
/// outside the runtime. Inline pipelines can shadow it for their inner
/// future via `with_stop_override`.
pub fn current_stop_token() -> StopToken {
    if let Some(token) = STOP_OVERRIDE.with(|cell| cell.borrow().last().cloned()) {
        return token;
    }
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|ctx| ctx.stop.clone())
            .unwrap_or_else(StopToken::never)
    })
}

/// Run `f` with `token` as the ambient stop token.
pub(crate) fn with_stop_override<R>(token: StopToken, f: impl FnOnce() -> R) -> R {
    STOP_OVERRIDE.with(|cell| cell.borrow_mut().push(token));
    struct PopGuard;
    impl Drop for PopGuard {
        fn drop(&mut self) {
            STOP_OVERRIDE.with(|cell| {
                cell.borrow_mut().pop();
            });
        }
    }
    let _guard = PopGuard;
    f()
}

/// Resume target for whoever is consuming a future on this thread: the
/// current task when inside the runtime, else the waker from the caller's
/// `Context`.
pub fn resume_target_for(waker: &Waker) -> ResumeTarget {
    CURRENT.with(|cell| match cell.borrow().as_ref() {
        Some(ctx) => ResumeTarget::Task {
            sched: Arc::clone(&ctx.sched),
            cont: ctx.cont.clone(),
        },
        None => ResumeTarget::Thread(waker.clone()),
    })
}
