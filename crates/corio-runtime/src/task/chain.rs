//! Inline chained subtasks.
//!
//! A `Chain` runs entirely inside its consumer's polls: no scheduler
//! round-trip, no separate continuation. What it adds over awaiting the
//! future directly is a cancellation scope of its own: the inner future
//! sees the chain's stop token as the ambient one, so a pipeline stage can
//! be cancelled without stopping the whole task around it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use corio_core::{StopSource, StopToken};

use crate::context::with_stop_override;

pub struct Chain<F> {
    future: F,
    stop: StopSource,
}

/// Wrap `future` as an inline subtask with its own stop scope.
pub fn chain<F: Future>(future: F) -> Chain<F> {
    Chain {
        future,
        stop: StopSource::new(),
    }
}

impl<F> Chain<F> {
    /// Request the inner future to wind down; takes effect at its next
    /// suspension point, observed through `current_stop_token()`.
    pub fn cancel(&self) {
        self.stop.request_stop();
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.token()
    }
}

impl<F: Future> Future for Chain<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        // Safety: structural projection; `future` is never moved out of
        // the pinned chain.
        let (future, token) = unsafe {
            let this = self.get_unchecked_mut();
            (Pin::new_unchecked(&mut this.future), this.stop.token())
        };
        with_stop_override(token, || future.poll(cx))
    }
}
