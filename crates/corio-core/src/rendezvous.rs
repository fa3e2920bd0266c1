//! One-shot rendezvous cell.
//!
//! Two parties race on a completion: the consumer, which wants to suspend
//! until the result is ready, and the producer, which publishes the result.
//! Whichever arrives second takes over resuming the other:
//!
//! - the consumer writes its resume handle into the slot and tries to move
//!   `EMPTY -> ARMED`; if the cell is already `DONE` it takes the handle
//!   straight back and proceeds inline,
//! - the producer swaps the state to `DONE`; if it displaces `ARMED` it
//!   takes the parked handle out and resumes it, otherwise nobody was
//!   waiting yet and the consumer will see `DONE` on arrival.
//!
//! Both paths resolve with single atomic exchanges, so exactly one side
//! resumes the consumer no matter how the two interleave. `SEALED` is the
//! post-handoff terminal state, letting a re-polled consumer observe that
//! completion already happened. `reset` rewinds a quiesced cell so strictly
//! alternating protocols (generators) can reuse it round after round.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const ARMED: u8 = 1;
const DONE: u8 = 2;
const SEALED: u8 = 3;

pub struct Rendezvous<R> {
    state: AtomicU8,
    slot: UnsafeCell<Option<R>>,
}

// Safety: slot access is guarded by the state machine; the handle crosses
// threads exactly once, at the DONE/ARMED handoff.
unsafe impl<R: Send> Send for Rendezvous<R> {}
unsafe impl<R: Send> Sync for Rendezvous<R> {}

impl<R> Default for Rendezvous<R> {
    fn default() -> Self {
        Rendezvous::new()
    }
}

impl<R> Rendezvous<R> {
    pub const fn new() -> Self {
        Rendezvous {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(None),
        }
    }

    /// Consumer side: park `handle` in the cell.
    ///
    /// Returns `None` when armed (the producer will resume the handle), or
    /// gives the handle back when the producer already completed, in which
    /// case the consumer proceeds inline. Single consumer only; calling
    /// again while armed replaces the parked handle.
    pub fn arm(&self, handle: R) -> Option<R> {
        loop {
            match self.state.load(Ordering::Acquire) {
                DONE | SEALED => return Some(handle),
                EMPTY => {
                    unsafe { *self.slot.get() = Some(handle) };
                    match self.state.compare_exchange(
                        EMPTY,
                        ARMED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return None,
                        Err(_) => {
                            // Producer slipped in between the write and the
                            // CAS. It saw EMPTY, so the handle is still ours.
                            return unsafe { (*self.slot.get()).take() };
                        }
                    }
                }
                _ => {
                    // ARMED: reclaim the cell to swap in the new handle.
                    // Only this consumer moves ARMED back to EMPTY, so the
                    // CAS can only lose to the producer's completion.
                    if self
                        .state
                        .compare_exchange(ARMED, EMPTY, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                }
            }
        }
    }

    /// Producer side: mark complete, returning a parked consumer handle if
    /// one was waiting. Call at most once per round.
    pub fn complete(&self) -> Option<R> {
        match self.state.swap(DONE, Ordering::AcqRel) {
            ARMED => {
                let handle = unsafe { (*self.slot.get()).take() };
                self.state.store(SEALED, Ordering::Release);
                handle
            }
            _ => None,
        }
    }

    /// Whether the producer already completed this round.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) >= DONE
    }

    /// Rewind a completed cell for the next round.
    ///
    /// Only valid once both sides have quiesced: the producer's `complete`
    /// returned and the consumer observed the completion.
    pub fn reset(&self) {
        unsafe { *self.slot.get() = None };
        self.state.store(EMPTY, Ordering::Release);
    }
}
