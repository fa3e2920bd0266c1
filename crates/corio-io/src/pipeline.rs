//! Per-thread submission pipelines.
//!
//! Each registered submitter thread owns one pipeline: a FIFO of prepared
//! SQEs plus a one-entry overflow slot for an entry that did not fit into
//! the shared submission queue on the last flush. The overflow entry is
//! retried before anything else so a full SQ never reorders a pipeline.
//!
//! Enqueue is owner-thread only; `flush` is called by whichever thread
//! holds the service's submit pass, so the consumer side is exclusive.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use io_uring::squeue;

use corio_core::WorkQueue;

pub(crate) struct IoPipeline {
    queue: WorkQueue<squeue::Entry>,
    /// Entry bounced off a full SQ, retried first on the next flush.
    /// Accessed only under the submit pass.
    overflow: UnsafeCell<Option<squeue::Entry>>,
    overflow_set: AtomicBool,
}

unsafe impl Send for IoPipeline {}
unsafe impl Sync for IoPipeline {}

impl IoPipeline {
    pub(crate) fn new() -> IoPipeline {
        IoPipeline {
            queue: WorkQueue::default(),
            overflow: UnsafeCell::new(None),
            overflow_set: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn has_work(&self) -> bool {
        self.overflow_set.load(Ordering::Acquire) || !self.queue.is_empty()
    }

    /// Owning thread only.
    pub(crate) fn enqueue(&self, entry: squeue::Entry) {
        self.queue.enqueue(entry);
    }

    /// Move pending entries into the shared SQ. Returns the number pushed
    /// and whether the SQ filled up mid-flush.
    ///
    /// # Safety
    ///
    /// Caller must hold the service's submit pass; the overflow slot is
    /// unsynchronized otherwise.
    pub(crate) unsafe fn flush(&self, sq: &mut squeue::SubmissionQueue<'_>) -> (usize, bool) {
        let mut pushed = 0;
        let slot = &mut *self.overflow.get();

        if let Some(entry) = slot.take() {
            if sq.push(&entry).is_err() {
                *slot = Some(entry);
                return (pushed, true);
            }
            self.overflow_set.store(false, Ordering::Release);
            pushed += 1;
        }

        while let Some(entry) = self.queue.dequeue() {
            if sq.push(&entry).is_err() {
                *slot = Some(entry);
                self.overflow_set.store(true, Ordering::Release);
                return (pushed, true);
            }
            pushed += 1;
        }
        (pushed, false)
    }
}
