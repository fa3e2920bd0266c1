//! Per-operation completion records.
//!
//! Every submitted SQE carries the address of an [`IoRecord`] as its
//! `user_data`. The completion thread writes the CQE result into the
//! record and completes its rendezvous, resuming whichever task parked on
//! the matching [`IoFuture`]. The record is pool-allocated; a two-party
//! destroy gate frees it only after *both* the completion thread and the
//! future are finished with it, whichever comes last.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::task::{Context, Poll};

use io_uring::{cqueue, types};

use corio_core::{PoolAlloc, Rendezvous};
use corio_runtime::{resume_target_for, ResumeTarget};

pub(crate) struct IoRecord {
    result: AtomicI32,
    cqe_flags: AtomicU32,
    rdv: Rendezvous<ResumeTarget>,
    /// Destroy gate: the second of {completion thread, future} to flip it
    /// returns the record to the pool.
    half_done: AtomicBool,
    pool: *const PoolAlloc<IoRecord>,
    /// Inline storage for operations whose SQE points back into the
    /// record: the timeout timespec, the openat path, and the accept
    /// peer-address slot the kernel fills in.
    timespec: UnsafeCell<types::Timespec>,
    path: UnsafeCell<Option<CString>>,
    addr: UnsafeCell<libc::sockaddr_storage>,
    addrlen: UnsafeCell<libc::socklen_t>,
}

unsafe impl Send for IoRecord {}
unsafe impl Sync for IoRecord {}

impl IoRecord {
    pub(crate) fn new(pool: *const PoolAlloc<IoRecord>) -> IoRecord {
        IoRecord {
            result: AtomicI32::new(0),
            cqe_flags: AtomicU32::new(0),
            rdv: Rendezvous::new(),
            half_done: AtomicBool::new(false),
            pool,
            timespec: UnsafeCell::new(types::Timespec::new()),
            path: UnsafeCell::new(None),
            addr: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            addrlen: UnsafeCell::new(0),
        }
    }

    /// Store the timespec payload and return the pointer the SQE embeds.
    ///
    /// # Safety
    ///
    /// Must be called before the entry is built, never after submission.
    pub(crate) unsafe fn set_timespec(&self, ts: types::Timespec) -> *const types::Timespec {
        *self.timespec.get() = ts;
        self.timespec.get()
    }

    /// Store the path payload and return the pointer the SQE embeds.
    ///
    /// # Safety
    ///
    /// Must be called before the entry is built, never after submission.
    pub(crate) unsafe fn set_path(&self, path: CString) -> *const libc::c_char {
        *self.path.get() = Some(path);
        (*self.path.get()).as_ref().unwrap().as_ptr()
    }

    /// Point an accept SQE at the record's inline peer-address slot and
    /// return the pointers the SQE embeds.
    ///
    /// # Safety
    ///
    /// Must be called before the entry is built, never after submission.
    pub(crate) unsafe fn set_peer_addr(&self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        *self.addrlen.get() = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        (self.addr.get() as *mut libc::sockaddr, self.addrlen.get())
    }

    /// Read back the peer address the kernel wrote.
    ///
    /// # Safety
    ///
    /// Only valid after the completion arrived, before `release`.
    unsafe fn peer_addr(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        (*self.addr.get(), *self.addrlen.get())
    }

    /// Completion-thread side: publish the CQE and resume the waiter.
    pub(crate) fn complete(record: NonNull<IoRecord>, result: i32, flags: u32) {
        let rec = unsafe { record.as_ref() };
        rec.result.store(result, Ordering::Release);
        rec.cqe_flags.store(flags, Ordering::Release);
        if let Some(target) = rec.rdv.complete() {
            target.resume();
        }
        unsafe { IoRecord::release(record) };
    }

    /// Drop one side's claim on the record; the second caller frees it.
    ///
    /// # Safety
    ///
    /// Each side (completion thread, future) may call this at most once.
    pub(crate) unsafe fn release(record: NonNull<IoRecord>) {
        let rec = record.as_ref();
        if rec.half_done.swap(true, Ordering::AcqRel) {
            let pool = rec.pool;
            (*pool).dealloc(record);
        }
    }
}

/// Future resolving to the raw CQE result (negative errno on failure).
///
/// Dropping the future before completion abandons the operation: it still
/// runs, its record is freed when the CQE arrives, but the result is
/// discarded. Use [`IoService::cancel_op`](crate::IoService::cancel_op)
/// to actually stop it.
pub struct IoFuture<'a> {
    record: NonNull<IoRecord>,
    consumed: bool,
    _borrow: PhantomData<&'a ()>,
}

// The record lives in an append-only pool block; moving the future across
// workers is what the rendezvous is for.
unsafe impl Send for IoFuture<'_> {}

impl<'a> IoFuture<'a> {
    pub(crate) fn new(record: NonNull<IoRecord>) -> IoFuture<'a> {
        IoFuture {
            record,
            consumed: false,
            _borrow: PhantomData,
        }
    }

    /// Identifier for [`IoService::cancel_op`](crate::IoService::cancel_op).
    pub fn user_data(&self) -> u64 {
        self.record.as_ptr() as u64
    }

    /// Resolve to `(result, cqe_flags)` instead of the bare result. Needed
    /// for buffer-select receives, where the chosen buffer id rides in the
    /// flags.
    pub fn with_flags(self) -> IoSelect<'a> {
        IoSelect { inner: self }
    }

    pub(crate) fn with_peer(self) -> IoAccept<'a> {
        IoAccept { inner: self }
    }

    fn poll_raw(&mut self, cx: &mut Context<'_>) -> Poll<(i32, u32)> {
        debug_assert!(!self.consumed, "io future polled after completion");
        let rec = unsafe { self.record.as_ref() };
        match rec.rdv.arm(resume_target_for(cx.waker())) {
            None => Poll::Pending,
            Some(_) => {
                let result = rec.result.load(Ordering::Acquire);
                let flags = rec.cqe_flags.load(Ordering::Acquire);
                self.consumed = true;
                unsafe { IoRecord::release(self.record) };
                Poll::Ready((result, flags))
            }
        }
    }
}

impl Future for IoFuture<'_> {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        self.get_mut().poll_raw(cx).map(|(result, _)| result)
    }
}

impl Unpin for IoFuture<'_> {}

impl Drop for IoFuture<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            unsafe { IoRecord::release(self.record) };
        }
    }
}

/// Buffer-select variant of [`IoFuture`]: resolves to the raw result and
/// the kernel-chosen buffer id, if any.
pub struct IoSelect<'a> {
    inner: IoFuture<'a>,
}

impl IoSelect<'_> {
    pub fn user_data(&self) -> u64 {
        self.inner.user_data()
    }
}

impl Future for IoSelect<'_> {
    type Output = (i32, Option<u16>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<(i32, Option<u16>)> {
        self.get_mut()
            .inner
            .poll_raw(cx)
            .map(|(result, flags)| (result, cqueue::buffer_select(flags)))
    }
}

impl Unpin for IoSelect<'_> {}

/// Accept variant of [`IoFuture`]: resolves to the connection fd plus the
/// peer address the kernel wrote into the record.
pub struct IoAccept<'a> {
    inner: IoFuture<'a>,
}

impl IoAccept<'_> {
    pub fn user_data(&self) -> u64 {
        self.inner.user_data()
    }
}

impl Future for IoAccept<'_> {
    type Output = (i32, libc::sockaddr_storage, libc::socklen_t);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.inner.consumed, "io future polled after completion");
        let rec = unsafe { this.inner.record.as_ref() };
        match rec.rdv.arm(resume_target_for(cx.waker())) {
            None => Poll::Pending,
            Some(_) => {
                let result = rec.result.load(Ordering::Acquire);
                // The address must come out before releasing our claim on
                // the record.
                let (addr, len) = unsafe { rec.peer_addr() };
                this.inner.consumed = true;
                unsafe { IoRecord::release(this.inner.record) };
                Poll::Ready((result, addr, len))
            }
        }
    }
}

impl Unpin for IoAccept<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Arc;
    use std::task::Waker;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        struct Noop;
        impl std::task::Wake for Noop {
            fn wake(self: Arc<Self>) {}
        }
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn test_complete_then_poll() {
        let pool: PoolAlloc<IoRecord> = PoolAlloc::new(4);
        let rec = pool.alloc(IoRecord::new(&pool));
        IoRecord::complete(rec, 17, 0);
        let mut fut = IoFuture::new(rec);
        assert_eq!(poll_once(&mut fut), Poll::Ready(17));
    }

    #[test]
    fn test_poll_then_complete() {
        let pool: PoolAlloc<IoRecord> = PoolAlloc::new(4);
        let rec = pool.alloc(IoRecord::new(&pool));
        let mut fut = IoFuture::new(rec);
        assert_eq!(poll_once(&mut fut), Poll::Pending);
        IoRecord::complete(rec, -libc::EAGAIN, 0);
        assert_eq!(poll_once(&mut fut), Poll::Ready(-libc::EAGAIN));
    }

    #[test]
    fn test_dropped_future_still_frees_record() {
        let pool: PoolAlloc<IoRecord> = PoolAlloc::new(4);
        let rec = pool.alloc(IoRecord::new(&pool));
        let addr = rec.as_ptr() as usize;
        drop(IoFuture::new(rec));
        IoRecord::complete(rec, 0, 0);
        // The slot is back on the free list; the next alloc reuses it.
        let again = pool.alloc(IoRecord::new(&pool));
        assert_eq!(again.as_ptr() as usize, addr);
        unsafe { pool.dealloc(again) };
    }
}
