//! Shared io_uring service.
//!
//! One ring serves every scheduler and thread in the process. Submitting
//! threads register lazily into a fixed table; each gets a private
//! [`IoPipeline`] and record pool so the prepare path never contends.
//! Entries reach the kernel through the *submit pass*, a single atomic
//! flag: whoever grabs it drains every pipeline into the shared SQ and
//! calls `io_uring_enter`, and anyone who finds it taken just leaves,
//! because the holder re-checks for new work before letting go.
//!
//! Completions are reaped by one dedicated thread parked in
//! `io_uring_enter(GETEVENTS)`. It maps each CQE's `user_data` back to an
//! [`IoRecord`] and resumes the parked task through the record's
//! rendezvous, so results are handled on worker threads, never on the
//! reaper.

use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use io_uring::{squeue, types, EnterFlags, IoUring};

use corio_core::{env_get, kdebug, kerror, kwarn, PoolAlloc, RtError, RtResult, SpinLock};

use crate::op;
use crate::pipeline::IoPipeline;
use crate::record::{IoAccept, IoFuture, IoRecord, IoSelect};

/// Upper bound on distinct threads that may submit through one service.
pub const MAX_IO_THREADS: usize = 32;

const RECORD_BLOCK: usize = 256;

/// Sentinel `user_data` that tells the completion thread to exit.
const SHUTDOWN_DATA: u64 = u64::MAX;

static NEXT_IO_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    /// (service id, thread slot) of the last service this thread used.
    static IO_TID: std::cell::Cell<(u32, usize)> = const { std::cell::Cell::new((0, usize::MAX)) };
}

pub struct IoConfig {
    /// Submission queue depth. `CORIO_SQ_ENTRIES`, default 256.
    pub sq_entries: u32,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            sq_entries: env_get("CORIO_SQ_ENTRIES", 256),
        }
    }
}

pub(crate) struct IoInner {
    ring: IoUring,
    pipelines: Box<[IoPipeline]>,
    pools: Box<[PoolAlloc<IoRecord>]>,
    registered: AtomicUsize,
    /// The submit pass.
    submitting: AtomicBool,
    id: u32,
}

impl IoInner {
    fn has_pending(&self) -> bool {
        self.pipelines.iter().any(IoPipeline::has_work)
    }
}

pub struct IoService {
    inner: Arc<IoInner>,
    reaper: SpinLock<Option<thread::JoinHandle<()>>>,
    shut: AtomicBool,
}

impl IoService {
    pub fn new() -> RtResult<IoService> {
        IoService::with_config(IoConfig::default())
    }

    pub fn with_config(config: IoConfig) -> RtResult<IoService> {
        let ring = IoUring::builder()
            .build(config.sq_entries)
            .map_err(RtError::RingSetup)?;
        let inner = Arc::new(IoInner {
            ring,
            pipelines: (0..MAX_IO_THREADS).map(|_| IoPipeline::new()).collect(),
            pools: (0..MAX_IO_THREADS)
                .map(|_| PoolAlloc::new(RECORD_BLOCK))
                .collect(),
            registered: AtomicUsize::new(0),
            submitting: AtomicBool::new(false),
            id: NEXT_IO_ID.fetch_add(1, Ordering::Relaxed),
        });
        kdebug!(
            "io service {} up, sq_entries={}",
            inner.id,
            config.sq_entries
        );

        let reap_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("corio-io-cq".into())
            .spawn(move || completion_loop(reap_inner))
            .map_err(RtError::ThreadSpawn)?;

        Ok(IoService {
            inner,
            reaper: SpinLock::new(Some(handle)),
            shut: AtomicBool::new(false),
        })
    }

    /// Claim this thread's pipeline slot ahead of its first submission.
    /// Primitives do this implicitly; the explicit form exists so callers
    /// can surface [`RtError::IoThreadLimit`] instead of panicking.
    pub fn register_thread(&self) -> RtResult<()> {
        self.try_thread_index().map(|_| ())
    }

    fn try_thread_index(&self) -> RtResult<usize> {
        let (svc, tid) = IO_TID.with(|c| c.get());
        if svc == self.inner.id && tid != usize::MAX {
            return Ok(tid);
        }
        let tid = self.inner.registered.fetch_add(1, Ordering::SeqCst);
        if tid >= MAX_IO_THREADS {
            kerror!("io service {}: pipeline table exhausted", self.inner.id);
            return Err(RtError::IoThreadLimit);
        }
        IO_TID.with(|c| c.set((self.inner.id, tid)));
        Ok(tid)
    }

    fn thread_index(&self) -> usize {
        match self.try_thread_index() {
            Ok(tid) => tid,
            Err(_) => panic!("more than {} threads submitting IO", MAX_IO_THREADS),
        }
    }

    /// Allocate a record and build the SQE around it. The entry is not
    /// enqueued; batches collect entries and hand them back later.
    pub(crate) fn prepare_op(
        &self,
        entry_for: impl FnOnce(NonNull<IoRecord>) -> squeue::Entry,
    ) -> (squeue::Entry, IoFuture<'_>) {
        let tid = self.thread_index();
        let pool = &self.inner.pools[tid];
        let rec = pool.alloc(IoRecord::new(pool));
        let entry = entry_for(rec).user_data(rec.as_ptr() as u64);
        (entry, IoFuture::new(rec))
    }

    fn issue(&self, entry_for: impl FnOnce(NonNull<IoRecord>) -> squeue::Entry) -> IoFuture<'_> {
        let tid = self.thread_index();
        let (entry, fut) = self.prepare_op(entry_for);
        self.inner.pipelines[tid].enqueue(entry);
        self.submit();
        fut
    }

    /// Enqueue a batch of already-prepared entries and flush.
    pub(crate) fn submit_prepared(&self, entries: Vec<squeue::Entry>) {
        let tid = self.thread_index();
        for entry in entries {
            self.inner.pipelines[tid].enqueue(entry);
        }
        self.submit();
    }

    /// Drive pending pipeline entries into the kernel.
    ///
    /// Runs the submit pass if it is free; otherwise the current holder
    /// picks our entries up, so there is nothing to wait for.
    pub fn submit(&self) {
        let inner = &*self.inner;
        loop {
            if !inner.has_pending() {
                return;
            }
            if inner.submitting.swap(true, Ordering::AcqRel) {
                return;
            }

            let mut pushed = 0usize;
            let mut sq_full = false;
            unsafe {
                let mut sq = inner.ring.submission_shared();
                for pipeline in inner.pipelines.iter() {
                    let (n, full) = pipeline.flush(&mut sq);
                    pushed += n;
                    if full {
                        sq_full = true;
                        break;
                    }
                }
                sq.sync();
            }

            if pushed > 0 || sq_full {
                if let Err(e) = inner.ring.submit() {
                    kerror!("io submit failed: {}", e);
                }
            }

            inner.submitting.store(false, Ordering::Release);

            // New entries may have landed while we held the pass; a full
            // SQ drains on submit, so loop for the leftovers too.
            if !sq_full && !inner.has_pending() {
                return;
            }
        }
    }

    /// Register fixed buffers for `read_fixed`/`write_fixed`.
    ///
    /// # Safety
    ///
    /// The buffers must stay alive (and unmoved) until unregistered or the
    /// service shuts down.
    pub unsafe fn register_buffers(&self, bufs: &[libc::iovec]) -> RtResult<()> {
        self.inner
            .ring
            .submitter()
            .register_buffers(bufs)
            .map_err(RtError::Register)
    }

    /// Stop the completion thread and wait for it. In-flight operations
    /// past this point are abandoned.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        let tid = self.thread_index();
        self.inner.pipelines[tid].enqueue(op::nop().user_data(SHUTDOWN_DATA));
        while self.inner.has_pending() {
            self.submit();
            std::hint::spin_loop();
        }
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
        kdebug!("io service {} down", self.inner.id);
    }

    pub fn nop(&self) -> IoFuture<'_> {
        self.issue(|_| op::nop())
    }

    pub fn openat<'a>(&'a self, dirfd: RawFd, path: &CStr, flags: i32, mode: u32) -> IoFuture<'a> {
        let path = path.to_owned();
        self.issue(move |rec| {
            let ptr = unsafe { rec.as_ref().set_path(path) };
            op::openat(dirfd, ptr, flags, mode)
        })
    }

    pub fn read<'a>(&'a self, fd: RawFd, buf: &'a mut [u8], offset: u64) -> IoFuture<'a> {
        self.issue(|_| op::read(fd, buf.as_mut_ptr(), buf.len() as u32, offset))
    }

    pub fn read_fixed<'a>(
        &'a self,
        fd: RawFd,
        buf: &'a mut [u8],
        offset: u64,
        buf_index: u16,
    ) -> IoFuture<'a> {
        self.issue(|_| op::read_fixed(fd, buf.as_mut_ptr(), buf.len() as u32, offset, buf_index))
    }

    pub fn readv<'a>(&'a self, fd: RawFd, iovecs: &'a mut [libc::iovec], offset: u64) -> IoFuture<'a> {
        self.issue(|_| op::readv(fd, iovecs.as_ptr(), iovecs.len() as u32, offset))
    }

    pub fn write<'a>(&'a self, fd: RawFd, buf: &'a [u8], offset: u64) -> IoFuture<'a> {
        self.issue(|_| op::write(fd, buf.as_ptr(), buf.len() as u32, offset))
    }

    pub fn write_fixed<'a>(
        &'a self,
        fd: RawFd,
        buf: &'a [u8],
        offset: u64,
        buf_index: u16,
    ) -> IoFuture<'a> {
        self.issue(|_| op::write_fixed(fd, buf.as_ptr(), buf.len() as u32, offset, buf_index))
    }

    pub fn writev<'a>(&'a self, fd: RawFd, iovecs: &'a [libc::iovec], offset: u64) -> IoFuture<'a> {
        self.issue(|_| op::writev(fd, iovecs.as_ptr(), iovecs.len() as u32, offset))
    }

    pub fn recv<'a>(&'a self, fd: RawFd, buf: &'a mut [u8], flags: i32) -> IoFuture<'a> {
        self.issue(|_| op::recv(fd, buf.as_mut_ptr(), buf.len() as u32, flags))
    }

    /// Receive into a kernel-chosen buffer from `group` (see
    /// [`provide_buffers`](IoService::provide_buffers)). Resolves to the
    /// byte count and the chosen buffer id.
    pub fn recv_select(&self, fd: RawFd, len: u32, group: u16, flags: i32) -> IoSelect<'_> {
        self.issue(|_| op::recv_select(fd, len, group, flags)).with_flags()
    }

    pub fn send<'a>(&'a self, fd: RawFd, buf: &'a [u8], flags: i32) -> IoFuture<'a> {
        self.issue(|_| op::send(fd, buf.as_ptr(), buf.len() as u32, flags))
    }

    pub fn accept(&self, fd: RawFd, flags: i32) -> IoFuture<'_> {
        self.issue(|_| op::accept(fd, std::ptr::null_mut(), std::ptr::null_mut(), flags))
    }

    /// Accept and report the peer address. Resolves to the connection fd
    /// (negative errno on failure) plus the raw address and its length as
    /// the kernel wrote them back.
    pub fn accept_addr(&self, fd: RawFd, flags: i32) -> IoAccept<'_> {
        self.issue(|rec| {
            let (addr, len) = unsafe { rec.as_ref().set_peer_addr() };
            op::accept(fd, addr, len, flags)
        })
        .with_peer()
    }

    pub fn close(&self, fd: RawFd) -> IoFuture<'_> {
        self.issue(|_| op::close(fd))
    }

    /// Await readiness on `fd`; `mask` is a `POLLIN`-style event mask.
    pub fn poll_add(&self, fd: RawFd, mask: u32) -> IoFuture<'_> {
        self.issue(|_| op::poll_add(fd, mask))
    }

    /// Cancel the in-flight operation identified by
    /// [`IoFuture::user_data`]. The cancelled operation completes with
    /// `-ECANCELED`; this future resolves once the kernel has acted.
    pub fn cancel_op(&self, target: u64) -> IoFuture<'_> {
        self.issue(move |_| op::cancel(target))
    }

    /// Completes with `-ETIME` after `duration`.
    pub fn timeout(&self, duration: Duration) -> IoFuture<'_> {
        self.issue(move |rec| {
            let ts = unsafe { rec.as_ref().set_timespec(types::Timespec::from(duration)) };
            op::timeout(ts)
        })
    }

    pub fn sleep(&self, duration: Duration) -> IoFuture<'_> {
        self.timeout(duration)
    }

    /// Hand `count` buffers of `each_len` bytes, carved out of `buf`, to
    /// the kernel under `group` for buffer-select receives.
    pub fn provide_buffers<'a>(
        &'a self,
        buf: &'a mut [u8],
        each_len: u32,
        count: u16,
        group: u16,
        start_id: u16,
    ) -> IoFuture<'a> {
        debug_assert!(buf.len() >= each_len as usize * count as usize);
        self.issue(move |_| {
            op::provide_buffers(buf.as_mut_ptr(), each_len as i32, count, group, start_id)
        })
    }
}

impl Drop for IoService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn completion_loop(inner: Arc<IoInner>) {
    kdebug!("io service {}: completion thread up", inner.id);
    loop {
        match unsafe {
            inner
                .ring
                .submitter()
                .enter::<libc::sigset_t>(0, 1, EnterFlags::GETEVENTS.bits(), None)
        } {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => kwarn!("io completion wait failed: {}", e),
        }

        let mut shutdown = false;
        unsafe {
            let mut cq = inner.ring.completion_shared();
            cq.sync();
            for cqe in &mut cq {
                let data = cqe.user_data();
                if data == SHUTDOWN_DATA {
                    shutdown = true;
                    continue;
                }
                let Some(rec) = NonNull::new(data as *mut IoRecord) else {
                    continue;
                };
                IoRecord::complete(rec, cqe.result(), cqe.flags());
            }
        }
        if shutdown {
            kdebug!("io service {}: completion thread exiting", inner.id);
            return;
        }
    }
}
