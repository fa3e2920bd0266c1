//! Grouped submission.
//!
//! An [`IoBatch`] collects prepared operations and hands them to the
//! kernel in one submit pass, one `io_uring_enter` for the lot. Each
//! operation still completes independently through its own future.
//!
//! An [`IoLink`] is a batch with ordering: entries are hard-linked, so the
//! kernel starts each one only after its predecessor completed, and a
//! failed predecessor cancels the rest with `-ECANCELED`. The link flag
//! goes on every entry except the last, which terminates the chain.

use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{squeue, types};

use crate::op;
use crate::record::IoFuture;
use crate::service::IoService;

pub struct IoBatch<'a> {
    service: &'a IoService,
    entries: Vec<squeue::Entry>,
}

impl<'a> IoBatch<'a> {
    pub fn new(service: &'a IoService) -> IoBatch<'a> {
        IoBatch {
            service,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(
        &mut self,
        entry_for: impl FnOnce(std::ptr::NonNull<crate::record::IoRecord>) -> squeue::Entry,
    ) -> IoFuture<'a> {
        let (entry, fut) = self.service.prepare_op(entry_for);
        self.entries.push(entry);
        fut
    }

    pub fn nop(&mut self) -> IoFuture<'a> {
        self.push(|_| op::nop())
    }

    pub fn openat(&mut self, dirfd: RawFd, path: &CStr, flags: i32, mode: u32) -> IoFuture<'a> {
        let path = path.to_owned();
        self.push(move |rec| {
            let ptr = unsafe { rec.as_ref().set_path(path) };
            op::openat(dirfd, ptr, flags, mode)
        })
    }

    pub fn read(&mut self, fd: RawFd, buf: &'a mut [u8], offset: u64) -> IoFuture<'a> {
        self.push(|_| op::read(fd, buf.as_mut_ptr(), buf.len() as u32, offset))
    }

    pub fn write(&mut self, fd: RawFd, buf: &'a [u8], offset: u64) -> IoFuture<'a> {
        self.push(|_| op::write(fd, buf.as_ptr(), buf.len() as u32, offset))
    }

    pub fn recv(&mut self, fd: RawFd, buf: &'a mut [u8], flags: i32) -> IoFuture<'a> {
        self.push(|_| op::recv(fd, buf.as_mut_ptr(), buf.len() as u32, flags))
    }

    pub fn send(&mut self, fd: RawFd, buf: &'a [u8], flags: i32) -> IoFuture<'a> {
        self.push(|_| op::send(fd, buf.as_ptr(), buf.len() as u32, flags))
    }

    pub fn close(&mut self, fd: RawFd) -> IoFuture<'a> {
        self.push(|_| op::close(fd))
    }

    pub fn timeout(&mut self, duration: Duration) -> IoFuture<'a> {
        self.push(move |rec| {
            let ts = unsafe { rec.as_ref().set_timespec(types::Timespec::from(duration)) };
            op::timeout(ts)
        })
    }

    /// Submit every collected entry in one pass.
    pub fn submit(self) {
        self.service.submit_prepared(self.entries);
    }
}

/// An ordered, hard-linked batch. Same prep surface as [`IoBatch`];
/// submission chains the entries.
pub struct IoLink<'a> {
    batch: IoBatch<'a>,
}

impl<'a> IoLink<'a> {
    pub fn new(service: &'a IoService) -> IoLink<'a> {
        IoLink {
            batch: IoBatch::new(service),
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn openat(&mut self, dirfd: RawFd, path: &CStr, flags: i32, mode: u32) -> IoFuture<'a> {
        self.batch.openat(dirfd, path, flags, mode)
    }

    pub fn read(&mut self, fd: RawFd, buf: &'a mut [u8], offset: u64) -> IoFuture<'a> {
        self.batch.read(fd, buf, offset)
    }

    pub fn write(&mut self, fd: RawFd, buf: &'a [u8], offset: u64) -> IoFuture<'a> {
        self.batch.write(fd, buf, offset)
    }

    pub fn recv(&mut self, fd: RawFd, buf: &'a mut [u8], flags: i32) -> IoFuture<'a> {
        self.batch.recv(fd, buf, flags)
    }

    pub fn send(&mut self, fd: RawFd, buf: &'a [u8], flags: i32) -> IoFuture<'a> {
        self.batch.send(fd, buf, flags)
    }

    pub fn close(&mut self, fd: RawFd) -> IoFuture<'a> {
        self.batch.close(fd)
    }

    pub fn timeout(&mut self, duration: Duration) -> IoFuture<'a> {
        self.batch.timeout(duration)
    }

    /// Submit the chain. All entries but the last carry the hard link, so
    /// the chain terminates at the final entry instead of leaking into
    /// whatever gets submitted next.
    pub fn submit(self) {
        let IoBatch { service, entries } = self.batch;
        let last = entries.len().saturating_sub(1);
        let entries = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                if i < last {
                    entry.flags(squeue::Flags::IO_HARDLINK)
                } else {
                    entry
                }
            })
            .collect();
        service.submit_prepared(entries);
    }
}
