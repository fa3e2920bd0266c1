//! Prep-to-SQE mapping for every supported operation.
//!
//! Each builder returns a bare [`squeue::Entry`]; the caller attaches the
//! `user_data` (the record address) and any link flags before the entry
//! enters a pipeline.

use std::os::unix::io::RawFd;

use io_uring::{opcode, squeue, types};

pub(crate) fn nop() -> squeue::Entry {
    opcode::Nop::new().build()
}

pub(crate) fn openat(
    dirfd: RawFd,
    path: *const libc::c_char,
    flags: i32,
    mode: u32,
) -> squeue::Entry {
    opcode::OpenAt::new(types::Fd(dirfd), path)
        .flags(flags)
        .mode(mode)
        .build()
}

pub(crate) fn read(fd: RawFd, buf: *mut u8, len: u32, offset: u64) -> squeue::Entry {
    opcode::Read::new(types::Fd(fd), buf, len)
        .offset(offset)
        .build()
}

pub(crate) fn read_fixed(
    fd: RawFd,
    buf: *mut u8,
    len: u32,
    offset: u64,
    buf_index: u16,
) -> squeue::Entry {
    opcode::ReadFixed::new(types::Fd(fd), buf, len, buf_index)
        .offset(offset)
        .build()
}

pub(crate) fn readv(fd: RawFd, iovecs: *const libc::iovec, count: u32, offset: u64) -> squeue::Entry {
    opcode::Readv::new(types::Fd(fd), iovecs, count)
        .offset(offset)
        .build()
}

pub(crate) fn write(fd: RawFd, buf: *const u8, len: u32, offset: u64) -> squeue::Entry {
    opcode::Write::new(types::Fd(fd), buf, len)
        .offset(offset)
        .build()
}

pub(crate) fn write_fixed(
    fd: RawFd,
    buf: *const u8,
    len: u32,
    offset: u64,
    buf_index: u16,
) -> squeue::Entry {
    opcode::WriteFixed::new(types::Fd(fd), buf, len, buf_index)
        .offset(offset)
        .build()
}

pub(crate) fn writev(
    fd: RawFd,
    iovecs: *const libc::iovec,
    count: u32,
    offset: u64,
) -> squeue::Entry {
    opcode::Writev::new(types::Fd(fd), iovecs, count)
        .offset(offset)
        .build()
}

pub(crate) fn recv(fd: RawFd, buf: *mut u8, len: u32, flags: i32) -> squeue::Entry {
    opcode::Recv::new(types::Fd(fd), buf, len).flags(flags).build()
}

/// Buffer-select receive: the kernel picks a buffer out of `group`; the
/// chosen buffer id comes back in the CQE flags.
pub(crate) fn recv_select(fd: RawFd, len: u32, group: u16, flags: i32) -> squeue::Entry {
    opcode::Recv::new(types::Fd(fd), std::ptr::null_mut(), len)
        .flags(flags)
        .buf_group(group)
        .build()
        .flags(squeue::Flags::BUFFER_SELECT)
}

pub(crate) fn send(fd: RawFd, buf: *const u8, len: u32, flags: i32) -> squeue::Entry {
    opcode::Send::new(types::Fd(fd), buf, len).flags(flags).build()
}

/// `addr`/`addrlen` may be null when the caller does not want the peer
/// address; otherwise they must stay valid until the completion arrives
/// (callers keep them inside the operation's record).
pub(crate) fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
    flags: i32,
) -> squeue::Entry {
    opcode::Accept::new(types::Fd(fd), addr, addrlen)
        .flags(flags)
        .build()
}

pub(crate) fn close(fd: RawFd) -> squeue::Entry {
    opcode::Close::new(types::Fd(fd)).build()
}

pub(crate) fn poll_add(fd: RawFd, mask: u32) -> squeue::Entry {
    opcode::PollAdd::new(types::Fd(fd), mask).build()
}

/// Cancel the in-flight operation whose `user_data` is `target`.
pub(crate) fn cancel(target: u64) -> squeue::Entry {
    opcode::AsyncCancel::new(target).build()
}

/// `timespec` must stay valid until the completion arrives; callers keep
/// it inside the operation's record.
pub(crate) fn timeout(timespec: *const types::Timespec) -> squeue::Entry {
    opcode::Timeout::new(timespec).build()
}

pub(crate) fn provide_buffers(
    addr: *mut u8,
    each_len: i32,
    count: u16,
    group: u16,
    start_id: u16,
) -> squeue::Entry {
    opcode::ProvideBuffers::new(addr, each_len, count, group, start_id).build()
}
