//! Futex-based worker parking.
//!
//! Futex word semantics:
//! - 0 = no wake pending
//! - 1 = wake pending (workers should look for work)
//!
//! The wake flag is set before the waiter count is consulted, so a worker
//! racing into `park` either sees the flag and returns immediately or the
//! kernel rejects the FUTEX_WAIT with EAGAIN. Workers always park with a
//! timeout, which also bounds shutdown latency.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) struct Parking {
    /// Futex word: 0 = sleep, 1 = wake pending
    futex: AtomicU32,

    /// Count of parked workers, to skip the syscall when nobody sleeps.
    parked: AtomicUsize,
}

impl Parking {
    pub(crate) const fn new() -> Self {
        Parking {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    /// Sleep until woken, until `timeout` elapses, or immediately if a wake
    /// is already pending. Returns true when woken by `wake_one`/`wake_all`.
    pub(crate) fn park(&self, timeout: Duration) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        // Consume a pending wake instead of sleeping.
        if self.futex.swap(0, Ordering::AcqRel) != 0 {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        let timespec = libc::timespec {
            tv_sec: timeout.as_secs() as i64,
            tv_nsec: timeout.subsec_nanos() as i64,
        };

        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                &timespec as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            )
        };

        self.parked.fetch_sub(1, Ordering::SeqCst);
        self.futex.store(0, Ordering::Release);

        if result == 0 {
            true
        } else {
            // ETIMEDOUT = timer, EAGAIN = word already flipped, EINTR =
            // signal; none of those count as an explicit wake.
            let errno = unsafe { *libc::__errno_location() };
            errno != libc::ETIMEDOUT && errno != libc::EAGAIN && errno != libc::EINTR
        }
    }

    pub(crate) fn wake_one(&self) {
        self.futex.store(1, Ordering::Release);
        if self.parked.load(Ordering::Acquire) == 0 {
            return;
        }
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    pub(crate) fn wake_all(&self) {
        self.futex.store(1, Ordering::Release);
        if self.parked.load(Ordering::Acquire) == 0 {
            return;
        }
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_times_out() {
        let p = Parking::new();
        let start = Instant::now();
        let woken = p.park(Duration::from_millis(30));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pending_wake_skips_sleep() {
        let p = Parking::new();
        p.wake_one();
        let start = Instant::now();
        assert!(p.park(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_one_releases_parker() {
        let p = Arc::new(Parking::new());
        let p2 = Arc::clone(&p);
        let parker = thread::spawn(move || p2.park(Duration::from_secs(10)));
        while p.parked_count() == 0 {
            thread::yield_now();
        }
        p.wake_one();
        // Whether the kernel reports the explicit wake or EAGAIN depends on
        // timing; either way the thread must come back quickly.
        let start = Instant::now();
        parker.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
