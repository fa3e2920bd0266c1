//! Power-of-two circular array backing the queues in this crate.
//!
//! Slots are `MaybeUninit`; the owning queue tracks which window
//! `[front, back)` is live via its own monotonic cursors and is responsible
//! for dropping the contents. Indexing masks the cursor, so cursors never
//! need to be reduced modulo capacity by callers.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

pub struct RingBuf<T> {
    mask: u64,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: slot access is coordinated by the owning queue's cursors.
unsafe impl<T: Send> Send for RingBuf<T> {}
unsafe impl<T: Send> Sync for RingBuf<T> {}

impl<T> RingBuf<T> {
    /// Allocate a buffer of `capacity` slots. `capacity` must be a power
    /// of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        RingBuf {
            mask: capacity as u64 - 1,
            slots,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store `value` at cursor `idx`.
    ///
    /// # Safety
    ///
    /// The slot must not hold a live value, and no other thread may access
    /// the slot concurrently.
    #[inline]
    pub unsafe fn write(&self, idx: u64, value: T) {
        let slot = &self.slots[(idx & self.mask) as usize];
        (*slot.get()).write(value);
    }

    /// Move the value out of cursor `idx`.
    ///
    /// # Safety
    ///
    /// The slot must hold a live value. Concurrent readers of the same slot
    /// are tolerated only if at most one of the resulting values is kept
    /// (the loser must `mem::forget` its copy); the deque's steal protocol
    /// relies on exactly that.
    #[inline]
    pub unsafe fn read(&self, idx: u64) -> T {
        let slot = &self.slots[(idx & self.mask) as usize];
        (*slot.get()).assume_init_read()
    }

    /// Build a buffer of twice the capacity holding the live window
    /// `[front, back)` at the same cursor positions.
    ///
    /// # Safety
    ///
    /// Every cursor in `[front, back)` must hold a live value and the caller
    /// must be the only writer. The values remain live in `self` as far as
    /// the type system is concerned; the caller must treat `self` as retired
    /// and never read those slots again.
    pub unsafe fn grow(&self, front: u64, back: u64) -> RingBuf<T> {
        let bigger = RingBuf::new(self.capacity() * 2);
        let mut i = front;
        while i != back {
            let slot = &self.slots[(i & self.mask) as usize];
            bigger.write(i, (*slot.get()).as_ptr().read());
            i = i.wrapping_add(1);
        }
        bigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let buf = RingBuf::new(4);
        unsafe {
            buf.write(0, 10u64);
            buf.write(1, 11);
            assert_eq!(buf.read(0), 10);
            assert_eq!(buf.read(1), 11);
        }
    }

    #[test]
    fn test_masking_wraps() {
        let buf = RingBuf::new(4);
        unsafe {
            // Cursor 5 lands on slot 1.
            buf.write(5, 99u32);
            assert_eq!(buf.read(5), 99);
        }
    }

    #[test]
    fn test_grow_preserves_window() {
        let buf = RingBuf::new(4);
        unsafe {
            for i in 6..10u64 {
                buf.write(i, i * 2);
            }
            let bigger = buf.grow(6, 10);
            assert_eq!(bigger.capacity(), 8);
            for i in 6..10u64 {
                assert_eq!(bigger.read(i), i * 2);
            }
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        let _ = RingBuf::<u8>::new(6);
    }
}
