//! Growable FIFO handoff queue.
//!
//! One producer (the thread that owns the queue) enqueues at the back; one
//! consumer at a time (whichever thread currently holds the submit pass)
//! dequeues at the front. Producer and consumer run concurrently; consumer
//! exclusivity is enforced by the caller. Same monotonic-cursor and
//! retired-buffer discipline as `StealQueue`.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::ring_buf::RingBuf;

const DEFAULT_CAPACITY: usize = 64;

pub struct WorkQueue<T> {
    front: AtomicU64,
    back: AtomicU64,
    data: AtomicPtr<RingBuf<T>>,
    retired: AtomicPtr<RingBuf<T>>,
}

unsafe impl<T: Send> Send for WorkQueue<T> {}
unsafe impl<T: Send> Sync for WorkQueue<T> {}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        WorkQueue::new(DEFAULT_CAPACITY)
    }
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let buf = Box::into_raw(Box::new(RingBuf::new(capacity)));
        WorkQueue {
            front: AtomicU64::new(0),
            back: AtomicU64::new(0),
            data: AtomicPtr::new(buf),
            retired: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let back = self.back.load(Ordering::Acquire);
        let front = self.front.load(Ordering::Acquire);
        front >= back
    }

    /// Enqueue at the back. Owning thread only.
    pub fn enqueue(&self, item: T) {
        let back = self.back.load(Ordering::Relaxed);
        let front = self.front.load(Ordering::Acquire);
        let mut data = unsafe { &*self.data.load(Ordering::Relaxed) };

        if back.wrapping_sub(front) >= data.capacity() as u64 {
            data = self.grow(data, front, back);
        }

        unsafe { data.write(back, item) };
        self.back.store(back.wrapping_add(1), Ordering::Release);
    }

    /// Dequeue at the front. Single consumer at a time.
    pub fn dequeue(&self) -> Option<T> {
        let front = self.front.load(Ordering::Relaxed);
        let back = self.back.load(Ordering::Acquire);
        if front >= back {
            return None;
        }
        let data = self.data.load(Ordering::Acquire);
        let item = unsafe { (*data).read(front) };
        self.front.store(front + 1, Ordering::Release);
        Some(item)
    }

    fn grow(&self, data: &RingBuf<T>, front: u64, back: u64) -> &RingBuf<T> {
        let bigger = Box::into_raw(Box::new(unsafe { data.grow(front, back) }));

        let stale = self.retired.load(Ordering::Relaxed);
        if !stale.is_null() {
            unsafe { drop(Box::from_raw(stale)) };
        }
        self.retired
            .store(self.data.load(Ordering::Relaxed), Ordering::Relaxed);
        self.data.store(bigger, Ordering::Release);

        unsafe { &*bigger }
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
        unsafe { drop(Box::from_raw(self.data.load(Ordering::Relaxed))) };
        let retired = self.retired.load(Ordering::Relaxed);
        if !retired.is_null() {
            unsafe { drop(Box::from_raw(retired)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = WorkQueue::new(4);
        for i in 0..3 {
            q.enqueue(i);
        }
        assert_eq!(q.dequeue(), Some(0));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_grow_keeps_order() {
        let q = WorkQueue::new(4);
        for i in 0..40 {
            q.enqueue(i);
        }
        for i in 0..40 {
            assert_eq!(q.dequeue(), Some(i));
        }
    }

    #[test]
    fn test_producer_consumer() {
        const ITEMS: u64 = 100_000;
        let q = Arc::new(WorkQueue::new(8));
        let q2 = Arc::clone(&q);

        let consumer = thread::spawn(move || {
            let mut expect = 0u64;
            while expect < ITEMS {
                if let Some(v) = q2.dequeue() {
                    assert_eq!(v, expect);
                    expect += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        for i in 0..ITEMS {
            q.enqueue(i);
        }
        consumer.join().unwrap();
        assert!(q.is_empty());
    }
}
