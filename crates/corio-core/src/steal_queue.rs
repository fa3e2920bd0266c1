//! Work-stealing deque.
//!
//! One owner thread pushes and pops at the back (LIFO, hot cache); any
//! number of thieves steal from the front (FIFO, oldest first). Cursors are
//! monotonically increasing `u64`s, so occupancy is `back - front` and the
//! buffer index is the cursor masked by the power-of-two capacity.
//!
//! Growth replaces the backing `RingBuf` and retires the previous one
//! instead of freeing it: a thief that loaded the old buffer pointer may
//! still be reading a slot from it. The retired buffer is freed on the
//! *next* grow, by which point any such steal has long resolved its CAS.

use core::mem;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::ring_buf::RingBuf;

const DEFAULT_CAPACITY: usize = 64;

pub struct StealQueue<T> {
    front: AtomicU64,
    back: AtomicU64,
    data: AtomicPtr<RingBuf<T>>,
    retired: AtomicPtr<RingBuf<T>>,
}

unsafe impl<T: Send> Send for StealQueue<T> {}
unsafe impl<T: Send> Sync for StealQueue<T> {}

impl<T> Default for StealQueue<T> {
    fn default() -> Self {
        StealQueue::new(DEFAULT_CAPACITY)
    }
}

impl<T> StealQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let buf = Box::into_raw(Box::new(RingBuf::new(capacity)));
        StealQueue {
            front: AtomicU64::new(0),
            back: AtomicU64::new(0),
            data: AtomicPtr::new(buf),
            retired: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        let back = self.back.load(Ordering::Acquire);
        let front = self.front.load(Ordering::Acquire);
        back.saturating_sub(front) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push at the back. Owner thread only.
    pub fn push(&self, item: T) {
        let back = self.back.load(Ordering::Relaxed);
        let front = self.front.load(Ordering::Acquire);
        let mut data = unsafe { &*self.data.load(Ordering::Relaxed) };

        if back.wrapping_sub(front) >= data.capacity() as u64 {
            data = self.grow(data, front, back);
        }

        unsafe { data.write(back, item) };
        self.back.store(back.wrapping_add(1), Ordering::Release);
    }

    /// Pop at the back (most recently pushed). Owner thread only.
    pub fn pop(&self) -> Option<T> {
        let b = self.back.load(Ordering::Relaxed);
        let f = self.front.load(Ordering::Relaxed);
        if f >= b {
            return None;
        }

        // Reserve the back slot, then re-read front to detect thieves.
        let back = b - 1;
        self.back.store(back, Ordering::SeqCst);
        let front = self.front.load(Ordering::SeqCst);

        if front > back {
            // A thief drained the queue between the two loads.
            self.back.store(b, Ordering::Relaxed);
            return None;
        }

        let data = self.data.load(Ordering::Relaxed);
        let item = unsafe { (*data).read(back) };

        if front == back {
            // Last element: race the thieves for it.
            let won = self
                .front
                .compare_exchange(front, front + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.back.store(b, Ordering::Relaxed);
            if !won {
                // The thief's copy is the live one.
                mem::forget(item);
                return None;
            }
        }
        Some(item)
    }

    /// Steal the oldest element. Any thread.
    pub fn steal(&self) -> Option<T> {
        let front = self.front.load(Ordering::SeqCst);
        let back = self.back.load(Ordering::SeqCst);
        if front >= back {
            return None;
        }

        let data = self.data.load(Ordering::Acquire);
        let item = unsafe { (*data).read(front) };

        if self
            .front
            .compare_exchange(front, front + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(item)
        } else {
            // Lost to the owner or another thief; our copy is dead.
            mem::forget(item);
            None
        }
    }

    /// Owner-side grow: copy the live window into a buffer twice the size,
    /// retire the current buffer, free the previously retired one.
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

impl<T> Drop for StealQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        let data = self.data.load(Ordering::Relaxed);
        unsafe { drop(Box::from_raw(data)) };
        let retired = self.retired.load(Ordering::Relaxed);
        if !retired.is_null() {
            unsafe { drop(Box::from_raw(retired)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_owner_lifo() {
        let q = StealQueue::new(8);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_thief_fifo() {
        let q = StealQueue::new(8);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.steal(), Some(1));
        assert_eq!(q.steal(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.steal(), None);
    }

    #[test]
    fn test_grows_past_capacity() {
        let q = StealQueue::new(4);
        for i in 0..64 {
            q.push(i);
        }
        assert_eq!(q.len(), 64);
        for i in (0..64).rev() {
            assert_eq!(q.pop(), Some(i));
        }
    }

    #[test]
    fn test_concurrent_exactly_once() {
        const ITEMS: usize = 20_000;
        const THIEVES: usize = 4;

        let q = Arc::new(StealQueue::new(64));
        let taken = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..THIEVES {
            let q = Arc::clone(&q);
            let taken = Arc::clone(&taken);
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                while taken.load(Ordering::Relaxed) < ITEMS {
                    if let Some(v) = q.steal() {
                        taken.fetch_add(1, Ordering::Relaxed);
                        got.push(v);
                    } else {
                        std::hint::spin_loop();
                    }
                }
                got
            }));
        }

        // Owner pushes everything, popping some of its own along the way.
        let mut owner_got = Vec::new();
        for i in 0..ITEMS {
            q.push(i);
            if i % 3 == 0 {
                if let Some(v) = q.pop() {
                    taken.fetch_add(1, Ordering::Relaxed);
                    owner_got.push(v);
                }
            }
        }
        while taken.load(Ordering::Relaxed) < ITEMS {
            if let Some(v) = q.pop() {
                taken.fetch_add(1, Ordering::Relaxed);
                owner_got.push(v);
            }
        }

        let mut seen: HashSet<usize> = owner_got.into_iter().collect();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "item {} delivered twice", v);
            }
        }
        assert_eq!(seen.len(), ITEMS);
    }

    #[test]
    fn test_steal_during_growth() {
        let q = Arc::new(StealQueue::new(4));
        let q2 = Arc::clone(&q);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);

        let thief = thread::spawn(move || {
            let mut count = 0usize;
            while !stop2.load(Ordering::Acquire) {
                if q2.steal().is_some() {
                    count += 1;
                }
            }
            while q2.steal().is_some() {
                count += 1;
            }
            count
        });

        const ITEMS: usize = 50_000;
        for i in 0..ITEMS {
            q.push(i);
        }
        stop.store(true, Ordering::Release);
        let stolen = thief.join().unwrap();

        let mut popped = 0usize;
        while q.pop().is_some() {
            popped += 1;
        }
        assert_eq!(stolen + popped, ITEMS);
    }

    #[test]
    fn test_drop_releases_items() {
        let q = StealQueue::new(4);
        for _ in 0..16 {
            q.push(Arc::new(7u32));
        }
        let probe = Arc::new(7u32);
        q.push(Arc::clone(&probe));
        drop(q);
        assert_eq!(Arc::strong_count(&probe), 1);
    }
}
