//! Unbounded MPMC overflow stack.
//!
//! A Treiber stack whose nodes come from a `PoolAlloc` and whose head packs
//! `(generation, index)` exactly like the pool's free list, so concurrent
//! pops never confuse a recycled node for the one they loaded. The
//! scheduler parks continuations here when the caller is not a worker
//! thread of the target scheduler.

use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::pool::PoolAlloc;

const NIL: u32 = u32::MAX;

struct Node<T> {
    /// Stack link, a pool slot index.
    next: AtomicU32,
    value: ManuallyDrop<T>,
}

pub struct OverflowStack<T> {
    head: AtomicU64,
    pool: PoolAlloc<Node<T>>,
}

#[inline]
fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

impl<T> Default for OverflowStack<T> {
    fn default() -> Self {
        OverflowStack::new(256)
    }
}

impl<T> OverflowStack<T> {
    pub fn new(block_size: usize) -> Self {
        OverflowStack {
            head: AtomicU64::new(pack(0, NIL)),
            pool: PoolAlloc::new(block_size),
        }
    }

    pub fn is_empty(&self) -> bool {
        let (_, index) = unpack(self.head.load(Ordering::Acquire));
        index == NIL
    }

    pub fn push(&self, value: T) {
        let node = self.pool.alloc(Node {
            next: AtomicU32::new(NIL),
            value: ManuallyDrop::new(value),
        });
        let index = unsafe { self.pool.index_of(node) };
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let (generation, old_index) = unpack(head);
            unsafe { node.as_ref().next.store(old_index, Ordering::Relaxed) };
            let replacement = pack(generation.wrapping_add(1), index);
            if self
                .head
                .compare_exchange_weak(head, replacement, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (generation, index) = unpack(head);
            if index == NIL {
                return None;
            }
            let node = unsafe { self.pool.get(index) };
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            let replacement = pack(generation.wrapping_add(1), next);
            if self
                .head
                .compare_exchange_weak(head, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The node is ours; lift the value out before the slot is
                // recycled. ManuallyDrop keeps dealloc from double-dropping.
                unsafe {
                    let value = ManuallyDrop::take(&mut (*node).value);
                    self.pool.dealloc(NonNull::new_unchecked(node));
                    return Some(value);
                }
            }
        }
    }
}

impl<T> Drop for OverflowStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
