//! Lock-free pooled allocator.
//!
//! Objects are carved out of fixed-size blocks and linked through a free
//! list keyed by slot *index*, not address. The list head packs
//! `(generation, index)` into one `AtomicU64` and bumps the generation on
//! every pop and push, which defuses the classic ABA reuse race without a
//! double-wide CAS. Blocks are never freed individually; the pool grows by
//! appending a block to a fixed table and splicing its slots onto the free
//! list, so any thread can free an object allocated by any other thread.

use core::cell::UnsafeCell;
use core::mem::{offset_of, MaybeUninit};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::kerror;

const NIL: u32 = u32::MAX;

/// Upper bound on growth: with the default block size this allows 64 * 1024
/// objects live at once per pool.
const MAX_BLOCKS: usize = 64;

const DEFAULT_BLOCK_SIZE: usize = 1024;

#[repr(C)]
struct Slot<T> {
    /// Free-list link, meaningful only while the slot is free. Atomic
    /// because a racing allocator may read it after the slot was already
    /// re-allocated; the tagged head CAS rejects the stale value.
    next: AtomicU32,
    /// Global slot index, fixed at block construction.
    index: u32,
    data: UnsafeCell<MaybeUninit<T>>,
}

pub struct PoolAlloc<T> {
    /// Packed `(generation << 32) | index` free-list head.
    head: AtomicU64,
    blocks: [AtomicPtr<Slot<T>>; MAX_BLOCKS],
    block_count: AtomicU32,
    growing: AtomicBool,
    block_size: u32,
    shift: u32,
    mask: u32,
}

unsafe impl<T: Send> Send for PoolAlloc<T> {}
unsafe impl<T: Send> Sync for PoolAlloc<T> {}

#[inline]
fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

impl<T> Default for PoolAlloc<T> {
    fn default() -> Self {
        PoolAlloc::new(DEFAULT_BLOCK_SIZE)
    }
}

impl<T> PoolAlloc<T> {
    /// Create a pool with the given block size (rounded up to a power of
    /// two). The first block is allocated eagerly.
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.next_power_of_two().max(2) as u32;
        let pool = PoolAlloc {
            head: AtomicU64::new(pack(0, NIL)),
            blocks: [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_BLOCKS],
            block_count: AtomicU32::new(0),
            growing: AtomicBool::new(false),
            block_size,
            shift: block_size.trailing_zeros(),
            mask: block_size - 1,
        };
        pool.grow();
        pool
    }

    #[inline]
    fn slot(&self, index: u32) -> *mut Slot<T> {
        let block = (index >> self.shift) as usize;
        let offset = (index & self.mask) as usize;
        let base = self.blocks[block].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe { base.add(offset) }
    }

    /// Allocate a slot and move `value` into it.
    pub fn alloc(&self, value: T) -> NonNull<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (generation, index) = unpack(head);
            if index == NIL {
                self.grow();
                continue;
            }
            let slot = self.slot(index);
            let next = unsafe { (*slot).next.load(Ordering::Relaxed) };
            let replacement = pack(generation.wrapping_add(1), next);
            if self
                .head
                .compare_exchange_weak(head, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The slot is exclusively ours now.
                unsafe {
                    let data = (*slot).data.get();
                    (*data).write(value);
                    return NonNull::new_unchecked((*data).as_mut_ptr());
                }
            }
        }
    }

    /// Drop the object and return its slot to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this pool and must not be used (or
    /// freed) again afterwards.
    pub unsafe fn dealloc(&self, ptr: NonNull<T>) {
        core::ptr::drop_in_place(ptr.as_ptr());
        let slot = Self::slot_of(ptr);
        let index = (*slot).index;
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let (generation, old_index) = unpack(head);
            (*slot).next.store(old_index, Ordering::Relaxed);
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

    /// Global slot index of a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this pool and still be live.
    pub unsafe fn index_of(&self, ptr: NonNull<T>) -> u32 {
        (*Self::slot_of(ptr)).index
    }

    /// Pointer to the object in slot `index`.
    ///
    /// # Safety
    ///
    /// `index` must have come from `index_of` on this pool. Blocks are
    /// never freed before the pool itself, so the pointer stays valid even
    /// after the slot is recycled; whether it points at a live object is
    /// the caller's protocol to enforce.
    pub unsafe fn get(&self, index: u32) -> *mut T {
        (*self.slot(index)).data.get() as *mut T
    }

    #[inline]
    unsafe fn slot_of(ptr: NonNull<T>) -> *mut Slot<T> {
        let data_offset = offset_of!(Slot<T>, data);
        (ptr.as_ptr() as *mut u8).sub(data_offset) as *mut Slot<T>
    }

    /// Append one block and splice its slots onto the free list. Only one
    /// thread grows at a time; losers spin briefly and re-read the head.
    fn grow(&self) {
        if self.growing.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
            return;
        }

        let count = self.block_count.load(Ordering::Relaxed) as usize;
        if count >= MAX_BLOCKS {
            self.growing.store(false, Ordering::Release);
            kerror!("pool: block table exhausted ({} blocks)", MAX_BLOCKS);
            panic!("pool allocator exhausted");
        }

        let block_size = self.block_size as usize;
        let base_index = (count * block_size) as u32;
        let block: Box<[Slot<T>]> = (0..block_size)
            .map(|i| Slot {
                next: AtomicU32::new(if i + 1 < block_size {
                    base_index + i as u32 + 1
                } else {
                    NIL
                }),
                index: base_index + i as u32,
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        let block = Box::into_raw(block) as *mut Slot<T>;

        self.blocks[count].store(block, Ordering::Release);
        self.block_count.store(count as u32 + 1, Ordering::Release);

        // Splice [base_index, base_index + block_size) onto the free list.
        let last = unsafe { &(*block.add(block_size - 1)).next };
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let (generation, old_index) = unpack(head);
            last.store(old_index, Ordering::Relaxed);
            let replacement = pack(generation.wrapping_add(1), base_index);
            if self
                .head
                .compare_exchange_weak(head, replacement, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        self.growing.store(false, Ordering::Release);
    }
}

impl<T> Drop for PoolAlloc<T> {
    fn drop(&mut self) {
        // All allocations must have been freed by now; slots hold no live
        // objects, so only the block storage is released.
        let count = self.block_count.load(Ordering::Relaxed) as usize;
        let block_size = self.block_size as usize;
        for i in 0..count {
            let ptr = self.blocks[i].load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                        ptr, block_size,
                    )));
                }
            }
        }
    }
}
