// Unbounded lock-free FIFO over a linked list of fixed-capacity slot blocks.
//
// Every slot carries a tag word driven by 32-bit CAS; a transient tag
// (Allocating, Removing, Extending, Destroying) is the sole ownership
// handshake for the payload next to it. head and tail only move forward
// through a block; the terminal slot of each block links to the next one. A
// fully-consumed block is handed back to the allocator, or parked as the
// single cached spare, under a short exclusive section of the reader/writer
// epoch counter. Block lifetime is the only thing that counter guards.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::mem::MaybeUninit;
use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::thread;

use crate::MpmcContainer;

/// Slots per block. The terminal slot of every block is reserved for the
/// end-of-list / block-pointer link, so a block stores `SLOTS_PER_BLOCK - 1`
/// values.
pub const SLOTS_PER_BLOCK: usize = 4096;

// Slot tags. TAG_FREE must be zero: freshly zero-allocated blocks come up
// all-free with a single allocation.
const TAG_FREE: u32 = 0;
const TAG_ALLOCATING: u32 = 1;
const TAG_ALLOCATED: u32 = 2;
const TAG_REMOVING: u32 = 3;
const TAG_REMOVED: u32 = 4;
const TAG_END_OF_LIST: u32 = 5;
const TAG_EXTENDING: u32 = 6;
const TAG_BLOCK_POINTER: u32 = 7;
const TAG_DESTROYING: u32 = 8;

#[repr(C)]
struct Slot<T> {
    tag: AtomicU32,
    // First slot of the successor block; meaningful only under
    // TAG_BLOCK_POINTER (and during the Extending window that installs it).
    link: AtomicPtr<Slot<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct BlockQueue<T: Send> {
    head: AtomicPtr<Slot<T>>,
    tail: AtomicPtr<Slot<T>>,
    // At most one pre-freed block retained for reuse.
    cached_block: AtomicPtr<Slot<T>>,
    // Epoch counter: 0 quiescent, > 0 readers inside, -1 one exclusive writer.
    remove_count: AtomicI32,
    released: AtomicUsize,
}

unsafe impl<T: Send> Send for BlockQueue<T> {}
unsafe impl<T: Send> Sync for BlockQueue<T> {}

/// The only failure mode of [`BlockQueue::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("dequeue from an empty queue")]
pub struct EmptyQueue;

impl<T: Send> BlockQueue<T> {
    pub fn new() -> Self {
        let block = Self::new_block();
        Self {
            head: AtomicPtr::new(block),
            tail: AtomicPtr::new(block),
            cached_block: AtomicPtr::new(null_mut()),
            remove_count: AtomicI32::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Number of drained blocks handed back to the allocator or the spare
    /// cache since construction.
    pub fn released_blocks(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// True while a drained block is parked for reuse.
    pub fn has_cached_block(&self) -> bool {
        !self.cached_block.load(Ordering::Acquire).is_null()
    }

    fn block_layout() -> Layout {
        Layout::array::<Slot<T>>(SLOTS_PER_BLOCK).unwrap()
    }

    // Fresh all-free block with its terminal slot marked end-of-list.
    fn new_block() -> *mut Slot<T> {
        let layout = Self::block_layout();
        let block = unsafe { alloc_zeroed(layout) } as *mut Slot<T>;
        if block.is_null() {
            handle_alloc_error(layout);
        }
        unsafe {
            (*block.add(SLOTS_PER_BLOCK - 1))
                .tag
                .store(TAG_END_OF_LIST, Ordering::Release);
        }
        block
    }

    // Take the cached spare if there is one, otherwise allocate. The spare
    // left reclamation with terminal tags everywhere, so it is re-zeroed.
    fn alloc_block(&self) -> *mut Slot<T> {
        let cached = self.cached_block.swap(null_mut(), Ordering::AcqRel);
        if cached.is_null() {
            return Self::new_block();
        }
        unsafe {
            ptr::write_bytes(cached as *mut u8, 0, Self::block_layout().size());
            (*cached.add(SLOTS_PER_BLOCK - 1))
                .tag
                .store(TAG_END_OF_LIST, Ordering::Release);
        }
        cached
    }

    // Hand a fully-consumed block back: park it as the single cached spare,
    // or free it when the cache is occupied (or when forced). `last_slot` is
    // the block's terminal slot. Callers hold the writer section, or
    // exclusive access during drop.
    fn release_block(&self, last_slot: *mut Slot<T>, force: bool) {
        let block = unsafe { last_slot.sub(SLOTS_PER_BLOCK - 1) };
        self.released.fetch_add(1, Ordering::Relaxed);
        if !force
            && self
                .cached_block
                .compare_exchange(null_mut(), block, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return;
        }
        unsafe { dealloc(block as *mut u8, Self::block_layout()) };
    }

    // Shared section of the epoch counter: any number of enqueuers and
    // dequeuers at once, none while a writer holds -1.
    fn enter_reader(&self) {
        loop {
            let count = self.remove_count.load(Ordering::Acquire);
            if count >= 0 {
                if self
                    .remove_count
                    .compare_exchange_weak(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else {
                thread::yield_now();
            }
        }
    }

    #[inline]
    fn leave_reader(&self) {
        self.remove_count.fetch_sub(1, Ordering::AcqRel);
    }

    // Exclusive section; taken only around block release.
    fn enter_writer(&self) {
        while self
            .remove_count
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            thread::yield_now();
        }
    }

    #[inline]
    fn leave_writer(&self) {
        self.remove_count.store(0, Ordering::Release);
    }

    /// Append `item`. Never fails; growing the queue aborts the process only
    /// if the allocator itself gives up.
    pub fn enqueue(&self, item: T) {
        self.enter_reader();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let slot = unsafe { &*tail };
            match slot.tag.load(Ordering::Acquire) {
                TAG_FREE => {
                    if slot
                        .tag
                        .compare_exchange(
                            TAG_FREE,
                            TAG_ALLOCATING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        // The transient tag holds the slot; later enqueuers
                        // move on as soon as the new tail is visible. The
                        // value must be in place before Allocated publishes
                        // it to dequeuers.
                        self.tail.store(unsafe { tail.add(1) }, Ordering::Release);
                        unsafe { (*slot.value.get()).write(item) };
                        let published = slot.tag.compare_exchange(
                            TAG_ALLOCATING,
                            TAG_ALLOCATED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        debug_assert!(published.is_ok());
                        break;
                    }
                }
                TAG_END_OF_LIST => {
                    if slot
                        .tag
                        .compare_exchange(
                            TAG_END_OF_LIST,
                            TAG_EXTENDING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        // Grow by one block. The value goes into the new
                        // block's first slot; publishing tail at slot 1
                        // reopens the queue for other enqueuers before the
                        // old block's link is wired up.
                        let block = self.alloc_block();
                        let first = unsafe { &*block };
                        unsafe { (*first.value.get()).write(item) };
                        first.tag.store(TAG_ALLOCATED, Ordering::Release);
                        self.tail.store(unsafe { block.add(1) }, Ordering::Release);
                        slot.link.store(block, Ordering::Release);
                        let linked = slot.tag.compare_exchange(
                            TAG_EXTENDING,
                            TAG_BLOCK_POINTER,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        debug_assert!(linked.is_ok());
                        break;
                    }
                }
                TAG_EXTENDING => thread::yield_now(),
                _ => hint::spin_loop(),
            }
        }
        self.leave_reader();
    }

    /// Take the oldest value, or None when the queue is empty.
    pub fn try_dequeue(&self) -> Option<T> {
        self.enter_reader();
        let taken = loop {
            let head = self.head.load(Ordering::Acquire);
            let slot = unsafe { &*head };
            match slot.tag.load(Ordering::Acquire) {
                TAG_FREE | TAG_END_OF_LIST => break None,
                TAG_ALLOCATED => {
                    if slot
                        .tag
                        .compare_exchange(
                            TAG_ALLOCATED,
                            TAG_REMOVING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.head.store(unsafe { head.add(1) }, Ordering::Release);
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        let retired = slot.tag.compare_exchange(
                            TAG_REMOVING,
                            TAG_REMOVED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        debug_assert!(retired.is_ok());
                        break Some(value);
                    }
                }
                TAG_BLOCK_POINTER => {
                    if slot
                        .tag
                        .compare_exchange(
                            TAG_BLOCK_POINTER,
                            TAG_DESTROYING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return self.cross_block(head, slot);
                    }
                }
                _ => thread::yield_now(),
            }
        };
        self.leave_reader();
        taken
    }

    // Step over a block link. The Destroying tag on `slot` stalls every other
    // dequeuer until the new head is published, so the successor's first slot
    // can be taken without its own Removing round-trip. The drained block is
    // released under the writer section. When the successor's first slot has
    // not been written yet, the call still steps into the new block and
    // releases the old one, but produces no value.
    fn cross_block(&self, head: *mut Slot<T>, slot: &Slot<T>) -> Option<T> {
        let next = slot.link.load(Ordering::Acquire);
        let first = unsafe { &*next };
        let taken = if first.tag.load(Ordering::Acquire) == TAG_ALLOCATED {
            self.head.store(unsafe { next.add(1) }, Ordering::Release);
            let value = unsafe { (*first.value.get()).assume_init_read() };
            let retired = first.tag.compare_exchange(
                TAG_ALLOCATED,
                TAG_REMOVED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            debug_assert!(retired.is_ok());
            Some(value)
        } else {
            self.head.store(next, Ordering::Release);
            None
        };
        // Readers spinning on the Destroying tag re-read head, find it in the
        // new block and drain out, so the writer section is reachable.
        self.leave_reader();
        self.enter_writer();
        self.release_block(head, false);
        self.leave_writer();
        taken
    }

    /// Take the oldest value, reporting [`EmptyQueue`] when there is none.
    pub fn dequeue(&self) -> Result<T, EmptyQueue> {
        self.try_dequeue().ok_or(EmptyQueue)
    }

    /// Snapshot; may be stale under contention.
    pub fn is_empty(&self) -> bool {
        self.enter_reader();
        let head = self.head.load(Ordering::Acquire);
        let tag = unsafe { (*head).tag.load(Ordering::Acquire) };
        self.leave_reader();
        matches!(tag, TAG_FREE | TAG_END_OF_LIST)
    }
}

impl<T: Send> Default for BlockQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> MpmcContainer<T> for BlockQueue<T> {
    type PushError = ();
    type PopError = EmptyQueue;

    fn push(&self, item: T) -> Result<(), Self::PushError> {
        self.enqueue(item);
        Ok(())
    }

    fn pop(&self) -> Result<T, Self::PopError> {
        self.dequeue()
    }

    fn available(&self) -> bool {
        true
    }

    fn empty(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Send> Drop for BlockQueue<T> {
    fn drop(&mut self) {
        // Walk from head, dropping whatever was never dequeued; every block
        // boundary frees the block just walked.
        let mut cursor = *self.head.get_mut();
        loop {
            let slot = unsafe { &mut *cursor };
            match *slot.tag.get_mut() {
                TAG_ALLOCATED => {
                    unsafe { (*slot.value.get()).assume_init_drop() };
                    cursor = unsafe { cursor.add(1) };
                }
                TAG_BLOCK_POINTER => {
                    let next = *slot.link.get_mut();
                    self.release_block(cursor, true);
                    cursor = next;
                }
                TAG_END_OF_LIST => {
                    self.release_block(cursor, true);
                    break;
                }
                _ => cursor = unsafe { cursor.add(1) },
            }
        }
        let cached = *self.cached_block.get_mut();
        if !cached.is_null() {
            unsafe { dealloc(cached as *mut u8, Self::block_layout()) };
        }
    }
}

impl<T: Send> fmt::Debug for BlockQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockQueue")
            .field("remove_count", &self.remove_count.load(Ordering::Relaxed))
            .field("released_blocks", &self.released.load(Ordering::Relaxed))
            .field("has_cached_block", &self.has_cached_block())
            .finish()
    }
}
