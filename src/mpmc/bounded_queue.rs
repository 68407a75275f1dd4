// Lock-free bounded FIFO over two referenced-pointer rings.
//
// The payload cells live in one flat buffer; the rings circulate cell
// indices. public_ring carries filled cells in FIFO order, recycle_ring
// carries the free ones, so enqueue is "take a free cell, fill it, link it
// public" and dequeue is the mirror image. Each ring has num_elements + 1
// slots; the spare slot keeps a full ring distinguishable from an empty one.

use crate::mpmc::refptr::{data_of, pack, spin_count, thread_token, RefLink, NIL};
use crate::MpmcContainer;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

// One ring: slots of packed {cell, ref} words plus the two micro-locked
// cursors. Cursor data is a slot position; slot data is a payload cell index.
struct RingBuffer {
    slots: Box<[AtomicU64]>,
    first_in: RefLink,
    last_in: RefLink,
}

impl RingBuffer {
    #[inline]
    fn advance(&self, position: u32) -> u32 {
        if position as usize + 1 == self.slots.len() {
            0
        } else {
            position + 1
        }
    }
}

pub struct BoundedQueue<T: Send> {
    cells: Box<[UnsafeCell<MaybeUninit<T>>]>,
    public_ring: RingBuffer,
    recycle_ring: RingBuffer,
    spin: u32,
}

unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

#[derive(Debug, PartialEq, Eq)]
pub struct EnqueueError<T>(pub T);

#[derive(Debug, PartialEq, Eq)]
pub struct DequeueError;

impl<T: Send> BoundedQueue<T> {
    pub fn with_capacity(num_elements: usize) -> Self {
        assert!(num_elements > 0, "BoundedQueue needs at least one element");
        assert!(
            num_elements + 1 < NIL as usize,
            "BoundedQueue capacity exceeds the index range"
        );

        let slot_count = num_elements + 1;
        let cells = (0..slot_count)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        // The public ring starts empty; the recycle ring starts seeded with
        // one free cell per slot, its write cursor parked on the separator.
        let public_ring = RingBuffer {
            slots: (0..slot_count).map(|_| AtomicU64::new(pack(0, 0))).collect(),
            first_in: RefLink::new(0),
            last_in: RefLink::new(0),
        };
        let recycle_ring = RingBuffer {
            slots: (0..slot_count)
                .map(|i| AtomicU64::new(pack(i as u32, 0)))
                .collect(),
            first_in: RefLink::new(0),
            last_in: RefLink::new(num_elements as u32),
        };

        Self {
            cells,
            public_ring,
            recycle_ring,
            spin: spin_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len() - 1
    }

    // Snapshots; may be stale under contention.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.public_ring.first_in.data() == self.public_ring.last_in.data()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let last = self.public_ring.last_in.data();
        self.public_ring.advance(last) == self.public_ring.first_in.data()
            || self.recycle_ring.first_in.data() == self.recycle_ring.last_in.data()
    }

    // Append `cell` at the ring's write cursor. The cursor micro-lock makes
    // this writer exclusive for the slot; the slot itself is busy-marked
    // while the cell index goes in, and the install CAS clears the mark in
    // the same step, so a cursor snapshot never yields a half-written slot.
    fn insert_link(&self, cell: u32, ring: &RingBuffer) {
        let token = thread_token();
        loop {
            let position = ring.last_in.acquire(token, self.spin);
            let slot = &ring.slots[position as usize];
            let stale = data_of(slot.load(Ordering::Acquire));
            if slot
                .compare_exchange(
                    pack(stale, 0),
                    pack(stale, token),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            if slot
                .compare_exchange(
                    pack(stale, token),
                    pack(cell, 0),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            // advance the cursor, releasing the micro-lock in the same CAS
            if ring.last_in.try_update(position, ring.advance(position), token) {
                return;
            }
        }
    }

    // Detach the cell at the ring's read cursor, or None when the cursors
    // meet (ring empty).
    fn remove_link(&self, ring: &RingBuffer) -> Option<u32> {
        let token = thread_token();
        loop {
            let position = ring.first_in.acquire(token, self.spin);
            if position == ring.last_in.data() {
                if ring.first_in.try_release(position, token) {
                    return None;
                }
                continue;
            }
            let cell = data_of(ring.slots[position as usize].load(Ordering::Acquire));
            if ring.first_in.try_update(position, ring.advance(position), token) {
                return Some(cell);
            }
        }
    }

    /// Move `item` into a free cell and publish it on the public ring.
    /// Returns the item back when the queue is full.
    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        let Some(cell) = self.remove_link(&self.recycle_ring) else {
            return Err(EnqueueError(item));
        };
        unsafe { (*self.cells[cell as usize].get()).write(item) };
        self.insert_link(cell, &self.public_ring);
        Ok(())
    }

    /// Take the oldest enqueued value.
    pub fn dequeue(&self) -> Result<T, DequeueError> {
        let Some(cell) = self.remove_link(&self.public_ring) else {
            return Err(DequeueError);
        };
        let value = unsafe { (*self.cells[cell as usize].get()).assume_init_read() };
        self.insert_link(cell, &self.recycle_ring);
        Ok(value)
    }

    /// Drain every public cell back into the recycle ring, dropping the
    /// payloads. Exclusive access; concurrent operations must have quiesced.
    pub fn clear(&mut self) {
        while let Some(cell) = self.remove_link(&self.public_ring) {
            unsafe { (*self.cells[cell as usize].get()).assume_init_drop() };
            self.insert_link(cell, &self.recycle_ring);
        }
    }
}

impl<T: Send + 'static> MpmcContainer<T> for BoundedQueue<T> {
    type PushError = EnqueueError<T>;
    type PopError = DequeueError;

    fn push(&self, item: T) -> Result<(), Self::PushError> {
        self.enqueue(item)
    }

    fn pop(&self) -> Result<T, Self::PopError> {
        self.dequeue()
    }

    fn available(&self) -> bool {
        !self.is_full()
    }

    fn empty(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Send> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        if !mem::needs_drop::<T>() {
            return;
        }
        let mut position = self.public_ring.first_in.data_mut();
        let last = self.public_ring.last_in.data_mut();
        while position != last {
            let cell = data_of(*self.public_ring.slots[position as usize].get_mut());
            unsafe { (*self.cells[cell as usize].get()).assume_init_drop() };
            position = self.public_ring.advance(position);
        }
    }
}

impl<T: Send> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("is_empty", &self.is_empty())
            .field("is_full", &self.is_full())
            .finish()
    }
}
