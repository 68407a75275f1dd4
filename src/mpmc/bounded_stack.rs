// Lock-free bounded LIFO over a preallocated node arena.
//
// Two intrusive chains share the arena: public_chain holds filled nodes in
// LIFO order, recycle_chain holds the free ones, so every node is in exactly
// one chain whenever the stack is quiescent. A pop takes the chain's
// micro-lock and swings the head to its successor in one release-CAS; a push
// slips its node in with a data-only CAS that deliberately ignores the lock
// (the holder's release-CAS sees the changed head and retries).

use crate::mpmc::refptr::{data_of, spin_count, thread_token, RefLink, NIL};
use crate::MpmcContainer;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

struct Node<T> {
   next: AtomicU32,
   value: UnsafeCell<MaybeUninit<T>>,
}

pub struct BoundedStack<T: Send> {
   nodes: Box<[Node<T>]>,
   public_chain: RefLink,
   recycle_chain: RefLink,
   spin: u32,
}

unsafe impl<T: Send> Send for BoundedStack<T> {}
unsafe impl<T: Send> Sync for BoundedStack<T> {}

#[derive(Debug, PartialEq, Eq)]
pub struct PushError<T>(pub T);

#[derive(Debug, PartialEq, Eq)]
pub struct PopError;

impl<T: Send> BoundedStack<T> {
   pub fn with_capacity(num_elements: usize) -> Self {
      assert!(num_elements > 0, "BoundedStack needs at least one element");
      assert!(
         num_elements < NIL as usize,
         "BoundedStack capacity exceeds the index range"
      );

      // All nodes start out chained into the recycle list.
      let nodes: Box<[Node<T>]> = (0..num_elements)
         .map(|i| Node {
            next: AtomicU32::new(if i + 1 < num_elements { i as u32 + 1 } else { NIL }),
            value: UnsafeCell::new(MaybeUninit::uninit()),
         })
         .collect();

      Self {
         nodes,
         public_chain: RefLink::new(NIL),
         recycle_chain: RefLink::new(0),
         spin: spin_count(),
      }
   }

   pub fn capacity(&self) -> usize {
      self.nodes.len()
   }

   // Snapshots; may be stale under contention.
   #[inline]
   pub fn is_empty(&self) -> bool {
      self.public_chain.data() == NIL
   }

   #[inline]
   pub fn is_full(&self) -> bool {
      self.recycle_chain.data() == NIL
   }

   // Unlink the head node of `chain`. The micro-lock is taken first; the
   // final CAS publishes the successor and clears the lock in one step.
   fn pop_link(&self, chain: &RefLink) -> Option<u32> {
      let token = thread_token();
      loop {
         let head = chain.acquire(token, self.spin);
         if head == NIL {
            if chain.try_release(NIL, token) {
               return None;
            }
            // a push landed while we held the lock; look again
            continue;
         }
         let next = self.nodes[head as usize].next.load(Ordering::Acquire);
         if chain.try_update(head, next, token) {
            return Some(head);
         }
      }
   }

   // Link `index` in as the new head of `chain` without taking the
   // micro-lock. The CAS preserves whatever ref word it observed, so it
   // cannot conflict with a holder's release-CAS losing gracefully.
   fn push_link(&self, index: u32, chain: &RefLink) {
      chain.spin_while_busy(self.spin);
      loop {
         let observed = chain.load();
         self.nodes[index as usize]
            .next
            .store(data_of(observed), Ordering::Release);
         if chain.try_swap_data(observed, index) {
            return;
         }
      }
   }

   /// Copy `item` into a free node and publish it on the public chain.
   /// Returns the item back when the stack is full.
   pub fn push(&self, item: T) -> Result<(), PushError<T>> {
      let Some(index) = self.pop_link(&self.recycle_chain) else {
         return Err(PushError(item));
      };
      unsafe { (*self.nodes[index as usize].value.get()).write(item) };
      self.push_link(index, &self.public_chain);
      Ok(())
   }

   /// Take the most recently pushed value.
   pub fn pop(&self) -> Result<T, PopError> {
      let Some(index) = self.pop_link(&self.public_chain) else {
         return Err(PopError);
      };
      let value = unsafe { (*self.nodes[index as usize].value.get()).assume_init_read() };
      self.push_link(index, &self.recycle_chain);
      Ok(value)
   }

   /// Drain every public node back into the recycle chain, dropping the
   /// payloads. Exclusive access; concurrent pushes and pops must have
   /// quiesced.
   pub fn clear(&mut self) {
      let mut head = self.public_chain.data_mut();
      let mut recycle = self.recycle_chain.data_mut();
      while head != NIL {
         let node = &mut self.nodes[head as usize];
         let next = *node.next.get_mut();
         unsafe { (*node.value.get()).assume_init_drop() };
         *node.next.get_mut() = recycle;
         recycle = head;
         head = next;
      }
      self.public_chain.set_data(NIL);
      self.recycle_chain.set_data(recycle);
   }
}

impl<T: Send + 'static> MpmcContainer<T> for BoundedStack<T> {
   type PushError = PushError<T>;
   type PopError = PopError;

   fn push(&self, item: T) -> Result<(), Self::PushError> {
      BoundedStack::push(self, item)
   }

   fn pop(&self) -> Result<T, Self::PopError> {
      BoundedStack::pop(self)
   }

   fn available(&self) -> bool {
      !self.is_full()
   }

   fn empty(&self) -> bool {
      self.is_empty()
   }
}

impl<T: Send> Drop for BoundedStack<T> {
   fn drop(&mut self) {
      if !std::mem::needs_drop::<T>() {
         return;
      }
      let mut head = self.public_chain.data_mut();
      while head != NIL {
         let node = &mut self.nodes[head as usize];
         unsafe { (*node.value.get()).assume_init_drop() };
         head = *node.next.get_mut();
      }
   }
}

impl<T: Send> fmt::Debug for BoundedStack<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("BoundedStack")
         .field("capacity", &self.nodes.len())
         .field("is_empty", &self.is_empty())
         .field("is_full", &self.is_full())
         .finish()
   }
}
