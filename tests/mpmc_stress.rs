// mpmc_containers/tests/mpmc_stress.rs
//
// Many-producer / many-consumer runs: conservation across the whole run,
// per-producer FIFO, block reclamation, and payload-release accounting.

use mpmc_containers::mpmc::block_queue::SLOTS_PER_BLOCK;
use mpmc_containers::mpmc::bounded_queue::EnqueueError;
use mpmc_containers::mpmc::bounded_stack::PushError;
use mpmc_containers::{BlockQueue, BoundedQueue, BoundedStack};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const PRODUCERS: usize = 8;
const CONSUMERS: usize = 8;
const PER_PRODUCER: usize = 10_000;

#[test]
fn block_queue_mpmc_conserves_the_multiset() {
    let queue = Arc::new(BlockQueue::<usize>::new());
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue(i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match queue.try_dequeue() {
                        Some(v) => got.push(v),
                        // a None after every producer joined is final: nothing
                        // re-enters the queue
                        None if done.load(Ordering::Acquire) => break,
                        None => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let mut counts = vec![0usize; PER_PRODUCER];
    let mut total = 0;
    for consumer in consumers {
        for v in consumer.join().unwrap() {
            counts[v] += 1;
            total += 1;
        }
    }

    assert_eq!(total, PRODUCERS * PER_PRODUCER);
    for (v, &count) in counts.iter().enumerate() {
        assert_eq!(count, PRODUCERS, "value {v} seen {count} times");
    }
    assert!(queue.is_empty());
    assert!(
        queue.released_blocks() >= 1,
        "80k values cross several blocks; at least one must have been reclaimed"
    );
}

#[test]
fn block_queue_consumers_see_per_producer_fifo() {
    let queue = Arc::new(BlockQueue::<(usize, usize)>::new());
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..4)
        .map(|id| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.enqueue((id, seq));
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                // any single consumer's view preserves each producer's order
                let mut last_seq = [None::<usize>; 4];
                let mut got = 0usize;
                loop {
                    match queue.try_dequeue() {
                        Some((id, seq)) => {
                            if let Some(previous) = last_seq[id] {
                                assert!(
                                    previous < seq,
                                    "producer {id} reordered: {previous} before {seq}"
                                );
                            }
                            last_seq[id] = Some(seq);
                            got += 1;
                        }
                        None if done.load(Ordering::Acquire) => break,
                        None => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let consumed: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
    assert_eq!(consumed, 4 * PER_PRODUCER);
}

#[test]
fn block_queue_crosses_block_boundaries_and_reclaims() {
    let queue = BlockQueue::<usize>::new();
    let per_block = SLOTS_PER_BLOCK - 1;

    // fill the first block exactly, then one more to force the extension
    for i in 0..per_block {
        queue.enqueue(i);
    }
    assert_eq!(queue.released_blocks(), 0);
    queue.enqueue(per_block);

    for i in 0..=per_block {
        assert_eq!(queue.try_dequeue(), Some(i));
    }
    assert_eq!(queue.try_dequeue(), None);

    // the drained first block went to the spare cache
    assert_eq!(queue.released_blocks(), 1);
    assert!(queue.has_cached_block());

    // the next extension reuses the cached block instead of allocating
    for i in 0..=per_block {
        queue.enqueue(i);
    }
    assert!(!queue.has_cached_block());
    for i in 0..=per_block {
        assert_eq!(queue.try_dequeue(), Some(i));
    }
    assert_eq!(queue.released_blocks(), 2);
}

#[test]
fn block_queue_releases_every_handle_exactly_once() {
    let live = Arc::new(AtomicUsize::new(0));
    let queue = BlockQueue::new();

    for _ in 0..1000 {
        queue.enqueue(Handle::new(&live));
    }
    assert_eq!(live.load(Ordering::Relaxed), 1000);

    for _ in 0..500 {
        drop(queue.try_dequeue().unwrap());
    }
    assert_eq!(live.load(Ordering::Relaxed), 500);

    // the destructor releases the rest, once each
    drop(queue);
    assert_eq!(live.load(Ordering::Relaxed), 0);
}

#[test]
fn block_queue_destructor_frees_every_block() {
    let queue = BlockQueue::<u64>::new();
    // span three blocks and leave everything enqueued
    for i in 0..(2 * SLOTS_PER_BLOCK as u64 + 17) {
        queue.enqueue(i);
    }
    // drop must walk all blocks without touching the reclamation protocol;
    // leak detection is the allocator's job, this is a no-crash check
    drop(queue);
}

#[test]
fn bounded_stack_mpmc_conserves_values() {
    let stack = Arc::new(BoundedStack::<usize>::with_capacity(64));
    let done = Arc::new(AtomicBool::new(false));
    let pushed_sum = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|id| {
            let stack = stack.clone();
            let pushed_sum = pushed_sum.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut item = id * PER_PRODUCER + i;
                    loop {
                        match stack.push(item) {
                            Ok(()) => {
                                pushed_sum.fetch_add(item, Ordering::Relaxed);
                                break;
                            }
                            Err(PushError(rejected)) => {
                                item = rejected;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let stack = stack.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut sum = 0usize;
                let mut count = 0usize;
                loop {
                    match stack.pop() {
                        Ok(v) => {
                            sum += v;
                            count += 1;
                        }
                        Err(_) if done.load(Ordering::Acquire) && stack.is_empty() => break,
                        Err(_) => thread::yield_now(),
                    }
                }
                (sum, count)
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let (sum, count) = consumers
        .into_iter()
        .map(|c| c.join().unwrap())
        .fold((0, 0), |(s, n), (cs, cn)| (s + cs, n + cn));

    assert_eq!(count, 4 * PER_PRODUCER);
    assert_eq!(sum, pushed_sum.load(Ordering::Relaxed));
    assert!(stack.is_empty());
    assert!(!stack.is_full());
}

#[test]
fn bounded_queue_mpmc_conserves_values() {
    let queue = Arc::new(BoundedQueue::<usize>::with_capacity(32));
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..4)
        .map(|id| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut item = id * PER_PRODUCER + i;
                    loop {
                        match queue.enqueue(item) {
                            Ok(()) => break,
                            Err(EnqueueError(rejected)) => {
                                item = rejected;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match queue.dequeue() {
                        Ok(v) => got.push(v),
                        Err(_) if done.load(Ordering::Acquire) && queue.is_empty() => break,
                        Err(_) => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let mut seen = vec![false; 4 * PER_PRODUCER];
    let mut total = 0;
    for consumer in consumers {
        for v in consumer.join().unwrap() {
            assert!(!seen[v], "value {v} dequeued twice");
            seen[v] = true;
            total += 1;
        }
    }
    assert_eq!(total, 4 * PER_PRODUCER);
    assert!(queue.is_empty());
}

struct Handle(Arc<AtomicUsize>);

impl Handle {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Handle(Arc::clone(live))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
