// Thread-based producer/consumer benchmarks for the three containers.
//
// Each iteration spins up a fresh container and a producer thread; the
// consumer side runs on the bench thread and its drain time is what criterion
// records, so the numbers track steady-state transfer cost rather than thread
// startup.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};

use mpmc_containers::{BlockQueue, BoundedQueue, BoundedStack};

const RING_CAP: usize = 1024;
const ITERS: usize = 100_000;

fn bounded_stack_spsc_bench(c: &mut Criterion) {
   c.bench_function("bounded_stack/spsc push+pop", |b| {
      b.iter_custom(|rounds| {
         let mut total = Duration::ZERO;
         for _ in 0..rounds {
            let stack = Arc::new(BoundedStack::<usize>::with_capacity(RING_CAP));

            let producer = {
               let stack = stack.clone();
               thread::spawn(move || {
                  for i in 0..ITERS {
                     let mut item = i;
                     while let Err(rejected) = stack.push(item) {
                        item = rejected.0;
                        std::hint::spin_loop();
                     }
                  }
               })
            };

            let start = Instant::now();
            let mut got = 0usize;
            while got < ITERS {
               if stack.pop().is_ok() {
                  got += 1;
               } else {
                  std::hint::spin_loop();
               }
            }
            total += start.elapsed();

            producer.join().unwrap();
         }
         total
      });
   });
}

fn bounded_queue_spsc_bench(c: &mut Criterion) {
   c.bench_function("bounded_queue/spsc enqueue+dequeue", |b| {
      b.iter_custom(|rounds| {
         let mut total = Duration::ZERO;
         for _ in 0..rounds {
            let queue = Arc::new(BoundedQueue::<usize>::with_capacity(RING_CAP));

            let producer = {
               let queue = queue.clone();
               thread::spawn(move || {
                  for i in 0..ITERS {
                     let mut item = i;
                     while let Err(rejected) = queue.enqueue(item) {
                        item = rejected.0;
                        std::hint::spin_loop();
                     }
                  }
               })
            };

            let start = Instant::now();
            let mut got = 0usize;
            while got < ITERS {
               if queue.dequeue().is_ok() {
                  got += 1;
               } else {
                  std::hint::spin_loop();
               }
            }
            total += start.elapsed();

            producer.join().unwrap();
         }
         total
      });
   });
}

fn block_queue_mpmc_bench(c: &mut Criterion) {
   const THREADS: usize = 4;

   c.bench_function("block_queue/4x4 enqueue+dequeue", |b| {
      b.iter_custom(|rounds| {
         let mut total = Duration::ZERO;
         for _ in 0..rounds {
            let queue = Arc::new(BlockQueue::<usize>::new());

            let producers: Vec<_> = (0..THREADS)
               .map(|_| {
                  let queue = queue.clone();
                  thread::spawn(move || {
                     for i in 0..ITERS / THREADS {
                        queue.enqueue(i);
                     }
                  })
               })
               .collect();

            let start = Instant::now();
            let consumers: Vec<_> = (0..THREADS)
               .map(|_| {
                  let queue = queue.clone();
                  thread::spawn(move || {
                     let mut got = 0usize;
                     while got < ITERS / THREADS {
                        if queue.try_dequeue().is_some() {
                           got += 1;
                        } else {
                           std::hint::spin_loop();
                        }
                     }
                  })
               })
               .collect();

            for consumer in consumers {
               consumer.join().unwrap();
            }
            total += start.elapsed();

            for producer in producers {
               producer.join().unwrap();
            }
         }
         total
      });
   });
}

criterion_group!(
   benches,
   bounded_stack_spsc_bench,
   bounded_queue_spsc_bench,
   block_queue_mpmc_bench
);
criterion_main!(benches);
