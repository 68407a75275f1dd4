// Referenced-pointer micro-lock shared by the bounded containers.
//
// A cursor is a packed {data, ref} pair in one AtomicU64: `data` indexes into
// the container's preallocated arena (NIL = u32::MAX), `ref` identifies the
// thread holding the cursor for a CAS sequence. ref == 0 means unlocked; the
// low bit of every holder token is set, so a non-zero ref doubles as the busy
// flag.

use std::cell::Cell;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Instant;

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::{gettid, Pid};

pub(crate) const NIL: u32 = u32::MAX;

// Spin budget used before the per-process calibration has run, and whenever
// calibration produces nothing usable.
const DEFAULT_SPIN: u32 = 64;
const MIN_SPIN: u32 = 16;
const MAX_SPIN: u32 = 4096;

#[inline]
pub(crate) const fn pack(data: u32, reference: u32) -> u64 {
    ((reference as u64) << 32) | data as u64
}

#[inline]
pub(crate) const fn data_of(word: u64) -> u32 {
    word as u32
}

#[inline]
pub(crate) const fn ref_of(word: u64) -> u32 {
    (word >> 32) as u32
}

thread_local! {
    static TOKEN: Cell<u32> = const { Cell::new(0) };
}

// Non-zero lock token, unique per live thread, low bit always set. The shift
// keeps tokens of threads with adjacent tids distinct.
pub(crate) fn thread_token() -> u32 {
    TOKEN.with(|slot| {
        let cached = slot.get();
        if cached != 0 {
            return cached;
        }
        let tid = gettid().as_raw() as u32;
        let token = (tid << 1) | 1;
        slot.set(token);
        token
    })
}

/// A micro-locked arena cursor. Lock-free: a stalled holder is overtaken the
/// moment its release CAS loses, and every successful CAS makes global
/// progress.
#[repr(transparent)]
pub(crate) struct RefLink(AtomicU64);

impl RefLink {
    pub(crate) fn new(data: u32) -> Self {
        RefLink(AtomicU64::new(pack(data, 0)))
    }

    #[inline]
    pub(crate) fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn data(&self) -> u32 {
        data_of(self.load())
    }

    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        ref_of(self.load()) != 0
    }

    // Acquire the cursor for `token` and return the `data` observed at lock
    // time. Spins `spin` iterations per round before yielding. A cursor whose
    // ref already equals `token` is re-entered directly: a release CAS that
    // lost to an interleaved data-only CAS leaves the lock held by this
    // thread, and the retry must observe the new data instead of deadlocking
    // on itself.
    pub(crate) fn acquire(&self, token: u32, spin: u32) -> u32 {
        let mut budget = spin;
        loop {
            let word = self.load();
            let holder = ref_of(word);
            if holder == token {
                return data_of(word);
            }
            if holder == 0 {
                if self
                    .0
                    .compare_exchange_weak(
                        word,
                        pack(data_of(word), token),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return data_of(word);
                }
                continue;
            }
            hint::spin_loop();
            budget -= 1;
            if budget == 0 {
                thread::yield_now();
                budget = spin;
            }
        }
    }

    // Publish `new_data` and drop the lock in a single CAS. Fails when the
    // data half changed under the lock (a data-only CAS slipped in).
    #[inline]
    pub(crate) fn try_update(&self, old_data: u32, new_data: u32, token: u32) -> bool {
        self.0
            .compare_exchange(
                pack(old_data, token),
                pack(new_data, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // Drop the lock without changing the data half.
    #[inline]
    pub(crate) fn try_release(&self, data: u32, token: u32) -> bool {
        self.try_update(data, data, token)
    }

    // Swap the data half while preserving whatever ref was observed. This is
    // the lock-ignoring CAS used by chain pushes: if a holder was active, its
    // release CAS sees the changed data and retries.
    #[inline]
    pub(crate) fn try_swap_data(&self, observed: u64, new_data: u32) -> bool {
        self.0
            .compare_exchange(
                observed,
                pack(new_data, ref_of(observed)),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // Bounded wait for the busy flag to clear. Pushes use this as backoff,
    // not as an acquisition.
    #[inline]
    pub(crate) fn spin_while_busy(&self, spin: u32) {
        let mut budget = spin;
        while budget > 0 && self.is_busy() {
            hint::spin_loop();
            budget -= 1;
        }
    }

    // Exclusive-access accessors for drain and drop paths.
    pub(crate) fn data_mut(&mut self) -> u32 {
        data_of(*self.0.get_mut())
    }

    pub(crate) fn set_data(&mut self, data: u32) {
        *self.0.get_mut() = pack(data, 0);
    }
}

/*──────────────────────── adaptive spin calibration ───────────────────────*/

static SPIN_COUNT: OnceLock<u32> = OnceLock::new();

/// Spin budget for one micro-lock round, calibrated once per process so that
/// one round of spinning roughly matches one push/pop service time. The
/// calibration is a soft heuristic; `DEFAULT_SPIN` is always correct.
pub(crate) fn spin_count() -> u32 {
    *SPIN_COUNT.get_or_init(calibrate)
}

struct AffinityGuard(Option<CpuSet>);

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            let _ = sched_setaffinity(Pid::from_raw(0), &previous);
        }
    }
}

// Pin the calibrating thread to the first CPU of its current mask so all
// samples come from one core's clock. Calibration proceeds unpinned if the
// syscall is unavailable.
fn pin_to_one_cpu() -> AffinityGuard {
    let previous = sched_getaffinity(Pid::from_raw(0)).ok();
    if let Some(mask) = previous.as_ref() {
        for cpu in 0..CpuSet::count() {
            if mask.is_set(cpu).unwrap_or(false) {
                let mut single = CpuSet::new();
                if single.set(cpu).is_ok() {
                    let _ = sched_setaffinity(Pid::from_raw(0), &single);
                }
                break;
            }
        }
    }
    AffinityGuard(previous)
}

const SAMPLES: usize = 10;
const BEST: usize = 4;
const REPS: u32 = 512;

fn calibrate() -> u32 {
    let _pin = pin_to_one_cpu();
    let token = thread_token();
    let link = RefLink::new(0);

    // 10 samples of an uncontended lock/update cycle, keep the best 4.
    let mut samples = [0u64; SAMPLES];
    for sample in samples.iter_mut() {
        let start = Instant::now();
        for _ in 0..REPS {
            let data = link.acquire(token, DEFAULT_SPIN);
            link.try_update(data, data ^ 1, token);
        }
        *sample = start.elapsed().as_nanos() as u64;
    }
    samples.sort_unstable();
    let op_ns = samples[..BEST].iter().sum::<u64>() / (BEST as u64 * REPS as u64);

    // Cost of a single pause iteration, measured over a long run.
    let pause_reps = u64::from(REPS) * 64;
    let start = Instant::now();
    for _ in 0..pause_reps {
        hint::spin_loop();
    }
    let pause_ns = (start.elapsed().as_nanos() as u64 / pause_reps).max(1);

    if op_ns == 0 {
        return DEFAULT_SPIN;
    }
    ((op_ns / pause_ns) as u32).clamp(MIN_SPIN, MAX_SPIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips() {
        let word = pack(17, 0x2b);
        assert_eq!(data_of(word), 17);
        assert_eq!(ref_of(word), 0x2b);
        assert_eq!(data_of(pack(NIL, 0)), NIL);
    }

    #[test]
    fn token_is_stable_and_carries_busy_bit() {
        let first = thread_token();
        let second = thread_token();
        assert_eq!(first, second);
        assert_eq!(first & 1, 1);
        assert_ne!(first, 0);
    }

    #[test]
    fn tokens_differ_across_threads() {
        let mine = thread_token();
        let other = std::thread::spawn(thread_token).join().unwrap();
        assert_ne!(mine, other);
        assert_eq!(other & 1, 1);
    }

    #[test]
    fn acquire_reenters_own_lock() {
        let token = thread_token();
        let link = RefLink::new(3);
        assert_eq!(link.acquire(token, DEFAULT_SPIN), 3);
        // Lock is held; a second acquire by the same thread must not spin.
        assert_eq!(link.acquire(token, DEFAULT_SPIN), 3);
        assert!(link.try_update(3, 4, token));
        assert_eq!(link.data(), 4);
        assert!(!link.is_busy());
    }

    #[test]
    fn calibrated_spin_is_sane() {
        let spin = spin_count();
        assert!((MIN_SPIN..=MAX_SPIN).contains(&spin));
    }
}
