//! Single-producer / multi-consumer ready-segment buffer.
//!
//! Exactly 32 slots. One 64-bit atomic packs the two 32-bit state bitmaps:
//! available bits in the low half, ack bits in the high half. A push
//! publishes both bits for a free slot with a single `fetch_add` (safe
//! because the producer owns free slots and both bits are zero); a pop
//! CAS-clears the available bit, leaving the ack bit for the producer to
//! reclaim with [`Spmc::pop_ack`]. A separate bitmap marks high-priority
//! slots; `pop` prefers them and `pop_back` avoids them.
//!
//! Slot states:
//!
//! | state        | avail | ack |
//! |--------------|-------|-----|
//! | free         | 0     | 0   |
//! | ready        | 1     | 1   |
//! | pending ack  | 0     | 1   |
//!
//! (With [`AckMode::None`], pop clears both bits and the pending-ack state
//! is skipped.) High/low watermarks adapt: consumers finding the buffer
//! empty raise them so the producer buffers more; a producer bouncing off
//! the high watermark lowers them for more back-pressure.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::DbError;

pub(crate) const SPMC_SLOTS: usize = 32;

const MIN_GAP: u32 = 4;
const DEFAULT_HIGH: u32 = 24;

/// Persistent buffer state; lives in the mapped allocator header.
#[repr(C)]
pub(crate) struct SpmcState {
    /// available bits (low 32) | ack bits (high 32)
    bitmap: AtomicU64,
    priority: AtomicU64,
    high_water: AtomicU32,
    low_water: AtomicU32,
    /// producer saw the high watermark and is holding off until low
    producer_held: AtomicU32,
    interrupted: AtomicU32,
    slots: [AtomicU64; SPMC_SLOTS],
}

/// Process-local wait machinery beside the mapped state.
#[derive(Default)]
pub(crate) struct SpmcSync {
    lock: Mutex<()>,
    cv: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckMode {
    /// Consumed slots wait for the producer's `pop_ack`.
    Require,
    /// Consumed slots free immediately.
    None,
}

pub(crate) struct Spmc<'a> {
    state: &'a SpmcState,
    sync: &'a SpmcSync,
}

fn avail_bit(i: usize) -> u64 {
    1u64 << i
}

fn ack_bit(i: usize) -> u64 {
    1u64 << (i + 32)
}

impl<'a> Spmc<'a> {
    pub fn new(state: &'a SpmcState, sync: &'a SpmcSync) -> Self {
        Self { state, sync }
    }

    /// Zero all state and restore default watermarks. Called once when the
    /// header file is created, and by `reset()`.
    pub fn reset(&self) {
        self.state.bitmap.store(0, Ordering::Relaxed);
        self.state.priority.store(0, Ordering::Relaxed);
        for s in &self.state.slots {
            s.store(0, Ordering::Relaxed);
        }
        self.state.producer_held.store(0, Ordering::Relaxed);
        self.state.interrupted.store(0, Ordering::Relaxed);
        self.state.high_water.store(DEFAULT_HIGH, Ordering::Relaxed);
        self.state.low_water.store(DEFAULT_HIGH - MIN_GAP, Ordering::Release);
    }

    fn high(&self) -> u32 {
        match self.state.high_water.load(Ordering::Relaxed) {
            0 => DEFAULT_HIGH, // never initialized
            h => h,
        }
    }

    /// Slots holding data in either state.
    pub fn usage(&self) -> u32 {
        let bm = self.state.bitmap.load(Ordering::Acquire);
        ((bm as u32) | ((bm >> 32) as u32)).count_ones()
    }

    pub fn can_push(&self) -> bool {
        let held = self.state.producer_held.load(Ordering::Relaxed) != 0;
        let limit = if held { self.high() - MIN_GAP } else { self.high() };
        self.usage() < limit && self.pushable_bitmap() != 0
    }

    /// Free slots: neither available nor pending ack.
    pub fn pushable_bitmap(&self) -> u32 {
        let bm = self.state.bitmap.load(Ordering::Acquire);
        !((bm as u32) | ((bm >> 32) as u32))
    }

    /// Ready slots a consumer hasn't claimed.
    pub fn swappable_bitmap(&self) -> u32 {
        self.state.bitmap.load(Ordering::Acquire) as u32
    }

    pub fn push(&self, v: u64) -> Option<usize> {
        self.push_impl(v, false)
    }

    /// Push with the priority bit set, so `pop` takes it first.
    pub fn push_front(&self, v: u64) -> Option<usize> {
        self.push_impl(v, true)
    }

    fn push_impl(&self, v: u64, front: bool) -> Option<usize> {
        let usage = self.usage();
        let held = self.state.producer_held.load(Ordering::Relaxed) != 0;
        if usage >= self.high() || (held && usage >= self.high() - MIN_GAP) {
            // back-pressure: record that we waited and tighten the window
            self.state.producer_held.store(1, Ordering::Relaxed);
            self.adapt(false);
            return None;
        }
        self.state.producer_held.store(0, Ordering::Relaxed);
        let free = self.pushable_bitmap();
        if free == 0 {
            return None;
        }
        let slot = free.trailing_zeros() as usize;
        self.state.slots[slot].store(v, Ordering::Release);
        if front {
            self.state.priority.fetch_or(avail_bit(slot), Ordering::AcqRel);
        } else {
            self.state.priority.fetch_and(!avail_bit(slot), Ordering::AcqRel);
        }
        // both bits are zero for a free slot, so an add sets them together
        self.state
            .bitmap
            .fetch_add(avail_bit(slot) + ack_bit(slot), Ordering::Release);
        self.notify();
        Some(slot)
    }

    /// Take the oldest ready slot, preferring priority items.
    pub fn pop(&self, ack: AckMode) -> Option<u64> {
        self.pop_impl(ack, false)
    }

    /// Take the newest ready slot, preferring non-priority items.
    pub fn pop_back(&self, ack: AckMode) -> Option<u64> {
        self.pop_impl(ack, true)
    }

    fn pop_impl(&self, ack: AckMode, back: bool) -> Option<u64> {
        loop {
            let avail = self.state.bitmap.load(Ordering::Acquire) as u32;
            if avail == 0 {
                return None;
            }
            let pri = self.state.priority.load(Ordering::Acquire) as u32;
            let candidates = if back {
                let np = avail & !pri;
                if np != 0 {
                    np
                } else {
                    avail
                }
            } else {
                let p = avail & pri;
                if p != 0 {
                    p
                } else {
                    avail
                }
            };
            let slot = if back {
                31 - candidates.leading_zeros() as usize
            } else {
                candidates.trailing_zeros() as usize
            };
            // read before claiming: until our CAS lands, the producer cannot
            // reuse the slot, and only the CAS winner keeps this value
            let v = self.state.slots[slot].load(Ordering::Acquire);
            let clear = match ack {
                AckMode::Require => avail_bit(slot),
                AckMode::None => avail_bit(slot) + ack_bit(slot),
            };
            let won = self
                .state
                .bitmap
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                    if w & avail_bit(slot) != 0 {
                        Some(w & !clear)
                    } else {
                        None
                    }
                })
                .is_ok();
            if won {
                if ack == AckMode::None {
                    self.state.priority.fetch_and(!avail_bit(slot), Ordering::AcqRel);
                }
                self.notify();
                return Some(v);
            }
        }
    }

    /// Blocking pop. Returns [`DbError::Interrupted`] after `wake_blocked`.
    pub fn pop_wait(&self, ack: AckMode) -> Result<u64, DbError> {
        self.wait_impl(ack, false)
    }

    pub fn pop_back_wait(&self, ack: AckMode) -> Result<u64, DbError> {
        self.wait_impl(ack, true)
    }

    fn wait_impl(&self, ack: AckMode, back: bool) -> Result<u64, DbError> {
        loop {
            if self.state.interrupted.load(Ordering::Acquire) != 0 {
                return Err(DbError::Interrupted);
            }
            if let Some(v) = self.pop_impl(ack, back) {
                return Ok(v);
            }
            // empty buffer: consumers waiting means the producer should
            // buffer deeper
            self.adapt(true);
            let g = self.sync.lock.lock().unwrap();
            if self.swappable_bitmap() == 0
                && self.state.interrupted.load(Ordering::Acquire) == 0
            {
                let _ = self.sync.cv.wait_timeout(g, Duration::from_millis(10)).unwrap();
            }
        }
    }

    /// Producer-side reclaim of consumed slots. Returns their values.
    pub fn pop_ack(&self) -> Vec<u64> {
        let bm = self.state.bitmap.load(Ordering::Acquire);
        let acked = ((bm >> 32) as u32) & !(bm as u32);
        let mut out = Vec::new();
        let mut bits = acked;
        while bits != 0 {
            let slot = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            out.push(self.state.slots[slot].load(Ordering::Acquire));
            self.state.priority.fetch_and(!avail_bit(slot), Ordering::AcqRel);
            self.state.bitmap.fetch_and(!ack_bit(slot), Ordering::AcqRel);
        }
        out
    }

    /// Producer-only: replace a still-available slot's value. Returns the
    /// old value, or `None` if a consumer claimed the slot first.
    pub fn try_swap(&self, slot: usize, v: u64) -> Option<u64> {
        debug_assert!(slot < SPMC_SLOTS);
        // briefly take the slot off the market the way a consumer would
        let claimed = self
            .state
            .bitmap
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if w & avail_bit(slot) != 0 {
                    Some(w & !avail_bit(slot))
                } else {
                    None
                }
            })
            .is_ok();
        if !claimed {
            return None;
        }
        let old = self.state.slots[slot].swap(v, Ordering::AcqRel);
        self.state.bitmap.fetch_or(avail_bit(slot), Ordering::Release);
        self.notify();
        Some(old)
    }

    /// Wake every blocked waiter with an interrupted error.
    pub fn wake_blocked(&self) {
        self.state.interrupted.store(1, Ordering::Release);
        self.notify();
    }

    pub fn clear_interrupt(&self) {
        self.state.interrupted.store(0, Ordering::Release);
    }

    fn notify(&self) {
        let _g = self.sync.lock.lock().unwrap();
        self.sync.cv.notify_all();
    }

    /// Move both watermarks, keeping `low = high - MIN_GAP` and high within
    /// `(MIN_GAP, 32]`.
    fn adapt(&self, raise: bool) {
        let h = self.high();
        let h = if raise {
            (h + 1).min(SPMC_SLOTS as u32)
        } else {
            (h - 1).max(MIN_GAP + 1)
        };
        self.state.high_water.store(h, Ordering::Relaxed);
        self.state.low_water.store(h - MIN_GAP, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn watermarks(&self) -> (u32, u32) {
        (
            self.state.high_water.load(Ordering::Relaxed),
            self.state.low_water.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make() -> (Box<SpmcState>, Box<SpmcSync>) {
        let state: SpmcState = unsafe { std::mem::zeroed() };
        (Box::new(state), Box::<SpmcSync>::default())
    }

    #[test]
    fn fifo_and_ack_cycle() {
        let (state, sync) = make();
        let q = Spmc::new(&state, &sync);
        q.reset();
        assert_eq!(q.push(10), Some(0));
        assert_eq!(q.push(11), Some(1));
        assert_eq!(q.usage(), 2);

        assert_eq!(q.pop(AckMode::Require), Some(10));
        assert_eq!(q.pop(AckMode::Require), Some(11));
        assert_eq!(q.pop(AckMode::Require), None);
        // consumed but unacked slots still occupy the buffer
        assert_eq!(q.usage(), 2);
        assert_eq!(q.pop_ack(), vec![10, 11]);
        assert_eq!(q.usage(), 0);
        assert_eq!(q.pop_ack(), Vec::<u64>::new());
    }

    #[test]
    fn no_ack_frees_immediately() {
        let (state, sync) = make();
        let q = Spmc::new(&state, &sync);
        q.reset();
        q.push(7);
        assert_eq!(q.pop(AckMode::None), Some(7));
        assert_eq!(q.usage(), 0);
        assert_eq!(q.pop_ack(), Vec::<u64>::new());
    }

    #[test]
    fn priority_ordering() {
        let (state, sync) = make();
        let q = Spmc::new(&state, &sync);
        q.reset();
        q.push(1);
        q.push(2);
        q.push_front(99);
        // pop prefers the priority item regardless of position
        assert_eq!(q.pop(AckMode::None), Some(99));
        assert_eq!(q.pop(AckMode::None), Some(1));

        q.push(3);
        q.push_front(98);
        q.push(4);
        // pop_back prefers the highest-index non-priority slot
        assert_eq!(q.pop_back_wait(AckMode::None).unwrap(), 4);
        assert_eq!(q.pop_back(AckMode::None), Some(2));
        assert_eq!(q.pop_back(AckMode::None), Some(3));
        // only the priority item remains
        assert_eq!(q.pop_back(AckMode::None), Some(98));
    }

    #[test]
    fn try_swap_races_with_consumers() {
        let (state, sync) = make();
        let q = Spmc::new(&state, &sync);
        q.reset();
        let slot = q.push(5).unwrap();
        assert_eq!(q.try_swap(slot, 6), Some(5));
        assert_eq!(q.pop(AckMode::None), Some(6));
        // slot no longer available
        assert_eq!(q.try_swap(slot, 7), None);
    }

    #[test]
    fn watermark_backpressure() {
        let (state, sync) = make();
        let q = Spmc::new(&state, &sync);
        q.reset();
        let (h0, l0) = q.watermarks();
        assert_eq!(l0, h0 - MIN_GAP);
        let mut pushed = 0;
        while q.push(pushed).is_some() {
            pushed += 1;
        }
        assert_eq!(pushed, h0 as u64);
        // the refused push lowered the watermarks
        let (h1, _) = q.watermarks();
        assert_eq!(h1, h0 - 1);
        assert!(!q.can_push());
        // drain below the (lowered) low watermark and pushing resumes
        while q.pop(AckMode::None).is_some() {}
        assert!(q.can_push());
        assert!(q.push(100).is_some());
    }

    #[test]
    fn wake_blocked_interrupts() {
        let (state, sync) = make();
        {
            let q = Spmc::new(&state, &sync);
            q.reset();
        }
        std::thread::scope(|s| {
            let state = &state;
            let sync = &sync;
            let waiter = s.spawn(move || {
                let q = Spmc::new(state, sync);
                q.pop_wait(AckMode::None)
            });
            std::thread::sleep(Duration::from_millis(20));
            let q = Spmc::new(state, sync);
            q.wake_blocked();
            let r = waiter.join().unwrap();
            assert!(matches!(r, Err(DbError::Interrupted)));
        });
        let q = Spmc::new(&state, &sync);
        q.reset();
        assert_eq!(state.interrupted.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn two_thread_producer_consumer() {
        let (state, sync) = make();
        {
            let q = Spmc::new(&state, &sync);
            q.reset();
        }
        const N: u64 = 500;
        std::thread::scope(|s| {
            let state = &state;
            let sync = &sync;
            let consumer = s.spawn(move || {
                let q = Spmc::new(state, sync);
                let mut got = Vec::new();
                while got.len() < N as usize {
                    match q.pop_wait(AckMode::None) {
                        Ok(v) => got.push(v),
                        Err(_) => break,
                    }
                }
                got
            });
            let q = Spmc::new(state, sync);
            let mut next = 0u64;
            while next < N {
                if q.push(next).is_some() {
                    next += 1;
                } else {
                    // drain of acks is the producer's job even when full
                    q.pop_ack();
                    std::thread::yield_now();
                }
            }
            let mut got = consumer.join().unwrap();
            // every value arrives exactly once (order is only approximate:
            // consumers pick by slot index, not push order)
            got.sort_unstable();
            assert_eq!(got, (0..N).collect::<Vec<_>>());
        });
    }
}
