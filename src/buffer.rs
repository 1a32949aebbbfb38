//! Sample buffer allocator.
//!
//! One pre-allocated region carved into fixed-size record slots by a bump
//! offset. Everything reachable from the interrupt path is a short critical
//! section under a spin lock.

use crate::error::{Result, SamplingError};
use crate::wake::NonBlocking;

use std::sync::atomic::{AtomicUsize, Ordering};

/// A granted record slot. Only valid for the buffer generation it was
/// handed out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    offset: usize,
    len: usize,
    generation: u64,
}

impl SlotHandle {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Acquired {
    pub slot: Option<SlotHandle>,
    /// The consumer should be woken (buffer full or sample limit hit).
    pub wake: bool,
}

#[derive(Default)]
struct ArenaState {
    buf: Vec<u8>,
    offset: usize,
    record_len: usize,
    generation: u64,
    samples: u64,
    max_samples: Option<u64>,
    active: bool,
    flush_requested: bool,
    limit_reached: bool,
}

#[derive(Default)]
pub struct SampleArena {
    state: spin::Mutex<ArenaState>,
    in_flight: AtomicUsize,
}

impl NonBlocking for SampleArena {}

impl SampleArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the buffer for a session. The region is only reallocated when
    /// its geometry changes, otherwise it is zeroed in place.
    pub fn prepare(
        &self,
        record_len: usize,
        samples_per_buffer: usize,
        max_samples: Option<u64>,
    ) -> Result<()> {
        let size = record_len
            .checked_mul(samples_per_buffer)
            .ok_or_else(|| SamplingError::exhausted("sample buffer size overflows"))?;

        let mut state = self.state.lock();

        if state.buf.len() != size {
            let mut buf = Vec::new();
            buf.try_reserve_exact(size).map_err(|e| {
                SamplingError::exhausted(format!("failed to allocate {size} byte sample buffer: {e}"))
            })?;
            buf.resize(size, 0);
            state.buf = buf;
        } else {
            state.buf.fill(0);
        }

        state.offset = 0;
        state.record_len = record_len;
        state.generation += 1;
        state.samples = 0;
        state.max_samples = max_samples;
        state.active = false;
        state.flush_requested = false;
        state.limit_reached = false;

        Ok(())
    }

    pub fn activate(&self) {
        let mut state = self.state.lock();
        state.active = !state.buf.is_empty();
    }

    pub fn deactivate(&self) {
        self.state.lock().active = false;
    }

    /// Mark the buffer for draining, used when the session stops.
    pub fn request_flush(&self) {
        self.state.lock().flush_requested = true;
    }

    /// Hand out one slot of `record_len` bytes.
    pub fn acquire(&self, record_len: usize) -> Acquired {
        let mut state = self.state.lock();

        if !state.active {
            return Acquired::default();
        }

        let end = state.buf.len();
        let next = state.offset + record_len;

        if next > end {
            // not even this record fits, suspend until drained
            state.active = false;
            state.flush_requested = true;
            return Acquired {
                slot: None,
                wake: true,
            };
        }

        let slot = SlotHandle {
            offset: state.offset,
            len: record_len,
            generation: state.generation,
        };

        state.offset = next;
        state.samples += 1;
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let mut wake = false;

        if next == end {
            // exactly full
            state.active = false;
            state.flush_requested = true;
            wake = true;
        }

        if let Some(max) = state.max_samples {
            if state.samples >= max {
                state.active = false;
                state.flush_requested = true;
                state.limit_reached = true;
                wake = true;
            }
        }

        Acquired {
            slot: Some(slot),
            wake,
        }
    }

    /// Copy an encoded record into its slot. A slot from an older
    /// generation (the buffer was released or drained meanwhile) is dropped.
    pub fn commit(&self, slot: SlotHandle, bytes: &[u8]) {
        {
            let mut state = self.state.lock();
            if state.generation == slot.generation && slot.offset + slot.len <= state.buf.len() {
                state.buf[slot.offset..slot.offset + slot.len].copy_from_slice(&bytes[..slot.len]);
            }
        }

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Copy out everything written so far and reset the buffer to empty.
    ///
    /// Consumer side only: this spins until every granted slot has been
    /// committed.
    pub fn drain(&self) -> Vec<u8> {
        loop {
            let mut state = self.state.lock();

            if self.in_flight.load(Ordering::Acquire) != 0 {
                drop(state);
                std::thread::yield_now();
                continue;
            }

            let len = state.offset;
            let data = state.buf[..len].to_vec();
            state.buf[..len].fill(0);
            state.offset = 0;
            state.generation += 1;
            state.flush_requested = false;

            return data;
        }
    }

    /// Re-enable sampling after a drain unless the sample limit was hit.
    /// Returns whether sampling is active again.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();

        if state.limit_reached || state.buf.is_empty() {
            return false;
        }

        if state.offset + state.record_len <= state.buf.len() {
            state.active = true;
        }

        state.active
    }

    /// Free the buffer memory. Outstanding slots become stale.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.buf = Vec::new();
        state.offset = 0;
        state.generation += 1;
        state.active = false;
        state.flush_requested = false;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn flush_requested(&self) -> bool {
        self.state.lock().flush_requested
    }

    pub fn limit_reached(&self) -> bool {
        self.state.lock().limit_reached
    }

    /// Total samples granted since `prepare`.
    pub fn samples(&self) -> u64 {
        self.state.lock().samples
    }

    /// Bytes currently written and not yet drained.
    pub fn pending(&self) -> usize {
        self.state.lock().offset
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: usize = 32;

    fn arena(slots: usize, max: Option<u64>) -> SampleArena {
        let arena = SampleArena::new();
        arena.prepare(LEN, slots, max).unwrap();
        arena.activate();
        arena
    }

    #[test]
    fn inactive_denies() {
        let arena = SampleArena::new();
        arena.prepare(LEN, 4, None).unwrap();
        let got = arena.acquire(LEN);
        assert!(got.slot.is_none());
        assert!(!got.wake);
    }

    #[test]
    fn slots_increase_and_stay_in_bounds() {
        let slots = 16;
        let arena = arena(slots, None);

        let mut last = None;
        let mut granted = 0;

        for _ in 0..100 {
            let got = arena.acquire(LEN);
            let Some(slot) = got.slot else {
                break;
            };

            assert!(slot.offset() <= slots * LEN - LEN);
            if let Some(prev) = last {
                assert!(slot.offset() >= prev + LEN);
            }
            last = Some(slot.offset());
            arena.commit(slot, &[0xab; LEN]);
            granted += 1;
        }

        assert_eq!(granted, slots);
    }

    #[test]
    fn exact_fit_wakes_once() {
        let arena = arena(3, None);

        let mut wakes = 0;
        let mut granted = 0;

        for _ in 0..10 {
            let got = arena.acquire(LEN);
            if got.wake {
                wakes += 1;
            }
            if let Some(slot) = got.slot {
                arena.commit(slot, &[1; LEN]);
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(wakes, 1);
        assert!(!arena.is_active());
        assert!(arena.flush_requested());
    }

    #[test]
    fn overfit_denies_and_wakes() {
        let arena = SampleArena::new();
        // 100 bytes does not hold four 32-byte records
        arena.prepare(25, 4, None).unwrap();
        arena.activate();

        for _ in 0..3 {
            assert!(arena.acquire(LEN).slot.is_some());
        }

        let got = arena.acquire(LEN);
        assert!(got.slot.is_none());
        assert!(got.wake);
        assert!(!arena.is_active());
        assert_eq!(arena.pending(), 96);
    }

    #[test]
    fn max_samples() {
        let arena = arena(100, Some(5));

        let mut granted = 0;
        let mut wakes = Vec::new();
        for _ in 0..8 {
            let got = arena.acquire(LEN);
            wakes.push(got.wake);
            if let Some(slot) = got.slot {
                arena.commit(slot, &[2; LEN]);
                granted += 1;
            }
        }

        assert_eq!(granted, 5);
        assert_eq!(arena.samples(), 5);
        // only the slot that reached the limit wakes the consumer
        assert_eq!(wakes, vec![false, false, false, false, true, false, false, false]);
        assert!(arena.limit_reached());
        assert!(!arena.is_active());
        assert!(!arena.resume());
    }

    #[test]
    fn drain_resets_and_resumes() {
        let arena = arena(2, None);

        for byte in [7u8, 8] {
            let slot = arena.acquire(LEN).slot.unwrap();
            arena.commit(slot, &[byte; LEN]);
        }

        let data = arena.drain();
        assert_eq!(data.len(), 2 * LEN);
        assert_eq!(data[0], 7);
        assert_eq!(data[LEN], 8);
        assert_eq!(arena.pending(), 0);
        assert!(!arena.flush_requested());

        assert!(arena.resume());
        assert!(arena.acquire(LEN).slot.is_some());
        assert_eq!(arena.samples(), 3);
    }

    #[test]
    fn stale_slot_is_dropped() {
        let arena = arena(2, None);
        let slot = arena.acquire(LEN).slot.unwrap();
        arena.release();
        arena.commit(slot, &[9; LEN]);
        assert_eq!(arena.capacity(), 0);
        assert!(arena.drain().is_empty());
    }

    #[test]
    fn concurrent_slots_never_overlap() {
        let arena = std::sync::Arc::new(arena(4000, None));
        let mut threads = Vec::new();

        for t in 0..4u8 {
            let arena = arena.clone();
            threads.push(std::thread::spawn(move || {
                let mut offsets = Vec::new();
                while let Some(slot) = arena.acquire(LEN).slot {
                    arena.commit(slot, &[t; LEN]);
                    offsets.push(slot.offset());
                }
                offsets
            }));
        }

        let mut all: Vec<usize> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();

        assert_eq!(all.len(), 4000);
        for pair in all.windows(2) {
            assert_eq!(pair[1] - pair[0], LEN);
        }
    }
}
