#![forbid(unsafe_code)]

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, StoreError};

/// Furthest an offer may land beyond the gap-free number.
pub const MAX_OFFER_DISTANCE: i64 = 1 << 20;

/// Tracks numbers that complete out of order and publishes the highest number
/// below which nothing is missing, together with the metadata offered with it.
///
/// Offers above the gap-free number are parked in a circular buffer indexed
/// relative to that number; the buffer doubles when an offer lands beyond it,
/// up to [`MAX_OFFER_DISTANCE`] slots.
pub struct OutOfOrderSequence<M: Clone> {
    state: Mutex<SequenceState<M>>,
    advanced: Condvar,
}

struct SequenceState<M> {
    number: i64,
    meta: M,
    highest_ever_seen: i64,
    head: usize,
    slots: Vec<Option<M>>,
}

/// Point-in-time view of a sequence, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceSnapshot {
    /// Highest gap-free number.
    pub highest_gap_free: i64,
    /// Highest number ever offered.
    pub highest_ever_seen: i64,
    /// Numbers offered above the gap-free number, ascending.
    pub pending: Vec<i64>,
}

impl<M: Clone> OutOfOrderSequence<M> {
    /// Creates a sequence whose gap-free number starts at `initial`.
    pub fn new(initial: i64, initial_capacity: usize, initial_meta: M) -> Self {
        Self {
            state: Mutex::new(SequenceState {
                number: initial,
                meta: initial_meta,
                highest_ever_seen: initial,
                head: 0,
                slots: vec![None; initial_capacity.max(1)],
            }),
            advanced: Condvar::new(),
        }
    }

    /// Offers `number`. Returns true only when the gap-free number advanced.
    /// Stale and duplicate offers are ignored and return false. An offer more
    /// than [`MAX_OFFER_DISTANCE`] past the gap-free number is rejected with
    /// [`StoreError::Invalid`].
    pub fn offer(&self, number: i64, meta: M) -> Result<bool> {
        let mut state = self.state.lock();
        if number <= state.number {
            return Ok(false);
        }
        let Some(distance) = state.distance_to(number) else {
            return Err(StoreError::Invalid(format!(
                "offer {number} is more than {MAX_OFFER_DISTANCE} past {}",
                state.number
            )));
        };
        state.highest_ever_seen = state.highest_ever_seen.max(number);
        if distance >= state.slots.len() {
            state.grow(distance + 1);
        }
        let index = state.slot_index(distance);
        if state.slots[index].is_some() {
            return Ok(false);
        }
        if distance > 0 {
            state.slots[index] = Some(meta);
            return Ok(false);
        }
        state.number = number;
        state.meta = meta;
        state.head = (state.head + 1) % state.slots.len();
        loop {
            let head = state.head;
            let Some(next) = state.slots[head].take() else {
                break;
            };
            state.number += 1;
            state.meta = next;
            state.head = (head + 1) % state.slots.len();
        }
        drop(state);
        self.advanced.notify_all();
        Ok(true)
    }

    /// The gap-free number and its metadata, read atomically.
    pub fn get(&self) -> (i64, M) {
        let state = self.state.lock();
        (state.number, state.meta.clone())
    }

    /// The gap-free number alone.
    pub fn highest_gap_free_number(&self) -> i64 {
        self.state.lock().number
    }

    /// Highest number offered so far, gaps or not.
    pub fn highest_ever_seen(&self) -> i64 {
        self.state.lock().highest_ever_seen
    }

    /// Resets the sequence to `number`, dropping every pending offer.
    pub fn set(&self, number: i64, meta: M) {
        let mut state = self.state.lock();
        state.number = number;
        state.meta = meta;
        state.highest_ever_seen = number;
        state.head = 0;
        state.slots.iter_mut().for_each(|slot| *slot = None);
        drop(state);
        self.advanced.notify_all();
    }

    /// Whether `number` was offered (or lies below the gap-free number).
    pub fn seen(&self, number: i64) -> bool {
        let state = self.state.lock();
        if number <= state.number {
            return true;
        }
        match state.distance_to(number) {
            Some(distance) => {
                distance < state.slots.len() && state.slots[state.slot_index(distance)].is_some()
            }
            None => false,
        }
    }

    /// Blocks until the gap-free number reaches `number` or `timeout` passes.
    pub fn wait_for(&self, number: i64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.number < number {
            if self.advanced.wait_until(&mut state, deadline).timed_out() {
                return state.number >= number;
            }
        }
        true
    }

    /// Diagnostic snapshot.
    pub fn snapshot(&self) -> SequenceSnapshot {
        let state = self.state.lock();
        let pending = (0..state.slots.len())
            .filter(|distance| state.slots[state.slot_index(*distance)].is_some())
            .map(|distance| state.number + 1 + distance as i64)
            .collect();
        SequenceSnapshot {
            highest_gap_free: state.number,
            highest_ever_seen: state.highest_ever_seen,
            pending,
        }
    }
}

impl<M> SequenceState<M> {
    /// Slot distance of `number` above the gap-free number, if within bounds.
    fn distance_to(&self, number: i64) -> Option<usize> {
        let distance = number.checked_sub(self.number)?.checked_sub(1)?;
        (0..MAX_OFFER_DISTANCE)
            .contains(&distance)
            .then_some(distance as usize)
    }

    fn slot_index(&self, distance: usize) -> usize {
        (self.head + distance) % self.slots.len()
    }

    fn grow(&mut self, required: usize) {
        let mut capacity = self.slots.len();
        while capacity < required {
            capacity *= 2;
        }
        let len = self.slots.len();
        let mut slots: Vec<Option<M>> = Vec::with_capacity(capacity);
        for distance in 0..len {
            let index = (self.head + distance) % len;
            slots.push(self.slots[index].take());
        }
        slots.resize_with(capacity, || None);
        self.slots = slots;
        self.head = 0;
    }
}

impl<M: Clone + fmt::Debug> fmt::Debug for OutOfOrderSequence<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (number, meta) = self.get();
        let snapshot = self.snapshot();
        f.debug_struct("OutOfOrderSequence")
            .field("number", &number)
            .field("meta", &meta)
            .field("pending", &snapshot.pending)
            .finish()
    }
}
