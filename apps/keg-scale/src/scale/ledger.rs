//! Fixed-capacity ring buffer of scale measurements.
//!
//! Offsets are relative to the newest sample: offset 0 is the most recent
//! measurement, offset `k` the k-th previous one. Slots that were never
//! written are never handed out as data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Logical sequence number, strictly increasing across buffer wraps.
    pub seq: u64,
    /// Physical slot at recording time. Not stable once the buffer wraps.
    pub slot_index: usize,
    /// Grams.
    pub weight: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct Ledger {
    slots: Vec<Option<Measurement>>,
    write_cursor: Option<usize>,
    valid_count: usize,
    last_seq: u64,
}

impl Ledger {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            write_cursor: None,
            valid_count: 0,
            last_seq: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn valid_count(&self) -> usize {
        self.valid_count
    }

    /// `recorded_at` never moves backwards: a timestamp older than the newest sample is
    /// raised to it, so seq order and time order agree.
    pub(crate) fn append(&mut self, weight: f64, recorded_at: DateTime<Utc>) -> Measurement {
        let seq = self.last_seq.saturating_add(1);
        let recorded_at = match self.read_relative(0) {
            Some(newest) => recorded_at.max(newest.recorded_at),
            None => recorded_at,
        };
        self.write(seq, weight, recorded_at)
    }

    fn write(&mut self, seq: u64, weight: f64, recorded_at: DateTime<Utc>) -> Measurement {
        let capacity = self.capacity();
        let slot_index = match self.write_cursor {
            Some(cursor) => (cursor + 1) % capacity,
            None => 0,
        };
        let measurement = Measurement {
            seq,
            slot_index,
            weight,
            recorded_at,
        };
        self.slots[slot_index] = Some(measurement);
        self.write_cursor = Some(slot_index);
        self.last_seq = seq;
        if self.valid_count < capacity {
            self.valid_count += 1;
        }
        measurement
    }

    /// Pre-seeds the buffer with stored measurements. Stores may hand them back in arrival
    /// order, which can differ from seq order, so they are replayed sorted by seq.
    /// Only the newest `capacity` survive; sequence numbering continues after the newest seq seen.
    pub(crate) fn restore<I>(&mut self, measurements: I) -> usize
    where
        I: IntoIterator<Item = Measurement>,
    {
        let mut measurements: Vec<Measurement> = measurements.into_iter().collect();
        measurements.sort_by_key(|m| m.seq);

        let mut restored = 0usize;
        for stored in measurements {
            if !stored.weight.is_finite() {
                continue;
            }
            let seq = stored.seq.max(self.last_seq.saturating_add(1));
            self.write(seq, stored.weight, stored.recorded_at);
            restored += 1;
        }
        restored.min(self.capacity())
    }

    fn physical_index(&self, offset: usize) -> Option<usize> {
        let cursor = self.write_cursor?;
        let capacity = self.capacity();
        Some((cursor + capacity - offset % capacity) % capacity)
    }

    pub(crate) fn read_relative(&self, offset: usize) -> Option<Measurement> {
        if offset >= self.valid_count || offset >= self.capacity() {
            return None;
        }
        self.physical_index(offset).and_then(|idx| self.slots[idx])
    }

    /// True when the newest `n` samples are all real. Always false past capacity.
    pub(crate) fn has_last_n(&self, n: usize) -> bool {
        n <= self.valid_count
    }

    /// Sums the newest `min(n, capacity)` slots. Never-written slots count as zero,
    /// so callers that need real samples only must check [`Ledger::has_last_n`] first.
    pub(crate) fn sum_last_n(&self, n: usize) -> f64 {
        let n = n.min(self.capacity());
        (0..n)
            .filter_map(|offset| self.physical_index(offset))
            .filter_map(|idx| self.slots[idx])
            .map(|measurement| measurement.weight)
            .sum()
    }

    pub(crate) fn average_last_n(&self, n: usize) -> f64 {
        let n = n.min(self.capacity());
        if n == 0 {
            return 0.0;
        }
        self.sum_last_n(n) / n as f64
    }

    /// Valid measurements, newest first.
    pub(crate) fn iter_recent(&self) -> impl Iterator<Item = Measurement> + '_ {
        (0..self.valid_count).filter_map(move |offset| self.read_relative(offset))
    }
}
