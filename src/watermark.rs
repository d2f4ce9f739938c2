// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watermark Processor (spec.md §4.8): per-origin monotonic sequence
//! tracking, global watermark = min across origins.
//!
//! Grounded on the teacher's `CommitVoteMonitor`: a `Mutex`-guarded
//! per-source cursor, updated on every observation, with the aggregate
//! (there: quorum commit index; here: global watermark) recomputed fresh
//! on each call rather than maintained incrementally. The teacher tracks
//! one cursor per fixed committee member known at construction; origins
//! here are unbounded and register lazily on first `update`.
//!
//! spec.md §9 leaves the exact interaction between `chunk` and
//! `last_chunk` for a single `sequence_number` unresolved ("must be
//! recovered from the control plane owner"). This implementation does not
//! guess at intra-sequence chunk semantics: it treats a `SequenceData`'s
//! `ts` as authoritative only once its `last_chunk` has been observed, and
//! coalesces purely on contiguous `seq` order, ignoring `chunk` ordering
//! within a `seq`. See DESIGN.md.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

pub type OriginId = u64;

/// One observation in a per-origin sequence, coalesced from a tuple
/// buffer's `(sequence_number, chunk_number, last_chunk)` header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceData {
    pub seq: u64,
    pub chunk: u32,
    pub last_chunk: bool,
}

struct OriginState {
    /// Completed sequences (their final chunk observed) not yet folded
    /// into `cursor_ts` because a lower `seq` is still outstanding.
    pending: BTreeMap<u64, u64>,
    next_expected_seq: u64,
    cursor_ts: u64,
}

impl OriginState {
    fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_expected_seq: 0,
            cursor_ts: 0,
        }
    }

    fn observe(&mut self, sd: SequenceData, ts: u64) {
        if !sd.last_chunk {
            return;
        }
        if sd.seq < self.next_expected_seq {
            return; // duplicate/retired, already folded into the cursor
        }
        self.pending.insert(sd.seq, ts);
        while let Some(&pending_ts) = self.pending.get(&self.next_expected_seq) {
            self.cursor_ts = pending_ts;
            self.pending.remove(&self.next_expected_seq);
            self.next_expected_seq += 1;
        }
    }
}

/// Tracks, per origin, the highest ts below which no further tuples are
/// expected, and exposes the minimum across all registered origins.
pub struct WatermarkProcessor {
    origins: Mutex<HashMap<OriginId, OriginState>>,
}

impl WatermarkProcessor {
    pub fn new() -> Self {
        Self {
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an origin with a zero cursor so it participates in the
    /// global minimum even before its first observation.
    pub fn register_origin(&self, origin: OriginId) {
        self.origins.lock().entry(origin).or_insert_with(OriginState::new);
    }

    /// Folds one observation into `origin`'s cursor and returns the new
    /// global watermark (min cursor across every registered origin).
    pub fn update(&self, origin: OriginId, sd: SequenceData, ts: u64) -> u64 {
        let mut origins = self.origins.lock();
        origins.entry(origin).or_insert_with(OriginState::new).observe(sd, ts);
        origins.values().map(|s| s.cursor_ts).min().unwrap_or(0)
    }

    pub fn global_watermark(&self) -> u64 {
        self.origins.lock().values().map(|s| s.cursor_ts).min().unwrap_or(0)
    }

    pub fn origin_watermark(&self, origin: OriginId) -> Option<u64> {
        self.origins.lock().get(&origin).map(|s| s.cursor_ts)
    }

    /// `[n_origins][ for each origin: origin_id, next_expected_seq,
    /// cursor_ts, n_pending, [per pending: seq, ts]* ]`, all little-endian
    /// u64 (spec.md §4.8 "Serialization format").
    pub fn checkpoint(&self) -> Vec<u8> {
        let origins = self.origins.lock();
        let mut out = Vec::new();
        out.extend_from_slice(&(origins.len() as u64).to_le_bytes());
        for (origin_id, state) in origins.iter() {
            out.extend_from_slice(&origin_id.to_le_bytes());
            out.extend_from_slice(&state.next_expected_seq.to_le_bytes());
            out.extend_from_slice(&state.cursor_ts.to_le_bytes());
            out.extend_from_slice(&(state.pending.len() as u64).to_le_bytes());
            for (seq, ts) in &state.pending {
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(&ts.to_le_bytes());
            }
        }
        out
    }

    pub fn restore(bytes: &[u8]) -> Option<Self> {
        let mut cursor = 0usize;
        let read_u64 = |bytes: &[u8], cursor: &mut usize| -> Option<u64> {
            let v = u64::from_le_bytes(bytes.get(*cursor..*cursor + 8)?.try_into().ok()?);
            *cursor += 8;
            Some(v)
        };

        let n_origins = read_u64(bytes, &mut cursor)?;
        let mut origins = HashMap::with_capacity(n_origins as usize);
        for _ in 0..n_origins {
            let origin_id = read_u64(bytes, &mut cursor)?;
            let next_expected_seq = read_u64(bytes, &mut cursor)?;
            let cursor_ts = read_u64(bytes, &mut cursor)?;
            let n_pending = read_u64(bytes, &mut cursor)?;
            let mut pending = BTreeMap::new();
            for _ in 0..n_pending {
                let seq = read_u64(bytes, &mut cursor)?;
                let ts = read_u64(bytes, &mut cursor)?;
                pending.insert(seq, ts);
            }
            origins.insert(
                origin_id,
                OriginState {
                    pending,
                    next_expected_seq,
                    cursor_ts,
                },
            );
        }
        Some(Self {
            origins: Mutex::new(origins),
        })
    }
}

impl Default for WatermarkProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last(seq: u64) -> SequenceData {
        SequenceData {
            seq,
            chunk: 0,
            last_chunk: true,
        }
    }

    #[test]
    fn cursor_advances_only_through_contiguous_sequences() {
        let wm = WatermarkProcessor::new();
        assert_eq!(wm.update(1, last(0), 10), 10);
        // seq 2 arrives before seq 1: cursor must not jump ahead.
        assert_eq!(wm.update(1, last(2), 30), 10);
        assert_eq!(wm.update(1, last(1), 20), 30);
    }

    #[test]
    fn global_watermark_is_the_minimum_across_origins() {
        let wm = WatermarkProcessor::new();
        wm.update(1, last(0), 100);
        assert_eq!(wm.global_watermark(), 0); // origin 2 not yet registered/observed
        wm.register_origin(2);
        assert_eq!(wm.global_watermark(), 0);
        wm.update(2, last(0), 40);
        assert_eq!(wm.global_watermark(), 40);
    }

    #[test]
    fn non_terminal_chunks_do_not_advance_the_cursor() {
        let wm = WatermarkProcessor::new();
        let mid_chunk = SequenceData {
            seq: 0,
            chunk: 0,
            last_chunk: false,
        };
        assert_eq!(wm.update(1, mid_chunk, 999), 0);
        assert_eq!(wm.update(1, last(0), 5), 5);
    }

    #[test]
    fn checkpoint_round_trips() {
        let wm = WatermarkProcessor::new();
        wm.update(1, last(0), 10);
        wm.update(1, last(2), 30); // out of order, stays pending
        let bytes = wm.checkpoint();
        let restored = WatermarkProcessor::restore(&bytes).unwrap();
        assert_eq!(restored.global_watermark(), 10);
        assert_eq!(restored.update(1, last(1), 20), 30);
    }
}
