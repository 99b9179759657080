//! Per-device reorder & gap engine (`spec.md` §4.4).
//!
//! Arrival-order, CRC-valid DATA packets go in; a gap-accounted,
//! ascending-sequence stream of flushed packets comes out. Sequence
//! comparisons use the shorter-distance rule on the 16-bit wraparound, per
//! `spec.md` §4.4 Edge cases and §9's open question (b): all pending keys
//! are tracked relative to a fixed per-session anchor (`base`), chosen as
//! the first sequence number seen, so ordinary `u32` arithmetic on
//! `seq.wrapping_sub(base)` gives the correct ordering as long as the live
//! window never spans a full 16-bit cycle — the same assumption `spec.md`
//! states explicitly.
//!
//! Loss accounting (`lost_packets`) tracks gaps across the *entire* insert
//! sequence, not just within one flushed chunk: a run that is internally
//! contiguous can still sit right after a hole left by the previous flush
//! (e.g. a clean 30-packet run, a 30-sequence gap, then another clean
//! 30-packet run — each chunk looks gap-free on its own). `next_expected`
//! remembers the unwrapped key that should follow the last flushed run so
//! that boundary gap is still counted.
use std::collections::BTreeMap;

/// Default threshold at which the reorder buffer flushes its oldest run.
pub const DEFAULT_MIN_BUFFER_SIZE: usize = 90;
/// Default number of lowest-keyed entries moved per flush.
pub const DEFAULT_CHUNK_SIZE: usize = 30;

/// Outcome of inserting one packet into the reorder buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Accepted into the pending map (fresh sequence or overwritten duplicate).
    Accepted,
    /// Rejected: older than every currently pending sequence.
    LateDrop,
}

/// One packet released from the reorder buffer, in ascending sequence order.
#[derive(Debug, Clone)]
pub struct FlushedPacket {
    pub seq: u16,
    pub body: Vec<u8>,
}

/// Per-device bounded reorder map plus loss accounting (`spec.md` §4.4).
pub struct ReorderBuffer {
    min_buffer_size: usize,
    chunk_size: usize,
    base: Option<u16>,
    // unwrapped distance from `base` -> (original sequence, verified body)
    pending: BTreeMap<u32, (u16, Vec<u8>)>,
    lost_packets: u64,
    late_drops: u64,
    // unwrapped key expected immediately after the last flushed run, so a
    // gap straddling two flush chunks (the low end of one chunk, the high
    // end of the previous) is still counted — see `take_run`.
    next_expected: Option<u32>,
}

impl ReorderBuffer {
    pub fn new(min_buffer_size: usize, chunk_size: usize) -> Self {
        Self {
            min_buffer_size,
            chunk_size,
            base: None,
            pending: BTreeMap::new(),
            lost_packets: 0,
            late_drops: 0,
            next_expected: None,
        }
    }

    fn unwrap_seq(&self, seq: u16) -> u32 {
        let base = self.base.unwrap_or(seq);
        seq.wrapping_sub(base) as u32
    }

    /// Number of packets currently pending in the map.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    pub fn late_drops(&self) -> u64 {
        self.late_drops
    }

    /// Resets all counters and pending state for a fresh sampling session
    /// (`spec.md` §3 Lifecycles: sequence numbers restart at 0).
    pub fn reset(&mut self) {
        self.base = None;
        self.pending.clear();
        self.lost_packets = 0;
        self.late_drops = 0;
        self.next_expected = None;
    }

    /// Inserts a verified DATA body at sequence `seq` (§4.4 steps 1-2).
    /// Duplicates overwrite silently; the caller should follow with
    /// [`Self::ready_to_flush`]/[`Self::take_flush_chunk`] to drain past the
    /// threshold.
    pub fn insert(&mut self, seq: u16, body: Vec<u8>) -> InsertOutcome {
        if self.base.is_none() {
            self.base = Some(seq);
        }
        let key = self.unwrap_seq(seq);

        if let Some((&min_key, _)) = self.pending.iter().next() {
            if key < min_key {
                self.late_drops += 1;
                return InsertOutcome::LateDrop;
            }
        }

        self.pending.insert(key, (seq, body));
        InsertOutcome::Accepted
    }

    /// True once the pending map has reached the flush threshold (§4.4 step 3).
    pub fn ready_to_flush(&self) -> bool {
        self.pending.len() >= self.min_buffer_size
    }

    /// Flushes the `chunk_size` lowest-keyed pending entries in ascending
    /// order, crediting `lost_packets` with any sequence numbers the flushed
    /// run skips — including a gap that falls exactly on the boundary with
    /// the previously flushed run.
    pub fn take_flush_chunk(&mut self) -> Vec<FlushedPacket> {
        self.take_run(self.chunk_size)
    }

    /// Drains every pending entry in ascending order, counting gaps across
    /// the whole drained run (`spec.md` §4.4 Drain on stop).
    pub fn flush_all(&mut self) -> Vec<FlushedPacket> {
        let n = self.pending.len();
        self.take_run(n)
    }

    fn take_run(&mut self, n: usize) -> Vec<FlushedPacket> {
        if n == 0 || self.pending.is_empty() {
            return Vec::new();
        }
        let keys: Vec<u32> = self.pending.keys().take(n).copied().collect();
        let lo = *keys.first().unwrap();
        let hi = *keys.last().unwrap();
        let count = keys.len() as u32;

        // Gap against the previous flush: if this run's lowest key doesn't
        // pick up right where the last one left off, the keys in between
        // were skipped entirely and never appeared as an internal gap in
        // either run.
        if let Some(expected) = self.next_expected {
            if lo > expected {
                self.lost_packets += (lo - expected) as u64;
            }
        }
        // Gap inside this run.
        if hi > lo + count - 1 {
            self.lost_packets += (hi - (lo + count - 1)) as u64;
        }
        self.next_expected = Some(hi + 1);

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let (seq, body) = self.pending.remove(&key).expect("key came from this map");
            out.push(FlushedPacket { seq, body });
        }
        out
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BUFFER_SIZE, DEFAULT_CHUNK_SIZE)
    }
}
