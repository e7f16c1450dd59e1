//! Fragment reassembly with bounded memory
//!
//! Fragments are collected per sequence until every index has arrived, then
//! concatenated in index order. State is bounded three ways:
//!
//! - at most `max_inflight` incomplete sequences (oldest evicted as lost)
//! - incomplete sequences expire after `timeout` (caller-driven `sweep`)
//! - finished sequences are remembered in a fixed-size window so duplicates
//!   and stragglers can be recognized
//!
//! Sequences skipped entirely get an empty placeholder entry when the gap is
//! small, so they expire through the same timeout and are counted as lost.
//! Larger gaps are counted as lost immediately.
//!
//! Not thread-safe; owned by the receive thread.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::codec::packet::Packet;
use crate::codec::sequence::SequenceUnwrapper;

/// Finished sequences remembered for duplicate detection
const WINDOW_CAPACITY: usize = 256;

/// A jump this far from the highest sequence means the sender restarted
const RESTART_DISTANCE: u64 = 4 * WINDOW_CAPACITY as u64;

/// A fully reassembled chunk payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChunk {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub payload: Bytes,
}

/// Result of feeding one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The packet completed its chunk
    Complete(CompletedChunk),
    /// Stored; more fragments needed
    Pending,
    /// Packet for an already completed chunk. `counted` is true only for the
    /// first such packet per sequence.
    Duplicate { counted: bool },
    /// A fragment index already received for an incomplete chunk
    DuplicateFragment,
    /// Packet for a sequence already given up on
    Late,
    /// Fragment count disagrees with earlier fragments of the same sequence
    Malformed,
}

#[derive(Debug)]
struct Entry {
    /// None until a fragment arrives (gap placeholder)
    fragment_count: Option<u16>,
    slots: Vec<Option<Bytes>>,
    received: usize,
    timestamp_us: u64,
    first_seen: Instant,
}

impl Entry {
    fn placeholder(now: Instant) -> Self {
        Self {
            fragment_count: None,
            slots: Vec::new(),
            received: 0,
            timestamp_us: 0,
            first_seen: now,
        }
    }

    fn assemble(self) -> Bytes {
        let len = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for part in self.slots.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        out.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finished {
    Completed { duplicate_counted: bool },
    Lost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub inflight: usize,
    pub placeholders: usize,
    pub remembered: usize,
}

pub struct Reassembler {
    max_inflight: usize,
    timeout: Duration,
    unwrapper: SequenceUnwrapper,
    entries: BTreeMap<u64, Entry>,
    finished: BTreeMap<u64, Finished>,
    highest: Option<u64>,
    lost: u64,
}

impl Reassembler {
    pub fn new(max_inflight: usize, timeout: Duration) -> Self {
        Self {
            max_inflight: max_inflight.max(1),
            timeout,
            unwrapper: SequenceUnwrapper::new(),
            entries: BTreeMap::new(),
            finished: BTreeMap::new(),
            highest: None,
            lost: 0,
        }
    }

    pub fn insert(&mut self, packet: Packet, now: Instant) -> InsertOutcome {
        let seq = self.unwrapper.unwrap(packet.sequence);

        if let Some(state) = self.finished.get_mut(&seq) {
            return match state {
                Finished::Completed { duplicate_counted } => {
                    let counted = !*duplicate_counted;
                    *duplicate_counted = true;
                    InsertOutcome::Duplicate { counted }
                }
                Finished::Lost => InsertOutcome::Late,
            };
        }

        match self.highest {
            None => self.highest = Some(seq),
            Some(highest) if seq.abs_diff(highest) > RESTART_DISTANCE => {
                tracing::info!(
                    "Sequence jumped from {} to {}, treating as sender restart",
                    highest as u32,
                    packet.sequence
                );
                self.restart();
                return self.insert(packet, now);
            }
            Some(highest) if seq > highest => {
                self.open_gap(highest, seq, now);
                self.highest = Some(seq);
            }
            Some(_) => {
                if !self.entries.contains_key(&seq) {
                    return InsertOutcome::Late;
                }
            }
        }

        let outcome = self.fill(seq, packet, now);
        self.enforce_capacity();
        outcome
    }

    /// Record skipped sequences between `highest` and `seq`
    fn open_gap(&mut self, highest: u64, seq: u64, now: Instant) {
        let gap = seq - highest - 1;
        if gap == 0 {
            return;
        }
        if gap as usize <= self.max_inflight {
            for missing in highest + 1..seq {
                self.entries.insert(missing, Entry::placeholder(now));
            }
        } else {
            tracing::debug!("Gap of {} chunks, counted lost", gap);
            self.lost += gap;
        }
    }

    fn fill(&mut self, seq: u64, packet: Packet, now: Instant) -> InsertOutcome {
        let entry = self
            .entries
            .entry(seq)
            .or_insert_with(|| Entry::placeholder(now));

        match entry.fragment_count {
            None => {
                entry.fragment_count = Some(packet.fragment_count);
                entry.slots = vec![None; packet.fragment_count as usize];
                entry.timestamp_us = packet.timestamp_us;
            }
            Some(count) if count != packet.fragment_count => return InsertOutcome::Malformed,
            Some(_) => {}
        }

        let slot = &mut entry.slots[packet.fragment_index as usize];
        if slot.is_some() {
            return InsertOutcome::DuplicateFragment;
        }
        *slot = Some(packet.payload);
        entry.received += 1;

        if entry.received < entry.slots.len() {
            return InsertOutcome::Pending;
        }

        let Some(entry) = self.entries.remove(&seq) else {
            return InsertOutcome::Pending;
        };
        let timestamp_us = entry.timestamp_us;
        self.remember(seq, Finished::Completed { duplicate_counted: false });
        InsertOutcome::Complete(CompletedChunk {
            sequence: packet.sequence,
            timestamp_us,
            payload: entry.assemble(),
        })
    }

    fn enforce_capacity(&mut self) {
        while self.entries.len() > self.max_inflight {
            if let Some((seq, _)) = self.entries.pop_first() {
                self.remember(seq, Finished::Lost);
                self.lost += 1;
            }
        }
    }

    fn remember(&mut self, seq: u64, state: Finished) {
        self.finished.insert(seq, state);
        while self.finished.len() > WINDOW_CAPACITY {
            self.finished.pop_first();
        }
    }

    /// Drop all state; the next packet starts a fresh stream
    fn restart(&mut self) {
        self.entries.clear();
        self.finished.clear();
        self.unwrapper.reset();
        self.highest = None;
    }

    /// Expire incomplete chunks and placeholders older than the timeout.
    /// Returns how many were expired; they are also added to the lost count.
    pub fn sweep(&mut self, now: Instant) -> u64 {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.first_seen) >= self.timeout)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &expired {
            self.entries.remove(seq);
            self.remember(*seq, Finished::Lost);
        }
        self.lost += expired.len() as u64;
        expired.len() as u64
    }

    /// Chunks lost since the last call
    pub fn take_lost(&mut self) -> u64 {
        std::mem::take(&mut self.lost)
    }

    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            inflight: self.entries.len(),
            placeholders: self
                .entries
                .values()
                .filter(|e| e.fragment_count.is_none())
                .count(),
            remembered: self.finished.len(),
        }
    }
}
