//! Playback synchronization
//!
//! The receiver hands complete chunks to a [`ChunkIntake`]; the player pulls
//! one chunk per period from a [`PlayoutSource`]. [`SharedSynchronizer`]
//! implements both around a single adaptive jitter buffer.

pub mod history;
pub mod jitter_buffer;
pub mod quality;
pub mod shared;

use serde::{Deserialize, Serialize};

use crate::audio::buffer::AudioChunk;

pub use jitter_buffer::{IngestOutcome, Synchronizer};
pub use shared::SharedSynchronizer;

/// A reassembled chunk on its way from the receiver to the jitter buffer
#[derive(Debug, Clone)]
pub struct ReassembledChunk {
    pub chunk: AudioChunk,
    pub sequence: u32,
    /// Sender's capture time, media clock microseconds
    pub timestamp_us: u64,
    /// Local arrival time, media clock microseconds
    pub arrival_us: u64,
}

/// Receiving end of the receiver → synchronizer hand-off. Must not block.
pub trait ChunkIntake: Send + Sync {
    fn push(&self, chunk: ReassembledChunk);
}

/// What the player polls once per chunk period
pub trait PlayoutSource: Send + Sync {
    /// The next chunk to play, or `None` to play silence
    fn poll(&self) -> Option<AudioChunk>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Filling up to the target depth; nothing is released
    #[default]
    Priming,
    Steady,
    /// High jitter or latency; depth grows every adaptation tick
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LinkQuality {
    #[default]
    Good,
    Fair,
    Poor,
}

/// Jitter buffer telemetry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStats {
    pub state: SyncState,
    pub quality: LinkQuality,
    /// Mean one-way latency over recent chunks
    pub latency_ms: f64,
    /// Mean latency variation between consecutive chunks
    pub jitter_ms: f64,
    /// Fraction of recent chunks that never reached playout
    pub loss_rate: f64,
    pub buffer_depth: usize,
    pub target_depth: usize,

    pub ingested: u64,
    pub played: u64,
    /// Fills substituted for missing chunks
    pub concealed: u64,
    pub underruns: u64,
    pub dropped_stale: u64,
    pub dropped_late: u64,
    pub dropped_overflow: u64,
    pub duplicates: u64,
    /// Sequences never received by the time they were due
    pub missing: u64,
    pub depth_changes: u64,
    /// Fills inserted to let the buffer grow
    pub stretched: u64,
    /// Chunks skipped to let the buffer shrink
    pub trimmed: u64,
    /// Transitions into the degraded state
    pub quality_degradations: u64,
    pub resyncs: u64,
    /// Chunks evicted from the intake queue before ingest
    pub intake_overflow: u64,
}
