//! Thread-safe synchronizer shared by the receiver and the player
//!
//! The receiver never touches the lock: it pushes into a bounded drop-oldest
//! intake queue. The player drains the intake and polls under one mutex, so
//! all jitter buffer state changes happen on the playback thread.

use parking_lot::Mutex;

use super::jitter_buffer::Synchronizer;
use super::{ChunkIntake, PlayoutSource, ReassembledChunk, SyncStats};
use crate::audio::buffer::{AudioChunk, ChunkQueue};
use crate::audio::device::StreamSpec;
use crate::clock::MediaClock;
use crate::config::SyncConfig;
use crate::error::SyncError;

pub struct SharedSynchronizer {
    inner: Mutex<Synchronizer>,
    intake: ChunkQueue<ReassembledChunk>,
    clock: MediaClock,
}

impl SharedSynchronizer {
    pub fn new(config: SyncConfig, spec: &StreamSpec, clock: MediaClock) -> Self {
        let intake = ChunkQueue::new(config.intake_capacity);
        Self {
            inner: Mutex::new(Synchronizer::new(config, spec)),
            intake,
            clock,
        }
    }

    /// Queue a chunk for the jitter buffer. Never blocks.
    pub fn ingest(&self, chunk: ReassembledChunk) {
        self.intake.push(chunk);
    }

    /// Drain pending arrivals and release the chunk for this period
    pub fn poll(&self) -> Option<AudioChunk> {
        let mut sync = self.inner.lock();
        self.drain(&mut sync);
        sync.poll(self.clock.now_us())
    }

    fn drain(&self, sync: &mut Synchronizer) {
        while let Some(arrival) = self.intake.try_pop() {
            sync.ingest(
                arrival.chunk,
                arrival.sequence,
                arrival.timestamp_us,
                arrival.arrival_us,
            );
        }
    }

    pub fn current_stats(&self) -> SyncStats {
        let mut stats = self.inner.lock().current_stats();
        stats.intake_overflow = self.intake.dropped();
        stats
    }

    pub fn force_target_depth(&self, depth: usize) -> Result<(), SyncError> {
        self.inner.lock().force_target_depth(depth)
    }

    pub fn reset_measurements(&self) {
        self.inner.lock().reset_measurements();
    }

    /// Stop releasing audio. Pending arrivals are discarded.
    pub fn stop(&self) {
        self.inner.lock().stop();
        self.intake.clear();
    }

    pub fn clock(&self) -> MediaClock {
        self.clock
    }
}

impl ChunkIntake for SharedSynchronizer {
    fn push(&self, chunk: ReassembledChunk) {
        self.ingest(chunk);
    }
}

impl PlayoutSource for SharedSynchronizer {
    fn poll(&self) -> Option<AudioChunk> {
        SharedSynchronizer::poll(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncState;
    use std::sync::Arc;

    fn spec() -> StreamSpec {
        StreamSpec {
            sample_rate: 1000,
            channels: 1,
            chunk_frames: 10,
        }
    }

    fn arrival(clock: &MediaClock, sequence: u32) -> ReassembledChunk {
        let now = clock.now_us();
        ReassembledChunk {
            chunk: AudioChunk::new(vec![sequence as i16; 10]),
            sequence,
            timestamp_us: now,
            arrival_us: now,
        }
    }

    #[test]
    fn test_intake_feeds_playout() {
        let clock = MediaClock::new();
        let sync = SharedSynchronizer::new(SyncConfig::default(), &spec(), clock);
        for seq in [0, 2, 1] {
            sync.ingest(arrival(&clock, seq));
        }
        let played: Vec<_> = (0..3)
            .map(|_| sync.poll().map(|c| c.samples()[0]))
            .collect();
        assert_eq!(played, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(sync.current_stats().played, 3);
    }

    #[test]
    fn test_intake_overflow_counted() {
        let clock = MediaClock::new();
        let config = SyncConfig {
            intake_capacity: 4,
            ..SyncConfig::default()
        };
        let sync = SharedSynchronizer::new(config, &spec(), clock);
        for seq in 0..6 {
            sync.ingest(arrival(&clock, seq));
        }
        assert_eq!(sync.current_stats().intake_overflow, 2);
        assert_eq!(sync.poll().map(|c| c.samples()[0]), Some(2));
    }

    #[test]
    fn test_concurrent_ingest_and_poll() {
        let clock = MediaClock::new();
        let sync = Arc::new(SharedSynchronizer::new(SyncConfig::default(), &spec(), clock));

        let producer = {
            let sync = sync.clone();
            std::thread::spawn(move || {
                for seq in 0..50 {
                    ChunkIntake::push(sync.as_ref(), arrival(&clock, seq));
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            })
        };

        let source: Arc<dyn PlayoutSource> = sync.clone();
        let mut played = Vec::new();
        for _ in 0..200 {
            if let Some(chunk) = source.poll() {
                played.push(chunk.samples()[0]);
            }
            std::thread::sleep(std::time::Duration::from_micros(500));
        }
        producer.join().unwrap();

        assert!(!played.is_empty());
        assert!(played.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_stop() {
        let clock = MediaClock::new();
        let sync = SharedSynchronizer::new(SyncConfig::default(), &spec(), clock);
        sync.ingest(arrival(&clock, 0));
        sync.stop();
        assert_eq!(sync.poll(), None);
        assert_eq!(sync.current_stats().state, SyncState::Stopped);
    }
}
