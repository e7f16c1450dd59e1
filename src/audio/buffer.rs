//! Audio chunks and the bounded queues that carry them between threads
//!
//! Queues never block the producer: when full, the oldest entry is evicted
//! and counted. This keeps device callbacks and the receive loop independent
//! of a slow consumer.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One fixed-size block of signed 16-bit mono samples.
///
/// Immutable once built; clones share the sample storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Arc<[i16]>,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    /// A chunk of digital silence
    pub fn silence(frames: usize) -> Self {
        Self::new(vec![0; frames])
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of frames (mono: one sample per frame)
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Chunk duration in microseconds
    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.len() as u64 * 1_000_000) / sample_rate.max(1) as u64
    }

    /// Peak absolute amplitude
    pub fn peak(&self) -> u16 {
        self.samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    /// RMS level normalized to 0.0..=1.0
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        ((sum / self.samples.len() as f64).sqrt() / i16::MAX as f64).min(1.0) as f32
    }

    /// RMS level in dBFS, floored at -96 dB
    pub fn level_db(&self) -> f32 {
        let rms = self.rms();
        if rms > 0.0 {
            (20.0 * rms.log10()).max(-96.0)
        } else {
            -96.0
        }
    }

    /// True when no sample reaches `threshold`
    pub fn is_silent(&self, threshold: i16) -> bool {
        self.peak() < threshold.unsigned_abs()
    }
}

/// A chunk fresh from the input device
#[derive(Debug, Clone)]
pub struct CapturedChunk {
    pub chunk: AudioChunk,
    /// Capture time, media clock microseconds
    pub timestamp_us: u64,
    /// Advisory: peak amplitude was below the silence threshold
    pub silent: bool,
}

/// Bounded multi-thread queue with drop-oldest overflow
pub struct ChunkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: AtomicU64,
}

impl<T> ChunkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an item, evicting the oldest one if the queue is full.
    /// Returns false if something had to be dropped.
    pub fn push(&self, item: T) -> bool {
        let mut item = item;
        let mut evicted = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return !evicted,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted = true;
                    }
                    item = back;
                }
                // Both ends live in self, so the channel cannot disconnect
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Pop, waiting up to `timeout` for an item
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Items evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything currently queued
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}
