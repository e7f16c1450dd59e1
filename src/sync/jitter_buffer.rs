//! Adaptive jitter buffer
//!
//! Holds reassembled chunks keyed by unwrapped sequence and releases one per
//! `poll`, lowest sequence first. The buffer is single-threaded and takes the
//! current media time as an argument, so adaptation and quality tracking are
//! deterministic functions of the calls made on it.
//!
//! ```text
//!            underrun
//!        ┌──────────────┐
//!        ▼              │
//!   PRIMING ──────▶ STEADY ◀────▶ DEGRADED      (any) ──stop──▶ STOPPED
//!        ▲   depth ≥ min     jitter / latency
//!        │                   above limits
//!        └── sequence restart
//! ```
//!
//! Depth adaptation runs every `adaptation_interval_ms` of media time:
//! the target follows `round(jitter / period) + margin`, one slot per tick.
//! While degraded the target grows every tick regardless. Either way it stays
//! within `[min_buffer_size, ceiling]`, where the ceiling is the smaller of
//! `max_buffer_size` and the number of periods that fit in
//! `max_acceptable_latency_ms`. A deeper buffer would only hold chunks that
//! go stale before they are played.

use std::collections::BTreeMap;

use super::history::SampleHistory;
use super::quality::{classify, LossWindow};
use super::{LinkQuality, SyncState, SyncStats};
use crate::audio::buffer::AudioChunk;
use crate::audio::device::StreamSpec;
use crate::codec::sequence::SequenceUnwrapper;
use crate::config::{Concealment, SyncConfig};
use crate::error::SyncError;

const LATENCY_HISTORY: usize = 100;
const JITTER_HISTORY: usize = 50;

/// Sequence distance, in buffer windows, treated as a sender restart
const RESTART_WINDOWS: u64 = 4;

/// What happened to an ingested chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Buffered,
    /// Older than the maximum acceptable latency
    DroppedStale,
    /// Its slot has already been played or concealed
    DroppedLate,
    /// Evicted at once because the buffer was full and it was the oldest
    DroppedOverflow,
    Duplicate,
    Stopped,
}

#[derive(Debug, Clone)]
struct Buffered {
    chunk: AudioChunk,
    timestamp_us: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    ingested: u64,
    played: u64,
    concealed: u64,
    underruns: u64,
    dropped_stale: u64,
    dropped_late: u64,
    dropped_overflow: u64,
    duplicates: u64,
    missing: u64,
    depth_changes: u64,
    stretched: u64,
    trimmed: u64,
    quality_degradations: u64,
    resyncs: u64,
}

pub struct Synchronizer {
    config: SyncConfig,
    period_ms: f64,
    /// Polls to wait for a missing chunk before concealing it
    max_gap_wait: u32,
    /// Largest target depth whose audio is still fresh when played
    depth_ceiling: usize,

    unwrapper: SequenceUnwrapper,
    buffer: BTreeMap<u64, Buffered>,
    next_release: Option<u64>,
    last_played: Option<AudioChunk>,

    priming: bool,
    degraded: bool,
    stopped: bool,
    target_depth: usize,
    gap_wait: u32,
    pending_stretch: u32,
    calm_ticks: u32,

    latency: SampleHistory,
    jitter: SampleHistory,
    last_latency_ms: Option<f64>,
    outcomes: LossWindow,
    quality: LinkQuality,
    last_adaptation_us: Option<u64>,
    last_quality_us: Option<u64>,

    counters: Counters,
}

impl Synchronizer {
    pub fn new(config: SyncConfig, spec: &StreamSpec) -> Self {
        let period_ms = (spec.period_us() as f64 / 1000.0).max(0.001);
        let max_gap_wait = (config.target_latency_ms / period_ms).floor().max(0.0) as u32;
        let target_depth = config.min_buffer_size.max(1);
        let depth_ceiling = ((config.max_acceptable_latency_ms / period_ms).floor().max(0.0)
            as usize)
            .min(config.max_buffer_size)
            .max(target_depth);

        Self {
            config,
            period_ms,
            max_gap_wait,
            depth_ceiling,
            unwrapper: SequenceUnwrapper::new(),
            buffer: BTreeMap::new(),
            next_release: None,
            last_played: None,
            priming: true,
            degraded: false,
            stopped: false,
            target_depth,
            gap_wait: 0,
            pending_stretch: 0,
            calm_ticks: 0,
            latency: SampleHistory::new(LATENCY_HISTORY),
            jitter: SampleHistory::new(JITTER_HISTORY),
            last_latency_ms: None,
            outcomes: LossWindow::new(),
            quality: LinkQuality::Good,
            last_adaptation_us: None,
            last_quality_us: None,
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> SyncState {
        if self.stopped {
            SyncState::Stopped
        } else if self.priming {
            SyncState::Priming
        } else if self.degraded {
            SyncState::Degraded
        } else {
            SyncState::Steady
        }
    }

    pub fn quality(&self) -> LinkQuality {
        self.quality
    }

    pub fn target_depth(&self) -> usize {
        self.target_depth
    }

    pub fn depth_ceiling(&self) -> usize {
        self.depth_ceiling
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Offer a reassembled chunk. `now_us` is the local arrival time.
    pub fn ingest(
        &mut self,
        chunk: AudioChunk,
        sequence: u32,
        timestamp_us: u64,
        now_us: u64,
    ) -> IngestOutcome {
        if self.stopped {
            return IngestOutcome::Stopped;
        }
        self.counters.ingested += 1;

        let latency_ms = (now_us as i64 - timestamp_us as i64) as f64 / 1000.0;
        if let Some(previous) = self.last_latency_ms {
            self.jitter.push((latency_ms - previous).abs());
        }
        self.last_latency_ms = Some(latency_ms);
        self.latency.push(latency_ms);

        self.tick(now_us);

        if latency_ms > self.config.max_acceptable_latency_ms {
            self.counters.dropped_stale += 1;
            tracing::trace!("Chunk {} stale on arrival ({:.1} ms)", sequence, latency_ms);
            return IngestOutcome::DroppedStale;
        }

        let mut seq = self.unwrapper.unwrap(sequence);
        let reference = self
            .next_release
            .or_else(|| self.buffer.keys().next().copied());
        if let Some(reference) = reference {
            let restart_distance = RESTART_WINDOWS * self.config.max_buffer_size as u64;
            if seq.abs_diff(reference) > restart_distance {
                tracing::info!("Sequence jumped to {}, resynchronizing", sequence);
                self.resync();
                seq = self.unwrapper.unwrap(sequence);
            } else if self.next_release.is_some_and(|next| seq < next) {
                self.counters.dropped_late += 1;
                return IngestOutcome::DroppedLate;
            }
        }

        if self.buffer.contains_key(&seq) {
            self.counters.duplicates += 1;
            return IngestOutcome::Duplicate;
        }
        self.buffer.insert(seq, Buffered { chunk, timestamp_us });

        let mut outcome = IngestOutcome::Buffered;
        while self.buffer.len() > self.config.max_buffer_size {
            let Some((evicted, _)) = self.buffer.pop_first() else {
                break;
            };
            self.counters.dropped_overflow += 1;
            self.outcomes.record_lost();
            self.skip_past(evicted);
            if evicted == seq {
                outcome = IngestOutcome::DroppedOverflow;
            }
        }
        outcome
    }

    /// Release the chunk for the current playout period.
    ///
    /// `None` means the player should write silence.
    pub fn poll(&mut self, now_us: u64) -> Option<AudioChunk> {
        if self.stopped {
            return None;
        }
        self.tick(now_us);
        self.drop_stale(now_us);

        if self.priming {
            if self.buffer.len() < self.config.min_buffer_size.max(1) {
                return None;
            }
            let Some(&first) = self.buffer.keys().next() else {
                return None;
            };
            if let Some(expected) = self.next_release {
                if first > expected {
                    self.counters.missing += first - expected;
                }
            }
            self.next_release = Some(first);
            self.priming = false;
            self.gap_wait = 0;
            self.pending_stretch = 0;
            tracing::debug!("Playout started at depth {}", self.buffer.len());
        }

        if self.pending_stretch > 0 {
            self.pending_stretch -= 1;
            self.counters.stretched += 1;
            return self.fill();
        }

        let next = self.next_release?;
        if let Some(entry) = self.buffer.remove(&next) {
            self.next_release = Some(next + 1);
            self.gap_wait = 0;
            self.counters.played += 1;
            self.outcomes.record_played();
            self.last_played = Some(entry.chunk.clone());
            return Some(entry.chunk);
        }

        if self.buffer.is_empty() {
            self.counters.underruns += 1;
            self.priming = true;
            self.gap_wait = 0;
            tracing::debug!("Jitter buffer underrun, re-priming");
            return None;
        }

        // Expected chunk missing while later ones are buffered
        if self.gap_wait < self.max_gap_wait && self.buffer.len() < self.target_depth {
            self.gap_wait += 1;
            return self.fill();
        }
        self.gap_wait = 0;
        self.next_release = Some(next + 1);
        self.counters.missing += 1;
        self.counters.concealed += 1;
        self.outcomes.record_lost();
        self.fill()
    }

    /// Substitute for a chunk that is not there
    fn fill(&self) -> Option<AudioChunk> {
        match self.config.concealment {
            Concealment::Silence => None,
            Concealment::RepeatLast => self.last_played.clone(),
        }
    }

    /// Make sure playout resumes after `seq`. Skipped sequences that never
    /// arrived count as missing.
    fn skip_past(&mut self, seq: u64) {
        let Some(next) = self.next_release else {
            return;
        };
        if next > seq {
            return;
        }
        let skipped = (next..seq)
            .filter(|s| !self.buffer.contains_key(s))
            .count();
        for _ in 0..skipped {
            self.outcomes.record_lost();
        }
        self.counters.missing += skipped as u64;
        self.next_release = Some(seq + 1);
        self.gap_wait = 0;
    }

    fn drop_stale(&mut self, now_us: u64) {
        let max_age_us = (self.config.max_acceptable_latency_ms * 1000.0) as u64;
        let stale: Vec<u64> = self
            .buffer
            .iter()
            .filter(|(_, b)| now_us.saturating_sub(b.timestamp_us) > max_age_us)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in stale {
            self.buffer.remove(&seq);
            self.counters.dropped_stale += 1;
            self.outcomes.record_lost();
            self.skip_past(seq);
        }
    }

    fn resync(&mut self) {
        self.buffer.clear();
        self.unwrapper.reset();
        self.next_release = None;
        self.priming = true;
        self.gap_wait = 0;
        self.pending_stretch = 0;
        self.counters.resyncs += 1;
    }

    /// Run adaptation and quality updates that are due at `now_us`
    fn tick(&mut self, now_us: u64) {
        let adaptation_us = (self.config.adaptation_interval_ms * 1000.0) as u64;
        if due(&mut self.last_adaptation_us, now_us, adaptation_us) {
            self.adapt();
        }
        let quality_us = (self.config.quality_interval_ms * 1000.0) as u64;
        if due(&mut self.last_quality_us, now_us, quality_us) {
            self.update_quality();
        }
    }

    fn adapt(&mut self) {
        let jitter = self.jitter.mean().unwrap_or(0.0);
        let latency = self.latency.mean().unwrap_or(0.0);
        let bad = jitter > self.config.jitter_threshold_ms || latency > self.config.latency_ceiling_ms;

        if bad {
            self.calm_ticks = 0;
            if !self.degraded {
                self.degraded = true;
                self.counters.quality_degradations += 1;
                tracing::warn!(
                    "Link degraded: jitter {:.1} ms, latency {:.1} ms",
                    jitter,
                    latency
                );
            }
        } else if self.degraded {
            self.calm_ticks += 1;
            if self.calm_ticks >= self.config.recovery_intervals {
                self.degraded = false;
                self.calm_ticks = 0;
                tracing::info!("Link recovered");
            }
        }

        let min = self.config.min_buffer_size;
        let max = self.depth_ceiling;
        let mut desired = ((jitter / self.period_ms).round() as usize + self.config.depth_margin)
            .clamp(min, max);
        if self.degraded {
            desired = desired.max(self.target_depth + 1).min(max);
        }

        if desired > self.target_depth {
            self.target_depth += 1;
            self.counters.depth_changes += 1;
            if !self.priming {
                self.pending_stretch += 1;
            }
            tracing::debug!("Target depth raised to {}", self.target_depth);
        } else if desired < self.target_depth {
            self.target_depth -= 1;
            self.counters.depth_changes += 1;
            if !self.priming && self.buffer.len() > self.target_depth {
                if let Some((trimmed, _)) = self.buffer.pop_first() {
                    self.counters.trimmed += 1;
                    self.skip_past(trimmed);
                }
            }
            tracing::debug!("Target depth lowered to {}", self.target_depth);
        }
    }

    fn update_quality(&mut self) {
        let jitter = self.jitter.mean().unwrap_or(0.0);
        let quality = classify(self.outcomes.loss_rate(), jitter, self.config.jitter_threshold_ms);
        if quality != self.quality {
            tracing::info!("Link quality {:?} -> {:?}", self.quality, quality);
            self.quality = quality;
        }
    }

    /// Pin the target depth, e.g. from a manual override. Adaptation resumes
    /// from the new value on the next tick.
    pub fn force_target_depth(&mut self, depth: usize) -> Result<(), SyncError> {
        let (min, max) = (self.config.min_buffer_size, self.depth_ceiling);
        if self.stopped {
            return Err(SyncError::Stopped);
        }
        if depth < min || depth > max {
            tracing::warn!("Rejected buffer depth {} (allowed {}..={})", depth, min, max);
            return Err(SyncError::DepthOutOfRange {
                requested: depth,
                min,
                max,
            });
        }
        if depth != self.target_depth {
            self.target_depth = depth;
            self.counters.depth_changes += 1;
            tracing::info!("Target depth forced to {}", depth);
        }
        Ok(())
    }

    /// Forget measurements and counters; buffered audio is kept
    pub fn reset_measurements(&mut self) {
        self.latency.clear();
        self.jitter.clear();
        self.last_latency_ms = None;
        self.outcomes.clear();
        self.quality = LinkQuality::Good;
        self.degraded = false;
        self.calm_ticks = 0;
        self.counters = Counters::default();
    }

    /// Terminal: drop everything and refuse further input
    pub fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.buffer.clear();
            self.last_played = None;
            tracing::debug!("Synchronizer stopped");
        }
    }

    pub fn current_stats(&self) -> SyncStats {
        let c = &self.counters;
        SyncStats {
            state: self.state(),
            quality: self.quality,
            latency_ms: self.latency.mean().unwrap_or(0.0),
            jitter_ms: self.jitter.mean().unwrap_or(0.0),
            loss_rate: self.outcomes.loss_rate(),
            buffer_depth: self.buffer.len(),
            target_depth: self.target_depth,
            ingested: c.ingested,
            played: c.played,
            concealed: c.concealed,
            underruns: c.underruns,
            dropped_stale: c.dropped_stale,
            dropped_late: c.dropped_late,
            dropped_overflow: c.dropped_overflow,
            duplicates: c.duplicates,
            missing: c.missing,
            depth_changes: c.depth_changes,
            stretched: c.stretched,
            trimmed: c.trimmed,
            quality_degradations: c.quality_degradations,
            resyncs: c.resyncs,
            intake_overflow: 0,
        }
    }
}

/// True when `interval_us` has passed since `*last`. The first call only
/// starts the clock.
fn due(last: &mut Option<u64>, now_us: u64, interval_us: u64) -> bool {
    match *last {
        None => {
            *last = Some(now_us);
            false
        }
        Some(previous) if now_us >= previous + interval_us.max(1) => {
            *last = Some(now_us);
            true
        }
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_000_000_000;
    const MS: u64 = 1_000;

    /// 10 ms chunks: 1000 Hz, 10 frames
    fn spec() -> StreamSpec {
        StreamSpec {
            sample_rate: 1000,
            channels: 1,
            chunk_frames: 10,
        }
    }

    fn sync_with(config: SyncConfig) -> Synchronizer {
        Synchronizer::new(config, &spec())
    }

    fn sync() -> Synchronizer {
        sync_with(SyncConfig::default())
    }

    fn chunk(tag: i16) -> AudioChunk {
        AudioChunk::new(vec![tag; 10])
    }

    fn tag(chunk: &Option<AudioChunk>) -> Option<i16> {
        chunk.as_ref().map(|c| c.samples()[0])
    }

    /// Ingest chunk `seq` (tagged with its own sequence) with zero latency
    fn feed(s: &mut Synchronizer, seq: u32, now: u64) -> IngestOutcome {
        s.ingest(chunk(seq as i16), seq, now, now)
    }

    #[test]
    fn test_priming_holds_until_min_depth() {
        let mut s = sync();
        feed(&mut s, 0, T0);
        feed(&mut s, 1, T0);
        assert_eq!(s.poll(T0), None);
        assert_eq!(s.state(), SyncState::Priming);

        feed(&mut s, 2, T0);
        assert_eq!(tag(&s.poll(T0)), Some(0));
        assert_eq!(s.state(), SyncState::Steady);
    }

    #[test]
    fn test_reordered_chunks_play_in_order() {
        let mut s = sync();
        for seq in [1, 3, 2] {
            assert_eq!(feed(&mut s, seq, T0), IngestOutcome::Buffered);
        }
        let played: Vec<_> = (0..3).map(|_| tag(&s.poll(T0))).collect();
        assert_eq!(played, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_stale_on_arrival_dropped() {
        let mut s = sync();
        let outcome = s.ingest(chunk(0), 0, T0, T0 + 250 * MS);
        assert_eq!(outcome, IngestOutcome::DroppedStale);
        assert_eq!(s.buffered(), 0);
        assert_eq!(s.current_stats().dropped_stale, 1);
    }

    #[test]
    fn test_stale_while_buffered_never_played() {
        let mut s = sync();
        for seq in 0..3 {
            feed(&mut s, seq, T0);
        }
        assert_eq!(s.poll(T0 + 250 * MS), None);
        let stats = s.current_stats();
        assert_eq!(stats.dropped_stale, 3);
        assert_eq!(stats.played, 0);
        assert_eq!(stats.buffer_depth, 0);
    }

    #[test]
    fn test_late_chunk_dropped() {
        let mut s = sync();
        for seq in 0..4 {
            feed(&mut s, seq, T0);
        }
        assert_eq!(tag(&s.poll(T0)), Some(0));
        assert_eq!(tag(&s.poll(T0)), Some(1));
        assert_eq!(feed(&mut s, 0, T0), IngestOutcome::DroppedLate);
        assert_eq!(s.current_stats().dropped_late, 1);
    }

    #[test]
    fn test_duplicate_buffered_once() {
        let mut s = sync();
        assert_eq!(feed(&mut s, 7, T0), IngestOutcome::Buffered);
        assert_eq!(feed(&mut s, 7, T0), IngestOutcome::Duplicate);
        assert_eq!(s.buffered(), 1);
        assert_eq!(s.current_stats().duplicates, 1);
    }

    #[test]
    fn test_missing_chunk_waits_then_conceals() {
        let mut s = sync();
        for seq in [0, 1, 2, 4, 5] {
            feed(&mut s, seq, T0);
        }
        for expected in 0..3 {
            assert_eq!(tag(&s.poll(T0)), Some(expected));
        }

        // Buffer (2) is below target (3): wait floor(50 / 10) polls, then conceal
        for _ in 0..5 {
            assert_eq!(s.poll(T0), None);
            assert_eq!(s.current_stats().missing, 0);
        }
        assert_eq!(s.poll(T0), None);
        assert_eq!(s.current_stats().missing, 1);
        assert_eq!(s.current_stats().concealed, 1);

        assert_eq!(tag(&s.poll(T0)), Some(4));
        assert_eq!(tag(&s.poll(T0)), Some(5));
    }

    #[test]
    fn test_repeat_last_concealment_without_wait() {
        let mut s = sync_with(SyncConfig {
            concealment: Concealment::RepeatLast,
            ..SyncConfig::default()
        });
        for seq in [0, 1, 2, 4, 5, 6, 7] {
            feed(&mut s, seq, T0);
        }
        for expected in 0..3 {
            assert_eq!(tag(&s.poll(T0)), Some(expected));
        }
        // Enough buffered behind the gap: conceal at once with the last chunk
        assert_eq!(tag(&s.poll(T0)), Some(2));
        assert_eq!(tag(&s.poll(T0)), Some(4));
    }

    #[test]
    fn test_underrun_reprimes() {
        let mut s = sync();
        for seq in 0..3 {
            feed(&mut s, seq, T0);
        }
        for _ in 0..3 {
            assert!(s.poll(T0).is_some());
        }
        assert_eq!(s.poll(T0), None);
        assert_eq!(s.state(), SyncState::Priming);
        assert_eq!(s.current_stats().underruns, 1);

        for seq in 3..6 {
            feed(&mut s, seq, T0);
        }
        assert_eq!(tag(&s.poll(T0)), Some(3));
    }

    #[test]
    fn test_playback_order_never_decreases() {
        let mut s = sync();
        let order = [2, 0, 1, 5, 3, 4, 8, 6, 7, 9];
        let mut played = Vec::new();
        for (i, &seq) in order.iter().enumerate() {
            feed(&mut s, seq, T0);
            if i >= 2 {
                if let Some(t) = tag(&s.poll(T0)) {
                    played.push(t);
                }
            }
        }
        while let Some(t) = tag(&s.poll(T0)) {
            played.push(t);
        }
        assert!(played.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(played.len(), 10);
    }

    /// One chunk per period over a link whose transit time depends on the
    /// sequence. Chunk `i` leaves at `i * period_us` and poll `i` runs half a
    /// period later. Sequences for which `arrives` is false never show up.
    /// `on_poll` sees every poll and whether it played a chunk.
    fn run_link(
        s: &mut Synchronizer,
        period_us: u64,
        periods: u64,
        transit_us: impl Fn(u64) -> u64,
        arrives: impl Fn(u64) -> bool,
        mut on_poll: impl FnMut(u64, &Synchronizer, bool),
    ) {
        let mut events = Vec::new();
        for i in 0..periods {
            let sent = T0 + i * period_us;
            if arrives(i) {
                events.push((sent + transit_us(i), 0u8, i));
            }
            events.push((sent + period_us / 2, 1u8, i));
        }
        events.sort_unstable();

        for (now, kind, i) in events {
            if kind == 0 {
                s.ingest(chunk(i as i16), i as u32, T0 + i * period_us, now);
            } else {
                let played = s.poll(now).is_some();
                on_poll(i, s, played);
            }
        }
    }

    #[test]
    fn test_high_jitter_grows_depth_to_max() {
        let mut s = sync();
        let mut depths = Vec::new();
        let mut played_late = 0;
        // Alternate 0 ms and 30 ms transit: jitter ~30 ms
        run_link(
            &mut s,
            10 * MS,
            625,
            |i| if i % 2 == 0 { 0 } else { 30 * MS },
            |_| true,
            |i, s, played| {
                depths.push(s.target_depth());
                if i >= 525 && played {
                    played_late += 1;
                }
            },
        );

        depths.dedup();
        let max = SyncConfig::default().max_buffer_size;
        assert_eq!(s.depth_ceiling(), max);
        assert_eq!(depths, (3..=max).collect::<Vec<_>>());
        assert_eq!(s.current_stats().quality_degradations, 1);

        // Playout keeps going at full depth
        assert_eq!(s.state(), SyncState::Degraded);
        assert!(played_late > 50, "played {} of the last 100", played_late);
    }

    #[test]
    fn test_outage_on_jittery_link_resumes_playout() {
        // 1024 frames at 44.1 kHz: ~23.2 ms per chunk, 8 fit in 200 ms
        let spec = StreamSpec {
            sample_rate: 44_100,
            channels: 1,
            chunk_frames: 1024,
        };
        let mut s = Synchronizer::new(SyncConfig::default(), &spec);
        assert_eq!(s.depth_ceiling(), 8);

        let mut deepest = 0;
        let mut played_after = 0;
        run_link(
            &mut s,
            spec.period_us(),
            900,
            |i| if i % 2 == 0 { 5 * MS } else { 35 * MS },
            |i| !(300..=312).contains(&i),
            |i, s, played| {
                deepest = deepest.max(s.target_depth());
                if i >= 400 && played {
                    played_after += 1;
                }
            },
        );

        let stats = s.current_stats();
        assert_eq!(deepest, 8);
        assert!(stats.underruns >= 1);
        assert!(stats.missing >= 13);
        assert_eq!(s.state(), SyncState::Degraded);
        assert!(played_after > 400, "played {} of 500 after the outage", played_after);
    }

    #[test]
    fn test_stale_skip_counts_missing_sequences() {
        let mut s = sync();
        for seq in 0..3 {
            feed(&mut s, seq, T0);
        }
        for _ in 0..3 {
            assert!(s.poll(T0).is_some());
        }

        // 3, 4 and 5 never arrive; 6 goes stale before it can be played
        assert_eq!(s.ingest(chunk(6), 6, T0, T0 + 10 * MS), IngestOutcome::Buffered);
        assert_eq!(s.poll(T0 + 250 * MS), None);

        let stats = s.current_stats();
        assert_eq!(stats.dropped_stale, 1);
        assert_eq!(stats.missing, 3);
        assert!((stats.loss_rate - 4.0 / 7.0).abs() < 1e-9);

        // Playout picks up after the stale chunk
        for seq in 7..10 {
            feed(&mut s, seq, T0 + 250 * MS);
        }
        assert_eq!(tag(&s.poll(T0 + 250 * MS)), Some(7));
        assert_eq!(s.current_stats().missing, 3);
    }

    #[test]
    fn test_degraded_state_entered_and_recovered() {
        let mut s = sync();
        let mut seq = 0;
        let mut now = T0;
        s.ingest(chunk(0), seq, now, now);
        for _ in 0..4 {
            seq += 1;
            let transit = if seq % 2 == 0 { 0 } else { 40 * MS };
            s.ingest(chunk(0), seq, now - transit, now);
        }
        now += 250 * MS;
        seq += 1;
        s.ingest(chunk(0), seq, now, now);
        for _ in 0..3 {
            s.poll(now);
        }
        assert_eq!(s.current_stats().quality_degradations, 1);
        assert!(s.current_stats().jitter_ms > 10.0);

        // Flush the jitter history with calm arrivals, then count calm ticks
        let mut ticks = 0;
        while s.degraded && ticks < 10 {
            now += 250 * MS;
            for _ in 0..60 {
                seq += 1;
                s.ingest(chunk(0), seq, now, now);
            }
            ticks += 1;
        }
        assert!(!s.degraded);
        assert!((4..=6).contains(&ticks), "recovered after {} ticks", ticks);
    }

    #[test]
    fn test_calm_link_shrinks_forced_depth() {
        let mut s = sync_with(SyncConfig {
            max_acceptable_latency_ms: 1000.0,
            ..SyncConfig::default()
        });
        for seq in 0..12 {
            feed(&mut s, seq, T0);
        }
        s.force_target_depth(10).unwrap();
        assert_eq!(tag(&s.poll(T0)), Some(0));

        // Zero jitter: one slot per tick back down, trimming the excess
        let mut now = T0;
        for _ in 0..3 {
            now += 250 * MS;
            s.poll(now);
        }
        assert_eq!(s.target_depth(), 7);
        assert_eq!(s.current_stats().trimmed, 2);
        assert_eq!(s.current_stats().played, 4);
    }

    #[test]
    fn test_force_target_depth_bounds() {
        let mut s = sync();
        assert_eq!(
            s.force_target_depth(21),
            Err(SyncError::DepthOutOfRange {
                requested: 21,
                min: 3,
                max: 20
            })
        );
        assert!(s.force_target_depth(2).is_err());
        assert!(s.force_target_depth(8).is_ok());
        assert_eq!(s.target_depth(), 8);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut s = sync();
        for seq in 0..25 {
            feed(&mut s, seq, T0);
        }
        let stats = s.current_stats();
        assert_eq!(stats.buffer_depth, 20);
        assert_eq!(stats.dropped_overflow, 5);
        assert_eq!(tag(&s.poll(T0)), Some(5));
    }

    #[test]
    fn test_sequence_wraparound_order() {
        let mut s = sync();
        let seqs = [u32::MAX, 0, u32::MAX - 1, 1];
        for &seq in &seqs {
            s.ingest(chunk(0), seq, T0, T0);
        }
        let first = s.poll(T0);
        assert!(first.is_some());
        let mut count = 1;
        while s.poll(T0).is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(s.current_stats().missing, 0);
        assert_eq!(s.current_stats().resyncs, 0);
    }

    #[test]
    fn test_sender_restart_resyncs() {
        let mut s = sync();
        for seq in 0..4 {
            feed(&mut s, seq, T0);
        }
        s.poll(T0);

        assert_eq!(feed(&mut s, 10_000, T0), IngestOutcome::Buffered);
        assert_eq!(s.state(), SyncState::Priming);
        assert_eq!(s.buffered(), 1);
        feed(&mut s, 10_001, T0);
        feed(&mut s, 10_002, T0);
        assert_eq!(tag(&s.poll(T0)), Some(10_000u32 as i16));
        assert_eq!(s.current_stats().resyncs, 1);
    }

    #[test]
    fn test_quality_reflects_loss() {
        let mut s = sync_with(SyncConfig {
            max_buffer_size: 100,
            quality_interval_ms: 10.0,
            ..SyncConfig::default()
        });
        // Every third sequence missing
        for seq in (0..90).filter(|seq| seq % 3 != 2) {
            feed(&mut s, seq, T0);
        }
        for _ in 0..60 {
            s.poll(T0);
        }
        assert_eq!(s.quality(), LinkQuality::Good);
        s.poll(T0 + 10 * MS);
        assert_eq!(s.quality(), LinkQuality::Poor);
        assert!(s.current_stats().loss_rate > 0.2);
    }

    #[test]
    fn test_reset_measurements() {
        let mut s = sync();
        for seq in 0..3 {
            feed(&mut s, seq, T0);
        }
        s.poll(T0);
        s.reset_measurements();
        let stats = s.current_stats();
        assert_eq!(stats.played, 0);
        assert_eq!(stats.ingested, 0);
        assert_eq!(stats.buffer_depth, 2);
        assert_eq!(stats.jitter_ms, 0.0);
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut s = sync();
        for seq in 0..3 {
            feed(&mut s, seq, T0);
        }
        s.stop();
        assert_eq!(s.state(), SyncState::Stopped);
        assert_eq!(s.poll(T0), None);
        assert_eq!(feed(&mut s, 3, T0), IngestOutcome::Stopped);
        assert_eq!(s.force_target_depth(5), Err(SyncError::Stopped));
    }
}
