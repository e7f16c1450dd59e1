//! Per-direction transport counters
//!
//! The transmitter writes the send side, the receiver writes the receive
//! side, and telemetry reads both through [`NetworkStats::snapshot`]. All
//! fields are relaxed atomics: counters are independent and snapshots need
//! not be a consistent cut.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NetworkStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_dropped_queue: AtomicU64,
    send_errors: AtomicU64,
    no_peer_drops: AtomicU64,

    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    malformed_packets: AtomicU64,
    chunks_reassembled: AtomicU64,
    chunks_lost: AtomicU64,
    duplicate_chunks: AtomicU64,
    duplicate_fragments: AtomicU64,
    late_packets: AtomicU64,

    last_latency_us: AtomicI64,
    last_transit_us: AtomicI64,
    /// RFC 3550 interarrival jitter, microseconds
    jitter_us: AtomicU64,
}

/// Point-in-time copy of [`NetworkStats`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    /// Chunks evicted from the outbound queue before sending
    pub chunks_dropped_queue: u64,
    pub send_errors: u64,
    /// Chunks discarded because no peer address was set
    pub no_peer_drops: u64,

    pub packets_received: u64,
    pub bytes_received: u64,
    pub malformed_packets: u64,
    pub chunks_reassembled: u64,
    /// Chunks never completed: fragment timeout, skipped sequence, eviction
    pub chunks_lost: u64,
    pub duplicate_chunks: u64,
    pub duplicate_fragments: u64,
    /// Packets for sequences already given up on
    pub late_packets: u64,

    /// One-way latency of the most recent chunk; negative means clock skew
    pub last_latency_ms: f64,
    pub jitter_ms: f64,
}

impl NetworkStatsSnapshot {
    /// Fraction of chunks that never completed reassembly
    pub fn loss_rate(&self) -> f64 {
        let total = self.chunks_reassembled + self.chunks_lost;
        if total == 0 {
            0.0
        } else {
            self.chunks_lost as f64 / total as f64
        }
    }
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet_sent(&self, bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_drops(&self, count: u64) {
        self.chunks_dropped_queue.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_peer(&self) {
        self.no_peer_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, chunks: u64) {
        if chunks > 0 {
            self.chunks_lost.fetch_add(chunks, Ordering::Relaxed);
        }
    }

    pub fn record_duplicate_chunk(&self) {
        self.duplicate_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_fragment(&self) {
        self.duplicate_fragments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late(&self) {
        self.late_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed chunk and fold its transit time into the latency
    /// and jitter estimates. Called from the receive thread only.
    pub fn record_reassembled(&self, timestamp_us: u64, arrival_us: u64) {
        let first = self.chunks_reassembled.fetch_add(1, Ordering::Relaxed) == 0;

        let transit = arrival_us as i64 - timestamp_us as i64;
        self.last_latency_us.store(transit, Ordering::Relaxed);

        let previous = self.last_transit_us.swap(transit, Ordering::Relaxed);
        if !first {
            let d = (transit - previous).unsigned_abs();
            let j = self.jitter_us.load(Ordering::Relaxed);
            // J += (|D| - J) / 16
            let next = (j as i64 + (d as i64 - j as i64) / 16).max(0) as u64;
            self.jitter_us.store(next, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> NetworkStatsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        NetworkStatsSnapshot {
            packets_sent: load(&self.packets_sent),
            bytes_sent: load(&self.bytes_sent),
            chunks_sent: load(&self.chunks_sent),
            chunks_dropped_queue: load(&self.chunks_dropped_queue),
            send_errors: load(&self.send_errors),
            no_peer_drops: load(&self.no_peer_drops),
            packets_received: load(&self.packets_received),
            bytes_received: load(&self.bytes_received),
            malformed_packets: load(&self.malformed_packets),
            chunks_reassembled: load(&self.chunks_reassembled),
            chunks_lost: load(&self.chunks_lost),
            duplicate_chunks: load(&self.duplicate_chunks),
            duplicate_fragments: load(&self.duplicate_fragments),
            late_packets: load(&self.late_packets),
            last_latency_ms: self.last_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            jitter_ms: load(&self.jitter_us) as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = NetworkStats::new();
        stats.record_packet_sent(1400);
        stats.record_packet_sent(688);
        stats.record_chunk_sent();
        stats.record_received(100);
        stats.record_malformed();
        stats.record_lost(0);
        stats.record_lost(2);
        stats.record_duplicate_chunk();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 2088);
        assert_eq!(snap.chunks_sent, 1);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.malformed_packets, 1);
        assert_eq!(snap.chunks_lost, 2);
        assert_eq!(snap.duplicate_chunks, 1);
    }

    #[test]
    fn test_latency_and_jitter() {
        let stats = NetworkStats::new();
        stats.record_reassembled(1_000_000, 1_005_000);
        let snap = stats.snapshot();
        assert_eq!(snap.last_latency_ms, 5.0);
        assert_eq!(snap.jitter_ms, 0.0);

        // Transit jumps by 16 ms: jitter moves 1/16 of the way
        stats.record_reassembled(2_000_000, 2_021_000);
        let snap = stats.snapshot();
        assert_eq!(snap.last_latency_ms, 21.0);
        assert_eq!(snap.jitter_ms, 1.0);
        assert_eq!(snap.chunks_reassembled, 2);
    }

    #[test]
    fn test_loss_rate() {
        let stats = NetworkStats::new();
        for i in 0..9 {
            stats.record_reassembled(i, i);
        }
        stats.record_lost(1);
        assert!((stats.snapshot().loss_rate() - 0.1).abs() < 1e-9);
    }
}
