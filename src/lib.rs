//! # LAN Voice Call
//!
//! Low-latency bidirectional voice calls between two peers on a LAN, with no
//! signaling server. This crate is the real-time audio core; discovery, call
//! orchestration and user interfaces live outside it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── PEER A ────────────────────────────┐
//! │  ┌──────────┐   ┌───────────────┐   ┌────────────────────────┐ │
//! │  │ Capturer │──▶│ outbound queue│──▶│ Transmitter            │ │
//! │  │ (thread) │   │ (drop-oldest) │   │ fragment + seq + ts    │ │
//! │  └──────────┘   └───────────────┘   └───────────┬────────────┘ │
//! └─────────────────────────────────────────────────┼──────────────┘
//!                                                   │ UDP datagrams
//!                                                   │ [magic|seq|ts|idx|cnt|payload]
//! ┌──────────────────────────── PEER B ─────────────┼──────────────┐
//! │  ┌────────────────────────────────────────────┐ │              │
//! │  │ Receiver (thread)                          │◀┘              │
//! │  │ decode ─▶ reassembly table ─▶ AudioChunk   │                │
//! │  └──────────────────────┬─────────────────────┘                │
//! │                         ▼ intake queue (drop-oldest)           │
//! │  ┌────────────────────────────────────────────┐                │
//! │  │ Synchronizer (jitter buffer, one mutex)    │                │
//! │  │ PRIMING ─▶ STEADY ⇄ DEGRADED, stale drop,  │                │
//! │  │ adaptive depth, quality classification     │                │
//! │  └──────────────────────┬─────────────────────┘                │
//! │                         ▼ poll() once per chunk period         │
//! │  ┌────────────────────────────────────────────┐                │
//! │  │ Player (thread) ─▶ output device           │                │
//! │  └────────────────────────────────────────────┘                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same pipeline runs in the opposite direction; the two directions share
//! no synchronizer state.

pub mod audio;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod sync;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (mono voice)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default frames per chunk
    pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

    /// Default UDP port for audio streaming
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Port reserved for peer discovery broadcasts
    pub const DISCOVERY_PORT: u16 = 5001;

    /// Maximum datagram size, header included
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

    /// Chunks held between capture and the socket
    pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 50;

    /// Incomplete chunks are abandoned after this long
    pub const DEFAULT_REASSEMBLY_TIMEOUT_MS: u64 = 100;

    /// Jitter buffer floor in chunks
    pub const DEFAULT_MIN_BUFFER_SIZE: usize = 3;

    /// Jitter buffer ceiling in chunks
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 20;

    pub const DEFAULT_JITTER_THRESHOLD_MS: f64 = 10.0;

    /// Chunks older than this are never played
    pub const DEFAULT_MAX_ACCEPTABLE_LATENCY_MS: f64 = 200.0;

    pub const DEFAULT_TARGET_LATENCY_MS: f64 = 50.0;

    /// Peak amplitude below which a chunk counts as silent
    pub const DEFAULT_SILENCE_THRESHOLD: i16 = 500;
}
