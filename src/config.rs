//! Configuration for the voice call core
//!
//! The core consumes configuration but does not own it: the surrounding
//! application loads an [`AppConfig`] (from TOML or defaults) and hands the
//! relevant sections to each component.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::device::StreamSpec;
use crate::codec::packet::HEADER_SIZE;
use crate::constants::*;
use crate::error::{Error, Result};

/// Largest UDP payload over IPv4
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfig,
}

/// Audio device settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per chunk (one device read/write)
    pub chunk_frames: usize,
    /// Input device ID (None = system default)
    pub input_device: Option<String>,
    /// Output device ID (None = system default)
    pub output_device: Option<String>,
    /// Peak amplitude below which a chunk is flagged silent
    pub silence_threshold: i16,
    /// Re-open attempts after a device failure
    pub max_device_retries: u32,
    /// Initial backoff between re-open attempts, doubled each time
    pub retry_backoff_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            input_device: None,
            output_device: None,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            max_device_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl AudioConfig {
    pub fn stream_spec(&self) -> StreamSpec {
        StreamSpec {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_frames: self.chunk_frames,
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// UDP transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address to bind sockets to
    pub bind_address: IpAddr,
    /// Port the receiver listens on (0 = ephemeral)
    pub listen_port: u16,
    /// Port used when the peer address is given without one
    pub target_port: u16,
    /// Remote peer, if known up front
    pub peer_address: Option<SocketAddr>,
    /// Maximum datagram size including the packet header
    pub max_packet_size: usize,
    /// Chunks waiting between capture and the socket
    pub outbound_queue_capacity: usize,
    /// Incomplete chunks older than this are discarded as lost
    pub reassembly_timeout_ms: u64,
    /// Maximum chunks under reassembly at once
    pub max_inflight_chunks: usize,
    /// Socket read timeout; bounds how long `stop` waits for the receive loop
    pub recv_timeout_ms: u64,
    pub recv_buffer_bytes: usize,
    pub send_buffer_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_UDP_PORT,
            target_port: DEFAULT_UDP_PORT,
            peer_address: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            reassembly_timeout_ms: DEFAULT_REASSEMBLY_TIMEOUT_MS,
            max_inflight_chunks: 64,
            recv_timeout_ms: 20,
            recv_buffer_bytes: 1 << 20,
            send_buffer_bytes: 1 << 20,
        }
    }
}

impl NetworkConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.max(1))
    }

    /// Parse a peer given as `host:port` or bare `host` (uses `target_port`)
    pub fn resolve_peer(&self, peer: &str) -> Result<SocketAddr> {
        if let Ok(addr) = peer.parse::<SocketAddr>() {
            return Ok(addr);
        }
        peer.parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.target_port))
            .map_err(|_| Error::Config(format!("Invalid peer address: {}", peer)))
    }
}

/// What the synchronizer hands to the player when the next chunk is missing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Concealment {
    /// Player writes silence
    Silence,
    /// Replay the last chunk that was actually played
    RepeatLast,
}

/// Jitter buffer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
    pub jitter_threshold_ms: f64,
    pub max_acceptable_latency_ms: f64,
    pub target_latency_ms: f64,
    /// One-way latency above which the link counts as degraded
    pub latency_ceiling_ms: f64,
    /// Slots added on top of the jitter-derived depth
    pub depth_margin: usize,
    pub adaptation_interval_ms: f64,
    pub quality_interval_ms: f64,
    /// Calm adaptation ticks needed to leave the degraded state
    pub recovery_intervals: u32,
    pub concealment: Concealment,
    /// Capacity of the receiver-to-synchronizer intake queue
    pub intake_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            jitter_threshold_ms: DEFAULT_JITTER_THRESHOLD_MS,
            max_acceptable_latency_ms: DEFAULT_MAX_ACCEPTABLE_LATENCY_MS,
            target_latency_ms: DEFAULT_TARGET_LATENCY_MS,
            latency_ceiling_ms: 150.0,
            depth_margin: 1,
            adaptation_interval_ms: 250.0,
            quality_interval_ms: 1000.0,
            recovery_intervals: 4,
            concealment: Concealment::Silence,
            intake_capacity: 64,
        }
    }
}

impl AppConfig {
    /// Default config file location for this platform
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-voice-call")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 || audio.chunk_frames == 0 {
            return Err(Error::Config(
                "sample_rate and chunk_frames must be non-zero".to_string(),
            ));
        }
        if audio.channels != 1 {
            return Err(Error::Config(format!(
                "Only mono audio is supported, got {} channels",
                audio.channels
            )));
        }

        let net = &self.network;
        if net.max_packet_size <= HEADER_SIZE || net.max_packet_size > MAX_UDP_PAYLOAD {
            return Err(Error::Config(format!(
                "max_packet_size must be in ({}, {}], got {}",
                HEADER_SIZE, MAX_UDP_PAYLOAD, net.max_packet_size
            )));
        }
        if net.listen_port == DISCOVERY_PORT {
            return Err(Error::Config(format!(
                "listen_port {} is reserved for peer discovery",
                DISCOVERY_PORT
            )));
        }
        if net.outbound_queue_capacity == 0 || net.max_inflight_chunks == 0 {
            return Err(Error::Config("queue capacities must be non-zero".to_string()));
        }

        let sync = &self.sync;
        if sync.min_buffer_size == 0 || sync.min_buffer_size > sync.max_buffer_size {
            return Err(Error::Config(format!(
                "buffer sizes must satisfy 1 <= min ({}) <= max ({})",
                sync.min_buffer_size, sync.max_buffer_size
            )));
        }
        let primed_ms = sync.min_buffer_size as f64 * audio.stream_spec().period_us() as f64 / 1000.0;
        if primed_ms >= sync.max_acceptable_latency_ms {
            return Err(Error::Config(format!(
                "min_buffer_size {} holds {:.1} ms of audio, which is not below max acceptable latency ({} ms)",
                sync.min_buffer_size, primed_ms, sync.max_acceptable_latency_ms
            )));
        }
        if net.reassembly_timeout_ms as f64 >= sync.max_acceptable_latency_ms {
            return Err(Error::Config(format!(
                "reassembly timeout ({} ms) must be shorter than max acceptable latency ({} ms)",
                net.reassembly_timeout_ms, sync.max_acceptable_latency_ms
            )));
        }
        if sync.intake_capacity == 0 {
            return Err(Error::Config("intake_capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}
