//! Data exchanged with collaborators outside the audio core
//!
//! Device listings for selection UIs and telemetry snapshots for dashboards.
//! Both are plain serde types; how they are delivered is up to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::stats::NetworkStatsSnapshot;
use crate::sync::SyncStats;

/// Audio device description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioDeviceInfo {
    /// Stable identifier accepted by `AudioBackend::open_*`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Local capture and playback activity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioActivity {
    pub chunks_captured: u64,
    pub silent_chunks: u64,
    /// Normalized RMS of the latest captured chunk
    pub input_level: f32,
    pub input_level_db: f32,
    pub chunks_played: u64,
    pub silence_written: u64,
    /// Chunks waiting to be sent
    pub outbound_queued: usize,
    /// Chunks evicted from the outbound queue before sending
    pub outbound_dropped: u64,
}

/// Everything a dashboard needs about one call, at one instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub audio: AudioActivity,
    /// Outgoing direction: this peer's transmitter
    pub send: NetworkStatsSnapshot,
    /// Incoming direction: this peer's receiver
    pub receive: NetworkStatsSnapshot,
    pub sync: SyncStats,
}

impl TelemetrySnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Packets per second sent over the snapshot's uptime
    pub fn send_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.send.packets_sent as f64 / self.uptime_secs
        } else {
            0.0
        }
    }

    /// Packets per second received over the snapshot's uptime
    pub fn receive_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.receive.packets_received as f64 / self.uptime_secs
        } else {
            0.0
        }
    }
}
