//! Error types for the voice call core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Synchronizer error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors.
///
/// These are fatal to the thread that owns the device. Capture and playback
/// loops retry opening a lost device a bounded number of times and report
/// `RetriesExhausted` when they give up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Device stalled: no audio for {0} ms")]
    Stalled(u64),

    #[error("Device unavailable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Packet encoding errors. These indicate a configuration bug, never a
/// network condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Payload of {len} bytes exceeds fragment capacity of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Packet size {max_packet_size} cannot hold the {header} byte header")]
    PacketSizeTooSmall { max_packet_size: usize, header: usize },

    #[error("Chunk needs {count} fragments, more than the wire format allows")]
    TooManyFragments { count: usize },
}

/// Packet decoding errors. Recoverable: the datagram is discarded and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Packet truncated: {len} bytes, header needs {required}")]
    Truncated { len: usize, required: usize },

    #[error("Bad magic: {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("Invalid fragment {index} of {count}")]
    InvalidFragment { index: u16, count: u16 },

    #[error("Audio payload has odd length {0}")]
    OddPayloadLength(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Thread spawn failed: {0}")]
    SpawnFailed(String),
}

/// Jitter buffer control errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Buffer depth {requested} outside allowed range [{min}, {max}]")]
    DepthOutOfRange {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("Synchronizer is stopped")]
    Stopped,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
