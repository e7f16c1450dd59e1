//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod synthetic;

pub use buffer::{AudioChunk, CapturedChunk, ChunkQueue};
pub use capture::{CaptureEvent, Capturer};
pub use device::{list_devices, AudioBackend, AudioSink, AudioSource, CpalBackend, StreamSpec};
pub use playback::Player;
pub use synthetic::SyntheticBackend;
