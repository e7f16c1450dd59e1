//! Audio device boundary
//!
//! Capture and playback talk to hardware through three small traits so the
//! rest of the pipeline can run against real devices ([`CpalBackend`]) or a
//! deterministic generator ([`super::synthetic::SyntheticBackend`]).
//!
//! Sources and sinks are opened on the thread that uses them and never cross
//! threads: cpal streams are not `Send` on every platform.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::DeviceError;
use crate::protocol::AudioDeviceInfo;

/// Shape of the PCM stream exchanged with a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_frames: usize,
}

impl StreamSpec {
    /// Duration of one chunk in microseconds
    pub fn period_us(&self) -> u64 {
        (self.chunk_frames as u64 * 1_000_000) / self.sample_rate.max(1) as u64
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us())
    }
}

/// Blocking reader of one chunk at a time
pub trait AudioSource {
    /// Fill `buf` with the next `buf.len()` mono frames, blocking for up to
    /// roughly one chunk period.
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<(), DeviceError>;

    fn close(&mut self) {}
}

/// Blocking writer of one chunk at a time
pub trait AudioSink {
    /// Queue `samples` for output, blocking until the device has room.
    fn write_chunk(&mut self, samples: &[i16]) -> Result<(), DeviceError>;

    fn close(&mut self) {}
}

/// Factory for sources and sinks
pub trait AudioBackend: Send + Sync {
    fn open_input(
        &self,
        spec: &StreamSpec,
        device_id: Option<&str>,
    ) -> Result<Box<dyn AudioSource>, DeviceError>;

    fn open_output(
        &self,
        spec: &StreamSpec,
        device_id: Option<&str>,
    ) -> Result<Box<dyn AudioSink>, DeviceError>;

    fn list_devices(&self) -> Vec<AudioDeviceInfo>;
}

/// Call `open` until it succeeds, sleeping with exponential backoff between
/// attempts. Gives up with `RetriesExhausted` after `max_attempts`, or early
/// when `running` is cleared.
pub fn reopen_with_backoff<T>(
    max_attempts: u32,
    initial_backoff: Duration,
    running: &AtomicBool,
    mut open: impl FnMut() -> Result<T, DeviceError>,
) -> Result<T, DeviceError> {
    let max_attempts = max_attempts.max(1);
    let mut backoff = initial_backoff;
    let mut last = String::from("not attempted");

    for attempt in 1..=max_attempts {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match open() {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!("Device open attempt {}/{} failed: {}", attempt, max_attempts, e);
                last = e.to_string();
            }
        }
        if attempt < max_attempts {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    Err(DeviceError::RetriesExhausted {
        attempts: max_attempts,
        last,
    })
}

// ---------------------------------------------------------------------------
// cpal
// ---------------------------------------------------------------------------

/// Real devices through the platform's default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        spec: &StreamSpec,
        device_id: Option<&str>,
    ) -> Result<Box<dyn AudioSource>, DeviceError> {
        let device = match device_id {
            Some(id) => get_device_by_id(id)?,
            None => cpal::default_host()
                .default_input_device()
                .ok_or_else(|| DeviceError::DeviceNotFound("No default input device".into()))?,
        };
        Ok(Box::new(CpalSource::open(&device, spec)?))
    }

    fn open_output(
        &self,
        spec: &StreamSpec,
        device_id: Option<&str>,
    ) -> Result<Box<dyn AudioSink>, DeviceError> {
        let device = match device_id {
            Some(id) => get_device_by_id(id)?,
            None => cpal::default_host()
                .default_output_device()
                .ok_or_else(|| DeviceError::DeviceNotFound("No default output device".into()))?,
        };
        Ok(Box::new(CpalSink::open(&device, spec)?))
    }

    fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        list_devices()
    }
}

/// Stream config at the requested rate, in the device's native channel layout
fn stream_config(
    default: &cpal::SupportedStreamConfig,
    spec: &StreamSpec,
) -> StreamConfig {
    StreamConfig {
        channels: default.channels(),
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Longest a read or write may wait before the device counts as stalled
fn stall_timeout(spec: &StreamSpec) -> Duration {
    (spec.period() * 4).max(Duration::from_millis(100))
}

/// Input stream that downmixes to mono i16 and hands blocks over a channel
pub struct CpalSource {
    stream: Option<cpal::Stream>,
    blocks: Receiver<Vec<i16>>,
    errors: Receiver<DeviceError>,
    pending: Vec<i16>,
    stall_timeout: Duration,
}

impl CpalSource {
    fn open(device: &cpal::Device, spec: &StreamSpec) -> Result<Self, DeviceError> {
        let default = device
            .default_input_config()
            .map_err(|e| DeviceError::UnsupportedFormat(e.to_string()))?;
        let config = stream_config(&default, spec);

        let (block_tx, block_rx) = bounded::<Vec<i16>>(64);
        let (err_tx, err_rx) = bounded::<DeviceError>(4);

        let stream = match default.sample_format() {
            SampleFormat::F32 => build_input::<f32>(device, &config, block_tx, err_tx),
            SampleFormat::I16 => build_input::<i16>(device, &config, block_tx, err_tx),
            SampleFormat::U16 => build_input::<u16>(device, &config, block_tx, err_tx),
            other => Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
        }?;
        stream
            .play()
            .map_err(|e| DeviceError::StreamError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            blocks: block_rx,
            errors: err_rx,
            pending: Vec::with_capacity(spec.chunk_frames * 2),
            stall_timeout: stall_timeout(spec),
        })
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    blocks: Sender<Vec<i16>>,
    errors: Sender<DeviceError>,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let block: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: i32 = frame
                            .iter()
                            .map(|&s| <i16 as Sample>::from_sample(s) as i32)
                            .sum();
                        (sum / frame.len() as i32) as i16
                    })
                    .collect();
                // Full channel means the reader fell behind; drop this block
                let _ = blocks.try_send(block);
            },
            move |err| {
                let _ = errors.try_send(DeviceError::DeviceLost(err.to_string()));
            },
            None,
        )
        .map_err(|e| DeviceError::StreamError(e.to_string()))
}

impl AudioSource for CpalSource {
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::DeviceLost("stream closed".into()));
        }
        while self.pending.len() < buf.len() {
            if let Ok(err) = self.errors.try_recv() {
                return Err(err);
            }
            match self.blocks.recv_timeout(self.stall_timeout) {
                Ok(block) => self.pending.extend_from_slice(&block),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(DeviceError::Stalled(self.stall_timeout.as_millis() as u64))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::DeviceLost("input stream ended".into()))
                }
            }
        }
        buf.copy_from_slice(&self.pending[..buf.len()]);
        self.pending.drain(..buf.len());
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.pending.clear();
    }
}

/// Output stream fed from a lock-free sample ring
pub struct CpalSink {
    stream: Option<cpal::Stream>,
    ring: Arc<ArrayQueue<i16>>,
    errors: Receiver<DeviceError>,
    stall_timeout: Duration,
}

impl CpalSink {
    fn open(device: &cpal::Device, spec: &StreamSpec) -> Result<Self, DeviceError> {
        let default = device
            .default_output_config()
            .map_err(|e| DeviceError::UnsupportedFormat(e.to_string()))?;
        let config = stream_config(&default, spec);

        // Room for three chunks: enough to ride out scheduling hiccups
        let ring = Arc::new(ArrayQueue::new(spec.chunk_frames.max(1) * 3));
        let (err_tx, err_rx) = bounded::<DeviceError>(4);

        let stream = match default.sample_format() {
            SampleFormat::F32 => build_output::<f32>(device, &config, ring.clone(), err_tx),
            SampleFormat::I16 => build_output::<i16>(device, &config, ring.clone(), err_tx),
            SampleFormat::U16 => build_output::<u16>(device, &config, ring.clone(), err_tx),
            other => Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
        }?;
        stream
            .play()
            .map_err(|e| DeviceError::StreamError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            ring,
            errors: err_rx,
            stall_timeout: stall_timeout(spec),
        })
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: Arc<ArrayQueue<i16>>,
    errors: Sender<DeviceError>,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let value = T::from_sample(ring.pop().unwrap_or(0));
                    for slot in frame.iter_mut() {
                        *slot = value;
                    }
                }
            },
            move |err| {
                let _ = errors.try_send(DeviceError::DeviceLost(err.to_string()));
            },
            None,
        )
        .map_err(|e| DeviceError::StreamError(e.to_string()))
}

impl AudioSink for CpalSink {
    fn write_chunk(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::DeviceLost("stream closed".into()));
        }
        let needed = samples.len().min(self.ring.capacity());
        let deadline = Instant::now() + self.stall_timeout;
        while self.ring.capacity() - self.ring.len() < needed {
            if let Ok(err) = self.errors.try_recv() {
                return Err(err);
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Stalled(self.stall_timeout.as_millis() as u64));
            }
            thread::sleep(Duration::from_millis(1));
        }
        for &sample in samples {
            let _ = self.ring.force_push(sample);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        while self.ring.pop().is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = device_capabilities(&device, true);
            devices.push(AudioDeviceInfo {
                id: format!("input:{}", name),
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let is_default = default_output.as_ref() == Some(&name);

            // Duplex devices show up once, flagged for both directions
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
                continue;
            }
            let (sample_rates, channels) = device_capabilities(&device, false);
            devices.push(AudioDeviceInfo {
                id: format!("output:{}", name),
                name,
                is_input: false,
                is_output: true,
                is_default,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

/// Common sample rates and channel counts a device supports
fn device_capabilities(device: &cpal::Device, input: bool) -> (Vec<u32>, Vec<u16>) {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = if input {
        device
            .supported_input_configs()
            .map(|it| it.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|it| it.collect())
            .unwrap_or_default()
    };

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for range in &ranges {
        for rate in [16000u32, 22050, 44100, 48000, 96000] {
            let r = cpal::SampleRate(rate);
            if r >= range.min_sample_rate() && r <= range.max_sample_rate() && !rates.contains(&rate)
            {
                rates.push(rate);
            }
        }
        if !channels.contains(&range.channels()) {
            channels.push(range.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Find a device by the ID reported from [`list_devices`].
///
/// IDs are `input:<name>` or `output:<name>`; a bare name is looked up among
/// inputs first, then outputs.
pub fn get_device_by_id(id: &str) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    let not_found = || DeviceError::DeviceNotFound(id.to_string());

    let (search_inputs, search_outputs, name) = if let Some(name) = id.strip_prefix("input:") {
        (true, false, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (false, true, name)
    } else {
        (true, true, id)
    };

    if search_inputs {
        let mut inputs = host.input_devices().map_err(|_| not_found())?;
        if let Some(device) = inputs.find(|d| d.name().map(|n| n == name).unwrap_or(false)) {
            return Ok(device);
        }
    }
    if search_outputs {
        let mut outputs = host.output_devices().map_err(|_| not_found())?;
        if let Some(device) = outputs.find(|d| d.name().map(|n| n == name).unwrap_or(false)) {
            return Ok(device);
        }
    }
    Err(not_found())
}
