//! Synthetic audio backend
//!
//! A sine-tone source and a recording sink, both optionally paced to real
//! time. Used by the integration tests and for running the pipeline on hosts
//! without sound hardware. Failures can be scripted to exercise the device
//! retry paths.

use parking_lot::Mutex;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::buffer::AudioChunk;
use crate::audio::device::{AudioBackend, AudioSink, AudioSource, StreamSpec};
use crate::error::DeviceError;
use crate::protocol::AudioDeviceInfo;

pub const SYNTHETIC_INPUT_ID: &str = "synthetic:tone";
pub const SYNTHETIC_OUTPUT_ID: &str = "synthetic:sink";

/// Sleeps until fixed deadlines one period apart
struct Pacer {
    period: Duration,
    next: Instant,
}

impl Pacer {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
            self.next += self.period;
        } else {
            // Fell behind; restart the schedule instead of bursting
            self.next = now + self.period;
        }
    }
}

pub struct SyntheticBackend {
    frequency_hz: f32,
    amplitude: i16,
    realtime: bool,
    input_failure_after: Option<u64>,
    output_failure_after: Option<u64>,
    opens_before_failure: Option<u32>,
    input_opens: AtomicU32,
    output_opens: AtomicU32,
    written: Arc<Mutex<Vec<AudioChunk>>>,
}

impl SyntheticBackend {
    /// 440 Hz tone at roughly -10 dBFS, paced to real time
    pub fn new() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 10_000,
            realtime: true,
            input_failure_after: None,
            output_failure_after: None,
            opens_before_failure: None,
            input_opens: AtomicU32::new(0),
            output_opens: AtomicU32::new(0),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tone(mut self, frequency_hz: f32, amplitude: i16) -> Self {
        self.frequency_hz = frequency_hz;
        self.amplitude = amplitude;
        self
    }

    /// Whether reads and writes wait for their chunk period
    pub fn paced(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// The first opened source reports `DeviceLost` after `chunks` reads
    pub fn fail_input_after(mut self, chunks: u64) -> Self {
        self.input_failure_after = Some(chunks);
        self
    }

    /// The first opened sink reports `DeviceLost` after `chunks` writes
    pub fn fail_output_after(mut self, chunks: u64) -> Self {
        self.output_failure_after = Some(chunks);
        self
    }

    /// Every open after the first `opens` (per direction) fails
    pub fn fail_opens_after(mut self, opens: u32) -> Self {
        self.opens_before_failure = Some(opens);
        self
    }

    /// Every chunk written to any sink so far
    pub fn written(&self) -> Vec<AudioChunk> {
        self.written.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.written.lock().len()
    }

    pub fn input_opens(&self) -> u32 {
        self.input_opens.load(Ordering::SeqCst)
    }

    pub fn output_opens(&self) -> u32 {
        self.output_opens.load(Ordering::SeqCst)
    }

    fn check_open(&self, counter: &AtomicU32, device_id: Option<&str>, expected: &str) -> Result<u32, DeviceError> {
        if let Some(id) = device_id {
            if id != expected {
                return Err(DeviceError::DeviceNotFound(id.to_string()));
            }
        }
        let index = counter.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.opens_before_failure {
            if index >= limit {
                return Err(DeviceError::DeviceNotFound(format!("{} unavailable", expected)));
            }
        }
        Ok(index)
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for SyntheticBackend {
    fn open_input(
        &self,
        spec: &StreamSpec,
        device_id: Option<&str>,
    ) -> Result<Box<dyn AudioSource>, DeviceError> {
        let index = self.check_open(&self.input_opens, device_id, SYNTHETIC_INPUT_ID)?;
        Ok(Box::new(ToneSource {
            step: TAU * self.frequency_hz / spec.sample_rate.max(1) as f32,
            phase: 0.0,
            amplitude: self.amplitude as f32,
            pacer: self.realtime.then(|| Pacer::new(spec.period())),
            remaining: if index == 0 { self.input_failure_after } else { None },
            closed: false,
        }))
    }

    fn open_output(
        &self,
        spec: &StreamSpec,
        device_id: Option<&str>,
    ) -> Result<Box<dyn AudioSink>, DeviceError> {
        let index = self.check_open(&self.output_opens, device_id, SYNTHETIC_OUTPUT_ID)?;
        Ok(Box::new(RecordingSink {
            written: self.written.clone(),
            pacer: self.realtime.then(|| Pacer::new(spec.period())),
            remaining: if index == 0 { self.output_failure_after } else { None },
            closed: false,
        }))
    }

    fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        vec![
            AudioDeviceInfo {
                id: SYNTHETIC_INPUT_ID.to_string(),
                name: "Synthetic tone".to_string(),
                is_input: true,
                is_output: false,
                is_default: true,
                sample_rates: vec![16000, 44100, 48000],
                channels: vec![1],
            },
            AudioDeviceInfo {
                id: SYNTHETIC_OUTPUT_ID.to_string(),
                name: "Recording sink".to_string(),
                is_input: false,
                is_output: true,
                is_default: true,
                sample_rates: vec![16000, 44100, 48000],
                channels: vec![1],
            },
        ]
    }
}

struct ToneSource {
    step: f32,
    phase: f32,
    amplitude: f32,
    pacer: Option<Pacer>,
    remaining: Option<u64>,
    closed: bool,
}

impl AudioSource for ToneSource {
    fn read_chunk(&mut self, buf: &mut [i16]) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::DeviceLost("source closed".into()));
        }
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(DeviceError::DeviceLost("synthetic input unplugged".into()));
            }
            *remaining -= 1;
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait();
        }
        for sample in buf.iter_mut() {
            *sample = (self.phase.sin() * self.amplitude) as i16;
            self.phase = (self.phase + self.step) % TAU;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct RecordingSink {
    written: Arc<Mutex<Vec<AudioChunk>>>,
    pacer: Option<Pacer>,
    remaining: Option<u64>,
    closed: bool,
}

impl AudioSink for RecordingSink {
    fn write_chunk(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::DeviceLost("sink closed".into()));
        }
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(DeviceError::DeviceLost("synthetic output unplugged".into()));
            }
            *remaining -= 1;
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait();
        }
        self.written.lock().push(AudioChunk::new(samples.to_vec()));
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
