//! Audio capture from an input device
//!
//! One dedicated thread owns the device: it blocks for one chunk period per
//! read and hands every chunk to a registered callback. The callback must not
//! block; in the pipeline it only pushes into the outbound queue.

use crossbeam_channel::{bounded, Receiver};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::buffer::{AudioChunk, CapturedChunk};
use crate::audio::device::{reopen_with_backoff, AudioBackend, AudioSource};
use crate::clock::MediaClock;
use crate::config::AudioConfig;
use crate::error::DeviceError;
use crate::protocol::AudioDeviceInfo;

/// What the capture thread reports to its callback
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Chunk(CapturedChunk),
    /// Fatal: the device could not be recovered and capture has stopped
    Error(DeviceError),
}

pub type CaptureCallback = Arc<dyn Fn(CaptureEvent) + Send + Sync>;

/// Counters owned by the capture thread
#[derive(Debug, Default)]
struct CaptureCounters {
    chunks: AtomicU64,
    silent: AtomicU64,
    reopens: AtomicU64,
}

pub struct Capturer {
    backend: Arc<dyn AudioBackend>,
    config: AudioConfig,
    clock: MediaClock,
    callback: Arc<RwLock<Option<CaptureCallback>>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<DeviceError>>,
    /// Latest chunk RMS, stored as f32 bits
    level: Arc<AtomicU32>,
    counters: Arc<CaptureCounters>,
}

impl Capturer {
    pub fn new(config: AudioConfig, backend: Arc<dyn AudioBackend>, clock: MediaClock) -> Self {
        Self {
            backend,
            config,
            clock,
            callback: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            level: Arc::new(AtomicU32::new(0)),
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Register the chunk consumer. May be replaced while running.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(CaptureEvent) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Open the device and start the capture thread.
    ///
    /// `device_id` overrides the configured input device. Returns once the
    /// device is open, or with the open error.
    pub fn start(&mut self, device_id: Option<&str>) -> Result<(), DeviceError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        // A previous run may have ended on its own after a fatal error
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        let device_id = device_id
            .map(str::to_string)
            .or_else(|| self.config.input_device.clone());
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);
        let (error_tx, error_rx) = bounded::<DeviceError>(16);
        self.error_rx = Some(error_rx);
        self.level.store(0f32.to_bits(), Ordering::Relaxed);

        let worker = CaptureWorker {
            backend: self.backend.clone(),
            config: self.config.clone(),
            device_id,
            clock: self.clock,
            callback: self.callback.clone(),
            running: self.running.clone(),
            level: self.level.clone(),
            counters: self.counters.clone(),
        };

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let source = match worker.open() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(fatal) = worker.run(source) {
                    tracing::error!("Capture stopped: {}", fatal);
                    let _ = error_tx.try_send(fatal.clone());
                    worker.emit(CaptureEvent::Error(fatal));
                }
                worker.running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                DeviceError::StreamError(e.to_string())
            })?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(DeviceError::StreamError("capture thread exited".into())));
        match opened {
            Ok(()) => {
                self.thread_handle = Some(handle);
                tracing::info!(
                    "Capture started: {} Hz, {} frames per chunk",
                    self.config.sample_rate,
                    self.config.chunk_frames
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                tracing::error!("Failed to open input device: {}", e);
                Err(e)
            }
        }
    }

    /// Stop capturing. The device is closed before this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// RMS of the most recent chunk, normalized 0..1
    pub fn current_input_level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Most recent chunk level in dBFS
    pub fn current_input_level_db(&self) -> f32 {
        let rms = self.current_input_level();
        if rms > 0.0 {
            (20.0 * rms.log10()).max(-96.0)
        } else {
            -96.0
        }
    }

    pub fn chunks_captured(&self) -> u64 {
        self.counters.chunks.load(Ordering::Relaxed)
    }

    pub fn silent_chunks(&self) -> u64 {
        self.counters.silent.load(Ordering::Relaxed)
    }

    /// Successful device re-opens after a failure
    pub fn device_reopens(&self) -> u64 {
        self.counters.reopens.load(Ordering::Relaxed)
    }

    pub fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        self.backend.list_devices()
    }

    /// Fatal device error from the capture thread, if any
    pub fn check_errors(&self) -> Option<DeviceError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the capture thread owns
struct CaptureWorker {
    backend: Arc<dyn AudioBackend>,
    config: AudioConfig,
    device_id: Option<String>,
    clock: MediaClock,
    callback: Arc<RwLock<Option<CaptureCallback>>>,
    running: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    counters: Arc<CaptureCounters>,
}

impl CaptureWorker {
    fn open(&self) -> Result<Box<dyn AudioSource>, DeviceError> {
        self.backend
            .open_input(&self.config.stream_spec(), self.device_id.as_deref())
    }

    fn emit(&self, event: CaptureEvent) {
        // Clone the handle so a slow callback never holds the lock
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Read until stopped. Returns an error only when the device is gone
    /// for good.
    fn run(&self, mut source: Box<dyn AudioSource>) -> Result<(), DeviceError> {
        let mut buf = vec![0i16; self.config.chunk_frames];

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = source.read_chunk(&mut buf) {
                tracing::warn!("Input device failed: {}", e);
                source.close();
                source = match reopen_with_backoff(
                    self.config.max_device_retries,
                    self.config.retry_backoff(),
                    &self.running,
                    || self.open(),
                ) {
                    Ok(source) => source,
                    // Stopped while retrying: not a device failure
                    Err(_) if !self.running.load(Ordering::SeqCst) => return Ok(()),
                    Err(fatal) => return Err(fatal),
                };
                self.counters.reopens.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Input device reopened");
                continue;
            }

            let timestamp_us = self.clock.now_us();
            let chunk = AudioChunk::new(buf.clone());
            let silent = chunk.is_silent(self.config.silence_threshold);

            self.level.store(chunk.rms().to_bits(), Ordering::Relaxed);
            self.counters.chunks.fetch_add(1, Ordering::Relaxed);
            if silent {
                self.counters.silent.fetch_add(1, Ordering::Relaxed);
            }

            self.emit(CaptureEvent::Chunk(CapturedChunk {
                chunk,
                timestamp_us,
                silent,
            }));
        }

        source.close();
        Ok(())
    }
}
