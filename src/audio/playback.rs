//! Audio playback to an output device
//!
//! The output device sets the pace: each blocking write takes one chunk
//! period, and every tick writes either the released chunk or silence so the
//! device clock never starves.

use crossbeam_channel::{bounded, Receiver};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::buffer::AudioChunk;
use crate::audio::device::{reopen_with_backoff, AudioBackend, AudioSink};
use crate::config::AudioConfig;
use crate::error::DeviceError;
use crate::sync::PlayoutSource;

/// Called once from the playback thread when the output device is given up on
pub type PlaybackErrorCallback = Arc<dyn Fn(DeviceError) + Send + Sync>;

#[derive(Debug, Default)]
struct PlaybackCounters {
    played: AtomicU64,
    silence: AtomicU64,
    reopens: AtomicU64,
}

pub struct Player {
    backend: Arc<dyn AudioBackend>,
    config: AudioConfig,
    source: Arc<dyn PlayoutSource>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<DeviceError>>,
    on_error: Arc<RwLock<Option<PlaybackErrorCallback>>>,
    counters: Arc<PlaybackCounters>,
}

impl Player {
    pub fn new(
        config: AudioConfig,
        backend: Arc<dyn AudioBackend>,
        source: Arc<dyn PlayoutSource>,
    ) -> Self {
        Self {
            backend,
            config,
            source,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            on_error: Arc::new(RwLock::new(None)),
            counters: Arc::new(PlaybackCounters::default()),
        }
    }

    /// Register a handler for the fatal device error that ends playback
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(DeviceError) + Send + Sync + 'static,
    {
        *self.on_error.write() = Some(Arc::new(callback));
    }

    /// Open the output device and start the playback thread
    pub fn start(&mut self, device_id: Option<&str>) -> Result<(), DeviceError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        let device_id = device_id
            .map(str::to_string)
            .or_else(|| self.config.output_device.clone());
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);
        let (error_tx, error_rx) = bounded::<DeviceError>(16);
        self.error_rx = Some(error_rx);

        let backend = self.backend.clone();
        let config = self.config.clone();
        let source = self.source.clone();
        let running = self.running.clone();
        let counters = self.counters.clone();
        let on_error = self.on_error.clone();

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let spec = config.stream_spec();
                let open = || backend.open_output(&spec, device_id.as_deref());
                let mut sink = match open() {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(()));
                        sink
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let silence = AudioChunk::silence(config.chunk_frames);
                while running.load(Ordering::Relaxed) {
                    let chunk = match source.poll() {
                        Some(chunk) => {
                            counters.played.fetch_add(1, Ordering::Relaxed);
                            chunk
                        }
                        None => {
                            counters.silence.fetch_add(1, Ordering::Relaxed);
                            silence.clone()
                        }
                    };

                    if let Err(e) = sink.write_chunk(chunk.samples()) {
                        tracing::warn!("Output device failed: {}", e);
                        sink.close();
                        match reopen_with_backoff(
                            config.max_device_retries,
                            config.retry_backoff(),
                            &running,
                            &open,
                        ) {
                            Ok(reopened) => {
                                sink = reopened;
                                counters.reopens.fetch_add(1, Ordering::Relaxed);
                                tracing::info!("Output device reopened");
                            }
                            Err(_) if !running.load(Ordering::SeqCst) => return,
                            Err(fatal) => {
                                tracing::error!("Playback stopped: {}", fatal);
                                let _ = error_tx.try_send(fatal.clone());
                                let callback = on_error.read().clone();
                                if let Some(callback) = callback {
                                    callback(fatal);
                                }
                                running.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
                sink.close();
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                DeviceError::StreamError(e.to_string())
            })?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(DeviceError::StreamError("playback thread exited".into())));
        match opened {
            Ok(()) => {
                self.thread_handle = Some(handle);
                tracing::info!("Playback started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                tracing::error!("Failed to open output device: {}", e);
                Err(e)
            }
        }
    }

    /// Stop playback. The device is closed before this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Playback stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Chunks released by the synchronizer and written
    pub fn chunks_played(&self) -> u64 {
        self.counters.played.load(Ordering::Relaxed)
    }

    /// Ticks that had nothing to play and wrote silence
    pub fn silence_written(&self) -> u64 {
        self.counters.silence.load(Ordering::Relaxed)
    }

    pub fn device_reopens(&self) -> u64 {
        self.counters.reopens.load(Ordering::Relaxed)
    }

    /// Fatal device error from the playback thread, if any
    pub fn check_errors(&self) -> Option<DeviceError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::synthetic::SyntheticBackend;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    /// Plays a fixed script of chunks, then nothing
    struct Scripted(Mutex<VecDeque<AudioChunk>>);

    impl PlayoutSource for Scripted {
        fn poll(&self) -> Option<AudioChunk> {
            self.0.lock().pop_front()
        }
    }

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 8000,
            chunk_frames: 40,
            retry_backoff_ms: 1,
            ..AudioConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_plays_chunks_then_silence() {
        let backend = Arc::new(SyntheticBackend::new());
        let script: VecDeque<_> = (1..=3).map(|v| AudioChunk::new(vec![v; 40])).collect();
        let source = Arc::new(Scripted(Mutex::new(script)));
        let mut player = Player::new(config(), backend.clone(), source);

        player.start(None).unwrap();
        assert!(wait_for(|| backend.write_count() >= 6));
        player.stop();

        let written = backend.written();
        assert_eq!(written[0].samples()[0], 1);
        assert_eq!(written[1].samples()[0], 2);
        assert_eq!(written[2].samples()[0], 3);
        assert!(written[3..].iter().all(|c| c.len() == 40 && c.peak() == 0));
        assert_eq!(player.chunks_played(), 3);
        assert!(player.silence_written() >= 3);
    }

    #[test]
    fn test_recovers_from_output_loss() {
        let backend = Arc::new(SyntheticBackend::new().fail_output_after(2));
        let source = Arc::new(Scripted(Mutex::new(VecDeque::new())));
        let mut player = Player::new(config(), backend.clone(), source);

        player.start(None).unwrap();
        assert!(wait_for(|| backend.write_count() >= 5));
        player.stop();
        assert_eq!(player.device_reopens(), 1);
        assert!(player.check_errors().is_none());
    }

    #[test]
    fn test_fatal_output_loss_surfaces_error() {
        let backend = Arc::new(
            SyntheticBackend::new()
                .fail_output_after(1)
                .fail_opens_after(1),
        );
        let source = Arc::new(Scripted(Mutex::new(VecDeque::new())));
        let mut player = Player::new(config(), backend, source);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        player.set_error_callback(move |e| sink.lock().push(e));

        player.start(None).unwrap();
        assert!(wait_for(|| !player.is_running()));

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], DeviceError::RetriesExhausted { .. }));
        assert!(matches!(
            player.check_errors(),
            Some(DeviceError::RetriesExhausted { .. })
        ));
    }
}
