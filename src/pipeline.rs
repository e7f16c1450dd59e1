//! One peer's side of a call
//!
//! Wires the outgoing direction (capture → transmit) and the incoming
//! direction (receive → synchronize → play). The two directions share only
//! the media clock.

use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::audio::capture::{CaptureEvent, Capturer};
use crate::audio::device::AudioBackend;
use crate::audio::playback::Player;
use crate::clock::MediaClock;
use crate::config::AppConfig;
use crate::error::{DeviceError, Result, SyncError};
use crate::network::{Receiver, Transmitter};
use crate::protocol::{AudioActivity, AudioDeviceInfo, TelemetrySnapshot};
use crate::sync::{ChunkIntake, PlayoutSource, SharedSynchronizer};

pub struct VoicePipeline {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    capturer: Capturer,
    transmitter: Transmitter,
    receiver: Receiver,
    synchronizer: Arc<SharedSynchronizer>,
    player: Player,
    started_at: Option<Instant>,
    stopped: bool,
}

impl VoicePipeline {
    pub fn new(config: AppConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let clock = MediaClock::new();
        let spec = config.audio.stream_spec();

        let synchronizer = Arc::new(SharedSynchronizer::new(config.sync.clone(), &spec, clock));
        let intake: Arc<dyn ChunkIntake> = synchronizer.clone();
        let playout: Arc<dyn PlayoutSource> = synchronizer.clone();

        let transmitter = Transmitter::new(config.network.clone());
        let capturer = Capturer::new(config.audio.clone(), backend.clone(), clock);
        let enqueue = transmitter.enqueuer();
        capturer.set_callback(move |event| match event {
            CaptureEvent::Chunk(chunk) => enqueue(chunk),
            CaptureEvent::Error(e) => tracing::error!("Outgoing audio stopped: {}", e),
        });
        let player = Player::new(config.audio.clone(), backend.clone(), playout);
        player.set_error_callback(|e| tracing::error!("Incoming audio stopped: {}", e));

        Self {
            receiver: Receiver::new(config.network.clone(), intake, clock),
            player,
            capturer,
            transmitter,
            synchronizer,
            backend,
            config,
            started_at: None,
            stopped: false,
        }
    }

    /// Start both directions and return the local listening address.
    ///
    /// `peer` overrides the configured peer. Without any peer the pipeline
    /// still receives and plays, and outgoing audio is discarded until
    /// [`set_peer`](Self::set_peer) is called. If any part fails to start,
    /// everything started so far is stopped again.
    pub fn start(&mut self, peer: Option<SocketAddr>) -> Result<SocketAddr> {
        if self.stopped {
            return Err(SyncError::Stopped.into());
        }
        self.config.validate()?;
        if let Some(addr) = self.receiver.local_addr() {
            return Ok(addr);
        }
        if peer.is_some() {
            self.transmitter.set_peer(peer);
        }

        match self.start_components() {
            Ok(addr) => {
                self.started_at = Some(Instant::now());
                tracing::info!("Call pipeline up, listening on {}", addr);
                Ok(addr)
            }
            Err(e) => {
                tracing::error!("Call pipeline failed to start: {}", e);
                self.shutdown_components();
                Err(e)
            }
        }
    }

    fn start_components(&mut self) -> Result<SocketAddr> {
        let listen = self.receiver.start()?;
        self.player
            .start(self.config.audio.output_device.as_deref())?;
        self.transmitter.start()?;
        self.capturer
            .start(self.config.audio.input_device.as_deref())?;
        Ok(listen)
    }

    fn shutdown_components(&mut self) {
        self.capturer.stop();
        self.transmitter.stop();
        self.receiver.stop();
        self.player.stop();
    }

    /// Stop both directions. A stopped pipeline cannot be restarted.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.shutdown_components();
        self.synchronizer.stop();
        self.stopped = true;
        tracing::info!("Call pipeline stopped");
    }

    pub fn set_peer(&self, peer: Option<SocketAddr>) {
        self.transmitter.set_peer(peer);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.transmitter.peer()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.receiver.local_addr()
    }

    pub fn synchronizer(&self) -> Arc<SharedSynchronizer> {
        self.synchronizer.clone()
    }

    pub fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        self.backend.list_devices()
    }

    /// Fatal device error from either audio thread, if any
    pub fn check_errors(&self) -> Option<DeviceError> {
        self.capturer
            .check_errors()
            .or_else(|| self.player.check_errors())
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        let send = self.transmitter.stats().snapshot();
        let receive = self.receiver.stats().snapshot();
        TelemetrySnapshot {
            taken_at: Utc::now(),
            uptime_secs: self
                .started_at
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            audio: AudioActivity {
                chunks_captured: self.capturer.chunks_captured(),
                silent_chunks: self.capturer.silent_chunks(),
                input_level: self.capturer.current_input_level(),
                input_level_db: self.capturer.current_input_level_db(),
                chunks_played: self.player.chunks_played(),
                silence_written: self.player.silence_written(),
                outbound_queued: self.transmitter.outbound().len(),
                outbound_dropped: send.chunks_dropped_queue,
            },
            send,
            receive,
            sync: self.synchronizer.current_stats(),
        }
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::synthetic::SyntheticBackend;
    use crate::error::Error;

    fn loopback_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.bind_address = "127.0.0.1".parse().unwrap();
        config.network.listen_port = 0;
        config
    }

    #[test]
    fn test_start_without_peer_discards_outgoing() {
        let backend = Arc::new(SyntheticBackend::new());
        let mut pipeline = VoicePipeline::new(loopback_config(), backend);
        let addr = pipeline.start(None).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(pipeline.local_addr(), Some(addr));

        std::thread::sleep(std::time::Duration::from_millis(200));
        let telemetry = pipeline.telemetry();
        assert!(telemetry.audio.chunks_captured > 0);
        assert_eq!(telemetry.send.packets_sent, 0);
        pipeline.stop();
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let backend = Arc::new(SyntheticBackend::new());
        let mut config = loopback_config();
        config.audio.input_device = Some("missing".to_string());
        let mut pipeline = VoicePipeline::new(config, backend);

        let err = pipeline.start(None).unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::DeviceNotFound(_))));
        assert_eq!(pipeline.local_addr(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = loopback_config();
        config.sync.min_buffer_size = 0;
        let mut pipeline = VoicePipeline::new(config, Arc::new(SyntheticBackend::new()));
        assert!(matches!(pipeline.start(None), Err(Error::Config(_))));
    }

    #[test]
    fn test_no_restart_after_stop() {
        let mut pipeline =
            VoicePipeline::new(loopback_config(), Arc::new(SyntheticBackend::new()));
        pipeline.start(None).unwrap();
        pipeline.stop();
        assert!(matches!(
            pipeline.start(None),
            Err(Error::Sync(SyncError::Stopped))
        ));
    }
}
