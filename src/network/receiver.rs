//! Incoming audio: datagram decode, reassembly and hand-off
//!
//! One thread owns the listening socket and the reassembly table. Every
//! complete chunk is stamped with its local arrival time and pushed to a
//! [`ChunkIntake`], which must not block.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::MediaClock;
use crate::codec::{decode_chunk, PacketCodec};
use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::network::reassembly::{InsertOutcome, Reassembler};
use crate::network::stats::NetworkStats;
use crate::network::udp::{create_socket, SocketOptions};
use crate::sync::{ChunkIntake, ReassembledChunk};

/// Largest datagram accepted
const RECV_BUFFER_SIZE: usize = 65_536;

pub struct Receiver {
    config: NetworkConfig,
    intake: Arc<dyn ChunkIntake>,
    clock: MediaClock,
    stats: Arc<NetworkStats>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Receiver {
    pub fn new(config: NetworkConfig, intake: Arc<dyn ChunkIntake>, clock: MediaClock) -> Self {
        Self {
            config,
            intake,
            clock,
            stats: Arc::new(NetworkStats::new()),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            local_addr: None,
        }
    }

    pub fn stats(&self) -> Arc<NetworkStats> {
        self.stats.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the listening socket and start the receive loop.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// `listen_port` is 0.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.running.load(Ordering::SeqCst) {
            if let Some(addr) = self.local_addr {
                return Ok(addr);
            }
        }

        let socket = create_socket(
            self.config.listen_addr(),
            &SocketOptions::receiver(&self.config),
        )?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let mut worker = ReceiveWorker {
            socket,
            reassembler: Reassembler::new(
                self.config.max_inflight_chunks,
                self.config.reassembly_timeout(),
            ),
            intake: self.intake.clone(),
            clock: self.clock,
            stats: self.stats.clone(),
        };
        let running = self.running.clone();

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("net-recv".to_string())
            .spawn(move || worker.run(&running))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::SpawnFailed(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        self.local_addr = Some(local_addr);
        tracing::info!("Receiver listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop the receive loop. Returns within roughly one socket read timeout.
    /// Incomplete chunks are discarded without being counted as lost.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            self.local_addr = None;
            tracing::info!("Receiver stopped");
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReceiveWorker {
    socket: UdpSocket,
    reassembler: Reassembler,
    intake: Arc<dyn ChunkIntake>,
    clock: MediaClock,
    stats: Arc<NetworkStats>,
}

impl ReceiveWorker {
    fn run(&mut self, running: &AtomicBool) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        while running.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _from)) => self.handle_datagram(&buf[..len]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                // ICMP port unreachable from a previous send on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
                Err(e) => {
                    tracing::warn!("Receive error: {}", e);
                    thread::sleep(Duration::from_millis(1));
                }
            }

            self.reassembler.sweep(Instant::now());
            let lost = self.reassembler.take_lost();
            if lost > 0 {
                self.stats.record_lost(lost);
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        self.stats.record_received(datagram.len() as u64);

        let packet = match PacketCodec::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!("Discarding datagram: {}", e);
                self.stats.record_malformed();
                return;
            }
        };

        match self.reassembler.insert(packet, Instant::now()) {
            InsertOutcome::Complete(completed) => match decode_chunk(&completed.payload) {
                Ok(chunk) => {
                    let arrival_us = self.clock.now_us();
                    self.stats
                        .record_reassembled(completed.timestamp_us, arrival_us);
                    self.intake.push(ReassembledChunk {
                        chunk,
                        sequence: completed.sequence,
                        timestamp_us: completed.timestamp_us,
                        arrival_us,
                    });
                }
                Err(e) => {
                    tracing::debug!("Chunk {} discarded: {}", completed.sequence, e);
                    self.stats.record_malformed();
                }
            },
            InsertOutcome::Pending | InsertOutcome::Duplicate { counted: false } => {}
            InsertOutcome::Duplicate { counted: true } => self.stats.record_duplicate_chunk(),
            InsertOutcome::DuplicateFragment => self.stats.record_duplicate_fragment(),
            InsertOutcome::Late => self.stats.record_late(),
            InsertOutcome::Malformed => self.stats.record_malformed(),
        }
    }
}
