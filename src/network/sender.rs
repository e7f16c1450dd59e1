//! Outgoing audio: sequencing, fragmentation and the send loop
//!
//! Capture pushes into a bounded outbound queue and never waits on the
//! network. A dedicated thread drains the queue and writes datagrams to
//! whichever peer is currently set.

use parking_lot::RwLock;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{AudioChunk, CapturedChunk, ChunkQueue};
use crate::codec::{encode_chunk, PacketCodec};
use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::network::stats::NetworkStats;
use crate::network::udp::{create_socket, SocketOptions};

/// How long the send loop waits on an empty queue before rechecking `running`
const QUEUE_POLL: Duration = Duration::from_millis(20);

/// Turns chunks into sequenced datagrams on one socket
pub struct PacketSender {
    socket: UdpSocket,
    codec: PacketCodec,
    next_sequence: u32,
    stats: Arc<NetworkStats>,
}

impl PacketSender {
    pub fn new(socket: UdpSocket, codec: PacketCodec, stats: Arc<NetworkStats>) -> Self {
        Self {
            socket,
            codec,
            next_sequence: 0,
            stats,
        }
    }

    /// Bind an ephemeral socket on the configured local address
    pub fn bind(config: &NetworkConfig, stats: Arc<NetworkStats>) -> Result<Self> {
        let codec = PacketCodec::new(config.max_packet_size)?;
        let local = SocketAddr::new(config.bind_address, 0);
        let socket = create_socket(local, &SocketOptions::sender(config))?;
        Ok(Self::new(socket, codec, stats))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Sequence number the next chunk will carry
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Send one chunk as `ceil(len / max_fragment_payload)` datagrams, in
    /// index order, all stamped with `timestamp_us`. Returns the sequence
    /// number used.
    ///
    /// An encoding error leaves the sequence counter untouched. A socket
    /// error consumes the sequence; the receiver sees it as loss.
    pub fn send(&mut self, chunk: &AudioChunk, timestamp_us: u64, peer: SocketAddr) -> Result<u32> {
        let sequence = self.next_sequence;
        let payload = encode_chunk(chunk);
        let datagrams = self.codec.fragment(sequence, timestamp_us, &payload)?;
        self.next_sequence = sequence.wrapping_add(1);

        for datagram in &datagrams {
            match self.socket.send_to(datagram, peer) {
                Ok(sent) => self.stats.record_packet_sent(sent as u64),
                Err(e) => {
                    self.stats.record_send_error();
                    return Err(NetworkError::SendFailed(format!("{}: {}", peer, e)).into());
                }
            }
        }
        self.stats.record_chunk_sent();
        Ok(sequence)
    }
}

/// Outbound queue plus the thread that drains it
pub struct Transmitter {
    config: NetworkConfig,
    outbound: Arc<ChunkQueue<CapturedChunk>>,
    peer: Arc<RwLock<Option<SocketAddr>>>,
    stats: Arc<NetworkStats>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Transmitter {
    pub fn new(config: NetworkConfig) -> Self {
        let outbound = Arc::new(ChunkQueue::new(config.outbound_queue_capacity));
        let peer = Arc::new(RwLock::new(config.peer_address));
        Self {
            config,
            outbound,
            peer,
            stats: Arc::new(NetworkStats::new()),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            local_addr: None,
        }
    }

    /// Change the destination; takes effect from the next dequeued chunk
    pub fn set_peer(&self, peer: Option<SocketAddr>) {
        *self.peer.write() = peer;
        match peer {
            Some(addr) => tracing::info!("Transmitting to {}", addr),
            None => tracing::info!("Peer cleared; outgoing audio discarded"),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    /// Queue a captured chunk. Never blocks; when full, the oldest queued
    /// chunk is dropped and counted.
    pub fn enqueue(&self, chunk: CapturedChunk) {
        if !self.outbound.push(chunk) {
            self.stats.record_queue_drops(1);
        }
    }

    /// Owned equivalent of [`enqueue`](Self::enqueue) for capture callbacks
    pub fn enqueuer(&self) -> impl Fn(CapturedChunk) + Send + Sync + 'static {
        let outbound = self.outbound.clone();
        let stats = self.stats.clone();
        move |chunk| {
            if !outbound.push(chunk) {
                stats.record_queue_drops(1);
            }
        }
    }

    /// Shared handle for producers that outlive a borrow of the transmitter
    pub fn outbound(&self) -> Arc<ChunkQueue<CapturedChunk>> {
        self.outbound.clone()
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

    /// Bind the socket and start the send loop
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.running.load(Ordering::SeqCst) {
            if let Some(addr) = self.local_addr {
                return Ok(addr);
            }
        }

        let mut sender = PacketSender::bind(&self.config, self.stats.clone())?;
        let local_addr = sender
            .local_addr()
            .ok_or_else(|| NetworkError::BindFailed("no local address".to_string()))?;

        let outbound = self.outbound.clone();
        let peer = self.peer.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("net-send".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let Some(captured) = outbound.pop_timeout(QUEUE_POLL) else {
                        continue;
                    };
                    let Some(addr) = *peer.read() else {
                        stats.record_no_peer();
                        continue;
                    };
                    if let Err(e) = sender.send(&captured.chunk, captured.timestamp_us, addr) {
                        tracing::debug!("Send failed: {}", e);
                    }
                }
                // Socket closes here, before join returns
                drop(sender);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::SpawnFailed(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        self.local_addr = Some(local_addr);
        tracing::info!(
            "Transmitter started on {} (peer: {:?})",
            local_addr,
            self.peer()
        );
        Ok(local_addr)
    }

    /// Stop the send loop and release the socket. Queued chunks are discarded.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            self.outbound.clear();
            self.local_addr = None;
            tracing::info!("Transmitter stopped");
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.stop();
    }
}
