//! Network subsystem for UDP audio transport

pub mod reassembly;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod udp;

pub use reassembly::{CompletedChunk, InsertOutcome, Reassembler};
pub use receiver::Receiver;
pub use sender::{PacketSender, Transmitter};
pub use stats::{NetworkStats, NetworkStatsSnapshot};
pub use udp::{create_socket, SocketOptions};
