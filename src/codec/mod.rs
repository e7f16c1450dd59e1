//! Wire codec
//!
//! Packet header encoding/decoding, chunk fragmentation, the PCM payload
//! format and sequence unwrapping. Everything here is a pure transform.

pub mod chunk;
pub mod packet;
pub mod sequence;

pub use chunk::{decode_chunk, encode_chunk};
pub use packet::{Packet, PacketCodec, HEADER_SIZE, MAGIC};
pub use sequence::SequenceUnwrapper;
