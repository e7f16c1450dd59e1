//! Audio chunk payload serialization
//!
//! Samples travel as consecutive little-endian `i16` values, two bytes per
//! frame. Only the packet header uses network byte order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::audio::buffer::AudioChunk;
use crate::error::DecodeError;

/// Serialize a chunk's samples
pub fn encode_chunk(chunk: &AudioChunk) -> Bytes {
    let mut buf = BytesMut::with_capacity(chunk.len() * 2);
    for &sample in chunk.samples() {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Rebuild a chunk from reassembled payload bytes
pub fn decode_chunk(payload: &[u8]) -> Result<AudioChunk, DecodeError> {
    if payload.len() % 2 != 0 {
        return Err(DecodeError::OddPayloadLength(payload.len()));
    }
    let mut buf = payload;
    let mut samples = Vec::with_capacity(payload.len() / 2);
    while buf.has_remaining() {
        samples.push(buf.get_i16_le());
    }
    Ok(AudioChunk::new(samples))
}
