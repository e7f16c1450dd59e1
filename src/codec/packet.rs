//! Wire packet format and fragmentation
//!
//! Every UDP datagram carries exactly one fragment of one audio chunk:
//!
//! ```text
//! +------------------------+
//! | magic (4)              |  "LVC1"
//! +------------------------+
//! | sequence (4, u32 BE)   |  one per chunk, shared by its fragments
//! +------------------------+
//! | timestamp (8, u64 BE)  |  capture time, microseconds
//! +------------------------+
//! | fragment_index (2, BE) |  0-based
//! +------------------------+
//! | fragment_count (2, BE) |  total fragments for this sequence
//! +------------------------+
//! | payload (variable)     |  <= max_packet_size - 20 bytes
//! +------------------------+
//! ```
//!
//! The payload length is implied by the datagram length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};

/// Protocol identifier at the start of every packet
pub const MAGIC: [u8; 4] = *b"LVC1";

/// Size of the fixed packet header in bytes
pub const HEADER_SIZE: usize = 20;

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload: Bytes,
}

/// Stateless encoder/decoder bound to a maximum datagram size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Result<Self, EncodeError> {
        if max_packet_size <= HEADER_SIZE {
            return Err(EncodeError::PacketSizeTooSmall {
                max_packet_size,
                header: HEADER_SIZE,
            });
        }
        Ok(Self { max_packet_size })
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Largest payload a single fragment can carry
    pub fn max_fragment_payload(&self) -> usize {
        self.max_packet_size - HEADER_SIZE
    }

    /// Number of fragments needed for `len` payload bytes
    pub fn fragment_count_for(&self, len: usize) -> usize {
        len.div_ceil(self.max_fragment_payload()).max(1)
    }

    /// Encode one fragment into a datagram
    pub fn encode(
        &self,
        sequence: u32,
        timestamp_us: u64,
        fragment_index: u16,
        fragment_count: u16,
        payload: &[u8],
    ) -> Result<Bytes, EncodeError> {
        let max = self.max_fragment_payload();
        if payload.len() > max {
            return Err(EncodeError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u32(sequence);
        buf.put_u64(timestamp_us);
        buf.put_u16(fragment_index);
        buf.put_u16(fragment_count);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Decode a datagram. Does not need the codec's size limit.
    pub fn decode(datagram: &[u8]) -> Result<Packet, DecodeError> {
        if datagram.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                len: datagram.len(),
                required: HEADER_SIZE,
            });
        }

        let mut buf = datagram;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(DecodeError::BadMagic { found: magic });
        }

        let sequence = buf.get_u32();
        let timestamp_us = buf.get_u64();
        let fragment_index = buf.get_u16();
        let fragment_count = buf.get_u16();
        if fragment_count == 0 || fragment_index >= fragment_count {
            return Err(DecodeError::InvalidFragment {
                index: fragment_index,
                count: fragment_count,
            });
        }

        Ok(Packet {
            sequence,
            timestamp_us,
            fragment_index,
            fragment_count,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Split a serialized chunk into encoded datagrams, in index order.
    ///
    /// An empty payload still produces one (empty) fragment so the sequence
    /// number reaches the receiver.
    pub fn fragment(
        &self,
        sequence: u32,
        timestamp_us: u64,
        data: &[u8],
    ) -> Result<Vec<Bytes>, EncodeError> {
        let count = self.fragment_count_for(data.len());
        let fragment_count =
            u16::try_from(count).map_err(|_| EncodeError::TooManyFragments { count })?;

        if data.is_empty() {
            return Ok(vec![self.encode(sequence, timestamp_us, 0, 1, &[])?]);
        }

        data.chunks(self.max_fragment_payload())
            .enumerate()
            .map(|(index, part)| {
                self.encode(sequence, timestamp_us, index as u16, fragment_count, part)
            })
            .collect()
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            max_packet_size: crate::constants::DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout_is_big_endian() {
        let codec = PacketCodec::new(64).unwrap();
        let bytes = codec
            .encode(0x0102_0304, 0x0A0B_0C0D_0E0F_1011, 2, 3, &[0xAA, 0xBB])
            .unwrap();

        assert_eq!(&bytes[0..4], b"LVC1");
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            &bytes[8..16],
            &[0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11]
        );
        assert_eq!(&bytes[16..18], &[0x00, 0x02]);
        assert_eq!(&bytes[18..20], &[0x00, 0x03]);
        assert_eq!(&bytes[20..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_round_trip() {
        let codec = PacketCodec::default();
        let bytes = codec.encode(42, 1_000_000, 1, 2, b"hello").unwrap();
        let packet = PacketCodec::decode(&bytes).unwrap();

        assert_eq!(packet.sequence, 42);
        assert_eq!(packet.timestamp_us, 1_000_000);
        assert_eq!(packet.fragment_index, 1);
        assert_eq!(packet.fragment_count, 2);
        assert_eq!(&packet.payload[..], b"hello");
    }

    #[test]
    fn test_payload_too_large() {
        let codec = PacketCodec::new(30).unwrap();
        let result = codec.encode(0, 0, 0, 1, &[0u8; 11]);
        assert_eq!(
            result,
            Err(EncodeError::PayloadTooLarge { len: 11, max: 10 })
        );
        assert!(codec.encode(0, 0, 0, 1, &[0u8; 10]).is_ok());
    }

    #[test]
    fn test_packet_size_too_small() {
        assert!(matches!(
            PacketCodec::new(HEADER_SIZE),
            Err(EncodeError::PacketSizeTooSmall { .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = PacketCodec::default().encode(1, 1, 0, 1, &[1]).unwrap().to_vec();
        bytes[0] = b'X';
        assert!(matches!(
            PacketCodec::decode(&bytes),
            Err(DecodeError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = PacketCodec::default().encode(1, 1, 0, 1, &[]).unwrap();
        assert_eq!(
            PacketCodec::decode(&bytes[..HEADER_SIZE - 1]),
            Err(DecodeError::Truncated {
                len: HEADER_SIZE - 1,
                required: HEADER_SIZE
            })
        );
        // A bare header is a valid, empty fragment
        assert!(PacketCodec::decode(&bytes[..HEADER_SIZE]).is_ok());
    }

    #[test]
    fn test_invalid_fragment_index() {
        let codec = PacketCodec::default();
        let bytes = codec.encode(1, 1, 3, 3, &[0]).unwrap();
        assert_eq!(
            PacketCodec::decode(&bytes),
            Err(DecodeError::InvalidFragment { index: 3, count: 3 })
        );

        let bytes = codec.encode(1, 1, 0, 0, &[0]).unwrap();
        assert!(PacketCodec::decode(&bytes).is_err());
    }

    #[test]
    fn test_default_chunk_needs_two_fragments() {
        // 1024 frames of i16 = 2048 bytes, 1380 bytes per fragment
        let codec = PacketCodec::default();
        let datagrams = codec.fragment(7, 99, &[0x55; 2048]).unwrap();
        assert_eq!(datagrams.len(), 2);
        assert_eq!(datagrams[0].len(), 1400);
        assert_eq!(datagrams[1].len(), HEADER_SIZE + 2048 - 1380);
    }

    #[test]
    fn test_fragment_exact_boundary() {
        let codec = PacketCodec::new(120).unwrap();
        let datagrams = codec.fragment(1, 1, &[0xCC; 200]).unwrap();
        assert_eq!(datagrams.len(), 2);
        assert!(datagrams.iter().all(|d| d.len() == 120));
    }

    #[test]
    fn test_empty_payload_single_fragment() {
        let codec = PacketCodec::default();
        let datagrams = codec.fragment(5, 0, &[]).unwrap();
        assert_eq!(datagrams.len(), 1);
        let packet = PacketCodec::decode(&datagrams[0]).unwrap();
        assert_eq!(packet.fragment_count, 1);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_too_many_fragments() {
        let codec = PacketCodec::new(HEADER_SIZE + 1).unwrap();
        let data = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            codec.fragment(0, 0, &data),
            Err(EncodeError::TooManyFragments {
                count: u16::MAX as usize + 1
            })
        );
    }

    proptest! {
        #[test]
        fn prop_fragments_reassemble_to_original(
            data in proptest::collection::vec(any::<u8>(), 1..6000),
            max_packet_size in (HEADER_SIZE + 1)..1500usize,
            sequence in any::<u32>(),
            timestamp in any::<u64>(),
        ) {
            let codec = PacketCodec::new(max_packet_size).unwrap();
            let datagrams = codec.fragment(sequence, timestamp, &data).unwrap();

            let capacity = max_packet_size - HEADER_SIZE;
            prop_assert_eq!(datagrams.len(), data.len().div_ceil(capacity));

            let mut rebuilt = Vec::with_capacity(data.len());
            for (i, datagram) in datagrams.iter().enumerate() {
                prop_assert!(datagram.len() <= max_packet_size);
                let packet = PacketCodec::decode(datagram).unwrap();
                prop_assert_eq!(packet.sequence, sequence);
                prop_assert_eq!(packet.timestamp_us, timestamp);
                prop_assert_eq!(packet.fragment_index as usize, i);
                prop_assert_eq!(packet.fragment_count as usize, datagrams.len());
                rebuilt.extend_from_slice(&packet.payload);
            }
            prop_assert_eq!(rebuilt, data);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = PacketCodec::decode(&bytes);
        }
    }
}
