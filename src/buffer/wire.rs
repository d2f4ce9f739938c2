// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bit-exact wire encoding of a tuple buffer header, for inter-worker
//! transport (spec.md §6). Unlike the teacher's `bcs`-serialized blocks,
//! this layout is a fixed-offset struct so it can be read without decoding:
//!
//! ```text
//! offset  size   field
//! 0       8      number_of_tuples
//! 8       8      watermark_ts
//! 16      8      sequence_number
//! 24      4      chunk_number
//! 28      1      last_chunk
//! 29      3      reserved (zero)
//! 32      8      origin_id
//! 40      8      creation_ts
//! 48      8      n_child_buffers
//! 56      N*16   child_buffer_descriptors (size: u64, offset: u64 pairs)
//! ```

use super::tuple_buffer::{TupleBufferHeader, WIRE_FIXED_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildBufferDescriptor {
    pub size: u64,
    pub offset: u64,
}

pub fn serialize_header(header: &TupleBufferHeader, children: &[ChildBufferDescriptor]) -> Vec<u8> {
    let mut out = vec![0u8; WIRE_FIXED_HEADER_SIZE + children.len() * 16];
    out[0..8].copy_from_slice(&header.number_of_tuples.to_le_bytes());
    out[8..16].copy_from_slice(&header.watermark_ts.to_le_bytes());
    out[16..24].copy_from_slice(&header.sequence_number.to_le_bytes());
    out[24..28].copy_from_slice(&header.chunk_number.to_le_bytes());
    out[28] = header.last_chunk as u8;
    // bytes 29..32 stay reserved/zero.
    out[32..40].copy_from_slice(&header.origin_id.to_le_bytes());
    out[40..48].copy_from_slice(&header.creation_ts.to_le_bytes());
    out[48..56].copy_from_slice(&(children.len() as u64).to_le_bytes());
    for (i, child) in children.iter().enumerate() {
        let base = WIRE_FIXED_HEADER_SIZE + i * 16;
        out[base..base + 8].copy_from_slice(&child.size.to_le_bytes());
        out[base + 8..base + 16].copy_from_slice(&child.offset.to_le_bytes());
    }
    out
}

pub fn deserialize_header(
    bytes: &[u8],
) -> Option<(TupleBufferHeader, Vec<ChildBufferDescriptor>)> {
    if bytes.len() < WIRE_FIXED_HEADER_SIZE {
        return None;
    }
    let read_u64 = |range: std::ops::Range<usize>| {
        u64::from_le_bytes(bytes[range].try_into().unwrap())
    };
    let header = TupleBufferHeader {
        number_of_tuples: read_u64(0..8),
        watermark_ts: read_u64(8..16),
        sequence_number: read_u64(16..24),
        chunk_number: u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
        last_chunk: bytes[28] != 0,
        origin_id: read_u64(32..40),
        creation_ts: read_u64(40..48),
    };
    let n_children = read_u64(48..56) as usize;
    let mut children = Vec::with_capacity(n_children);
    for i in 0..n_children {
        let base = WIRE_FIXED_HEADER_SIZE + i * 16;
        if bytes.len() < base + 16 {
            return None;
        }
        children.push(ChildBufferDescriptor {
            size: read_u64(base..base + 8),
            offset: read_u64(base + 8..base + 16),
        });
    }
    Some((header, children))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_bit_exact() {
        let header = TupleBufferHeader {
            number_of_tuples: 3,
            watermark_ts: 1000,
            sequence_number: 42,
            chunk_number: 1,
            last_chunk: true,
            origin_id: 7,
            creation_ts: 123456,
        };
        let children = vec![
            ChildBufferDescriptor {
                size: 16,
                offset: 0,
            },
            ChildBufferDescriptor {
                size: 32,
                offset: 16,
            },
        ];
        let bytes = serialize_header(&header, &children);
        let (decoded_header, decoded_children) = deserialize_header(&bytes).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_children, children);
    }

    #[test]
    fn reserved_bytes_are_zero() {
        let bytes = serialize_header(&TupleBufferHeader::default(), &[]);
        assert_eq!(&bytes[29..32], &[0, 0, 0]);
    }

    #[test]
    fn truncated_buffer_fails_to_decode() {
        assert!(deserialize_header(&[0u8; 10]).is_none());
    }
}
