// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint blob framing for operator state (spec.md §6 "Checkpoint
//! blob"): `OperatorStateBlob { header { kind, version, op_id }, bytes }`.
//! Follows the same flat little-endian style as `buffer::wire` and
//! `watermark::WatermarkProcessor::checkpoint`.

use crate::hashmap::ChainedHashMap;
use crate::paged_vector::PagedVector;

/// Kinds of per-thread slice state a checkpoint blob can carry
/// (spec.md §6: `0=Aggregation, 1=HashJoin, 2=NestedLoopJoin`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorStateKind {
    Aggregation = 0,
    HashJoin = 1,
    NestedLoopJoin = 2,
}

impl OperatorStateKind {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Aggregation),
            1 => Some(Self::HashJoin),
            2 => Some(Self::NestedLoopJoin),
            _ => None,
        }
    }
}

const CURRENT_VERSION: u16 = 1;
const HEADER_SIZE: usize = 1 + 2 + 8;

/// A versioned, kind-tagged blob of one operator's serialized state
/// (spec.md §6). `bytes` is produced by `SliceStore::checkpoint` for the
/// operator's slice store, encoded with the per-thread state type's
/// `Checkpointable` implementation.
pub struct OperatorStateBlob {
    pub kind: OperatorStateKind,
    pub version: u16,
    pub op_id: u64,
    pub bytes: Vec<u8>,
}

impl OperatorStateBlob {
    pub fn new(kind: OperatorStateKind, op_id: u64, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            version: CURRENT_VERSION,
            op_id,
            bytes,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.bytes.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.op_id.to_le_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let kind = OperatorStateKind::from_u8(bytes[0])?;
        let version = u16::from_le_bytes(bytes[1..3].try_into().unwrap());
        let op_id = u64::from_le_bytes(bytes[3..11].try_into().unwrap());
        Some(Self {
            kind,
            version,
            op_id,
            bytes: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// A per-worker-thread slice state type that can be checkpointed to bytes
/// and restored from them. Implemented by every state type `SliceStore<S>`
/// is instantiated over (spec.md §4.7 "all_non_triggered_slices... for
/// capture/checkpoint").
pub trait Checkpointable: Sized {
    fn checkpoint(&self) -> Vec<u8>;
    fn restore(bytes: &[u8], entries_per_page: usize) -> Self;
}

impl Checkpointable for ChainedHashMap {
    fn checkpoint(&self) -> Vec<u8> {
        ChainedHashMap::checkpoint(self)
    }
    fn restore(bytes: &[u8], entries_per_page: usize) -> Self {
        ChainedHashMap::restore(bytes, entries_per_page)
    }
}

impl Checkpointable for PagedVector {
    fn checkpoint(&self) -> Vec<u8> {
        PagedVector::checkpoint(self)
    }
    fn restore(bytes: &[u8], entries_per_page: usize) -> Self {
        PagedVector::restore(bytes, entries_per_page)
    }
}

impl<A: Checkpointable, B: Checkpointable> Checkpointable for (A, B) {
    fn checkpoint(&self) -> Vec<u8> {
        let a = self.0.checkpoint();
        let b = self.1.checkpoint();
        let mut out = Vec::with_capacity(16 + a.len() + b.len());
        out.extend_from_slice(&(a.len() as u64).to_le_bytes());
        out.extend_from_slice(&a);
        out.extend_from_slice(&(b.len() as u64).to_le_bytes());
        out.extend_from_slice(&b);
        out
    }

    fn restore(bytes: &[u8], entries_per_page: usize) -> Self {
        let a_len = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
        let a = A::restore(&bytes[8..8 + a_len], entries_per_page);
        let mut offset = 8 + a_len;
        let b_len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
        offset += 8;
        let b = B::restore(&bytes[offset..offset + b_len], entries_per_page);
        (a, b)
    }
}
