// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chained hashmap over paged arena memory (spec.md §4.6), used for keyed
//! aggregation and join state. Entries are laid out
//! `| next_offset:u64 | hash:u64 | key_bytes | value_bytes |` inside a
//! `PagedVector` arena; chains link by arena index, not by pointer, so the
//! arena can grow without invalidating anything already inserted — the same
//! "pointer stability via append-only arena" trick `block_store.rs` relies
//! on to hand out long-lived block references.
//!
//! No resize: per spec.md §4.6, `number_of_buckets` is fixed at
//! construction from the slice's configured target load factor. Per-thread
//! Build-side instances are never shared across threads; a Probe merges
//! them into one table on the thread that wins the slice's trigger.

use crate::paged_vector::PagedVector;

/// A stable reference to an occupied slot in a `ChainedHashMap`'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef {
    index: usize,
}

const NEXT_OFFSET_SIZE: usize = 8;
const HASH_SIZE: usize = 8;
const HEADER_SIZE: usize = NEXT_OFFSET_SIZE + HASH_SIZE;

/// Chain-head sentinel meaning "no entry" (arena indices are stored as
/// `index + 1` so zero is free to mean "chain end").
const CHAIN_END: u64 = 0;

pub struct ChainedHashMap {
    chain_heads: Vec<u64>,
    mask: u64,
    arena: PagedVector,
    key_size: usize,
    value_size: usize,
}

impl ChainedHashMap {
    /// `num_buckets` must be a power of two (spec.md §4.6 "Design").
    pub fn new(num_buckets: usize, key_size: usize, value_size: usize, entries_per_page: usize) -> Self {
        assert!(num_buckets.is_power_of_two(), "num_buckets must be a power of two");
        Self {
            chain_heads: vec![CHAIN_END; num_buckets],
            mask: num_buckets as u64 - 1,
            arena: PagedVector::new(HEADER_SIZE + key_size + value_size, entries_per_page),
            key_size,
            value_size,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.total_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.total_entries() == 0
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// Scans the bucket's chain comparing hashes then `key_eq`; on hit,
    /// returns the existing entry. On miss, allocates a new entry with a
    /// zeroed value region and links it at the head of the chain. Callers
    /// use `was_new` to decide whether to initialize or combine the value
    /// (spec.md §4.9 "lift").
    pub fn find_or_insert(&mut self, hash: u64, key_bytes: &[u8], key_eq: impl Fn(&[u8]) -> bool) -> (EntryRef, bool) {
        assert_eq!(key_bytes.len(), self.key_size, "key_bytes must match this map's key_size");
        let bucket = self.bucket_of(hash);

        let mut cursor = self.chain_heads[bucket];
        while cursor != CHAIN_END {
            let index = (cursor - 1) as usize;
            let entry = self.arena.at(index);
            let stored_hash = u64::from_le_bytes(entry[NEXT_OFFSET_SIZE..HEADER_SIZE].try_into().unwrap());
            let stored_key = &entry[HEADER_SIZE..HEADER_SIZE + self.key_size];
            if stored_hash == hash && key_eq(stored_key) {
                return (EntryRef { index }, false);
            }
            cursor = u64::from_le_bytes(entry[0..NEXT_OFFSET_SIZE].try_into().unwrap());
        }

        let mut bytes = vec![0u8; HEADER_SIZE + self.key_size + self.value_size];
        bytes[0..NEXT_OFFSET_SIZE].copy_from_slice(&self.chain_heads[bucket].to_le_bytes());
        bytes[NEXT_OFFSET_SIZE..HEADER_SIZE].copy_from_slice(&hash.to_le_bytes());
        bytes[HEADER_SIZE..HEADER_SIZE + self.key_size].copy_from_slice(key_bytes);
        self.arena.append(&bytes);
        let index = self.arena.total_entries() - 1;
        self.chain_heads[bucket] = index as u64 + 1;
        (EntryRef { index }, true)
    }

    pub fn key(&self, entry: EntryRef) -> &[u8] {
        let bytes = self.arena.at(entry.index);
        &bytes[HEADER_SIZE..HEADER_SIZE + self.key_size]
    }

    pub fn value(&self, entry: EntryRef) -> &[u8] {
        let bytes = self.arena.at(entry.index);
        &bytes[HEADER_SIZE + self.key_size..]
    }

    pub fn value_mut(&mut self, entry: EntryRef) -> &mut [u8] {
        let offset = HEADER_SIZE + self.key_size;
        let bytes = self.arena.at_mut(entry.index);
        &mut bytes[offset..]
    }

    /// Chain order is undefined for iteration (spec.md §4.6), matching the
    /// arena's insertion order here.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8], &[u8])> {
        self.arena.iterate().map(move |bytes| {
            let hash = u64::from_le_bytes(bytes[NEXT_OFFSET_SIZE..HEADER_SIZE].try_into().unwrap());
            let key = &bytes[HEADER_SIZE..HEADER_SIZE + self.key_size];
            let value = &bytes[HEADER_SIZE + self.key_size..];
            (hash, key, value)
        })
    }

    /// Flat serialization for checkpointing (spec.md §6 "Checkpoint blob",
    /// kinds `Aggregation`/`HashJoin`): `[num_buckets:u64][key_size:u64]
    /// [value_size:u64][num_entries:u64]` then each entry's
    /// `[hash:u64][key_bytes][value_bytes]`. Chain order is not preserved,
    /// matching the "chain order undefined for iteration" contract.
    pub fn checkpoint(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.chain_heads.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.key_size as u64).to_le_bytes());
        out.extend_from_slice(&(self.value_size as u64).to_le_bytes());
        out.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for (hash, key, value) in self.iter() {
            out.extend_from_slice(&hash.to_le_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(value);
        }
        out
    }

    /// Inverse of `checkpoint`, re-inserting every entry with its original
    /// hash via the always-miss `key_eq` trick (see `window::join`) so
    /// entries with equal keys are never collapsed.
    pub fn restore(bytes: &[u8], entries_per_page: usize) -> Self {
        let num_buckets = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
        let key_size = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let value_size = u64::from_le_bytes(bytes[16..24].try_into().unwrap()) as usize;
        let num_entries = u64::from_le_bytes(bytes[24..32].try_into().unwrap()) as usize;
        let mut map = Self::new(num_buckets, key_size, value_size, entries_per_page);
        let mut offset = 32;
        for _ in 0..num_entries {
            let hash = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
            offset += 8;
            let key = bytes[offset..offset + key_size].to_vec();
            offset += key_size;
            let value = &bytes[offset..offset + value_size];
            offset += value_size;
            let (entry, _) = map.find_or_insert(hash, &key, |_| false);
            map.value_mut(entry).copy_from_slice(value);
        }
        map
    }

    /// Re-inserts every entry of `other` into `self`, calling `combine` for
    /// keys already present and `init` to seed the value for new ones. Used
    /// by a Probe to merge per-thread Build-side tables into one before
    /// iterating (spec.md §4.9 "Aggregation Probe").
    pub fn merge_from(
        &mut self,
        other: &ChainedHashMap,
        mut init: impl FnMut(&[u8]) -> Vec<u8>,
        mut combine: impl FnMut(&mut [u8], &[u8]),
    ) {
        for (hash, key, value) in other.iter() {
            let key_owned = key.to_vec();
            let (entry, was_new) = self.find_or_insert(hash, &key_owned, |candidate| candidate == key);
            if was_new {
                let seeded = init(value);
                self.value_mut(entry).copy_from_slice(&seeded);
            } else {
                combine(self.value_mut(entry), value);
            }
        }
    }
}
