// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Aggregation Build/Probe (spec.md §4.9).
//!
//! Build reads key fields from each record, resolves the record's slice via
//! the Slice Store, and lifts (initializes or combines) aggregation state in
//! that slice's per-thread hashmap. Probe, on a trigger task, merges the
//! per-thread hashmaps of every slice composing the triggered window and
//! lowers each combined entry to an output record.

use std::sync::Arc;

use crate::hashmap::ChainedHashMap;
use crate::layout::{PhysicalType, Record, VarVal};
use crate::metrics::Metrics;
use crate::slice_store::{SliceStore, TriggerTask};

use super::fnv1a;

/// A numeric aggregation lifted into fixed-size byte state inside a
/// hashmap entry's value region (spec.md §4.9 "lift"/"lower").
pub trait AggregationFunction: Send + Sync {
    fn state_size(&self) -> usize;
    /// Seeds the state for a key's first observed value.
    fn init(&self, first: &VarVal) -> Vec<u8>;
    /// Folds one more record's value into an existing per-thread state.
    fn combine(&self, state: &mut [u8], next: &VarVal);
    /// Folds another thread's complete state into this one, used when
    /// merging per-thread hashmaps at trigger time.
    fn merge(&self, state: &mut [u8], other: &[u8]);
    fn lower(&self, state: &[u8]) -> VarVal;
}

fn read_i64(state: &[u8]) -> i64 {
    i64::from_le_bytes(state.try_into().expect("aggregation state must be 8 bytes"))
}

fn write_i64(state: &mut [u8], v: i64) {
    state.copy_from_slice(&v.to_le_bytes());
}

pub struct Sum;
impl AggregationFunction for Sum {
    fn state_size(&self) -> usize {
        8
    }
    fn init(&self, first: &VarVal) -> Vec<u8> {
        first.as_i64().unwrap_or(0).to_le_bytes().to_vec()
    }
    fn combine(&self, state: &mut [u8], next: &VarVal) {
        write_i64(state, read_i64(state) + next.as_i64().unwrap_or(0));
    }
    fn merge(&self, state: &mut [u8], other: &[u8]) {
        write_i64(state, read_i64(state) + read_i64(other));
    }
    fn lower(&self, state: &[u8]) -> VarVal {
        VarVal::I64(read_i64(state))
    }
}

pub struct Count;
impl AggregationFunction for Count {
    fn state_size(&self) -> usize {
        8
    }
    fn init(&self, _first: &VarVal) -> Vec<u8> {
        1i64.to_le_bytes().to_vec()
    }
    fn combine(&self, state: &mut [u8], _next: &VarVal) {
        write_i64(state, read_i64(state) + 1);
    }
    fn merge(&self, state: &mut [u8], other: &[u8]) {
        write_i64(state, read_i64(state) + read_i64(other));
    }
    fn lower(&self, state: &[u8]) -> VarVal {
        VarVal::I64(read_i64(state))
    }
}

pub struct Min;
impl AggregationFunction for Min {
    fn state_size(&self) -> usize {
        8
    }
    fn init(&self, first: &VarVal) -> Vec<u8> {
        first.as_i64().unwrap_or(i64::MAX).to_le_bytes().to_vec()
    }
    fn combine(&self, state: &mut [u8], next: &VarVal) {
        write_i64(state, read_i64(state).min(next.as_i64().unwrap_or(i64::MAX)));
    }
    fn merge(&self, state: &mut [u8], other: &[u8]) {
        write_i64(state, read_i64(state).min(read_i64(other)));
    }
    fn lower(&self, state: &[u8]) -> VarVal {
        VarVal::I64(read_i64(state))
    }
}

pub struct Max;
impl AggregationFunction for Max {
    fn state_size(&self) -> usize {
        8
    }
    fn init(&self, first: &VarVal) -> Vec<u8> {
        first.as_i64().unwrap_or(i64::MIN).to_le_bytes().to_vec()
    }
    fn combine(&self, state: &mut [u8], next: &VarVal) {
        write_i64(state, read_i64(state).max(next.as_i64().unwrap_or(i64::MIN)));
    }
    fn merge(&self, state: &mut [u8], other: &[u8]) {
        write_i64(state, read_i64(state).max(read_i64(other)));
    }
    fn lower(&self, state: &[u8]) -> VarVal {
        VarVal::I64(read_i64(state))
    }
}

fn encode_field(out: &mut Vec<u8>, value: &VarVal) {
    match value {
        VarVal::I8(v) => out.push(*v as u8),
        VarVal::U8(v) => out.push(*v),
        VarVal::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        VarVal::Bool(v) => out.push(*v as u8),
        VarVal::Char(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        VarVal::VariableSizedData { .. } => panic!("variable-sized fields cannot be group keys"),
    }
}

fn decode_field(ty: PhysicalType, bytes: &[u8]) -> VarVal {
    match ty {
        PhysicalType::I8 => VarVal::I8(bytes[0] as i8),
        PhysicalType::U8 => VarVal::U8(bytes[0]),
        PhysicalType::I16 => VarVal::I16(i16::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::U16 => VarVal::U16(u16::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::I32 => VarVal::I32(i32::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::U32 => VarVal::U32(u32::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::F32 => VarVal::F32(f32::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::I64 => VarVal::I64(i64::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::U64 => VarVal::U64(u64::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::F64 => VarVal::F64(f64::from_le_bytes(bytes.try_into().unwrap())),
        PhysicalType::Bool => VarVal::Bool(bytes[0] != 0),
        PhysicalType::Char => VarVal::Char(char::from_u32(u32::from_le_bytes(bytes.try_into().unwrap())).unwrap_or('\u{FFFD}')),
        PhysicalType::VariableSized => unreachable!("group keys are never variable-sized"),
    }
}

/// Shared key/value schema for one aggregation, used by both Build and
/// Probe so their byte layouts always agree.
pub struct AggregationSpec {
    key_fields: Vec<(usize, PhysicalType)>,
    value_field: usize,
    function: Arc<dyn AggregationFunction>,
}

impl AggregationSpec {
    pub fn new(key_fields: Vec<(usize, PhysicalType)>, value_field: usize, function: Arc<dyn AggregationFunction>) -> Self {
        Self {
            key_fields,
            value_field,
            function,
        }
    }

    pub fn key_size(&self) -> usize {
        self.key_fields.iter().map(|(_, t)| t.size_in_bytes()).sum()
    }

    fn encode_key(&self, record: &Record) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key_size());
        for &(index, _) in &self.key_fields {
            encode_field(&mut out, record.get(index));
        }
        out
    }

    fn decode_key(&self, bytes: &[u8]) -> Vec<VarVal> {
        let mut out = Vec::with_capacity(self.key_fields.len());
        let mut offset = 0;
        for &(_, ty) in &self.key_fields {
            let size = ty.size_in_bytes();
            out.push(decode_field(ty, &bytes[offset..offset + size]));
            offset += size;
        }
        out
    }

    fn new_map(&self, num_buckets: usize, entries_per_page: usize) -> ChainedHashMap {
        ChainedHashMap::new(num_buckets, self.key_size(), self.function.state_size(), entries_per_page)
    }
}

pub struct AggregationBuild {
    spec: Arc<AggregationSpec>,
    num_buckets: usize,
    entries_per_page: usize,
}

impl AggregationBuild {
    pub fn new(spec: Arc<AggregationSpec>, num_buckets: usize, entries_per_page: usize) -> Self {
        Self {
            spec,
            num_buckets,
            entries_per_page,
        }
    }

    /// Lifts `record` into the slice containing `ts`. Returns `false` when
    /// the record was dropped as too late (spec.md §4.7 "Failure").
    pub fn process(
        &self,
        slice_store: &mut SliceStore<ChainedHashMap>,
        worker_id: usize,
        origin_id: u64,
        record: &Record,
        ts: u64,
        metrics: &Metrics,
    ) -> bool {
        let spec = &self.spec;
        let num_buckets = self.num_buckets;
        let entries_per_page = self.entries_per_page;
        let Some(slice) = slice_store.get_or_create_slice(ts, || spec.new_map(num_buckets, entries_per_page)) else {
            metrics
                .late_tuples_dropped
                .with_label_values(&[&origin_id.to_string()])
                .inc();
            return false;
        };

        let map = slice.worker_state_mut(worker_id);
        let key_bytes = self.spec.encode_key(record);
        let hash = fnv1a(&key_bytes);
        let value = record.get(self.spec.value_field);
        let (entry, was_new) = map.find_or_insert(hash, &key_bytes, |candidate| candidate == key_bytes);
        if was_new {
            let seeded = self.spec.function.init(value);
            map.value_mut(entry).copy_from_slice(&seeded);
        } else {
            self.spec.function.combine(map.value_mut(entry), value);
        }
        true
    }
}

pub struct AggregationProbe {
    spec: Arc<AggregationSpec>,
    num_buckets: usize,
    entries_per_page: usize,
}

impl AggregationProbe {
    pub fn new(spec: Arc<AggregationSpec>, num_buckets: usize, entries_per_page: usize) -> Self {
        Self {
            spec,
            num_buckets,
            entries_per_page,
        }
    }

    /// Merges the per-thread hashmaps of every slice in `task` and lowers
    /// each combined entry to a `{window_start, window_end, key…, agg}`
    /// record (spec.md §4.9 "Aggregation Probe").
    pub fn emit(&self, slice_store: &SliceStore<ChainedHashMap>, task: &TriggerTask) -> Vec<Record> {
        let mut combined = self.spec.new_map(self.num_buckets, self.entries_per_page);
        for &end in &task.slice_ends {
            if let Some(slice) = slice_store.get_slice_by_end(end) {
                for worker_map in slice.per_thread_states() {
                    combined.merge_from(worker_map, |v| v.to_vec(), |existing, incoming| self.spec.function.merge(existing, incoming));
                }
            }
        }

        combined
            .iter()
            .map(|(_, key, value)| {
                let mut values = vec![VarVal::U64(task.window_start), VarVal::U64(task.window_end)];
                values.extend(self.spec.decode_key(key));
                values.push(self.spec.function.lower(value));
                Record::new(values)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice_store::WindowSpec;

    fn spec() -> Arc<AggregationSpec> {
        Arc::new(AggregationSpec::new(vec![(1, PhysicalType::U64)], 2, Arc::new(Sum)))
    }

    /// spec.md §8 scenario 1: tumbling size=10, SUM grouped by key.
    #[test]
    fn tumbling_sum_aggregation_groups_and_triggers() {
        let spec = spec();
        let build = AggregationBuild::new(spec.clone(), 8, 4);
        let probe = AggregationProbe::new(spec, 8, 4);
        let metrics = Metrics::for_test();
        let mut store: SliceStore<ChainedHashMap> = SliceStore::new(WindowSpec::new(10, 10), 1, 0);

        let rows = [(1u64, 1u64, 5i64), (2, 1, 7), (3, 2, 2), (11, 1, 9)];
        for (ts, key, val) in rows {
            let record = Record::new(vec![VarVal::U64(ts), VarVal::U64(key), VarVal::I64(val)]);
            assert!(build.process(&mut store, 0, 1, &record, ts, &metrics));
        }

        let tasks = store.advance_watermark(20);
        assert_eq!(tasks.len(), 2);
        let mut totals = std::collections::HashMap::new();
        for task in &tasks {
            for record in probe.emit(&store, task) {
                let window_start = record.get(0).as_u64().unwrap();
                let key = record.get(2).as_u64().unwrap();
                let agg = record.get(3).as_i64().unwrap();
                totals.insert((window_start, key), agg);
            }
        }
        assert_eq!(totals.get(&(0, 1)), Some(&12));
        assert_eq!(totals.get(&(0, 2)), Some(&2));
        assert_eq!(totals.get(&(10, 1)), Some(&9));
    }

    #[test]
    fn late_record_beyond_allowed_lateness_is_dropped() {
        let spec = spec();
        let build = AggregationBuild::new(spec, 8, 4);
        let metrics = Metrics::for_test();
        let mut store: SliceStore<ChainedHashMap> = SliceStore::new(WindowSpec::new(10, 10), 1, 0);
        store.advance_watermark(100);
        let record = Record::new(vec![VarVal::U64(1), VarVal::U64(1), VarVal::I64(1)]);
        assert!(!build.process(&mut store, 0, 9, &record, 1, &metrics));
        assert_eq!(metrics.late_tuples_dropped.with_label_values(&["9"]).get(), 1);
    }
}
