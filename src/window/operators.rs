// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pipeline `Operator` adapters for the Build/Probe pairs in this module
//! (spec.md §4.9, §4.10): `BuildOperator` lifts each record into a shared
//! `SliceStore`, and `ProbeOperator` drains it once the global watermark
//! passes a window's end, emitting the trigger's output records to a
//! successor pipeline via `PipelineExecutionContext::emit_buffer` — the
//! same control-buffer path every other operator uses, rather than a
//! bespoke per-join-kind trigger type.
//!
//! Grounded on the teacher's `ConsensusHandler` trait-object registration in
//! `authority_service.rs` for the type-erased `GlobalHandlers` lookup, and on
//! `commit_vote_monitor.rs`'s watermark-update-then-recompute shape for
//! `ProbeOperator::close`.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::TupleBuffer;
use crate::error::{RuntimeError, RuntimeResult};
use crate::hashmap::ChainedHashMap;
use crate::layout::Record;
use crate::metrics::Metrics;
use crate::paged_vector::PagedVector;
use crate::pipeline::{Operator, OperatorId, PipelineExecutionContext, PipelineId};
use crate::slice_store::{SliceStore, TriggerTask};
use crate::watermark::{SequenceData, WatermarkProcessor};

use super::aggregation::{AggregationBuild, AggregationProbe};
use super::join::{HashJoinBuild, HashJoinProbe, NestedLoopJoinBuild, NestedLoopJoinProbe};

/// Common shape of a Build's `process`, so one `BuildOperator<S, B>` can
/// host any of `AggregationBuild`/`NestedLoopJoinBuild`/`HashJoinBuild`.
pub trait WindowBuild<S>: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn process(&self, store: &mut SliceStore<S>, worker_id: usize, origin_id: u64, record: &Record, ts: u64, metrics: &Metrics) -> bool;
}

impl WindowBuild<ChainedHashMap> for AggregationBuild {
    fn process(&self, store: &mut SliceStore<ChainedHashMap>, worker_id: usize, origin_id: u64, record: &Record, ts: u64, metrics: &Metrics) -> bool {
        AggregationBuild::process(self, store, worker_id, origin_id, record, ts, metrics)
    }
}

impl WindowBuild<(PagedVector, PagedVector)> for NestedLoopJoinBuild {
    fn process(
        &self,
        store: &mut SliceStore<(PagedVector, PagedVector)>,
        worker_id: usize,
        origin_id: u64,
        record: &Record,
        ts: u64,
        metrics: &Metrics,
    ) -> bool {
        NestedLoopJoinBuild::process(self, store, worker_id, origin_id, record, ts, metrics)
    }
}

impl WindowBuild<(ChainedHashMap, ChainedHashMap)> for HashJoinBuild {
    fn process(
        &self,
        store: &mut SliceStore<(ChainedHashMap, ChainedHashMap)>,
        worker_id: usize,
        origin_id: u64,
        record: &Record,
        ts: u64,
        metrics: &Metrics,
    ) -> bool {
        HashJoinBuild::process(self, store, worker_id, origin_id, record, ts, metrics)
    }
}

/// Common shape of a Probe's `emit`, so one `ProbeOperator<S, P>` can host
/// any of `AggregationProbe`/`NestedLoopJoinProbe`/`HashJoinProbe`.
pub trait WindowProbe<S>: Send + Sync {
    fn emit(&self, store: &SliceStore<S>, task: &TriggerTask) -> Vec<Record>;
}

impl WindowProbe<ChainedHashMap> for AggregationProbe {
    fn emit(&self, store: &SliceStore<ChainedHashMap>, task: &TriggerTask) -> Vec<Record> {
        AggregationProbe::emit(self, store, task)
    }
}

impl WindowProbe<(PagedVector, PagedVector)> for NestedLoopJoinProbe {
    fn emit(&self, store: &SliceStore<(PagedVector, PagedVector)>, task: &TriggerTask) -> Vec<Record> {
        NestedLoopJoinProbe::emit(self, store, task)
    }
}

impl WindowProbe<(ChainedHashMap, ChainedHashMap)> for HashJoinProbe {
    fn emit(&self, store: &SliceStore<(ChainedHashMap, ChainedHashMap)>, task: &TriggerTask) -> Vec<Record> {
        HashJoinProbe::emit(self, store, task)
    }
}

/// Lifts each incoming record into the slice store registered under
/// `handler_key`, which a paired `ProbeOperator` drains on the same key.
/// `ts_field` names the record's event-time column.
pub struct BuildOperator<S, B> {
    id: OperatorId,
    build: B,
    ts_field: usize,
    handler_key: OperatorId,
    _marker: PhantomData<fn() -> S>,
}

impl<S, B> BuildOperator<S, B> {
    pub fn new(id: OperatorId, build: B, ts_field: usize, handler_key: OperatorId) -> Self {
        Self {
            id,
            build,
            ts_field,
            handler_key,
            _marker: PhantomData,
        }
    }
}

impl<S: Send + Sync + 'static, B: WindowBuild<S> + 'static> Operator for BuildOperator<S, B> {
    fn operator_id(&self) -> OperatorId {
        self.id
    }

    fn open(&self, ctx: &mut PipelineExecutionContext, buffer: &TupleBuffer) {
        ctx.set_local_state(self.id, Box::new(buffer.header().origin_id));
    }

    fn execute(&self, ctx: &mut PipelineExecutionContext, record: &Record) -> RuntimeResult<()> {
        let origin_id = ctx.get_local_state::<u64>(self.id).copied().unwrap_or(0);
        let ts = record.get(self.ts_field).as_u64().ok_or_else(|| RuntimeError::OperatorExecution {
            pipeline_id: ctx.pipeline_id,
            operator_id: self.id,
            message: format!("field {} is not a u64 event-time column", self.ts_field),
        })?;
        let store = ctx
            .get_global_operator_handler::<Mutex<SliceStore<S>>>(self.handler_key)
            .ok_or_else(|| RuntimeError::OperatorExecution {
                pipeline_id: ctx.pipeline_id,
                operator_id: self.id,
                message: format!("no slice store registered under handler key {}", self.handler_key),
            })?;
        let mut guard = store.lock();
        self.build.process(&mut guard, ctx.worker_thread_id, origin_id, record, ts, ctx.metrics());
        Ok(())
    }
}

/// Drains the slice store registered under `handler_key` whenever the
/// watermark registered under `watermark_key` advances past a window's end,
/// emitting the triggered records to `successor_pipeline`. Runs from
/// `close` (once per buffer, after every record in it has been built) and
/// again from `terminate` (spec.md §8 scenario 6, graceful stop flushes
/// every remaining window regardless of watermark).
pub struct ProbeOperator<S, P> {
    id: OperatorId,
    probe: P,
    handler_key: OperatorId,
    watermark_key: OperatorId,
    successor_pipeline: PipelineId,
    _marker: PhantomData<fn() -> S>,
}

impl<S, P> ProbeOperator<S, P> {
    pub fn new(id: OperatorId, probe: P, handler_key: OperatorId, watermark_key: OperatorId, successor_pipeline: PipelineId) -> Self {
        Self {
            id,
            probe,
            handler_key,
            watermark_key,
            successor_pipeline,
            _marker: PhantomData,
        }
    }

    fn drain_tasks(&self, ctx: &mut PipelineExecutionContext, tasks: Vec<TriggerTask>)
    where
        S: Send + Sync + 'static,
        P: WindowProbe<S>,
    {
        if tasks.is_empty() {
            return;
        }
        let Some(store) = ctx.get_global_operator_handler::<Mutex<SliceStore<S>>>(self.handler_key) else {
            return;
        };
        let guard = store.lock();
        for task in &tasks {
            let records = self.probe.emit(&guard, task);
            if records.is_empty() {
                continue;
            }
            let buffer = TupleBuffer::new_unpooled(records.len());
            ctx.emit_buffer(self.successor_pipeline, buffer, records);
        }
    }
}

impl<S: Send + Sync + 'static, P: WindowProbe<S> + 'static> Operator for ProbeOperator<S, P> {
    fn operator_id(&self) -> OperatorId {
        self.id
    }

    /// A trigger task has no per-record work of its own; output is produced
    /// entirely from `close`/`terminate` once the watermark says a window
    /// is ready.
    fn execute(&self, _ctx: &mut PipelineExecutionContext, _record: &Record) -> RuntimeResult<()> {
        Ok(())
    }

    fn close(&self, ctx: &mut PipelineExecutionContext, buffer: &TupleBuffer) {
        let header = buffer.header();
        let global_watermark = match ctx.get_global_operator_handler::<WatermarkProcessor>(self.watermark_key) {
            Some(watermark) => {
                let sd = SequenceData {
                    seq: header.sequence_number,
                    chunk: header.chunk_number,
                    last_chunk: header.last_chunk,
                };
                watermark.update(header.origin_id, sd, header.watermark_ts)
            }
            None => header.watermark_ts,
        };

        let Some(store) = ctx.get_global_operator_handler::<Mutex<SliceStore<S>>>(self.handler_key) else {
            return;
        };
        let tasks = store.lock().advance_watermark(global_watermark);
        self.drain_tasks(ctx, tasks);
    }

    fn terminate(&self, ctx: &mut PipelineExecutionContext) {
        let Some(store) = ctx.get_global_operator_handler::<Mutex<SliceStore<S>>>(self.handler_key) else {
            return;
        };
        let tasks = store.lock().trigger_all_remaining();
        self.drain_tasks(ctx, tasks);
    }
}

pub type AggregationBuildOperator = BuildOperator<ChainedHashMap, AggregationBuild>;
pub type AggregationProbeOperator = ProbeOperator<ChainedHashMap, AggregationProbe>;
pub type NestedLoopJoinBuildOperator = BuildOperator<(PagedVector, PagedVector), NestedLoopJoinBuild>;
pub type NestedLoopJoinProbeOperator = ProbeOperator<(PagedVector, PagedVector), NestedLoopJoinProbe>;
pub type HashJoinBuildOperator = BuildOperator<(ChainedHashMap, ChainedHashMap), HashJoinBuild>;
pub type HashJoinProbeOperator = ProbeOperator<(ChainedHashMap, ChainedHashMap), HashJoinProbe>;
