// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pipeline Execution Context and Executable Pipeline (spec.md §4.10, §6).
//!
//! Operators are trait objects installed once per pipeline; the context
//! threads buffer pools, metrics, per-operator local state, and a registry
//! of shared ("global") handlers through every invocation, the way the
//! teacher's `Context` is threaded through `Core`/`BlockManager`/etc. as a
//! shared `Arc`, except here each worker thread gets its own mutable
//! context rather than sharing one behind a lock — operators never suspend
//! (spec.md §5), so no synchronization is needed inside one invocation.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{BufferPool, TupleBuffer};
use crate::error::{RuntimeError, RuntimeResult};
use crate::layout::Record;
use crate::metrics::Metrics;

pub type PipelineId = u64;
pub type OperatorId = u64;

/// Per-operator local state, type-erased so the context can hold a
/// heterogeneous map without a shared state type across operators
/// (spec.md §4.10 "set_local_state"/"get_local_state").
pub trait OperatorState: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> OperatorState for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A handler shared across every worker thread for one operator (e.g. a
/// `SliceStore` behind a lock, or a `WatermarkProcessor`), registered once
/// at pipeline install and looked up by every worker invocation
/// (spec.md §4.10 "get_global_operator_handler").
pub trait OperatorHandler: Send + Sync + Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> OperatorHandler for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct GlobalHandlers {
    handlers: HashMap<OperatorId, Arc<dyn OperatorHandler>>,
}

impl GlobalHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operator_id: OperatorId, handler: Arc<dyn OperatorHandler>) {
        self.handlers.insert(operator_id, handler);
    }

    pub fn get<T: 'static>(&self, operator_id: OperatorId) -> Option<&T> {
        self.handlers.get(&operator_id)?.as_any().downcast_ref::<T>()
    }
}

/// A buffer handed to a successor pipeline's work queue (spec.md §4.10
/// "Emission"), together with the records already decoded from it so the
/// Query Manager's worker pool can dispatch straight into the next
/// pipeline's `execute` without re-parsing the wire layout.
pub struct EmittedWorkItem {
    pub successor_pipeline: PipelineId,
    pub buffer: TupleBuffer,
    pub records: Vec<Record>,
}

/// Runtime services handed to every operator invocation (spec.md §4.10).
/// One instance per worker thread per pipeline invocation; not `Sync` —
/// nothing here is shared across threads except through `Arc` fields.
pub struct PipelineExecutionContext {
    pub worker_thread_id: usize,
    pub pipeline_id: PipelineId,
    local_pool: Arc<BufferPool>,
    global_pool: Arc<BufferPool>,
    global_handlers: Arc<GlobalHandlers>,
    metrics: Arc<Metrics>,
    local_state: HashMap<OperatorId, Box<dyn OperatorState>>,
    emitted: Vec<EmittedWorkItem>,
}

impl PipelineExecutionContext {
    pub fn new(
        worker_thread_id: usize,
        pipeline_id: PipelineId,
        local_pool: Arc<BufferPool>,
        global_pool: Arc<BufferPool>,
        global_handlers: Arc<GlobalHandlers>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            worker_thread_id,
            pipeline_id,
            local_pool,
            global_pool,
            global_handlers,
            metrics,
            local_state: HashMap::new(),
            emitted: Vec::new(),
        }
    }

    pub fn local_pool(&self) -> &Arc<BufferPool> {
        &self.local_pool
    }

    pub fn global_pool(&self) -> &Arc<BufferPool> {
        &self.global_pool
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn get_global_operator_handler<T: 'static>(&self, operator_id: OperatorId) -> Option<&T> {
        self.global_handlers.get(operator_id)
    }

    pub fn set_local_state(&mut self, operator_id: OperatorId, state: Box<dyn OperatorState>) {
        self.local_state.insert(operator_id, state);
    }

    pub fn get_local_state<T: 'static>(&mut self, operator_id: OperatorId) -> Option<&mut T> {
        self.local_state.get_mut(&operator_id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Appends `buffer` (with its decoded `records`) to the queue of work
    /// items for `successor_pipeline` (spec.md §4.10 "Emission"); the Query
    /// Manager dispatches these via its worker pool.
    pub fn emit_buffer(&mut self, successor_pipeline: PipelineId, buffer: TupleBuffer, records: Vec<Record>) {
        self.emitted.push(EmittedWorkItem {
            successor_pipeline,
            buffer,
            records,
        });
    }

    pub(crate) fn drain_emitted(&mut self) -> Vec<EmittedWorkItem> {
        std::mem::take(&mut self.emitted)
    }
}

/// One physical operator's lifecycle hooks (spec.md §4.10): `setup` once at
/// install, `open`/`close` bracket one buffer, `execute` runs per record,
/// `terminate` runs at pipeline shutdown.
pub trait Operator: Send + Sync {
    fn operator_id(&self) -> OperatorId;
    fn setup(&self, _ctx: &mut PipelineExecutionContext) {}
    fn open(&self, _ctx: &mut PipelineExecutionContext, _buffer: &TupleBuffer) {}
    fn execute(&self, ctx: &mut PipelineExecutionContext, record: &Record) -> RuntimeResult<()>;
    fn close(&self, _ctx: &mut PipelineExecutionContext, _buffer: &TupleBuffer) {}
    fn terminate(&self, _ctx: &mut PipelineExecutionContext) {}
}

/// Attaches the failing `(pipeline_id, operator_id)` to an operator's error
/// (spec.md §7: "errors are reported with the triple ... when available"),
/// unless the operator already reported that triple itself.
fn wrap_operator_error(pipeline_id: PipelineId, operator_id: OperatorId, err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::OperatorExecution { .. } => err,
        other => RuntimeError::OperatorExecution {
            pipeline_id,
            operator_id,
            message: other.to_string(),
        },
    }
}

/// A linear chain of operators installed on one pipeline (spec.md §4.10,
/// §6 "ExecutablePipeline").
pub struct ExecutablePipeline {
    pub id: PipelineId,
    operators: Vec<Arc<dyn Operator>>,
}

impl ExecutablePipeline {
    pub fn new(id: PipelineId, operators: Vec<Arc<dyn Operator>>) -> Self {
        Self { id, operators }
    }

    pub fn setup(&self, ctx: &mut PipelineExecutionContext) {
        for op in &self.operators {
            op.setup(ctx);
        }
    }

    /// Runs `open -> execute* -> close` for one incoming buffer's records,
    /// returning whatever was emitted to successor pipelines.
    pub fn run_buffer(
        &self,
        ctx: &mut PipelineExecutionContext,
        buffer: &TupleBuffer,
        records: &[Record],
    ) -> RuntimeResult<Vec<EmittedWorkItem>> {
        for op in &self.operators {
            op.open(ctx, buffer);
        }
        for record in records {
            for op in &self.operators {
                op.execute(ctx, record).map_err(|err| wrap_operator_error(self.id, op.operator_id(), err))?;
            }
        }
        for op in &self.operators {
            op.close(ctx, buffer);
        }
        Ok(ctx.drain_emitted())
    }

    pub fn terminate(&self, ctx: &mut PipelineExecutionContext) {
        for op in &self.operators {
            op.terminate(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::layout::VarVal;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct SumOperator {
        id: OperatorId,
        total: Arc<AtomicI64>,
    }

    impl Operator for SumOperator {
        fn operator_id(&self) -> OperatorId {
            self.id
        }

        fn execute(&self, _ctx: &mut PipelineExecutionContext, record: &Record) -> RuntimeResult<()> {
            if let Some(v) = record.get(0).as_i64() {
                self.total.fetch_add(v, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn test_context() -> PipelineExecutionContext {
        let metrics = Metrics::for_test();
        let config = RuntimeConfig::default();
        let pool = BufferPool::new(1, &config, metrics.clone());
        PipelineExecutionContext::new(0, 1, pool.clone(), pool, Arc::new(GlobalHandlers::new()), metrics)
    }

    #[test]
    fn run_buffer_executes_every_record_through_every_operator() {
        let total = Arc::new(AtomicI64::new(0));
        let pipeline = ExecutablePipeline::new(
            1,
            vec![Arc::new(SumOperator {
                id: 1,
                total: total.clone(),
            })],
        );
        let mut ctx = test_context();
        let buffer = TupleBuffer::new_unpooled(8);
        let records = vec![Record::new(vec![VarVal::I64(3)]), Record::new(vec![VarVal::I64(4)])];
        pipeline.run_buffer(&mut ctx, &buffer, &records).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn local_state_round_trips_through_downcast() {
        let mut ctx = test_context();
        ctx.set_local_state(1, Box::new(42i64));
        assert_eq!(ctx.get_local_state::<i64>(1), Some(&mut 42));
    }

    #[test]
    fn global_handlers_round_trip_through_downcast() {
        let mut handlers = GlobalHandlers::new();
        handlers.register(1, Arc::new(String::from("shared-slice-store")));
        let ctx = PipelineExecutionContext::new(
            0,
            1,
            BufferPool::new(1, &RuntimeConfig::default(), Metrics::for_test()),
            BufferPool::new(1, &RuntimeConfig::default(), Metrics::for_test()),
            Arc::new(handlers),
            Metrics::for_test(),
        );
        assert_eq!(ctx.get_global_operator_handler::<String>(1).map(|s| s.as_str()), Some("shared-slice-store"));
    }
}
