// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Query Manager: a fixed-size OS-thread worker pool draining a shared work
//! queue, and per-query lifecycle management (spec.md §4.11).
//!
//! Grounded on the teacher's `CoreThreadDispatcher`/`CoreThread` pattern
//! (a named `thread::Builder` spawn per worker, graceful shutdown by
//! draining a queue until a shutdown flag is observed) generalized from one
//! dispatcher thread per component to N worker threads pulling from one
//! shared queue, since spec.md §5 calls for a fixed worker pool with no
//! cooperative scheduler and no per-record await rather than one thread per
//! pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::buffer::{BufferPool, TupleBuffer};
use crate::config::RuntimeConfig;
use crate::error::{QueryError, RuntimeError, RuntimeResult};
use crate::layout::Record;
use crate::metrics::Metrics;
use crate::pipeline::{
    EmittedWorkItem, ExecutablePipeline, GlobalHandlers, PipelineExecutionContext, PipelineId,
};

pub type QueryId = u64;

/// How a query's presence in the worker pool ended (spec.md §4.11).
#[derive(Debug, Clone)]
pub enum TerminationType {
    /// Let in-flight buffers drain and trigger any remaining windows before
    /// retiring the query (spec.md §8 scenario 6, "graceful stop").
    Graceful,
    /// Retire immediately, abandoning queued and in-flight work.
    HardStop,
    /// An operator raised an unrecoverable error; the query is retired with
    /// the failing `(query_id, pipeline_id, operator_id)` recorded in the
    /// error (spec.md §7).
    Failure(QueryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Registered,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// A compiled query plan: the DAG of pipelines to run and the pipeline that
/// ingests external input, installed via `register_query`.
pub struct CompiledQueryPlan {
    pub pipelines: Vec<Arc<ExecutablePipeline>>,
    pub source_pipeline: PipelineId,
}

impl CompiledQueryPlan {
    fn pipeline(&self, id: PipelineId) -> Option<Arc<ExecutablePipeline>> {
        self.pipelines.iter().find(|p| p.id == id).cloned()
    }
}

struct QueryState {
    plan: CompiledQueryPlan,
    status: QueryStatus,
    termination: Option<TerminationType>,
}

/// One dispatchable unit of work: run one pipeline over one buffer's
/// already-decoded records.
struct WorkItem {
    query_id: QueryId,
    pipeline_id: PipelineId,
    buffer: TupleBuffer,
    records: Vec<Record>,
}

struct SharedQueue {
    items: VecDeque<WorkItem>,
    shutdown: bool,
}

/// Runtime services held by each worker thread; cloned into the spawned
/// thread's closure, not shared mutable state beyond what its `Arc`/`Mutex`
/// fields already guard.
struct WorkerContext {
    queries: Arc<Mutex<HashMap<QueryId, QueryState>>>,
    queue: Arc<Mutex<SharedQueue>>,
    queue_not_empty: Arc<Condvar>,
    global_pool: Arc<BufferPool>,
    global_handlers: Arc<GlobalHandlers>,
    metrics: Arc<Metrics>,
}

/// Owns the worker pool and every registered query's lifecycle
/// (spec.md §4.11). One instance per runtime process.
pub struct QueryManager {
    queries: Arc<Mutex<HashMap<QueryId, QueryState>>>,
    next_query_id: AtomicU64,
    queue: Arc<Mutex<SharedQueue>>,
    queue_not_empty: Arc<Condvar>,
    workers: Vec<JoinHandle<()>>,
    global_pool: Arc<BufferPool>,
    global_handlers: Arc<GlobalHandlers>,
    metrics: Arc<Metrics>,
}

impl QueryManager {
    pub fn new(worker_threads: usize, config: &RuntimeConfig, metrics: Arc<Metrics>) -> Self {
        let global_pool = BufferPool::new(config.global_pool_capacity, config, metrics.clone());
        let global_handlers = Arc::new(GlobalHandlers::new());
        let queries = Arc::new(Mutex::new(HashMap::new()));
        let queue = Arc::new(Mutex::new(SharedQueue {
            items: VecDeque::new(),
            shutdown: false,
        }));
        let queue_not_empty = Arc::new(Condvar::new());

        let mut workers = Vec::with_capacity(worker_threads);
        for worker_id in 0..worker_threads {
            let worker_ctx = WorkerContext {
                queries: queries.clone(),
                queue: queue.clone(),
                queue_not_empty: queue_not_empty.clone(),
                global_pool: global_pool.clone(),
                global_handlers: global_handlers.clone(),
                metrics: metrics.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("flowrt-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, worker_ctx))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            queries,
            next_query_id: AtomicU64::new(1),
            queue,
            queue_not_empty,
            workers,
            global_pool,
            global_handlers,
            metrics,
        }
    }

    pub fn global_handlers(&self) -> &Arc<GlobalHandlers> {
        &self.global_handlers
    }

    pub fn register_query(&self, plan: CompiledQueryPlan) -> QueryId {
        let query_id = self.next_query_id.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().insert(
            query_id,
            QueryState {
                plan,
                status: QueryStatus::Registered,
                termination: None,
            },
        );
        query_id
    }

    /// Marks `query_id` as running and enqueues its first buffer onto the
    /// source pipeline.
    pub fn start(&self, query_id: QueryId, source_buffer: TupleBuffer, source_records: Vec<Record>) -> RuntimeResult<()> {
        let source_pipeline = {
            let mut queries = self.queries.lock();
            let state = queries
                .get_mut(&query_id)
                .ok_or_else(|| RuntimeError::InvalidConfig(format!("unknown query {query_id}")))?;
            state.status = QueryStatus::Running;
            state.plan.source_pipeline
        };
        self.enqueue(query_id, source_pipeline, source_buffer, source_records);
        Ok(())
    }

    /// Feeds one more buffer into a running query's source pipeline
    /// (spec.md §4.11 ingestion path, called repeatedly after `start`).
    pub fn feed(&self, query_id: QueryId, buffer: TupleBuffer, records: Vec<Record>) -> RuntimeResult<()> {
        let source_pipeline = {
            let queries = self.queries.lock();
            let state = queries
                .get(&query_id)
                .ok_or_else(|| RuntimeError::InvalidConfig(format!("unknown query {query_id}")))?;
            if state.status != QueryStatus::Running {
                return Err(RuntimeError::Cancelled);
            }
            state.plan.source_pipeline
        };
        self.enqueue(query_id, source_pipeline, buffer, records);
        Ok(())
    }

    fn enqueue(&self, query_id: QueryId, pipeline_id: PipelineId, buffer: TupleBuffer, records: Vec<Record>) {
        self.metrics
            .work_items_enqueued
            .with_label_values(&[&pipeline_id.to_string()])
            .inc();
        let mut queue = self.queue.lock();
        queue.items.push_back(WorkItem {
            query_id,
            pipeline_id,
            buffer,
            records,
        });
        drop(queue);
        self.queue_not_empty.notify_one();
    }

    pub fn status(&self, query_id: QueryId) -> Option<QueryStatus> {
        self.queries.lock().get(&query_id).map(|s| s.status.clone())
    }

    /// Retires a query. `Graceful` runs `terminate()` on every pipeline so
    /// outstanding windows trigger (spec.md §8 scenario 6); `HardStop` and
    /// `Failure` skip straight to marking the query retired.
    pub fn stop(&self, query_id: QueryId, termination: TerminationType) {
        let mut queries = self.queries.lock();
        let Some(state) = queries.get_mut(&query_id) else {
            return;
        };
        if matches!(termination, TerminationType::Graceful) {
            state.status = QueryStatus::Stopping;
            let mut ctx = PipelineExecutionContext::new(
                usize::MAX,
                state.plan.source_pipeline,
                self.global_pool.clone(),
                self.global_pool.clone(),
                self.global_handlers.clone(),
                self.metrics.clone(),
            );
            for pipeline in &state.plan.pipelines {
                pipeline.terminate(&mut ctx);
            }
            // A graceful terminate can flush trigger buffers (e.g. a window
            // operator's remaining-windows emission); dispatch them the same
            // way the worker loop would rather than dropping them on the
            // floor (spec.md §8 scenario 6).
            for EmittedWorkItem {
                successor_pipeline,
                buffer,
                records,
            } in ctx.drain_emitted()
            {
                self.enqueue(query_id, successor_pipeline, buffer, records);
            }
        }
        state.status = match &termination {
            TerminationType::Failure(_) => QueryStatus::Failed,
            _ => QueryStatus::Stopped,
        };
        state.termination = Some(termination);
    }

    /// Signals every worker thread to exit once the queue drains, then
    /// joins them. Consumes `self`; queued-but-undispatched work is
    /// abandoned, matching `HardStop` semantics at the process level.
    pub fn shutdown(mut self) {
        self.queue.lock().shutdown = true;
        self.queue_not_empty.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    loop {
        let item = {
            let mut guard = ctx.queue.lock();
            loop {
                if let Some(item) = guard.items.pop_front() {
                    break Some(item);
                }
                if guard.shutdown {
                    break None;
                }
                ctx.queue_not_empty.wait(&mut guard);
            }
        };
        let Some(item) = item else {
            break;
        };

        let pipeline = {
            let queries = ctx.queries.lock();
            queries.get(&item.query_id).and_then(|s| s.plan.pipeline(item.pipeline_id))
        };
        let Some(pipeline) = pipeline else {
            warn!(query_id = item.query_id, pipeline_id = item.pipeline_id, "work item for unknown pipeline, dropping");
            continue;
        };

        let mut exec_ctx = PipelineExecutionContext::new(
            worker_id,
            item.pipeline_id,
            ctx.global_pool.clone(),
            ctx.global_pool.clone(),
            ctx.global_handlers.clone(),
            ctx.metrics.clone(),
        );

        match pipeline.run_buffer(&mut exec_ctx, &item.buffer, &item.records) {
            Ok(emitted) => {
                ctx.metrics
                    .work_items_retired
                    .with_label_values(&[&item.pipeline_id.to_string()])
                    .inc();
                for EmittedWorkItem {
                    successor_pipeline,
                    buffer,
                    records,
                } in emitted
                {
                    ctx.metrics
                        .work_items_enqueued
                        .with_label_values(&[&successor_pipeline.to_string()])
                        .inc();
                    let mut queue = ctx.queue.lock();
                    queue.items.push_back(WorkItem {
                        query_id: item.query_id,
                        pipeline_id: successor_pipeline,
                        buffer,
                        records,
                    });
                    drop(queue);
                    ctx.queue_not_empty.notify_one();
                }
            }
            Err(err) => {
                error!(query_id = item.query_id, pipeline_id = item.pipeline_id, error = %err, "operator execution failed");
                ctx.metrics
                    .query_failures
                    .with_label_values(&["operator_execution"])
                    .inc();
                let mut queries = ctx.queries.lock();
                if let Some(state) = queries.get_mut(&item.query_id) {
                    state.status = QueryStatus::Failed;
                    state.termination = Some(TerminationType::Failure(err.with_query(item.query_id)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::VarVal;
    use crate::pipeline::{Operator, OperatorId};
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
    use std::time::Duration;

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
                self.total.fetch_add(v, AtomicOrdering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn start_dispatches_the_source_buffer_to_a_worker() {
        let metrics = Metrics::for_test();
        let config = RuntimeConfig::default();
        let manager = QueryManager::new(2, &config, metrics);

        let total = Arc::new(AtomicI64::new(0));
        let pipeline = Arc::new(ExecutablePipeline::new(
            1,
            vec![Arc::new(SumOperator {
                id: 1,
                total: total.clone(),
            })],
        ));
        let plan = CompiledQueryPlan {
            pipelines: vec![pipeline],
            source_pipeline: 1,
        };
        let query_id = manager.register_query(plan);
        let buffer = TupleBuffer::new_unpooled(8);
        let records = vec![Record::new(vec![VarVal::I64(5)]), Record::new(vec![VarVal::I64(6)])];
        manager.start(query_id, buffer, records).unwrap();

        for _ in 0..200 {
            if total.load(AtomicOrdering::SeqCst) == 11 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(total.load(AtomicOrdering::SeqCst), 11);
        manager.shutdown();
    }

    #[test]
    fn stop_marks_query_as_stopped() {
        let metrics = Metrics::for_test();
        let config = RuntimeConfig::default();
        let manager = QueryManager::new(1, &config, metrics);
        let plan = CompiledQueryPlan {
            pipelines: vec![Arc::new(ExecutablePipeline::new(1, vec![]))],
            source_pipeline: 1,
        };
        let query_id = manager.register_query(plan);
        manager.stop(query_id, TerminationType::HardStop);
        assert_eq!(manager.status(query_id), Some(QueryStatus::Stopped));
        manager.shutdown();
    }

    #[test]
    fn feed_rejects_a_query_that_is_not_running() {
        let metrics = Metrics::for_test();
        let config = RuntimeConfig::default();
        let manager = QueryManager::new(1, &config, metrics);
        let plan = CompiledQueryPlan {
            pipelines: vec![Arc::new(ExecutablePipeline::new(1, vec![]))],
            source_pipeline: 1,
        };
        let query_id = manager.register_query(plan);
        let result = manager.feed(query_id, TupleBuffer::new_unpooled(1), vec![]);
        assert!(result.is_err());
        manager.shutdown();
    }
}
