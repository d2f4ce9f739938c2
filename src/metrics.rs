// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

/// Metrics shared by all components of one runtime instance. Held behind an
/// `Arc` by the `PipelineExecutionContext` and `QueryManager`, mirroring how
/// the teacher's `Context` carries `Arc<Metrics>` to every component.
pub struct Metrics {
    pub buffers_acquired: IntCounter,
    pub buffers_released: IntCounter,
    pub buffer_pool_exhausted: IntCounter,
    pub unpooled_outstanding: IntGauge,

    pub late_tuples_dropped: IntCounterVec,
    pub windows_triggered: IntCounter,
    pub shredder_cas_retries: IntCounter,
    pub shredder_tuples_emitted: IntCounter,

    pub work_items_enqueued: IntCounterVec,
    pub work_items_retired: IntCounterVec,
    pub query_failures: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            buffers_acquired: register_int_counter_with_registry!(
                "flowrt_buffers_acquired_total",
                "Total tuple buffers handed out by the buffer manager",
                registry,
            )
            .unwrap(),
            buffers_released: register_int_counter_with_registry!(
                "flowrt_buffers_released_total",
                "Total tuple buffers returned to a pool",
                registry,
            )
            .unwrap(),
            buffer_pool_exhausted: register_int_counter_with_registry!(
                "flowrt_buffer_pool_exhausted_total",
                "Times a non-blocking buffer acquisition found no free buffer",
                registry,
            )
            .unwrap(),
            unpooled_outstanding: register_int_gauge_with_registry!(
                "flowrt_unpooled_buffers_outstanding",
                "Unpooled (unrecycled) buffers currently alive",
                registry,
            )
            .unwrap(),
            late_tuples_dropped: register_int_counter_vec_with_registry!(
                "flowrt_late_tuples_dropped_total",
                "Tuples dropped for arriving below the watermark, by origin",
                &["origin_id"],
                registry,
            )
            .unwrap(),
            windows_triggered: register_int_counter_with_registry!(
                "flowrt_windows_triggered_total",
                "Windows that have triggered exactly once",
                registry,
            )
            .unwrap(),
            shredder_cas_retries: register_int_counter_with_registry!(
                "flowrt_shredder_cas_retries_total",
                "CAS retries inside the sequence shredder ring",
                registry,
            )
            .unwrap(),
            shredder_tuples_emitted: register_int_counter_with_registry!(
                "flowrt_shredder_tuples_emitted_total",
                "Spanning and non-spanning tuples emitted by the sequence shredder",
                registry,
            )
            .unwrap(),
            work_items_enqueued: register_int_counter_vec_with_registry!(
                "flowrt_work_items_enqueued_total",
                "Work items submitted to the worker pool, by pipeline id",
                &["pipeline_id"],
                registry,
            )
            .unwrap(),
            work_items_retired: register_int_counter_vec_with_registry!(
                "flowrt_work_items_retired_total",
                "Work items that completed open/execute*/close, by pipeline id",
                &["pipeline_id"],
                registry,
            )
            .unwrap(),
            query_failures: register_int_counter_vec_with_registry!(
                "flowrt_query_failures_total",
                "Query failures, by error kind",
                &["kind"],
                registry,
            )
            .unwrap(),
        }
    }

    /// A `Metrics` backed by a throwaway registry, for unit tests,
    /// integration tests, and benchmarks that don't care about export.
    pub fn for_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(&Registry::new()))
    }
}
