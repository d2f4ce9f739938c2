// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::pipeline::{OperatorId, PipelineId};
use crate::query_manager::QueryId;

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Error taxonomy for the runtime. Every fallible public entry point returns
/// one of these; invariant violations that indicate a bug rather than an
/// expected runtime condition panic instead.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("buffer pool exhausted after {retries} retries")]
    ResourceExhausted { retries: u32 },

    #[error("formatting error at origin {origin_id} sequence {sequence_number}: {message}")]
    FormattingError {
        origin_id: u64,
        sequence_number: u64,
        field: Option<String>,
        message: String,
    },

    #[error("operator {operator_id} in pipeline {pipeline_id} failed: {message}")]
    OperatorExecution {
        pipeline_id: PipelineId,
        operator_id: OperatorId,
        message: String,
    },

    #[error("invalid query configuration: {0}")]
    InvalidConfig(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn with_query(self, query_id: QueryId) -> QueryError {
        QueryError {
            query_id,
            source: self,
        }
    }
}

/// A `RuntimeError` tagged with the query it was observed in, the shape the
/// Query Manager reports failures in (spec.md §4.11, §7).
#[derive(Debug, Clone, Error)]
#[error("query {query_id}: {source}")]
pub struct QueryError {
    pub query_id: QueryId,
    pub source: RuntimeError,
}
