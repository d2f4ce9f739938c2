// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Window Build/Probe operators (spec.md §4.9): Aggregation (Build/Probe
//! over a `ChainedHashMap` slice) and Join (NLJ and Hash variants, Build/Probe
//! over `PagedVector`/`ChainedHashMap` slices).

pub mod aggregation;
pub mod join;
pub mod operators;

pub use aggregation::{AggregationBuild, AggregationFunction, AggregationProbe, AggregationSpec};
pub use join::{
    HashJoinBuild, HashJoinProbe, JoinBuildSide, JoinCondition, JoinSpec, NestedLoopJoinBuild,
    NestedLoopJoinProbe,
};
pub use operators::{
    AggregationBuildOperator, AggregationProbeOperator, BuildOperator, HashJoinBuildOperator,
    HashJoinProbeOperator, NestedLoopJoinBuildOperator, NestedLoopJoinProbeOperator, ProbeOperator,
    WindowBuild, WindowProbe,
};

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
