// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed row/column views over a tuple buffer (spec.md §4.2).

mod column;
mod row;
mod schema;

pub use column::ColumnLayout;
pub use row::RowLayout;
pub(crate) use row::{read_value, write_value};
pub use schema::{FieldDef, PhysicalType, Record, Schema, VarVal};
