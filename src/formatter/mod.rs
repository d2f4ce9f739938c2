// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Input Formatter Task Pipeline (spec.md §4.4): turns tuples reassembled by
//! the Sequence Shredder into schema'd tuple buffers, deriving each buffer's
//! watermark from its last tuple's event-time field.

mod csv;
mod json;

pub use csv::CsvIndexer;
pub use json::JsonIndexer;

use std::sync::Arc;

use crate::buffer::{BufferPool, TupleBuffer};
use crate::error::{RuntimeError, RuntimeResult};
use crate::layout::{RowLayout, Schema, VarVal};
use crate::shredder::ShreddedTuple;

/// Computes field values for one reassembled tuple's raw bytes against a
/// `Schema`. CSV and JSON parse differently (delimiter scan vs. object
/// lookup) but share this contract (spec.md §4.4 "Design").
pub trait FieldIndexer {
    /// Parses one tuple's raw bytes into schema-ordered values, or an error
    /// message describing the mismatch (missing/extra field, bad type).
    fn index(&self, schema: &Schema, bytes: &[u8]) -> Result<Vec<VarVal>, String>;
}

/// Parses every tuple in `tuples` with `indexer`, writes them Row-layout
/// into one fresh tuple buffer, and sets its header's `watermark_ts` from
/// `event_time_field` if the schema carries one (spec.md §4.4 "Contract").
/// Returns `Ok(None)` for an empty input instead of an empty buffer.
///
/// A parse failure on any tuple aborts the whole buffer with a
/// `FormattingError` carrying the origin and sequence coordinates
/// (spec.md §4.4 "Failure"); no partial buffer is emitted.
pub fn format_buffer(
    indexer: &dyn FieldIndexer,
    schema: &Schema,
    tuples: &[ShreddedTuple],
    origin_id: u64,
    event_time_field: Option<usize>,
    pool: &Arc<BufferPool>,
) -> RuntimeResult<Option<TupleBuffer>> {
    if tuples.is_empty() {
        return Ok(None);
    }

    let layout = RowLayout::new(schema);
    let stride = schema.size_in_bytes().max(1);
    let buffer = pool.get_unpooled(stride * tuples.len());

    let mut watermark_ts = 0u64;
    for (row, tuple) in tuples.iter().enumerate() {
        let values = indexer.index(schema, &tuple.bytes).map_err(|message| RuntimeError::FormattingError {
            origin_id,
            sequence_number: tuple.start_sequence,
            field: None,
            message,
        })?;
        if values.len() != schema.fields().len() {
            return Err(RuntimeError::FormattingError {
                origin_id,
                sequence_number: tuple.start_sequence,
                field: None,
                message: format!("expected {} fields, got {}", schema.fields().len(), values.len()),
            });
        }
        for (field_index, value) in values.iter().enumerate() {
            layout.write(&buffer, row, field_index, value);
        }
        if let Some(field_index) = event_time_field {
            if let Some(ts) = values[field_index].as_u64() {
                watermark_ts = watermark_ts.max(ts);
            }
        }
    }

    let last = tuples.last().expect("checked non-empty above");
    let mut header = buffer.header();
    header.number_of_tuples = tuples.len() as u64;
    header.watermark_ts = watermark_ts;
    header.origin_id = origin_id;
    header.sequence_number = last.start_sequence;
    buffer.set_header(header);

    Ok(Some(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::layout::PhysicalType;
    use crate::metrics::Metrics;

    fn schema() -> Schema {
        Schema::new(vec![("ts", PhysicalType::U64), ("value", PhysicalType::I64)])
    }

    fn tuple(seq: u64, bytes: &[u8]) -> ShreddedTuple {
        ShreddedTuple {
            start_sequence: seq,
            ordinal: 0,
            bytes: bytes.to_vec(),
        }
    }

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(1, &RuntimeConfig::default(), Metrics::for_test())
    }

    #[test]
    fn csv_indexer_populates_watermark_from_event_time_field() {
        let schema = schema();
        let tuples = vec![tuple(0, b"10,100"), tuple(1, b"20,200")];
        let buffer = format_buffer(&CsvIndexer::default(), &schema, &tuples, 7, Some(0), &pool())
            .unwrap()
            .unwrap();
        assert_eq!(buffer.number_of_tuples(), 2);
        assert_eq!(buffer.watermark_ts(), 20);

        let layout = RowLayout::new(&schema);
        assert_eq!(layout.read(&buffer, 0, 1), VarVal::I64(100));
        assert_eq!(layout.read(&buffer, 1, 1), VarVal::I64(200));
    }

    #[test]
    fn csv_indexer_rejects_wrong_field_count() {
        let schema = schema();
        let tuples = vec![tuple(0, b"10")];
        let result = format_buffer(&CsvIndexer::default(), &schema, &tuples, 7, None, &pool());
        assert!(matches!(result, Err(RuntimeError::FormattingError { .. })));
    }

    #[test]
    fn json_indexer_populates_fields_by_name() {
        let schema = schema();
        let tuples = vec![tuple(0, br#"{"ts": 5, "value": -3}"#)];
        let buffer = format_buffer(&JsonIndexer, &schema, &tuples, 1, Some(0), &pool())
            .unwrap()
            .unwrap();
        assert_eq!(buffer.watermark_ts(), 5);
        let layout = RowLayout::new(&schema);
        assert_eq!(layout.read(&buffer, 0, 1), VarVal::I64(-3));
    }

    #[test]
    fn json_indexer_reports_missing_field() {
        let schema = schema();
        let tuples = vec![tuple(0, br#"{"ts": 5}"#)];
        let result = format_buffer(&JsonIndexer, &schema, &tuples, 1, None, &pool());
        assert!(matches!(result, Err(RuntimeError::FormattingError { .. })));
    }

    #[test]
    fn empty_tuple_slice_produces_no_buffer() {
        let schema = schema();
        assert!(format_buffer(&CsvIndexer::default(), &schema, &[], 1, None, &pool())
            .unwrap()
            .is_none());
    }
}
