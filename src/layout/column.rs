// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::TupleBuffer;

use super::row::{read_value, write_value};
use super::schema::{Schema, VarVal};

/// Column layout: tuples stored as `[f0_0,f0_1,…][f1_0,f1_1,…]…`, one
/// contiguous array per field (spec.md §4.2).
pub struct ColumnLayout<'a> {
    schema: &'a Schema,
}

impl<'a> ColumnLayout<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Capacity is bounded by the field needing the most bytes per row, since
    /// every column array must hold the same number of rows.
    pub fn capacity(&self, buffer: &TupleBuffer) -> usize {
        let widest = self
            .schema
            .fields()
            .iter()
            .map(|f| f.physical_type.size_in_bytes())
            .max()
            .unwrap_or(1);
        buffer.capacity() / (widest * self.schema.fields().len().max(1))
    }

    fn column_start(&self, buffer: &TupleBuffer, field_index: usize) -> usize {
        let capacity = self.capacity(buffer);
        self.schema.fields()[..field_index]
            .iter()
            .map(|f| f.physical_type.size_in_bytes() * capacity)
            .sum()
    }

    pub fn write(&self, buffer: &TupleBuffer, row: usize, field_index: usize, value: &VarVal) {
        let capacity = self.capacity(buffer);
        assert!(row < capacity, "row {row} exceeds column layout capacity");
        let width = self.schema.fields()[field_index].physical_type.size_in_bytes();
        let offset = self.column_start(buffer, field_index) + row * width;
        buffer.with_bytes_mut(|bytes| {
            write_value(&mut bytes[offset..offset + width], value);
        });
    }

    pub fn read(&self, buffer: &TupleBuffer, row: usize, field_index: usize) -> VarVal {
        let capacity = self.capacity(buffer);
        assert!(row < capacity, "row {row} exceeds column layout capacity");
        let ty = self.schema.fields()[field_index].physical_type;
        let width = ty.size_in_bytes();
        let offset = self.column_start(buffer, field_index) + row * width;
        buffer.with_bytes(|bytes| read_value(&bytes[offset..offset + width], ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::schema::PhysicalType;

    #[test]
    fn columns_are_contiguous_per_field() {
        let schema = Schema::new(vec![("a", PhysicalType::U32), ("b", PhysicalType::U32)]);
        let buffer = TupleBuffer::new_unpooled(4 * 2 * 4);
        let layout = ColumnLayout::new(&schema);

        for row in 0..4 {
            layout.write(&buffer, row, 0, &VarVal::U32(row as u32));
            layout.write(&buffer, row, 1, &VarVal::U32(100 + row as u32));
        }
        for row in 0..4 {
            assert_eq!(layout.read(&buffer, row, 0), VarVal::U32(row as u32));
            assert_eq!(layout.read(&buffer, row, 1), VarVal::U32(100 + row as u32));
        }
    }
}
