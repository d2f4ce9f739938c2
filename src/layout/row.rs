// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::TupleBuffer;

use super::schema::{PhysicalType, Schema, VarVal};

/// Row layout: tuples packed `[f0,f1,…][f0,f1,…]…`, stride = schema size
/// (spec.md §4.2).
pub struct RowLayout<'a> {
    schema: &'a Schema,
    tuple_size: usize,
}

impl<'a> RowLayout<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            tuple_size: schema.size_in_bytes(),
        }
    }

    pub fn capacity(&self, buffer: &TupleBuffer) -> usize {
        if self.tuple_size == 0 {
            0
        } else {
            buffer.capacity() / self.tuple_size
        }
    }

    fn field_offset(&self, row: usize, field_index: usize) -> usize {
        row * self.tuple_size + self.schema.row_field_offset(field_index)
    }

    pub fn write(&self, buffer: &TupleBuffer, row: usize, field_index: usize, value: &VarVal) {
        assert!(
            row < self.capacity(buffer),
            "row {row} exceeds row layout capacity"
        );
        let offset = self.field_offset(row, field_index);
        let width = self.schema.fields()[field_index].physical_type.size_in_bytes();
        buffer.with_bytes_mut(|bytes| {
            write_value(&mut bytes[offset..offset + width], value);
        });
    }

    pub fn read(&self, buffer: &TupleBuffer, row: usize, field_index: usize) -> VarVal {
        assert!(
            row < self.capacity(buffer),
            "row {row} exceeds row layout capacity"
        );
        let offset = self.field_offset(row, field_index);
        let ty = self.schema.fields()[field_index].physical_type;
        let width = ty.size_in_bytes();
        buffer.with_bytes(|bytes| read_value(&bytes[offset..offset + width], ty))
    }
}

pub(crate) fn write_value(dst: &mut [u8], value: &VarVal) {
    match value {
        VarVal::I8(v) => dst[0] = *v as u8,
        VarVal::I16(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::I32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::I64(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::U8(v) => dst[0] = *v,
        VarVal::U16(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::U32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::U64(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::F32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::F64(v) => dst.copy_from_slice(&v.to_le_bytes()),
        VarVal::Bool(v) => dst[0] = *v as u8,
        VarVal::Char(v) => dst.copy_from_slice(&(*v as u32).to_le_bytes()),
        VarVal::VariableSizedData { child_index, len } => {
            dst[0..8].copy_from_slice(&(*child_index as u64).to_le_bytes());
            dst[8..16].copy_from_slice(&len.to_le_bytes());
        }
    }
}

pub(crate) fn read_value(src: &[u8], ty: PhysicalType) -> VarVal {
    match ty {
        PhysicalType::I8 => VarVal::I8(src[0] as i8),
        PhysicalType::I16 => VarVal::I16(i16::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::I32 => VarVal::I32(i32::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::I64 => VarVal::I64(i64::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::U8 => VarVal::U8(src[0]),
        PhysicalType::U16 => VarVal::U16(u16::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::U32 => VarVal::U32(u32::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::U64 => VarVal::U64(u64::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::F32 => VarVal::F32(f32::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::F64 => VarVal::F64(f64::from_le_bytes(src.try_into().unwrap())),
        PhysicalType::Bool => VarVal::Bool(src[0] != 0),
        PhysicalType::Char => {
            let code = u32::from_le_bytes(src.try_into().unwrap());
            VarVal::Char(char::from_u32(code).unwrap_or('\u{FFFD}'))
        }
        PhysicalType::VariableSized => {
            let child_index = u64::from_le_bytes(src[0..8].try_into().unwrap()) as usize;
            let len = u64::from_le_bytes(src[8..16].try_into().unwrap());
            VarVal::VariableSizedData { child_index, len }
        }
    }
}
