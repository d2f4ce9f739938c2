// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

/// Fixed-width primitive types a field can hold, plus a variable-sized
/// pointer+length form backed by a child buffer (spec.md §3 "VarVal").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Char,
    VariableSized,
}

impl PhysicalType {
    /// Fixed in-row byte footprint. Variable-sized fields store an 8-byte
    /// child-buffer index plus an 8-byte length inline; the referenced bytes
    /// live in a child buffer.
    pub fn size_in_bytes(self) -> usize {
        match self {
            PhysicalType::I8 | PhysicalType::U8 | PhysicalType::Bool => 1,
            PhysicalType::I16 | PhysicalType::U16 => 2,
            PhysicalType::I32 | PhysicalType::U32 | PhysicalType::F32 | PhysicalType::Char => 4,
            PhysicalType::I64 | PhysicalType::U64 | PhysicalType::F64 => 8,
            PhysicalType::VariableSized => 16,
        }
    }
}

/// A tagged value read from or written to a tuple buffer (spec.md §3 "Record").
#[derive(Debug, Clone, PartialEq)]
pub enum VarVal {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(char),
    VariableSizedData { child_index: usize, len: u64 },
}

impl VarVal {
    pub fn physical_type(&self) -> PhysicalType {
        match self {
            VarVal::I8(_) => PhysicalType::I8,
            VarVal::I16(_) => PhysicalType::I16,
            VarVal::I32(_) => PhysicalType::I32,
            VarVal::I64(_) => PhysicalType::I64,
            VarVal::U8(_) => PhysicalType::U8,
            VarVal::U16(_) => PhysicalType::U16,
            VarVal::U32(_) => PhysicalType::U32,
            VarVal::U64(_) => PhysicalType::U64,
            VarVal::F32(_) => PhysicalType::F32,
            VarVal::F64(_) => PhysicalType::F64,
            VarVal::Bool(_) => PhysicalType::Bool,
            VarVal::Char(_) => PhysicalType::Char,
            VarVal::VariableSizedData { .. } => PhysicalType::VariableSized,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            VarVal::I8(v) => Some(v as i64),
            VarVal::I16(v) => Some(v as i64),
            VarVal::I32(v) => Some(v as i64),
            VarVal::I64(v) => Some(v),
            VarVal::U8(v) => Some(v as i64),
            VarVal::U16(v) => Some(v as i64),
            VarVal::U32(v) => Some(v as i64),
            VarVal::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            VarVal::U8(v) => Some(v as u64),
            VarVal::U16(v) => Some(v as u64),
            VarVal::U32(v) => Some(v as u64),
            VarVal::U64(v) => Some(v),
            VarVal::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub physical_type: PhysicalType,
}

/// An ordered list of `(field_name, physical_type)` with a computed stride,
/// the building block both layouts are generated from (spec.md §3 "Schema").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(fields: Vec<(&str, PhysicalType)>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(name, physical_type)| FieldDef {
                    name: name.to_string(),
                    physical_type,
                })
                .collect(),
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Total size of one row in the Row layout; stride for field offset math.
    pub fn size_in_bytes(&self) -> usize {
        self.fields.iter().map(|f| f.physical_type.size_in_bytes()).sum()
    }

    /// Byte offset of `field` within one row of the Row layout.
    pub fn row_field_offset(&self, index: usize) -> usize {
        self.fields[..index]
            .iter()
            .map(|f| f.physical_type.size_in_bytes())
            .sum()
    }

    /// A record built from field name -> VarVal, validated against this
    /// schema's field order and types.
    pub fn build_record(&self, values: HashMap<String, VarVal>) -> Option<Record> {
        let mut ordered = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = values.get(&field.name)?;
            if value.physical_type() != field.physical_type {
                return None;
            }
            ordered.push(value.clone());
        }
        Some(Record { values: ordered })
    }
}

/// A logical tuple: an ordered list of values aligned to a `Schema`'s field
/// order (spec.md §3 "Record").
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<VarVal>,
}

impl Record {
    pub fn new(values: Vec<VarVal>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> &VarVal {
        &self.values[index]
    }

    pub fn values(&self) -> &[VarVal] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_computes_row_stride() {
        let schema = Schema::new(vec![
            ("ts", PhysicalType::U64),
            ("key", PhysicalType::U64),
            ("val", PhysicalType::I64),
        ]);
        assert_eq!(schema.size_in_bytes(), 24);
        assert_eq!(schema.row_field_offset(0), 0);
        assert_eq!(schema.row_field_offset(1), 8);
        assert_eq!(schema.row_field_offset(2), 16);
    }

    #[test]
    fn build_record_rejects_type_mismatch() {
        let schema = Schema::new(vec![("ts", PhysicalType::U64)]);
        let mut values = HashMap::new();
        values.insert("ts".to_string(), VarVal::I32(1));
        assert!(schema.build_record(values).is_none());
    }
}
