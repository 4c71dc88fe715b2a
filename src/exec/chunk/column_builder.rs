// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Typed append-only column builders keyed by builtin scalar kind.
//!
//! Responsibilities:
//! - Provides the mutable "reference" a collector binds per output field.
//! - Decodes packed value-blob bytes and string-encoded keys into Arrow
//!   builders, single- or multi-valued.
//!
//! Key exported interfaces:
//! - Types: `TypedBuilder`, `ByteCursor`.
//! - Functions: `column_data_type`.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float32Builder, Float64Builder, Int8Builder, Int16Builder, Int32Builder,
    Int64Builder, ListBuilder, StringBuilder, UInt8Builder, UInt16Builder, UInt32Builder,
    UInt64Builder,
};
use arrow::datatypes::{DataType, Field};

use crate::common::types::BuiltinType;

/// Cursor over one packed value blob.
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                format!(
                    "malformed value blob: need {} bytes at offset {} of {}",
                    n,
                    self.pos,
                    self.buf.len()
                )
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_u32(&mut self) -> Result<u32, String> {
        let bytes = self.take(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(arr))
    }

    pub fn read_str(&mut self) -> Result<&'a str, String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map_err(|e| format!("malformed value blob: invalid utf8 string: {}", e))
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }
}

/// Arrow data type for a field of the given kind and cardinality.
pub fn column_data_type(kind: BuiltinType, multi_value: bool) -> DataType {
    let element = kind.arrow_type();
    if multi_value {
        DataType::List(Arc::new(Field::new_list_field(element, true)))
    } else {
        element
    }
}

/// One typed output reference, covering every builtin scalar kind in both
/// single- and multi-valued form.
pub enum TypedBuilder {
    Int8(Int8Builder),
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    UInt8(UInt8Builder),
    UInt16(UInt16Builder),
    UInt32(UInt32Builder),
    UInt64(UInt64Builder),
    Float(Float32Builder),
    Double(Float64Builder),
    Utf8(StringBuilder),
    Int8List(ListBuilder<Int8Builder>),
    Int16List(ListBuilder<Int16Builder>),
    Int32List(ListBuilder<Int32Builder>),
    Int64List(ListBuilder<Int64Builder>),
    UInt8List(ListBuilder<UInt8Builder>),
    UInt16List(ListBuilder<UInt16Builder>),
    UInt32List(ListBuilder<UInt32Builder>),
    UInt64List(ListBuilder<UInt64Builder>),
    FloatList(ListBuilder<Float32Builder>),
    DoubleList(ListBuilder<Float64Builder>),
    Utf8List(ListBuilder<StringBuilder>),
}

impl TypedBuilder {
    pub fn new(kind: BuiltinType, multi_value: bool) -> Self {
        if multi_value {
            match kind {
                BuiltinType::Int8 => Self::Int8List(ListBuilder::new(Int8Builder::new())),
                BuiltinType::Int16 => Self::Int16List(ListBuilder::new(Int16Builder::new())),
                BuiltinType::Int32 => Self::Int32List(ListBuilder::new(Int32Builder::new())),
                BuiltinType::Int64 => Self::Int64List(ListBuilder::new(Int64Builder::new())),
                BuiltinType::UInt8 => Self::UInt8List(ListBuilder::new(UInt8Builder::new())),
                BuiltinType::UInt16 => Self::UInt16List(ListBuilder::new(UInt16Builder::new())),
                BuiltinType::UInt32 => Self::UInt32List(ListBuilder::new(UInt32Builder::new())),
                BuiltinType::UInt64 => Self::UInt64List(ListBuilder::new(UInt64Builder::new())),
                BuiltinType::Float => Self::FloatList(ListBuilder::new(Float32Builder::new())),
                BuiltinType::Double => Self::DoubleList(ListBuilder::new(Float64Builder::new())),
                BuiltinType::String => Self::Utf8List(ListBuilder::new(StringBuilder::new())),
            }
        } else {
            match kind {
                BuiltinType::Int8 => Self::Int8(Int8Builder::new()),
                BuiltinType::Int16 => Self::Int16(Int16Builder::new()),
                BuiltinType::Int32 => Self::Int32(Int32Builder::new()),
                BuiltinType::Int64 => Self::Int64(Int64Builder::new()),
                BuiltinType::UInt8 => Self::UInt8(UInt8Builder::new()),
                BuiltinType::UInt16 => Self::UInt16(UInt16Builder::new()),
                BuiltinType::UInt32 => Self::UInt32(UInt32Builder::new()),
                BuiltinType::UInt64 => Self::UInt64(UInt64Builder::new()),
                BuiltinType::Float => Self::Float(Float32Builder::new()),
                BuiltinType::Double => Self::Double(Float64Builder::new()),
                BuiltinType::String => Self::Utf8(StringBuilder::new()),
            }
        }
    }

    /// Re-parse a string-encoded raw key into the key's builtin type and
    /// append it. Only integer and string keys are representable.
    pub fn append_key(&mut self, key: &str) -> Result<(), String> {
        macro_rules! parse_key {
            ($builder:expr, $ty:ty) => {{
                let v = key.parse::<$ty>().map_err(|e| {
                    format!(
                        "parse primary key '{}' as {} failed: {}",
                        key,
                        stringify!($ty),
                        e
                    )
                })?;
                $builder.append_value(v);
            }};
        }
        match self {
            Self::Int8(b) => parse_key!(b, i8),
            Self::Int16(b) => parse_key!(b, i16),
            Self::Int32(b) => parse_key!(b, i32),
            Self::Int64(b) => parse_key!(b, i64),
            Self::UInt8(b) => parse_key!(b, u8),
            Self::UInt16(b) => parse_key!(b, u16),
            Self::UInt32(b) => parse_key!(b, u32),
            Self::UInt64(b) => parse_key!(b, u64),
            Self::Utf8(b) => b.append_value(key),
            Self::Float(_) | Self::Double(_) => {
                return Err("unsupported primary key type: floating point".to_string());
            }
            _ => return Err("primary key reference cannot be multi-valued".to_string()),
        }
        Ok(())
    }

    /// Decode one field from the packed blob cursor and append it.
    pub fn append_packed(&mut self, cursor: &mut ByteCursor<'_>) -> Result<(), String> {
        macro_rules! fixed {
            ($builder:expr, $ty:ty) => {{
                let bytes = cursor.take(std::mem::size_of::<$ty>())?;
                let mut arr = [0u8; std::mem::size_of::<$ty>()];
                arr.copy_from_slice(bytes);
                $builder.append_value(<$ty>::from_le_bytes(arr));
            }};
        }
        macro_rules! fixed_list {
            ($builder:expr, $ty:ty) => {{
                let count = cursor.read_u32()? as usize;
                for _ in 0..count {
                    let bytes = cursor.take(std::mem::size_of::<$ty>())?;
                    let mut arr = [0u8; std::mem::size_of::<$ty>()];
                    arr.copy_from_slice(bytes);
                    $builder.values().append_value(<$ty>::from_le_bytes(arr));
                }
                $builder.append(true);
            }};
        }
        match self {
            Self::Int8(b) => fixed!(b, i8),
            Self::Int16(b) => fixed!(b, i16),
            Self::Int32(b) => fixed!(b, i32),
            Self::Int64(b) => fixed!(b, i64),
            Self::UInt8(b) => fixed!(b, u8),
            Self::UInt16(b) => fixed!(b, u16),
            Self::UInt32(b) => fixed!(b, u32),
            Self::UInt64(b) => fixed!(b, u64),
            Self::Float(b) => fixed!(b, f32),
            Self::Double(b) => fixed!(b, f64),
            Self::Utf8(b) => {
                let s = cursor.read_str()?;
                b.append_value(s);
            }
            Self::Int8List(b) => fixed_list!(b, i8),
            Self::Int16List(b) => fixed_list!(b, i16),
            Self::Int32List(b) => fixed_list!(b, i32),
            Self::Int64List(b) => fixed_list!(b, i64),
            Self::UInt8List(b) => fixed_list!(b, u8),
            Self::UInt16List(b) => fixed_list!(b, u16),
            Self::UInt32List(b) => fixed_list!(b, u32),
            Self::UInt64List(b) => fixed_list!(b, u64),
            Self::FloatList(b) => fixed_list!(b, f32),
            Self::DoubleList(b) => fixed_list!(b, f64),
            Self::Utf8List(b) => {
                let count = cursor.read_u32()? as usize;
                for _ in 0..count {
                    let s = cursor.read_str()?;
                    b.values().append_value(s);
                }
                b.append(true);
            }
        }
        Ok(())
    }

    /// Finish the accumulated rows into an array, resetting the builder for
    /// the next round.
    pub fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Int8(b) => Arc::new(b.finish()),
            Self::Int16(b) => Arc::new(b.finish()),
            Self::Int32(b) => Arc::new(b.finish()),
            Self::Int64(b) => Arc::new(b.finish()),
            Self::UInt8(b) => Arc::new(b.finish()),
            Self::UInt16(b) => Arc::new(b.finish()),
            Self::UInt32(b) => Arc::new(b.finish()),
            Self::UInt64(b) => Arc::new(b.finish()),
            Self::Float(b) => Arc::new(b.finish()),
            Self::Double(b) => Arc::new(b.finish()),
            Self::Utf8(b) => Arc::new(b.finish()),
            Self::Int8List(b) => Arc::new(b.finish()),
            Self::Int16List(b) => Arc::new(b.finish()),
            Self::Int32List(b) => Arc::new(b.finish()),
            Self::Int64List(b) => Arc::new(b.finish()),
            Self::UInt8List(b) => Arc::new(b.finish()),
            Self::UInt16List(b) => Arc::new(b.finish()),
            Self::UInt32List(b) => Arc::new(b.finish()),
            Self::UInt64List(b) => Arc::new(b.finish()),
            Self::FloatList(b) => Arc::new(b.finish()),
            Self::DoubleList(b) => Arc::new(b.finish()),
            Self::Utf8List(b) => Arc::new(b.finish()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, ListArray, StringArray};

    #[test]
    fn packed_fixed_and_string_decode() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&51_i32.to_le_bytes());
        blob.extend_from_slice(&2_u32.to_le_bytes());
        blob.extend_from_slice(b"ab");
        let mut cursor = ByteCursor::new(&blob);

        let mut ints = TypedBuilder::new(BuiltinType::Int32, false);
        let mut strs = TypedBuilder::new(BuiltinType::String, false);
        ints.append_packed(&mut cursor).expect("int field");
        strs.append_packed(&mut cursor).expect("string field");
        assert!(cursor.is_exhausted());

        let ints = ints.finish();
        let ints = ints.as_any().downcast_ref::<Int32Array>().expect("int32");
        assert_eq!(ints.value(0), 51);
        let strs = strs.finish();
        let strs = strs.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(strs.value(0), "ab");
    }

    #[test]
    fn packed_multi_value_decode() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&3_u32.to_le_bytes());
        for v in [7_i32, 8, 9] {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        let mut cursor = ByteCursor::new(&blob);
        let mut builder = TypedBuilder::new(BuiltinType::Int32, true);
        builder.append_packed(&mut cursor).expect("list field");
        let list = builder.finish();
        let list = list.as_any().downcast_ref::<ListArray>().expect("list");
        assert_eq!(list.len(), 1);
        let values = list.value(0);
        let values = values.as_any().downcast_ref::<Int32Array>().expect("int32");
        assert_eq!(values.values(), &[7, 8, 9]);
    }

    #[test]
    fn truncated_blob_is_reported() {
        let blob = 1_u8.to_le_bytes();
        let mut cursor = ByteCursor::new(&blob);
        let mut builder = TypedBuilder::new(BuiltinType::Int64, false);
        let err = builder
            .append_packed(&mut cursor)
            .expect_err("truncated blob");
        assert!(err.contains("malformed value blob"), "err={}", err);
    }

    #[test]
    fn key_parse_respects_kind() {
        let mut builder = TypedBuilder::new(BuiltinType::Int64, false);
        builder.append_key("42").expect("integer key");
        let err = builder.append_key("x").expect_err("bad integer");
        assert!(err.contains("parse primary key"), "err={}", err);

        let mut float_key = TypedBuilder::new(BuiltinType::Double, false);
        let err = float_key.append_key("1.5").expect_err("float key");
        assert!(err.contains("unsupported primary key type"), "err={}", err);
    }
}
