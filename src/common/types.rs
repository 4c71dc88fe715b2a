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
//! Builtin scalar types understood by the scan and join stages.
//!
//! Responsibilities:
//! - Defines the closed set of scalar kinds a KV/KKV table field may carry.
//! - Maps scalar kinds to Arrow data types and fixed byte widths.
//!
//! Key exported interfaces:
//! - Types: `BuiltinType`.

use std::fmt;

use arrow::datatypes::DataType;

/// Closed tagged union over the scalar kinds supported by the engine.
///
/// Every per-type dispatch in the scan and join paths matches exhaustively on
/// this enum so that adding a kind is a compile-time event, not a runtime
/// surprise.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BuiltinType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
}

impl BuiltinType {
    /// Map an Arrow data type to a builtin scalar kind.
    ///
    /// Multi-valued fields are `List` of one of these kinds; callers strip the
    /// list wrapper before resolving the element kind.
    pub fn from_arrow(data_type: &DataType) -> Result<Self, String> {
        match data_type {
            DataType::Int8 => Ok(Self::Int8),
            DataType::Int16 => Ok(Self::Int16),
            DataType::Int32 => Ok(Self::Int32),
            DataType::Int64 => Ok(Self::Int64),
            DataType::UInt8 => Ok(Self::UInt8),
            DataType::UInt16 => Ok(Self::UInt16),
            DataType::UInt32 => Ok(Self::UInt32),
            DataType::UInt64 => Ok(Self::UInt64),
            DataType::Float32 => Ok(Self::Float),
            DataType::Float64 => Ok(Self::Double),
            DataType::Utf8 => Ok(Self::String),
            other => Err(format!("unsupported builtin scalar type: {:?}", other)),
        }
    }

    pub fn arrow_type(self) -> DataType {
        match self {
            Self::Int8 => DataType::Int8,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::UInt8 => DataType::UInt8,
            Self::UInt16 => DataType::UInt16,
            Self::UInt32 => DataType::UInt32,
            Self::UInt64 => DataType::UInt64,
            Self::Float => DataType::Float32,
            Self::Double => DataType::Float64,
            Self::String => DataType::Utf8,
        }
    }

    /// Fixed on-disk width of one packed value, or `None` for var-size kinds.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float => Some(4),
            Self::Int64 | Self::UInt64 | Self::Double => Some(8),
            Self::String => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    /// Whether the kind may back a primary key.
    ///
    /// Raw request keys travel as strings; only kinds with a lossless string
    /// round-trip qualify. Floating-point keys are rejected up front.
    pub fn is_valid_key_type(self) -> bool {
        self.is_integer() || self == Self::String
    }
}

impl fmt::Display for BuiltinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrow_round_trip_covers_every_kind() {
        let kinds = [
            BuiltinType::Int8,
            BuiltinType::Int16,
            BuiltinType::Int32,
            BuiltinType::Int64,
            BuiltinType::UInt8,
            BuiltinType::UInt16,
            BuiltinType::UInt32,
            BuiltinType::UInt64,
            BuiltinType::Float,
            BuiltinType::Double,
            BuiltinType::String,
        ];
        for kind in kinds {
            let back = BuiltinType::from_arrow(&kind.arrow_type()).expect("round trip");
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn boolean_is_not_a_builtin_scalar() {
        let err = BuiltinType::from_arrow(&DataType::Boolean).expect_err("boolean rejected");
        assert!(err.contains("unsupported builtin scalar type"), "err={}", err);
    }

    #[test]
    fn float_keys_are_rejected() {
        assert!(!BuiltinType::Float.is_valid_key_type());
        assert!(!BuiltinType::Double.is_valid_key_type());
        assert!(BuiltinType::UInt64.is_valid_key_type());
        assert!(BuiltinType::String.is_valid_key_type());
    }
}
