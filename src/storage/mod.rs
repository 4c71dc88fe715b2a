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
//! Storage collaborator contracts.
//!
//! Responsibilities:
//! - Declares the reader interfaces the scan path consumes (legacy partition
//!   readers and tablet readers) without depending on the index engine itself.
//! - Defines the minimal schema model, packed value-blob layout, stream-query
//!   message, and partition ownership routing.
//!
//! Key exported interfaces:
//! - Types: `TableKind`, `TableSchema`, `FieldSpec`, `ValueConfig`,
//!   `FieldValue`, `LookupPayload`, `KkvEntry`, `LookupOption`, `StreamQuery`,
//!   `PartitionRoute`.
//! - Traits: `PartitionReader`, `TabletReader`, `ReaderProvider`.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::common::config::{lookup_default_left_time_ms, lookup_default_max_concurrency};
use crate::common::types::BuiltinType;

/// Closed set of table kinds the execution layer dispatches on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableKind {
    Kv,
    Kkv,
    Normal,
    Aggregation,
}

impl TableKind {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "kv" => Ok(Self::Kv),
            "kkv" => Ok(Self::Kkv),
            "normal" => Ok(Self::Normal),
            "aggregation" => Ok(Self::Aggregation),
            other => Err(format!("unknown table type: {}", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kv => "kv",
            Self::Kkv => "kkv",
            Self::Normal => "normal",
            Self::Aggregation => "aggregation",
        }
    }
}

/// One named, typed field of a table; `multi_value` marks list-valued fields.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: BuiltinType,
    pub multi_value: bool,
}

impl FieldSpec {
    pub fn single(name: impl Into<String>, field_type: BuiltinType) -> Self {
        Self {
            name: name.into(),
            field_type,
            multi_value: false,
        }
    }

    pub fn multi(name: impl Into<String>, field_type: BuiltinType) -> Self {
        Self {
            name: name.into(),
            field_type,
            multi_value: true,
        }
    }
}

/// Minimal schema model for a KV/KKV table.
///
/// `fields` lists every field including keys; value fields are the rest once
/// the primary key (and the KKV suffix key) are removed.
#[derive(Clone, Debug)]
pub struct TableSchema {
    pub table_name: String,
    pub kind: TableKind,
    pub primary_key: String,
    pub suffix_key: Option<String>,
    pub fields: Vec<FieldSpec>,
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key_field(&self) -> Option<&FieldSpec> {
        self.field(&self.primary_key)
    }

    pub fn suffix_key_field(&self) -> Option<&FieldSpec> {
        self.suffix_key.as_deref().and_then(|name| self.field(name))
    }

    fn is_key_field(&self, name: &str) -> bool {
        name == self.primary_key || self.suffix_key.as_deref() == Some(name)
    }
}

/// Declared layout of the fields packed into a table's value blob.
///
/// Blob layout, fields in declared order:
/// - fixed-width scalars as little-endian bytes,
/// - strings as u32 length prefix plus utf8 bytes,
/// - multi-valued fields as u32 element count followed by packed elements.
#[derive(Clone, Debug)]
pub struct ValueConfig {
    fields: Vec<FieldSpec>,
}

impl ValueConfig {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Legacy-schema path: derive the value layout from the full field list
    /// with key fields removed.
    pub fn from_schema(schema: &TableSchema) -> Self {
        let fields = schema
            .fields
            .iter()
            .filter(|f| !schema.is_key_field(&f.name))
            .cloned()
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Pack one row's field values into a value blob.
    pub fn pack(&self, values: &[FieldValue]) -> Result<Bytes, String> {
        if values.len() != self.fields.len() {
            return Err(format!(
                "value count mismatch: declared {} fields, got {}",
                self.fields.len(),
                values.len()
            ));
        }
        let mut buf = Vec::new();
        for (spec, value) in self.fields.iter().zip(values) {
            match (spec.multi_value, value) {
                (true, FieldValue::Multi(elems)) => {
                    let count = u32::try_from(elems.len())
                        .map_err(|_| format!("field {} element count overflow", spec.name))?;
                    buf.extend_from_slice(&count.to_le_bytes());
                    for elem in elems {
                        pack_scalar(spec, elem, &mut buf)?;
                    }
                }
                (true, _) => {
                    return Err(format!(
                        "field {} is multi-valued but got a scalar value",
                        spec.name
                    ));
                }
                (false, FieldValue::Multi(_)) => {
                    return Err(format!(
                        "field {} is single-valued but got a multi value",
                        spec.name
                    ));
                }
                (false, scalar) => pack_scalar(spec, scalar, &mut buf)?,
            }
        }
        Ok(Bytes::from(buf))
    }
}

fn pack_scalar(spec: &FieldSpec, value: &FieldValue, buf: &mut Vec<u8>) -> Result<(), String> {
    let kind = value
        .scalar_kind()
        .ok_or_else(|| format!("field {} got a nested multi value", spec.name))?;
    if kind != spec.field_type {
        return Err(format!(
            "field {} type mismatch: declared {}, got {}",
            spec.name, spec.field_type, kind
        ));
    }
    match value {
        FieldValue::Int8(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Int16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::UInt8(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::UInt16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::UInt32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::UInt64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        FieldValue::Str(v) => {
            let len = u32::try_from(v.len())
                .map_err(|_| format!("field {} string length overflow", spec.name))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        FieldValue::Multi(_) => unreachable!("scalar_kind filtered nested multi"),
    }
    Ok(())
}

/// Typed value used when packing rows into a value blob.
#[derive(Clone, Debug)]
pub enum FieldValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Multi(Vec<FieldValue>),
}

impl FieldValue {
    fn scalar_kind(&self) -> Option<BuiltinType> {
        match self {
            Self::Int8(_) => Some(BuiltinType::Int8),
            Self::Int16(_) => Some(BuiltinType::Int16),
            Self::Int32(_) => Some(BuiltinType::Int32),
            Self::Int64(_) => Some(BuiltinType::Int64),
            Self::UInt8(_) => Some(BuiltinType::UInt8),
            Self::UInt16(_) => Some(BuiltinType::UInt16),
            Self::UInt32(_) => Some(BuiltinType::UInt32),
            Self::UInt64(_) => Some(BuiltinType::UInt64),
            Self::Float(_) => Some(BuiltinType::Float),
            Self::Double(_) => Some(BuiltinType::Double),
            Self::Str(_) => Some(BuiltinType::String),
            Self::Multi(_) => None,
        }
    }
}

/// One KKV entry under a primary key: suffix key plus its value blob.
#[derive(Clone, Debug)]
pub struct KkvEntry {
    pub suffix_key: String,
    pub value: Bytes,
}

/// Raw result of one key lookup, reinterpreted later by the value collector.
#[derive(Clone, Debug)]
pub enum LookupPayload {
    Kv(Bytes),
    Kkv(Vec<KkvEntry>),
}

/// Per-round lookup parameters; constructed fresh for every async round.
#[derive(Clone, Debug)]
pub struct LookupOption {
    pub left_time: Duration,
    pub max_concurrency: usize,
    pub table_name: String,
}

impl LookupOption {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            left_time: Duration::from_millis(lookup_default_left_time_ms()),
            max_concurrency: lookup_default_max_concurrency(),
            table_name: table_name.into(),
        }
    }

    pub fn with_left_time(mut self, left_time: Duration) -> Self {
        self.left_time = left_time;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

/// Key-set update message a driving kernel sends to a driven scan operator.
#[derive(Clone, Debug, Default)]
pub struct StreamQuery {
    pub primary_keys: Vec<String>,
}

/// Partition ownership of string-encoded keys across parallel shards.
#[derive(Copy, Clone, Debug)]
pub struct PartitionRoute {
    pub shard_index: u32,
    pub shard_count: u32,
}

impl PartitionRoute {
    /// Route covering the whole key space (single shard).
    pub fn full() -> Self {
        Self {
            shard_index: 0,
            shard_count: 1,
        }
    }

    pub fn new(shard_index: u32, shard_count: u32) -> Result<Self, String> {
        if shard_count == 0 || shard_index >= shard_count {
            return Err(format!(
                "invalid partition route: shard_index={} shard_count={}",
                shard_index, shard_count
            ));
        }
        Ok(Self {
            shard_index,
            shard_count,
        })
    }

    pub fn owns(&self, key: &str) -> bool {
        if self.shard_count <= 1 {
            return true;
        }
        (fnv1a64(key.as_bytes()) % u64::from(self.shard_count)) == u64::from(self.shard_index)
    }
}

// Stable across processes so routing agrees between driver and shards.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Legacy partition-reader generation ("v1"): synchronous gets the lookup
/// context offloads to the lookup runtime.
pub trait PartitionReader: Send + Sync {
    fn table_name(&self) -> &str;
    fn schema(&self) -> Arc<TableSchema>;
    fn schema_version(&self) -> u64;
    fn get_sync(&self, key: &str) -> Result<Option<LookupPayload>, String>;
}

/// Tablet-reader generation ("v2"): natively asynchronous gets plus a build
/// watermark used by the watermark gate.
pub trait TabletReader: Send + Sync {
    fn table_name(&self) -> &str;
    fn schema(&self) -> Arc<TableSchema>;
    fn schema_version(&self) -> u64;
    fn build_watermark(&self) -> i64;
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<LookupPayload>, String>>;
}

/// Resolves readers by table name; the execution framework supplies one per
/// query. Tables may expose either generation, or both.
pub trait ReaderProvider: Send + Sync {
    fn partition_reader(&self, table: &str) -> Option<Arc<dyn PartitionReader>>;
    fn tablet_reader(&self, table: &str) -> Option<Arc<dyn TabletReader>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> TableSchema {
        TableSchema {
            table_name: "item".to_string(),
            kind: TableKind::Kv,
            primary_key: "pk".to_string(),
            suffix_key: None,
            fields: vec![
                FieldSpec::single("pk", BuiltinType::Int64),
                FieldSpec::single("attr2", BuiltinType::Int32),
                FieldSpec::single("name", BuiltinType::String),
            ],
        }
    }

    #[test]
    fn table_kind_parse_rejects_unknown() {
        assert_eq!(TableKind::parse("kv").expect("kv"), TableKind::Kv);
        assert_eq!(TableKind::parse("kkv").expect("kkv"), TableKind::Kkv);
        let err = TableKind::parse("olap").expect_err("unknown kind");
        assert!(err.contains("unknown table type"), "err={}", err);
    }

    #[test]
    fn legacy_value_config_drops_key_fields() {
        let schema = sample_schema();
        let config = ValueConfig::from_schema(&schema);
        let names: Vec<&str> = config.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["attr2", "name"]);
    }

    #[test]
    fn pack_checks_declared_types() {
        let config = ValueConfig::new(vec![FieldSpec::single("attr2", BuiltinType::Int32)]);
        let err = config
            .pack(&[FieldValue::Int64(1)])
            .expect_err("type mismatch");
        assert!(err.contains("type mismatch"), "err={}", err);
        let blob = config.pack(&[FieldValue::Int32(51)]).expect("pack");
        assert_eq!(blob.as_ref(), &51_i32.to_le_bytes());
    }

    #[test]
    fn pack_multi_value_is_count_prefixed() {
        let config = ValueConfig::new(vec![FieldSpec::multi("ids", BuiltinType::Int32)]);
        let blob = config
            .pack(&[FieldValue::Multi(vec![
                FieldValue::Int32(7),
                FieldValue::Int32(9),
            ])])
            .expect("pack");
        let mut expected = Vec::new();
        expected.extend_from_slice(&2_u32.to_le_bytes());
        expected.extend_from_slice(&7_i32.to_le_bytes());
        expected.extend_from_slice(&9_i32.to_le_bytes());
        assert_eq!(blob.as_ref(), expected.as_slice());
    }

    #[test]
    fn partition_route_splits_keys() {
        let shards = [
            PartitionRoute::new(0, 2).expect("route"),
            PartitionRoute::new(1, 2).expect("route"),
        ];
        for key in ["1", "2", "3", "alpha", "beta"] {
            let owners = shards.iter().filter(|s| s.owns(key)).count();
            assert_eq!(owners, 1, "key {} must have exactly one owner", key);
        }
        assert!(PartitionRoute::full().owns("anything"));
    }
}
