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
//! Turns raw lookup payloads into columnar output rows.
//!
//! Responsibilities:
//! - Binds one typed builder per output field (primary key, KKV suffix key,
//!   declared value fields in order) at scan init.
//! - Splits each packed value blob into per-field ranges and appends them.
//! - Finishes accumulated rows into a chunk, resetting builders per round.
//!
//! Key exported interfaces:
//! - Types: `KeyValueCollector`.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Field, Schema, SchemaRef};

use crate::common::ids::SlotId;
use crate::common::types::BuiltinType;
use crate::exec::chunk::column_builder::{ByteCursor, TypedBuilder, column_data_type};
use crate::exec::chunk::{Chunk, field_with_slot_id};
use crate::storage::{LookupPayload, TableKind, TableSchema, ValueConfig};

struct BoundField {
    name: String,
    kind: BuiltinType,
    multi_value: bool,
    builder: TypedBuilder,
}

impl BoundField {
    fn new(name: &str, kind: BuiltinType, multi_value: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            multi_value,
            builder: TypedBuilder::new(kind, multi_value),
        }
    }
}

/// Collects decoded rows for one scan instance.
///
/// Output column order is primary key, then the KKV suffix key if any, then
/// the declared value fields; slot ids are assigned by position.
pub struct KeyValueCollector {
    kind: TableKind,
    primary_key: Option<BoundField>,
    suffix_key: Option<BoundField>,
    values: Vec<BoundField>,
    // Schema is built once so pages from successive rounds concat cleanly.
    output_schema: Option<SchemaRef>,
    rows: usize,
}

impl KeyValueCollector {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            primary_key: None,
            suffix_key: None,
            values: Vec::new(),
            output_schema: None,
            rows: 0,
        }
    }

    /// Resolve the primary key field and mount its typed reference.
    pub fn init_primary_key(&mut self, schema: &TableSchema) -> Result<(), String> {
        let spec = schema.primary_key_field().ok_or_else(|| {
            format!(
                "table {} declares no field for primary key {}",
                schema.table_name, schema.primary_key
            )
        })?;
        if spec.multi_value {
            return Err(format!(
                "primary key {} of table {} cannot be multi-valued",
                spec.name, schema.table_name
            ));
        }
        if !spec.field_type.is_valid_key_type() {
            return Err(format!(
                "unsupported primary key type {} for field {} of table {}",
                spec.field_type, spec.name, schema.table_name
            ));
        }
        self.primary_key = Some(BoundField::new(&spec.name, spec.field_type, false));
        Ok(())
    }

    /// Mount one typed reference per declared value field, and the suffix-key
    /// reference for KKV tables.
    pub fn init_values(
        &mut self,
        value_config: &ValueConfig,
        schema: &TableSchema,
    ) -> Result<(), String> {
        if self.kind == TableKind::Kkv {
            let spec = schema.suffix_key_field().ok_or_else(|| {
                format!(
                    "kkv table {} declares no suffix key field",
                    schema.table_name
                )
            })?;
            if !spec.field_type.is_valid_key_type() {
                return Err(format!(
                    "unsupported suffix key type {} for field {} of table {}",
                    spec.field_type, spec.name, schema.table_name
                ));
            }
            self.suffix_key = Some(BoundField::new(&spec.name, spec.field_type, false));
        }
        self.values = value_config
            .fields()
            .iter()
            .map(|spec| BoundField::new(&spec.name, spec.field_type, spec.multi_value))
            .collect();
        Ok(())
    }

    /// Append the decoded row(s) for one looked-up key. KKV payloads expand
    /// into one row per entry.
    pub fn collect_fields(&mut self, key: &str, payload: &LookupPayload) -> Result<usize, String> {
        match (self.kind, payload) {
            (TableKind::Kv, LookupPayload::Kv(blob)) => {
                self.append_primary_key(key)?;
                self.append_value_blob(blob)?;
                self.rows += 1;
                Ok(1)
            }
            (TableKind::Kkv, LookupPayload::Kkv(entries)) => {
                for entry in entries {
                    self.append_primary_key(key)?;
                    let suffix = self
                        .suffix_key
                        .as_mut()
                        .ok_or_else(|| "kkv collector missing suffix key reference".to_string())?;
                    suffix.builder.append_key(&entry.suffix_key)?;
                    self.append_value_blob(&entry.value)?;
                    self.rows += 1;
                }
                Ok(entries.len())
            }
            (kind, _) => Err(format!(
                "payload shape does not match {} table",
                kind.as_str()
            )),
        }
    }

    fn append_primary_key(&mut self, key: &str) -> Result<(), String> {
        let pk = self
            .primary_key
            .as_mut()
            .ok_or_else(|| "collector primary key not initialized".to_string())?;
        pk.builder.append_key(key)
    }

    fn append_value_blob(&mut self, blob: &[u8]) -> Result<(), String> {
        let mut cursor = ByteCursor::new(blob);
        for field in &mut self.values {
            field.builder.append_packed(&mut cursor).map_err(|e| {
                format!("decode value blob failed at field {}: {}", field.name, e)
            })?;
        }
        if !cursor.is_exhausted() {
            return Err(format!(
                "value blob has trailing bytes after {} declared fields",
                self.values.len()
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Finish the round's rows into a chunk and re-prime the builders.
    pub fn finish_batch(&mut self) -> Result<Chunk, String> {
        let schema = self.output_schema()?;
        let mut columns = Vec::with_capacity(schema.fields().len());
        if let Some(pk) = self.primary_key.as_mut() {
            columns.push(pk.builder.finish());
        }
        if let Some(suffix) = self.suffix_key.as_mut() {
            columns.push(suffix.builder.finish());
        }
        for field in &mut self.values {
            columns.push(field.builder.finish());
        }
        self.rows = 0;
        let batch = RecordBatch::try_new(schema, columns)
            .map_err(|e| format!("build scan batch failed: {}", e))?;
        Chunk::try_new(batch)
    }

    /// Discard accumulated rows without producing a chunk.
    pub fn reset(&mut self) {
        if let Some(pk) = self.primary_key.as_mut() {
            let _ = pk.builder.finish();
        }
        if let Some(suffix) = self.suffix_key.as_mut() {
            let _ = suffix.builder.finish();
        }
        for field in &mut self.values {
            let _ = field.builder.finish();
        }
        self.rows = 0;
    }

    fn output_schema(&mut self) -> Result<SchemaRef, String> {
        if let Some(schema) = self.output_schema.as_ref() {
            return Ok(Arc::clone(schema));
        }
        if self.primary_key.is_none() {
            return Err("collector primary key not initialized".to_string());
        }
        let mut fields = Vec::new();
        let mut next_slot = 0u32;
        let mut push = |fields: &mut Vec<Field>, bound: &BoundField| {
            let field = Field::new(
                &bound.name,
                column_data_type(bound.kind, bound.multi_value),
                true,
            );
            fields.push(field_with_slot_id(field, SlotId::new(next_slot)));
            next_slot += 1;
        };
        if let Some(pk) = self.primary_key.as_ref() {
            push(&mut fields, pk);
        }
        if let Some(suffix) = self.suffix_key.as_ref() {
            push(&mut fields, suffix);
        }
        for bound in &self.values {
            push(&mut fields, bound);
        }
        let schema = Arc::new(Schema::new(fields));
        self.output_schema = Some(Arc::clone(&schema));
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FieldSpec, FieldValue, KkvEntry};
    use arrow::array::{Array, Int32Array, Int64Array, StringArray};

    fn kv_schema() -> TableSchema {
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

    fn kkv_schema() -> TableSchema {
        TableSchema {
            table_name: "orders".to_string(),
            kind: TableKind::Kkv,
            primary_key: "uid".to_string(),
            suffix_key: Some("order_id".to_string()),
            fields: vec![
                FieldSpec::single("uid", BuiltinType::Int64),
                FieldSpec::single("order_id", BuiltinType::Int64),
                FieldSpec::single("price", BuiltinType::Int32),
            ],
        }
    }

    #[test]
    fn kv_rows_round_trip() {
        let schema = kv_schema();
        let value_config = ValueConfig::from_schema(&schema);
        let mut collector = KeyValueCollector::new(TableKind::Kv);
        collector.init_primary_key(&schema).expect("pk");
        collector.init_values(&value_config, &schema).expect("values");

        let blob = value_config
            .pack(&[FieldValue::Int32(51), FieldValue::Str("a".to_string())])
            .expect("pack");
        collector
            .collect_fields("1", &LookupPayload::Kv(blob))
            .expect("collect");
        assert_eq!(collector.len(), 1);

        let chunk = collector.finish_batch().expect("finish");
        assert_eq!(chunk.len(), 1);
        let pk = chunk.column_by_name("pk").expect("pk column");
        let pk = pk.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(pk.value(0), 1);
        let attr2 = chunk.column_by_name("attr2").expect("attr2 column");
        let attr2 = attr2.as_any().downcast_ref::<Int32Array>().expect("int32");
        assert_eq!(attr2.value(0), 51);
        let name = chunk.column_by_name("name").expect("name column");
        let name = name.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(name.value(0), "a");

        // Builders are reset; the next round starts empty.
        assert!(collector.finish_batch().expect("empty batch").is_empty());
    }

    #[test]
    fn kkv_payload_expands_per_entry() {
        let schema = kkv_schema();
        let value_config = ValueConfig::from_schema(&schema);
        let mut collector = KeyValueCollector::new(TableKind::Kkv);
        collector.init_primary_key(&schema).expect("pk");
        collector.init_values(&value_config, &schema).expect("values");

        let entries = vec![
            KkvEntry {
                suffix_key: "100".to_string(),
                value: value_config.pack(&[FieldValue::Int32(5)]).expect("pack"),
            },
            KkvEntry {
                suffix_key: "101".to_string(),
                value: value_config.pack(&[FieldValue::Int32(6)]).expect("pack"),
            },
        ];
        let appended = collector
            .collect_fields("7", &LookupPayload::Kkv(entries))
            .expect("collect");
        assert_eq!(appended, 2);

        let chunk = collector.finish_batch().expect("finish");
        assert_eq!(chunk.len(), 2);
        let uid = chunk.column_by_name("uid").expect("uid");
        let uid = uid.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(uid.values(), &[7, 7]);
        let order_id = chunk.column_by_name("order_id").expect("order_id");
        let order_id = order_id
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        assert_eq!(order_id.values(), &[100, 101]);
    }

    #[test]
    fn mismatched_payload_shape_is_rejected() {
        let schema = kv_schema();
        let value_config = ValueConfig::from_schema(&schema);
        let mut collector = KeyValueCollector::new(TableKind::Kv);
        collector.init_primary_key(&schema).expect("pk");
        collector.init_values(&value_config, &schema).expect("values");
        let err = collector
            .collect_fields("1", &LookupPayload::Kkv(Vec::new()))
            .expect_err("shape mismatch");
        assert!(err.contains("payload shape"), "err={}", err);
    }

    #[test]
    fn trailing_blob_bytes_are_rejected() {
        let schema = kv_schema();
        let value_config = ValueConfig::from_schema(&schema);
        let mut collector = KeyValueCollector::new(TableKind::Kv);
        collector.init_primary_key(&schema).expect("pk");
        collector.init_values(&value_config, &schema).expect("values");
        let mut blob = value_config
            .pack(&[FieldValue::Int32(1), FieldValue::Str(String::new())])
            .expect("pack")
            .to_vec();
        blob.push(0xff);
        let err = collector
            .collect_fields("1", &LookupPayload::Kv(blob.into()))
            .expect_err("trailing bytes");
        assert!(err.contains("trailing bytes"), "err={}", err);
    }

    #[test]
    fn float_primary_key_is_rejected_at_init() {
        let mut schema = kv_schema();
        schema.fields[0] = FieldSpec::single("pk", BuiltinType::Double);
        let mut collector = KeyValueCollector::new(TableKind::Kv);
        let err = collector.init_primary_key(&schema).expect_err("float pk");
        assert!(err.contains("unsupported primary key type"), "err={}", err);
    }
}
