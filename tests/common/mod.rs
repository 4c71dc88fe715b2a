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
//! Common fixtures and helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Int32Array, Int64Array, Int64Builder, ListArray, ListBuilder, RecordBatch,
    StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};

use petrel::common::ids::SlotId;
use petrel::common::types::BuiltinType;
use petrel::exec::chunk::{Chunk, field_with_slot_id};
use petrel::storage::memory::{MemoryReaderProvider, MemoryTablet};
use petrel::storage::{FieldSpec, FieldValue, ReaderProvider, TableKind, TableSchema};

/// KV table `item(pk int64, attr2 int32)` with rows 1:51, 2:52, 3:53.
pub fn item_tablet() -> MemoryTablet {
    let tablet = MemoryTablet::new(TableSchema {
        table_name: "item".to_string(),
        kind: TableKind::Kv,
        primary_key: "pk".to_string(),
        suffix_key: None,
        fields: vec![
            FieldSpec::single("pk", BuiltinType::Int64),
            FieldSpec::single("attr2", BuiltinType::Int32),
        ],
    });
    for (pk, attr2) in [("1", 51), ("2", 52), ("3", 53)] {
        tablet
            .insert_kv(pk, &[FieldValue::Int32(attr2)])
            .expect("insert item row");
    }
    tablet
}

/// KV table `price_table(pk int64, price int32)` with rows 0:0, 1:3, 2:2,
/// 3:1, 4:4.
pub fn price_tablet() -> MemoryTablet {
    let tablet = MemoryTablet::new(TableSchema {
        table_name: "price_table".to_string(),
        kind: TableKind::Kv,
        primary_key: "pk".to_string(),
        suffix_key: None,
        fields: vec![
            FieldSpec::single("pk", BuiltinType::Int64),
            FieldSpec::single("price", BuiltinType::Int32),
        ],
    });
    for (pk, price) in [("0", 0), ("1", 3), ("2", 2), ("3", 1), ("4", 4)] {
        tablet
            .insert_kv(pk, &[FieldValue::Int32(price)])
            .expect("insert price row");
    }
    tablet
}

/// KV table `names(pk string, label string)` keyed by raw strings.
pub fn names_tablet() -> MemoryTablet {
    let tablet = MemoryTablet::new(TableSchema {
        table_name: "names".to_string(),
        kind: TableKind::Kv,
        primary_key: "pk".to_string(),
        suffix_key: None,
        fields: vec![
            FieldSpec::single("pk", BuiltinType::String),
            FieldSpec::single("label", BuiltinType::String),
        ],
    });
    for (pk, label) in [("alpha", "first"), ("beta", "second")] {
        tablet
            .insert_kv(pk, &[FieldValue::Str(label.to_string())])
            .expect("insert names row");
    }
    tablet
}

/// KKV table `orders(uid int64 pk, order_id int64 suffix, price int32)`.
pub fn orders_tablet() -> MemoryTablet {
    let tablet = MemoryTablet::new(TableSchema {
        table_name: "orders".to_string(),
        kind: TableKind::Kkv,
        primary_key: "uid".to_string(),
        suffix_key: Some("order_id".to_string()),
        fields: vec![
            FieldSpec::single("uid", BuiltinType::Int64),
            FieldSpec::single("order_id", BuiltinType::Int64),
            FieldSpec::single("price", BuiltinType::Int32),
        ],
    });
    for (uid, order_id, price) in [("7", "100", 5), ("7", "101", 6), ("8", "200", 9)] {
        tablet
            .insert_kkv(uid, order_id, &[FieldValue::Int32(price)])
            .expect("insert order row");
    }
    tablet
}

pub fn provider_with_tablet(tablet: MemoryTablet) -> Arc<dyn ReaderProvider> {
    let provider = MemoryReaderProvider::new();
    provider.register_tablet(tablet);
    Arc::new(provider)
}

pub fn provider_with_partition(tablet: MemoryTablet) -> Arc<dyn ReaderProvider> {
    let provider = MemoryReaderProvider::new();
    provider.register_partition(tablet);
    Arc::new(provider)
}

pub fn int64_values(chunk: &Chunk, name: &str) -> Vec<i64> {
    let col = chunk.column_by_name(name).expect("int64 column");
    let col = col.as_any().downcast_ref::<Int64Array>().expect("int64");
    col.values().to_vec()
}

pub fn int32_values(chunk: &Chunk, name: &str) -> Vec<i32> {
    let col = chunk.column_by_name(name).expect("int32 column");
    let col = col.as_any().downcast_ref::<Int32Array>().expect("int32");
    col.values().to_vec()
}

pub fn string_values(chunk: &Chunk, name: &str) -> Vec<String> {
    let col = chunk.column_by_name(name).expect("string column");
    let col = col.as_any().downcast_ref::<StringArray>().expect("utf8");
    (0..col.len()).map(|i| col.value(i).to_string()).collect()
}

/// One-column left chunk `joinid list<int64>`; `None` rows are null lists.
pub fn left_joinid_chunk(rows: &[Option<Vec<i64>>]) -> Chunk {
    let mut builder = ListBuilder::new(Int64Builder::new());
    for row in rows {
        match row {
            Some(values) => {
                for v in values {
                    builder.values().append_value(*v);
                }
                builder.append(true);
            }
            None => builder.append(false),
        }
    }
    let array = Arc::new(builder.finish()) as ArrayRef;
    let field = Field::new(
        "joinid",
        DataType::List(Arc::new(Field::new_list_field(DataType::Int64, true))),
        true,
    );
    let schema = Arc::new(Schema::new(vec![field_with_slot_id(field, SlotId::new(0))]));
    let batch = RecordBatch::try_new(schema, vec![array]).expect("left batch");
    Chunk::try_new(batch).expect("left chunk")
}

/// Read back a list<int32> output column as row-wise vectors.
pub fn int32_lists(chunk: &Chunk, name: &str) -> Vec<Vec<i32>> {
    let col = chunk.column_by_name(name).expect("list column");
    let list = col.as_any().downcast_ref::<ListArray>().expect("list");
    (0..list.len())
        .map(|row| {
            let values = list.value(row);
            let values = values
                .as_any()
                .downcast_ref::<Int32Array>()
                .expect("int32 values");
            values.values().to_vec()
        })
        .collect()
}
