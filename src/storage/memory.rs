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
//! In-memory tablet implementing both reader generations.
//!
//! Reference storage used by unit and integration tests. Supports fault
//! injection (failing keys, artificial get latency) and schema-version bumps
//! to exercise the degraded-read and schema-mismatch paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::storage::{
    FieldValue, KkvEntry, LookupPayload, PartitionReader, ReaderProvider, TableKind, TableSchema,
    TabletReader, ValueConfig,
};

struct MemoryTabletInner {
    schema: Arc<TableSchema>,
    value_config: ValueConfig,
    rows: Mutex<HashMap<String, LookupPayload>>,
    failing_keys: Mutex<HashSet<String>>,
    get_latency: Mutex<Option<Duration>>,
    build_watermark: AtomicI64,
    schema_version: AtomicU64,
}

/// In-memory KV/KKV tablet; cheap to clone via `Arc`.
#[derive(Clone)]
pub struct MemoryTablet {
    inner: Arc<MemoryTabletInner>,
}

impl MemoryTablet {
    pub fn new(schema: TableSchema) -> Self {
        let value_config = ValueConfig::from_schema(&schema);
        Self {
            inner: Arc::new(MemoryTabletInner {
                schema: Arc::new(schema),
                value_config,
                rows: Mutex::new(HashMap::new()),
                failing_keys: Mutex::new(HashSet::new()),
                get_latency: Mutex::new(None),
                build_watermark: AtomicI64::new(0),
                schema_version: AtomicU64::new(1),
            }),
        }
    }

    pub fn value_config(&self) -> &ValueConfig {
        &self.inner.value_config
    }

    /// Insert one KV row; `values` follow the value-config field order.
    pub fn insert_kv(&self, key: impl Into<String>, values: &[FieldValue]) -> Result<(), String> {
        if self.inner.schema.kind != TableKind::Kv {
            return Err(format!(
                "insert_kv on a {} table",
                self.inner.schema.kind.as_str()
            ));
        }
        let blob = self.inner.value_config.pack(values)?;
        let mut rows = self.inner.rows.lock().expect("memory tablet rows lock");
        rows.insert(key.into(), LookupPayload::Kv(blob));
        Ok(())
    }

    /// Insert one KKV entry under the primary key, appending to existing ones.
    pub fn insert_kkv(
        &self,
        key: impl Into<String>,
        suffix_key: impl Into<String>,
        values: &[FieldValue],
    ) -> Result<(), String> {
        if self.inner.schema.kind != TableKind::Kkv {
            return Err(format!(
                "insert_kkv on a {} table",
                self.inner.schema.kind.as_str()
            ));
        }
        let blob = self.inner.value_config.pack(values)?;
        let entry = KkvEntry {
            suffix_key: suffix_key.into(),
            value: blob,
        };
        let mut rows = self.inner.rows.lock().expect("memory tablet rows lock");
        match rows
            .entry(key.into())
            .or_insert_with(|| LookupPayload::Kkv(Vec::new()))
        {
            LookupPayload::Kkv(entries) => entries.push(entry),
            LookupPayload::Kv(_) => return Err("kv payload under kkv key".to_string()),
        }
        Ok(())
    }

    /// Make subsequent gets for `key` fail, exercising the degrade path.
    pub fn fail_key(&self, key: impl Into<String>) {
        let mut failing = self
            .inner
            .failing_keys
            .lock()
            .expect("memory tablet failing keys lock");
        failing.insert(key.into());
    }

    /// Delay every get by `latency`, exercising the deadline path.
    pub fn set_get_latency(&self, latency: Option<Duration>) {
        let mut guard = self
            .inner
            .get_latency
            .lock()
            .expect("memory tablet latency lock");
        *guard = latency;
    }

    pub fn set_build_watermark(&self, watermark: i64) {
        self.inner
            .build_watermark
            .store(watermark, Ordering::Release);
    }

    /// Simulate a concurrent reopen with an evolved schema.
    pub fn bump_schema_version(&self) {
        self.inner.schema_version.fetch_add(1, Ordering::AcqRel);
    }

    fn lookup(&self, key: &str) -> Result<Option<LookupPayload>, String> {
        {
            let failing = self
                .inner
                .failing_keys
                .lock()
                .expect("memory tablet failing keys lock");
            if failing.contains(key) {
                return Err(format!(
                    "injected lookup failure for key {} in table {}",
                    key, self.inner.schema.table_name
                ));
            }
        }
        let rows = self.inner.rows.lock().expect("memory tablet rows lock");
        Ok(rows.get(key).cloned())
    }
}

impl PartitionReader for MemoryTablet {
    fn table_name(&self) -> &str {
        &self.inner.schema.table_name
    }

    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.inner.schema)
    }

    fn schema_version(&self) -> u64 {
        self.inner.schema_version.load(Ordering::Acquire)
    }

    fn get_sync(&self, key: &str) -> Result<Option<LookupPayload>, String> {
        self.lookup(key)
    }
}

impl TabletReader for MemoryTablet {
    fn table_name(&self) -> &str {
        &self.inner.schema.table_name
    }

    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.inner.schema)
    }

    fn schema_version(&self) -> u64 {
        self.inner.schema_version.load(Ordering::Acquire)
    }

    fn build_watermark(&self) -> i64 {
        self.inner.build_watermark.load(Ordering::Acquire)
    }

    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<LookupPayload>, String>> {
        let tablet = self.clone();
        let key = key.to_string();
        Box::pin(async move {
            let latency = {
                let guard = tablet
                    .inner
                    .get_latency
                    .lock()
                    .expect("memory tablet latency lock");
                *guard
            };
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            tablet.lookup(&key)
        })
    }
}

/// Table-name registry handed to kernels as the query's reader provider.
#[derive(Default)]
pub struct MemoryReaderProvider {
    partition_tables: Mutex<HashMap<String, Arc<dyn PartitionReader>>>,
    tablet_tables: Mutex<HashMap<String, Arc<dyn TabletReader>>>,
}

impl MemoryReaderProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the tablet-reader generation ("v2").
    pub fn register_tablet(&self, tablet: MemoryTablet) {
        let name = TabletReader::table_name(&tablet).to_string();
        let mut guard = self
            .tablet_tables
            .lock()
            .expect("reader provider tablets lock");
        guard.insert(name, Arc::new(tablet));
    }

    /// Register under the legacy partition-reader generation ("v1").
    pub fn register_partition(&self, tablet: MemoryTablet) {
        let name = PartitionReader::table_name(&tablet).to_string();
        let mut guard = self
            .partition_tables
            .lock()
            .expect("reader provider partitions lock");
        guard.insert(name, Arc::new(tablet));
    }
}

impl ReaderProvider for MemoryReaderProvider {
    fn partition_reader(&self, table: &str) -> Option<Arc<dyn PartitionReader>> {
        let guard = self
            .partition_tables
            .lock()
            .expect("reader provider partitions lock");
        guard.get(table).cloned()
    }

    fn tablet_reader(&self, table: &str) -> Option<Arc<dyn TabletReader>> {
        let guard = self
            .tablet_tables
            .lock()
            .expect("reader provider tablets lock");
        guard.get(table).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::BuiltinType;
    use crate::storage::FieldSpec;

    fn kv_schema() -> TableSchema {
        TableSchema {
            table_name: "item".to_string(),
            kind: TableKind::Kv,
            primary_key: "pk".to_string(),
            suffix_key: None,
            fields: vec![
                FieldSpec::single("pk", BuiltinType::Int64),
                FieldSpec::single("attr2", BuiltinType::Int32),
            ],
        }
    }

    #[test]
    fn kv_insert_and_sync_get() {
        let tablet = MemoryTablet::new(kv_schema());
        tablet.insert_kv("1", &[FieldValue::Int32(51)]).expect("insert");
        let payload = tablet.get_sync("1").expect("get").expect("present");
        match payload {
            LookupPayload::Kv(blob) => assert_eq!(blob.as_ref(), &51_i32.to_le_bytes()),
            LookupPayload::Kkv(_) => panic!("unexpected kkv payload"),
        }
        assert!(tablet.get_sync("9").expect("get").is_none());
    }

    #[test]
    fn failing_key_returns_error() {
        let tablet = MemoryTablet::new(kv_schema());
        tablet.insert_kv("1", &[FieldValue::Int32(51)]).expect("insert");
        tablet.fail_key("1");
        let err = tablet.get_sync("1").expect_err("injected failure");
        assert!(err.contains("injected lookup failure"), "err={}", err);
    }

    #[test]
    fn schema_version_bump_is_visible() {
        let tablet = MemoryTablet::new(kv_schema());
        let before = PartitionReader::schema_version(&tablet);
        tablet.bump_schema_version();
        assert_eq!(PartitionReader::schema_version(&tablet), before + 1);
    }

    #[test]
    fn provider_resolves_by_generation() {
        let provider = MemoryReaderProvider::new();
        provider.register_tablet(MemoryTablet::new(kv_schema()));
        assert!(provider.tablet_reader("item").is_some());
        assert!(provider.partition_reader("item").is_none());
    }
}
