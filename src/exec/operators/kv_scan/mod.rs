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
//! Point-lookup scan over KV and KKV tables.
//!
//! Responsibilities:
//! - Resolves the reader generation, binds the collector, and runs lookup
//!   rounds; every batch scan call drains one full round (`eof` is always
//!   true for KV/KKV).
//! - Accepts wholesale key-set replacement from a driving kernel
//!   (`update_scan_query`), with first-occurrence dedup and partition
//!   ownership filtering.
//! - Applies the watermark gate and the degrade policy, then the residual
//!   filter and the row limit.
//!
//! Key exported interfaces:
//! - Types: `KvScanConfig`, `KvScanOperator`, `ScanBatch`, `ScanInfo`,
//!   `DegradedInfo`, `ScanKernel`, `ChunkFilter`.

pub mod collector;
pub mod lookup;
pub mod watermark;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;

use crate::common::config::{lookup_default_left_time_ms, lookup_default_max_concurrency};
use crate::exec::chunk::Chunk;
use crate::exec::chunk::transfer::transfer_chunk;
use crate::exec::kernel::{
    ComputeContext, ErrorCode, Kernel, KernelConfigContext, KernelDefBuilder, KernelInitContext,
};
use crate::runtime::async_pipe::AsyncPipe;
use crate::runtime::mem_tracker::MemTracker;
use crate::storage::{
    LookupOption, PartitionRoute, ReaderProvider, StreamQuery, TableKind, TableSchema, ValueConfig,
};
use collector::KeyValueCollector;
use lookup::{
    AsyncLookupContext, LookupBackend, LookupState, PartitionReaderBackend, TabletReaderBackend,
};
use watermark::WatermarkGate;

const DEFAULT_WATERMARK_TIMEOUT_MS: u64 = 10_000;

/// Residual row filter applied after decode (the condition parser that
/// produces it lives outside this crate).
pub type ChunkFilter = Arc<dyn Fn(&Chunk) -> Result<BooleanArray, String> + Send + Sync>;

#[derive(Clone)]
pub struct KvScanConfig {
    pub table_name: String,
    pub use_tablet_reader: bool,
    pub use_async: bool,
    pub require_pk: bool,
    pub allow_soft_failure: bool,
    pub limit: Option<usize>,
    pub left_time: Duration,
    pub max_concurrency: usize,
    pub target_watermark: Option<i64>,
    pub watermark_timeout: Duration,
    pub initial_keys: Vec<String>,
    pub filter: Option<ChunkFilter>,
    /// When the consumer holds batches across rounds it must not alias the
    /// scan's builders; the batch is then handed out as a deep copy.
    pub reuse_buffers: bool,
}

impl KvScanConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            use_tablet_reader: true,
            use_async: true,
            require_pk: false,
            allow_soft_failure: false,
            limit: None,
            left_time: Duration::from_millis(lookup_default_left_time_ms()),
            max_concurrency: lookup_default_max_concurrency(),
            target_watermark: None,
            watermark_timeout: Duration::from_millis(DEFAULT_WATERMARK_TIMEOUT_MS),
            initial_keys: Vec::new(),
            filter: None,
            reuse_buffers: false,
        }
    }

    /// Parse scan attributes from a kernel attribute map.
    pub fn from_attrs(ctx: &KernelConfigContext) -> Result<Self, String> {
        let mut config = Self::new(ctx.require_str("table_name")?);
        config.use_tablet_reader = ctx.get_bool("use_tablet_reader", true)?;
        config.use_async = ctx.get_bool("kv_async", true)?;
        config.require_pk = ctx.get_bool("kv_require_pk", false)?;
        config.allow_soft_failure = ctx.get_bool("allow_soft_failure", false)?;
        if let Some(limit) = ctx.get_u64_opt("limit")? {
            config.limit = Some(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        if let Some(ms) = ctx.get_u64_opt("left_time_ms")? {
            config.left_time = Duration::from_millis(ms);
        }
        if let Some(n) = ctx.get_u64_opt("max_concurrency")? {
            config.max_concurrency = usize::try_from(n).unwrap_or(usize::MAX).max(1);
        }
        config.target_watermark = ctx.get_i64_opt("target_watermark")?;
        if let Some(ms) = ctx.get_u64_opt("watermark_timeout_ms")? {
            config.watermark_timeout = Duration::from_millis(ms);
        }
        if let Some(keys) = ctx.get_str_array("primary_keys")? {
            config.initial_keys = keys;
        }
        config.reuse_buffers = ctx.get_bool("reuse_scan_buffers", false)?;
        Ok(config)
    }
}

/// Telemetry about a degraded (soft-failed) scan.
#[derive(Clone, Debug)]
pub struct DegradedInfo {
    pub error: String,
    pub degraded_docs: u64,
}

/// Result of one batch scan call. For KV/KKV tables one call drains the
/// whole round, so `eof` is always true.
#[derive(Debug)]
pub struct ScanBatch {
    pub chunk: Chunk,
    pub eof: bool,
    pub degraded: Option<DegradedInfo>,
}

#[derive(Clone, Debug, Default)]
pub struct ScanInfo {
    pub wait_watermark_time: Duration,
    pub seek_time: Duration,
    pub degraded_docs: u64,
    pub build_watermark: i64,
    pub rounds: u64,
}

pub struct KvScanOperator {
    config: KvScanConfig,
    route: PartitionRoute,
    schema: Arc<TableSchema>,
    collector: KeyValueCollector,
    lookup: AsyncLookupContext,
    gate: Option<WatermarkGate>,
    gate_resolved: bool,
    deferred_keys: Option<Vec<String>>,
    pipe: Arc<AsyncPipe>,
    pending_keys: Vec<String>,
    streaming: bool,
    scan_info: ScanInfo,
    tracker: Option<Arc<MemTracker>>,
}

impl KvScanOperator {
    pub fn open(
        config: KvScanConfig,
        provider: &Arc<dyn ReaderProvider>,
        route: PartitionRoute,
    ) -> Result<Self, String> {
        let pipe = AsyncPipe::new();
        let (backend, gate): (Arc<dyn LookupBackend>, Option<WatermarkGate>) =
            if config.use_tablet_reader {
                let reader = provider.tablet_reader(&config.table_name).ok_or_else(|| {
                    format!("no tablet reader registered for table {}", config.table_name)
                })?;
                let gate = config
                    .target_watermark
                    .map(|_| WatermarkGate::new(Arc::clone(&reader), Arc::clone(&pipe)));
                (Arc::new(TabletReaderBackend::new(reader)), gate)
            } else {
                if config.target_watermark.is_some() {
                    return Err(
                        "watermark wait requires the tablet reader generation".to_string()
                    );
                }
                let reader = provider.partition_reader(&config.table_name).ok_or_else(|| {
                    format!(
                        "no partition reader registered for table {}",
                        config.table_name
                    )
                })?;
                (Arc::new(PartitionReaderBackend::new(reader)), None)
            };

        let schema = backend.schema();
        if !matches!(schema.kind, TableKind::Kv | TableKind::Kkv) {
            return Err(format!(
                "kv scan opened on a {} table: {}",
                schema.kind.as_str(),
                schema.table_name
            ));
        }

        let mut collector = KeyValueCollector::new(schema.kind);
        collector.init_primary_key(&schema)?;
        let value_config = ValueConfig::from_schema(&schema);
        collector.init_values(&value_config, &schema)?;

        let lookup_pipe = config.use_async.then(|| Arc::clone(&pipe));
        let lookup = AsyncLookupContext::new(backend, lookup_pipe);

        let mut operator = Self {
            config,
            route,
            schema,
            collector,
            lookup,
            gate,
            gate_resolved: false,
            deferred_keys: None,
            pipe,
            pending_keys: Vec::new(),
            streaming: false,
            scan_info: ScanInfo::default(),
            tracker: None,
        };

        let keys = operator.prepare_keys(operator.config.initial_keys.clone());
        if keys.is_empty() && operator.config.require_pk {
            return Err(format!(
                "kv scan on table {} requires a primary key predicate",
                operator.config.table_name
            ));
        }
        if let Some(gate) = operator.gate.clone() {
            let target = operator
                .config
                .target_watermark
                .ok_or_else(|| "watermark gate without a target".to_string())?;
            gate.start_wait(target, operator.config.watermark_timeout)?;
            operator.deferred_keys = Some(keys);
        } else if !keys.is_empty() {
            operator.start_round(keys)?;
        }
        Ok(operator)
    }

    pub fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema)
    }

    pub fn scan_info(&self) -> &ScanInfo {
        &self.scan_info
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.tracker = Some(tracker);
    }

    /// Replace the key set wholesale and start a new round. `None` means an
    /// empty round, not an error.
    pub fn update_scan_query(&mut self, query: Option<StreamQuery>) -> Result<(), String> {
        self.streaming = true;
        let keys = query.map(|q| q.primary_keys).unwrap_or_default();
        let keys = self.prepare_keys(keys);
        if self.gate.is_some() && !self.gate_resolved {
            self.deferred_keys = Some(keys);
            return Ok(());
        }
        self.start_round(keys)
    }

    /// First-occurrence dedup plus partition ownership filter.
    fn prepare_keys(&self, keys: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::with_capacity(keys.len());
        keys.into_iter()
            .filter(|key| self.route.owns(key) && seen.insert(key.clone()))
            .collect()
    }

    fn start_round(&mut self, keys: Vec<String>) -> Result<(), String> {
        self.pending_keys = keys.clone();
        let option = LookupOption::new(&self.config.table_name)
            .with_left_time(self.config.left_time)
            .with_max_concurrency(self.config.max_concurrency);
        if self.config.use_async {
            self.lookup.start(keys, option)
        } else {
            self.lookup.run_sync(keys, option)
        }
    }

    /// Drain the in-flight round into one output batch.
    pub fn do_batch_scan(&mut self) -> Result<ScanBatch, String> {
        let mut degraded: Option<DegradedInfo> = None;

        if let Some(gate) = self.gate.clone() {
            if !self.gate_resolved {
                let timeout = self.config.watermark_timeout + Duration::from_secs(1);
                if !self.pipe.wait_ready(timeout) {
                    return Err(format!(
                        "watermark wait for table {} did not complete in time",
                        self.config.table_name
                    ));
                }
                self.gate_resolved = true;
                self.scan_info.wait_watermark_time = gate.wait_watermark_time();
                self.scan_info.build_watermark = gate.build_watermark();
                if gate.wait_failed() {
                    if !self.config.allow_soft_failure {
                        return Err(format!(
                            "watermark catch-up failed for table {} and soft failure is not allowed",
                            self.config.table_name
                        ));
                    }
                    // Every key served below the target counts as degraded.
                    let docs = self
                        .deferred_keys
                        .as_ref()
                        .map(|keys| keys.len() as u64)
                        .unwrap_or(0)
                        .max(1);
                    degraded = Some(DegradedInfo {
                        error: "watermark catch-up timed out".to_string(),
                        degraded_docs: docs,
                    });
                    self.scan_info.degraded_docs += docs;
                }
                if let Some(keys) = self.deferred_keys.take() {
                    self.start_round(keys)?;
                }
            }
        }

        // Nothing submitted: an empty round still yields one (empty) batch.
        if self.lookup.state() == LookupState::Idle && self.pending_keys.is_empty() {
            let chunk = self.collector.finish_batch()?;
            return Ok(ScanBatch {
                chunk,
                eof: true,
                degraded,
            });
        }

        if self.config.use_async {
            let timeout = self.config.left_time + Duration::from_secs(5);
            if !self.pipe.wait_ready(timeout) {
                return Err(format!(
                    "lookup round for table {} did not complete in time",
                    self.config.table_name
                ));
            }
        }

        if !self.lookup.is_schema_match() {
            self.collector.reset();
            self.pending_keys.clear();
            return Err(format!(
                "schema version of table {} changed during scan",
                self.config.table_name
            ));
        }

        let results = self.lookup.get_results()?;
        let failed = self.lookup.get_failed_count();
        if failed > 0 {
            if !self.config.allow_soft_failure {
                self.collector.reset();
                self.pending_keys.clear();
                return Err(format!(
                    "{} lookups failed for table {} and soft failure is not allowed",
                    failed, self.config.table_name
                ));
            }
            let info = degraded.get_or_insert_with(|| DegradedInfo {
                error: "lookup failures degraded the scan".to_string(),
                degraded_docs: 0,
            });
            info.degraded_docs += failed;
            self.scan_info.degraded_docs += failed;
        }

        let keys = std::mem::take(&mut self.pending_keys);
        debug_assert_eq!(keys.len(), results.len());
        for (key, result) in keys.iter().zip(results.iter()) {
            if let Some(payload) = result {
                self.collector.collect_fields(key, payload)?;
            }
        }
        self.scan_info.seek_time += self.lookup.get_seek_time();
        self.scan_info.rounds += 1;

        let mut chunk = self.collector.finish_batch()?;
        if let Some(filter) = self.config.filter.clone() {
            let mask = filter(&chunk)?;
            let batch = filter_record_batch(&chunk.batch, &mask)
                .map_err(|e| format!("apply residual filter failed: {}", e))?;
            chunk = Chunk::try_new(batch)?;
        }
        if let Some(limit) = self.config.limit {
            if chunk.len() > limit {
                chunk = chunk.slice(0, limit);
            }
        }
        let mut chunk = transfer_chunk(chunk, self.config.reuse_buffers)?.into_chunk();
        if let Some(tracker) = self.tracker.as_ref() {
            chunk.transfer_to(tracker);
        }
        self.lookup.try_report_metrics();
        Ok(ScanBatch {
            chunk,
            eof: true,
            degraded,
        })
    }
}

/// Kernel wrapper exposing the scan as a source with one `out` port.
#[derive(Default)]
pub struct ScanKernel {
    config: Option<KvScanConfig>,
    operator: Option<KvScanOperator>,
}

impl ScanKernel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Kernel for ScanKernel {
    fn def(&self, builder: &mut KernelDefBuilder) {
        builder.name("KvScanKernel").output("out");
    }

    fn config(&mut self, ctx: &KernelConfigContext) -> Result<(), String> {
        self.config = Some(KvScanConfig::from_attrs(ctx)?);
        Ok(())
    }

    fn init(&mut self, ctx: &mut KernelInitContext) -> ErrorCode {
        let Some(config) = self.config.clone() else {
            return ctx.abort("scan kernel used before config");
        };
        match KvScanOperator::open(config, ctx.reader_provider(), ctx.route()) {
            Ok(mut operator) => {
                operator.set_mem_tracker(Arc::clone(ctx.mem_tracker()));
                self.operator = Some(operator);
                ErrorCode::None
            }
            Err(e) => ctx.abort(e),
        }
    }

    fn compute(&mut self, ctx: &mut ComputeContext) -> ErrorCode {
        let Some(operator) = self.operator.as_mut() else {
            return ctx.abort("scan kernel used before init");
        };
        match operator.do_batch_scan() {
            Ok(batch) => {
                ctx.push_output("out", Some(batch.chunk), batch.eof);
                ErrorCode::None
            }
            Err(e) => ctx.abort(e),
        }
    }
}
