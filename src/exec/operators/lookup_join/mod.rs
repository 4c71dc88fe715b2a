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
//! Streaming lookup join driving a KV scan with keys from the left input.
//!
//! Responsibilities:
//! - Flattens the left multi-valued join column into a stream query, drives
//!   the right-side scan to eof, and builds a hash map over the right rows.
//! - Gathers per-element matches into a result index matrix (`-1` marks no
//!   match) and expands the requested right fields into list columns.
//! - Emits exactly one output row per left row; unmatched elements take
//!   zero/empty defaults.
//!
//! Key exported interfaces:
//! - Types: `LookupJoinKernel`, `JoinInfo`.

pub mod join_map;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{
    Array, ArrayRef, Float32Array, Float32Builder, Float64Array, Float64Builder, Int8Array,
    Int8Builder, Int16Array, Int16Builder, Int32Array, Int32Builder, Int64Array, Int64Builder,
    ListArray, ListBuilder, RecordBatch, StringArray, StringBuilder, UInt8Array, UInt8Builder,
    UInt16Array, UInt16Builder, UInt32Array, UInt32Builder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, FieldRef, Schema};

use crate::common::ids::SlotId;
use crate::common::logging::info;
use crate::common::types::BuiltinType;
use crate::exec::chunk::{Chunk, field_with_slot_id};
use crate::exec::kernel::{
    ComputeContext, ErrorCode, Kernel, KernelConfigContext, KernelDefBuilder, KernelInitContext,
};
use crate::exec::operators::kv_scan::{KvScanConfig, KvScanOperator};
use crate::storage::{StreamQuery, TableKind};
use join_map::JoinHashMap;

const METRICS_REPORT_TICKS: u64 = 64;

#[derive(Clone)]
struct JoinConfig {
    left_column: String,
    right_column: String,
    left_outputs: Option<Vec<String>>,
    right_outputs: Vec<String>,
    scan: KvScanConfig,
}

/// Accumulated join telemetry, reported periodically through the log.
#[derive(Clone, Debug, Default)]
pub struct JoinInfo {
    pub update_time: Duration,
    pub scan_time: Duration,
    pub hash_time: Duration,
    pub join_time: Duration,
    pub total_time: Duration,
    pub hash_size: usize,
    pub left_rows: u64,
    pub output_rows: u64,
    pub empty_join_keys: u64,
    pub unmatched_elements: u64,
    pub degraded_docs: u64,
    pub ticks: u64,
}

#[derive(Default)]
pub struct LookupJoinKernel {
    config: Option<JoinConfig>,
    scan: Option<KvScanOperator>,
    info: JoinInfo,
}

impl LookupJoinKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join_info(&self) -> &JoinInfo {
        &self.info
    }

    fn process(&mut self, left: &Chunk) -> Result<Chunk, String> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| "join kernel used before config".to_string())?;
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| "join kernel used before init".to_string())?;
        let total_start = Instant::now();

        let t = Instant::now();
        let query = gen_stream_query(left, &config.left_column)?;
        scan.update_scan_query(Some(query))?;
        self.info.update_time += t.elapsed();

        let t = Instant::now();
        let mut pages = Vec::new();
        loop {
            let batch = scan.do_batch_scan()?;
            if let Some(degraded) = batch.degraded {
                self.info.degraded_docs += degraded.degraded_docs;
            }
            let eof = batch.eof;
            pages.push(batch.chunk);
            if eof {
                break;
            }
        }
        let right = Chunk::concat(&pages)?;
        self.info.scan_time += t.elapsed();

        let t = Instant::now();
        let map = create_hash_map(&right, &config.right_column)?;
        self.info.hash_size = map.len();
        self.info.hash_time += t.elapsed();

        let t = Instant::now();
        let gather = join_and_gather(left, &config.left_column, &right, &config.right_column, &map)?;
        self.info.empty_join_keys += gather.empty_keys;
        self.info.unmatched_elements += gather.misses;
        let out = generate_output(left, &right, &gather.matrix, &config)?;
        self.info.join_time += t.elapsed();

        if out.len() != left.len() {
            return Err(format!(
                "join output has {} rows for {} left rows",
                out.len(),
                left.len()
            ));
        }
        self.info.left_rows += left.len() as u64;
        self.info.output_rows += out.len() as u64;
        self.info.total_time += total_start.elapsed();
        self.info.ticks += 1;
        self.try_report_metrics();
        Ok(out)
    }

    fn try_report_metrics(&self) {
        if self.info.ticks == 0 || self.info.ticks % METRICS_REPORT_TICKS != 0 {
            return;
        }
        info!(
            ticks = self.info.ticks,
            left_rows = self.info.left_rows,
            output_rows = self.info.output_rows,
            hash_size = self.info.hash_size,
            unmatched = self.info.unmatched_elements,
            empty_keys = self.info.empty_join_keys,
            scan_ms = self.info.scan_time.as_millis() as u64,
            join_ms = self.info.join_time.as_millis() as u64,
            "lookup join metrics"
        );
    }
}

impl Kernel for LookupJoinKernel {
    fn def(&self, builder: &mut KernelDefBuilder) {
        builder.name("LookupJoinKernel").input("left").output("out");
    }

    fn config(&mut self, ctx: &KernelConfigContext) -> Result<(), String> {
        let meta = ctx.require_str("right_table_meta")?;
        let (kind_str, table) = meta.split_once(':').ok_or_else(|| {
            format!("right_table_meta must be '<kind>:<table>', got '{}'", meta)
        })?;
        let kind = TableKind::parse(kind_str)?;
        if kind != TableKind::Kv {
            return Err(format!(
                "lookup join supports only kv right tables, got {}",
                kind.as_str()
            ));
        }
        let mut scan = KvScanConfig::new(table);
        scan.use_tablet_reader = ctx.get_bool("use_tablet_reader", true)?;
        scan.use_async = ctx.get_bool("kv_async", true)?;
        scan.allow_soft_failure = ctx.get_bool("allow_soft_failure", false)?;
        if let Some(ms) = ctx.get_u64_opt("left_time_ms")? {
            scan.left_time = Duration::from_millis(ms);
        }
        if let Some(n) = ctx.get_u64_opt("max_concurrency")? {
            scan.max_concurrency = usize::try_from(n).unwrap_or(usize::MAX).max(1);
        }
        self.config = Some(JoinConfig {
            left_column: ctx.require_str("left_join_column")?.to_string(),
            right_column: ctx.require_str("right_join_column")?.to_string(),
            left_outputs: ctx.get_str_array("left_outputs")?,
            right_outputs: ctx.get_str_array("right_outputs")?.unwrap_or_default(),
            scan,
        });
        Ok(())
    }

    fn init(&mut self, ctx: &mut KernelInitContext) -> ErrorCode {
        let Some(config) = self.config.clone() else {
            return ctx.abort("join kernel used before config");
        };
        let mut scan = match KvScanOperator::open(config.scan.clone(), ctx.reader_provider(), ctx.route()) {
            Ok(scan) => scan,
            Err(e) => return ctx.abort(e),
        };
        scan.set_mem_tracker(Arc::clone(ctx.mem_tracker()));
        let schema = scan.schema();
        if schema.primary_key != config.right_column {
            return ctx.abort(format!(
                "right join column {} is not the primary key of table {}",
                config.right_column, schema.table_name
            ));
        }
        for name in &config.right_outputs {
            let Some(field) = schema.field(name) else {
                return ctx.abort(format!(
                    "right output field {} not found in table {}",
                    name, schema.table_name
                ));
            };
            if field.multi_value {
                return ctx.abort(format!(
                    "multi-valued right output field {} is not supported in lookup join",
                    name
                ));
            }
        }
        self.scan = Some(scan);
        ErrorCode::None
    }

    fn compute(&mut self, ctx: &mut ComputeContext) -> ErrorCode {
        let Some(port) = ctx.take_input("left") else {
            // A tick without input terminates the join.
            ctx.push_output("out", None, true);
            return ErrorCode::None;
        };
        let eof = port.eof;
        let Some(left) = port.chunk else {
            ctx.push_output("out", None, eof);
            return ErrorCode::None;
        };
        match self.process(&left) {
            Ok(out) => {
                ctx.push_output("out", Some(out), eof);
                ErrorCode::None
            }
            Err(e) => ctx.abort(e),
        }
    }
}

/// Flatten every element of the left list column into string-encoded keys,
/// first occurrence wins.
fn gen_stream_query(left: &Chunk, column: &str) -> Result<StreamQuery, String> {
    let col = left.column_by_name(column)?;
    let list = col.as_any().downcast_ref::<ListArray>().ok_or_else(|| {
        format!("join column {} must be a multi-valued list", column)
    })?;
    let mut seen = HashSet::new();
    let mut primary_keys = Vec::new();
    for row in 0..list.len() {
        if list.is_null(row) {
            continue;
        }
        let elems = list.value(row);
        for i in 0..elems.len() {
            if elems.is_null(i) {
                continue;
            }
            let key = encode_key(&elems, i)?;
            if seen.insert(key.clone()) {
                primary_keys.push(key);
            }
        }
    }
    Ok(StreamQuery { primary_keys })
}

/// Hash every right-side key into a row-index map, last writer wins.
fn create_hash_map(right: &Chunk, column: &str) -> Result<JoinHashMap, String> {
    let col = right.column_by_name(column)?;
    let mut map = JoinHashMap::with_capacity(right.len());
    for row in 0..right.len() {
        let hash = hash_element(&map, &col, row)?;
        let row = u32::try_from(row).map_err(|_| "right side row index overflow".to_string())?;
        map.insert(hash, row);
    }
    Ok(map)
}

struct GatherResult {
    matrix: Vec<Vec<i32>>,
    misses: u64,
    empty_keys: u64,
}

/// Probe each element of each left row; `-1` marks no match.
fn join_and_gather(
    left: &Chunk,
    left_column: &str,
    right: &Chunk,
    right_column: &str,
    map: &JoinHashMap,
) -> Result<GatherResult, String> {
    let col = left.column_by_name(left_column)?;
    let list = col.as_any().downcast_ref::<ListArray>().ok_or_else(|| {
        format!("join column {} must be a multi-valued list", left_column)
    })?;
    let right_col = right.column_by_name(right_column)?;
    if &list.value_type() != right_col.data_type() {
        return Err(format!(
            "join key type mismatch: left {:?} vs right {:?}",
            list.value_type(),
            right_col.data_type()
        ));
    }

    let mut matrix = Vec::with_capacity(list.len());
    let mut misses = 0u64;
    let mut empty_keys = 0u64;
    for row in 0..list.len() {
        if list.is_null(row) {
            empty_keys += 1;
            matrix.push(Vec::new());
            continue;
        }
        let elems = list.value(row);
        if elems.is_empty() {
            empty_keys += 1;
            matrix.push(Vec::new());
            continue;
        }
        let mut indices = Vec::with_capacity(elems.len());
        for i in 0..elems.len() {
            if elems.is_null(i) {
                indices.push(-1);
                misses += 1;
                continue;
            }
            let hash = hash_element(map, &elems, i)?;
            match map.get(hash) {
                Some(idx) => indices.push(idx as i32),
                None => {
                    indices.push(-1);
                    misses += 1;
                }
            }
        }
        matrix.push(indices);
    }
    Ok(GatherResult {
        matrix,
        misses,
        empty_keys,
    })
}

/// Left columns pass through verbatim; right fields expand into list columns
/// shaped by the result index matrix.
fn generate_output(
    left: &Chunk,
    right: &Chunk,
    matrix: &[Vec<i32>],
    config: &JoinConfig,
) -> Result<Chunk, String> {
    let left_schema = left.schema();
    let mut fields: Vec<FieldRef> = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();
    match &config.left_outputs {
        Some(names) => {
            for name in names {
                let (idx, field) = left_schema
                    .fields()
                    .iter()
                    .enumerate()
                    .find(|(_, f)| f.name() == name)
                    .ok_or_else(|| format!("left output column {} not found", name))?;
                fields.push(Arc::clone(field));
                columns.push(Arc::clone(&left.columns()[idx]));
            }
        }
        None => {
            for (idx, field) in left_schema.fields().iter().enumerate() {
                fields.push(Arc::clone(field));
                columns.push(Arc::clone(&left.columns()[idx]));
            }
        }
    }

    let mut next_slot = left
        .slot_id_to_index()
        .keys()
        .map(|s| s.as_u32())
        .max()
        .map(|v| v + 1)
        .unwrap_or(0);
    for name in &config.right_outputs {
        let col = right.column_by_name(name)?;
        if matches!(col.data_type(), DataType::List(_)) {
            return Err(format!(
                "multi-valued right output field {} is not supported in lookup join",
                name
            ));
        }
        let kind = BuiltinType::from_arrow(col.data_type())?;
        columns.push(expand_right_column(&col, kind, matrix)?);
        let field = Field::new(
            name,
            DataType::List(Arc::new(Field::new_list_field(kind.arrow_type(), true))),
            true,
        );
        fields.push(Arc::new(field_with_slot_id(field, SlotId::new(next_slot))));
        next_slot += 1;
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema, columns)
        .map_err(|e| format!("build join output failed: {}", e))?;
    Chunk::try_new(batch)
}

/// Expand one right column into a list column, one list per left row; the
/// `-1` sentinel takes the kind's default (zero or empty string).
fn expand_right_column(
    col: &ArrayRef,
    kind: BuiltinType,
    matrix: &[Vec<i32>],
) -> Result<ArrayRef, String> {
    macro_rules! expand {
        ($arr_ty:ty, $builder_ty:ty, $default:expr) => {{
            let src = col
                .as_any()
                .downcast_ref::<$arr_ty>()
                .ok_or_else(|| "right output column type mismatch".to_string())?;
            let mut builder = ListBuilder::new(<$builder_ty>::new());
            for indices in matrix {
                for &idx in indices {
                    if idx >= 0 {
                        builder.values().append_value(src.value(idx as usize));
                    } else {
                        builder.values().append_value($default);
                    }
                }
                builder.append(true);
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }
    Ok(match kind {
        BuiltinType::Int8 => expand!(Int8Array, Int8Builder, 0),
        BuiltinType::Int16 => expand!(Int16Array, Int16Builder, 0),
        BuiltinType::Int32 => expand!(Int32Array, Int32Builder, 0),
        BuiltinType::Int64 => expand!(Int64Array, Int64Builder, 0),
        BuiltinType::UInt8 => expand!(UInt8Array, UInt8Builder, 0),
        BuiltinType::UInt16 => expand!(UInt16Array, UInt16Builder, 0),
        BuiltinType::UInt32 => expand!(UInt32Array, UInt32Builder, 0),
        BuiltinType::UInt64 => expand!(UInt64Array, UInt64Builder, 0),
        BuiltinType::Float => expand!(Float32Array, Float32Builder, 0.0),
        BuiltinType::Double => expand!(Float64Array, Float64Builder, 0.0),
        BuiltinType::String => expand!(StringArray, StringBuilder, ""),
    })
}

/// String-encode one list element as a raw lookup key.
fn encode_key(array: &ArrayRef, idx: usize) -> Result<String, String> {
    macro_rules! stringify_value {
        ($arr_ty:ty) => {{
            let src = array
                .as_any()
                .downcast_ref::<$arr_ty>()
                .ok_or_else(|| "join key column type mismatch".to_string())?;
            src.value(idx).to_string()
        }};
    }
    let kind = BuiltinType::from_arrow(array.data_type())?;
    let key = match kind {
        BuiltinType::Int8 => stringify_value!(Int8Array),
        BuiltinType::Int16 => stringify_value!(Int16Array),
        BuiltinType::Int32 => stringify_value!(Int32Array),
        BuiltinType::Int64 => stringify_value!(Int64Array),
        BuiltinType::UInt8 => stringify_value!(UInt8Array),
        BuiltinType::UInt16 => stringify_value!(UInt16Array),
        BuiltinType::UInt32 => stringify_value!(UInt32Array),
        BuiltinType::UInt64 => stringify_value!(UInt64Array),
        BuiltinType::String => stringify_value!(StringArray),
        BuiltinType::Float | BuiltinType::Double => {
            return Err("floating point join keys are not supported".to_string());
        }
    };
    Ok(key)
}

/// Hash one element through the join map's seed so both sides agree.
fn hash_element(map: &JoinHashMap, array: &ArrayRef, idx: usize) -> Result<u64, String> {
    macro_rules! hash_value {
        ($arr_ty:ty) => {{
            let src = array
                .as_any()
                .downcast_ref::<$arr_ty>()
                .ok_or_else(|| "join key column type mismatch".to_string())?;
            map.hash_one(&src.value(idx))
        }};
    }
    let kind = BuiltinType::from_arrow(array.data_type())?;
    let hash = match kind {
        BuiltinType::Int8 => hash_value!(Int8Array),
        BuiltinType::Int16 => hash_value!(Int16Array),
        BuiltinType::Int32 => hash_value!(Int32Array),
        BuiltinType::Int64 => hash_value!(Int64Array),
        BuiltinType::UInt8 => hash_value!(UInt8Array),
        BuiltinType::UInt16 => hash_value!(UInt16Array),
        BuiltinType::UInt32 => hash_value!(UInt32Array),
        BuiltinType::UInt64 => hash_value!(UInt64Array),
        BuiltinType::String => hash_value!(StringArray),
        BuiltinType::Float | BuiltinType::Double => {
            return Err("floating point join keys are not supported".to_string());
        }
    };
    Ok(hash)
}
