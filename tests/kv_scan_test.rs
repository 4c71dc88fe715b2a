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
//! Integration tests for the KV/KKV point-lookup scan path.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arrow::array::Int32Array;

use petrel::exec::chunk::Chunk;
use petrel::petrel_kv_scan::{KvScanConfig, KvScanOperator};
use petrel::storage::{PartitionRoute, StreamQuery};

mod common;
use crate::common::{
    int32_values, int64_values, item_tablet, orders_tablet, provider_with_partition,
    provider_with_tablet, string_values, names_tablet,
};

fn stream_query(keys: &[&str]) -> Option<StreamQuery> {
    Some(StreamQuery {
        primary_keys: keys.iter().map(|k| k.to_string()).collect(),
    })
}

#[test]
fn test_in_predicate_fixture() {
    // pk IN (1, 2, 3) AND attr2 IN (50, 51, 52) leaves two rows.
    let provider = provider_with_tablet(item_tablet());
    let mut config = KvScanConfig::new("item");
    let wanted: HashSet<i32> = [50, 51, 52].into_iter().collect();
    config.filter = Some(Arc::new(move |chunk: &Chunk| {
        let attr2 = chunk.column_by_name("attr2")?;
        let attr2 = attr2
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| "attr2 is not int32".to_string())?;
        Ok(attr2.iter().map(|v| v.map(|v| wanted.contains(&v))).collect())
    }));
    config.initial_keys = vec!["1".to_string(), "2".to_string(), "3".to_string()];
    config.require_pk = true;

    let mut scan = KvScanOperator::open(config, &provider, PartitionRoute::full()).expect("open");
    let batch = scan.do_batch_scan().expect("scan");
    assert!(batch.eof);
    assert_eq!(int64_values(&batch.chunk, "pk"), vec![1, 2]);
    assert_eq!(int32_values(&batch.chunk, "attr2"), vec![51, 52]);
}

#[test]
fn test_string_keys_round_trip() {
    let provider = provider_with_tablet(names_tablet());
    let mut scan = KvScanOperator::open(
        KvScanConfig::new("names"),
        &provider,
        PartitionRoute::full(),
    )
    .expect("open");
    scan.update_scan_query(stream_query(&["beta", "alpha", "unknown"]))
        .expect("update");
    let batch = scan.do_batch_scan().expect("scan");
    assert_eq!(
        string_values(&batch.chunk, "pk"),
        vec!["beta".to_string(), "alpha".to_string()]
    );
    assert_eq!(
        string_values(&batch.chunk, "label"),
        vec!["second".to_string(), "first".to_string()]
    );
}

#[test]
fn test_sync_and_async_rounds_agree() {
    let keys = ["2", "1", "3"];

    let provider = provider_with_tablet(item_tablet());
    let mut async_scan = KvScanOperator::open(
        KvScanConfig::new("item"),
        &provider,
        PartitionRoute::full(),
    )
    .expect("open async");
    async_scan.update_scan_query(stream_query(&keys)).expect("update");
    let async_batch = async_scan.do_batch_scan().expect("async scan");

    let provider = provider_with_partition(item_tablet());
    let mut config = KvScanConfig::new("item");
    config.use_async = false;
    config.use_tablet_reader = false;
    let mut sync_scan =
        KvScanOperator::open(config, &provider, PartitionRoute::full()).expect("open sync");
    sync_scan.update_scan_query(stream_query(&keys)).expect("update");
    let sync_batch = sync_scan.do_batch_scan().expect("sync scan");

    assert_eq!(
        int64_values(&async_batch.chunk, "pk"),
        int64_values(&sync_batch.chunk, "pk")
    );
    assert_eq!(
        int32_values(&async_batch.chunk, "attr2"),
        int32_values(&sync_batch.chunk, "attr2")
    );
}

#[test]
fn test_kkv_scan_expands_entries() {
    let provider = provider_with_tablet(orders_tablet());
    let mut scan = KvScanOperator::open(
        KvScanConfig::new("orders"),
        &provider,
        PartitionRoute::full(),
    )
    .expect("open");
    scan.update_scan_query(stream_query(&["7", "8", "9"])).expect("update");
    let batch = scan.do_batch_scan().expect("scan");
    assert_eq!(int64_values(&batch.chunk, "uid"), vec![7, 7, 8]);
    assert_eq!(int64_values(&batch.chunk, "order_id"), vec![100, 101, 200]);
    assert_eq!(int32_values(&batch.chunk, "price"), vec![5, 6, 9]);
}

#[test]
fn test_successive_rounds_replace_the_key_set() {
    let provider = provider_with_tablet(item_tablet());
    let mut scan = KvScanOperator::open(
        KvScanConfig::new("item"),
        &provider,
        PartitionRoute::full(),
    )
    .expect("open");

    scan.update_scan_query(stream_query(&["1", "2"])).expect("update");
    let first = scan.do_batch_scan().expect("scan");
    assert_eq!(int64_values(&first.chunk, "pk"), vec![1, 2]);

    scan.update_scan_query(stream_query(&["3"])).expect("update");
    let second = scan.do_batch_scan().expect("scan");
    assert_eq!(int64_values(&second.chunk, "pk"), vec![3]);

    scan.update_scan_query(None).expect("update");
    let third = scan.do_batch_scan().expect("scan");
    assert!(third.chunk.is_empty());
    assert!(third.eof);
}

#[test]
fn test_degraded_scan_accumulates_docs() {
    let tablet = item_tablet();
    tablet.fail_key("1");
    tablet.fail_key("3");
    let provider = provider_with_tablet(tablet);
    let mut config = KvScanConfig::new("item");
    config.allow_soft_failure = true;
    let mut scan = KvScanOperator::open(config, &provider, PartitionRoute::full()).expect("open");
    scan.update_scan_query(stream_query(&["1", "2", "3"])).expect("update");
    let batch = scan.do_batch_scan().expect("degraded scan");
    assert_eq!(int64_values(&batch.chunk, "pk"), vec![2]);
    assert_eq!(batch.degraded.expect("degraded info").degraded_docs, 2);
    assert_eq!(scan.scan_info().degraded_docs, 2);
}

#[test]
fn test_watermark_catch_up_before_first_round() {
    let tablet = item_tablet();
    let provider = provider_with_tablet(tablet.clone());
    let mut config = KvScanConfig::new("item");
    config.target_watermark = Some(42);
    config.watermark_timeout = Duration::from_secs(5);
    config.initial_keys = vec!["2".to_string()];
    let mut scan = KvScanOperator::open(config, &provider, PartitionRoute::full()).expect("open");

    let bumper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        tablet.set_build_watermark(42);
    });
    let batch = scan.do_batch_scan().expect("scan");
    bumper.join().expect("join bumper");

    assert_eq!(int64_values(&batch.chunk, "pk"), vec![2]);
    assert!(batch.degraded.is_none());
    assert_eq!(scan.scan_info().build_watermark, 42);
    assert!(scan.scan_info().wait_watermark_time > Duration::ZERO);
}

#[test]
fn test_schema_change_mid_stream_aborts() {
    let tablet = item_tablet();
    let provider = provider_with_tablet(tablet.clone());
    let mut scan = KvScanOperator::open(
        KvScanConfig::new("item"),
        &provider,
        PartitionRoute::full(),
    )
    .expect("open");
    scan.update_scan_query(stream_query(&["1"])).expect("update");
    tablet.bump_schema_version();
    let err = scan.do_batch_scan().expect_err("schema changed");
    assert!(err.contains("schema version"), "err={}", err);
}
