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
//! Build-watermark gate for consistency-bounded scans.
//!
//! Before the first lookup round the scan may require the tablet's build
//! watermark to reach a target logical timestamp. The gate polls on the
//! lookup runtime and wakes the scan's suspension pipe when the target is
//! reached or the wait times out; the scan then applies its degrade policy.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::config::watermark_poll_interval_ms;
use crate::common::logging::{debug, warn};
use crate::runtime::async_pipe::AsyncPipe;
use crate::runtime::lookup_runtime::lookup_runtime_handle;
use crate::storage::TabletReader;

struct GateInner {
    reader: Arc<dyn TabletReader>,
    pipe: Arc<AsyncPipe>,
    wait_failed: AtomicBool,
    wait_time_us: AtomicU64,
    last_watermark: AtomicI64,
}

/// One watermark wait shared with the scan through its suspension pipe.
#[derive(Clone)]
pub struct WatermarkGate {
    inner: Arc<GateInner>,
}

impl WatermarkGate {
    pub fn new(reader: Arc<dyn TabletReader>, pipe: Arc<AsyncPipe>) -> Self {
        let last = reader.build_watermark();
        Self {
            inner: Arc::new(GateInner {
                reader,
                pipe,
                wait_failed: AtomicBool::new(false),
                wait_time_us: AtomicU64::new(0),
                last_watermark: AtomicI64::new(last),
            }),
        }
    }

    /// The gate-owned suspension handle; shared with the lookup rounds.
    pub fn async_pipe(&self) -> Arc<AsyncPipe> {
        Arc::clone(&self.inner.pipe)
    }

    /// Begin polling toward `target`. Arms the shared pipe, so a pending
    /// lookup suspension makes this fail.
    pub fn start_wait(&self, target: i64, timeout: Duration) -> Result<(), String> {
        self.inner.pipe.arm()?;
        self.inner.wait_failed.store(false, Ordering::Release);
        let handle = lookup_runtime_handle()?;
        let inner = Arc::clone(&self.inner);
        let poll_interval = Duration::from_millis(watermark_poll_interval_ms().max(1));
        handle.spawn(async move {
            let started = Instant::now();
            let deadline = started + timeout;
            loop {
                let watermark = inner.reader.build_watermark();
                inner.last_watermark.store(watermark, Ordering::Release);
                if watermark >= target {
                    debug!(
                        table = inner.reader.table_name(),
                        watermark, target, "watermark target reached"
                    );
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(
                        "watermark wait timed out for table {}: build {} < target {}",
                        inner.reader.table_name(),
                        watermark,
                        target
                    );
                    inner.wait_failed.store(true, Ordering::Release);
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
            let elapsed = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            inner.wait_time_us.store(elapsed, Ordering::Release);
            inner.pipe.wake();
        });
        Ok(())
    }

    pub fn wait_failed(&self) -> bool {
        self.inner.wait_failed.load(Ordering::Acquire)
    }

    pub fn wait_watermark_time(&self) -> Duration {
        Duration::from_micros(self.inner.wait_time_us.load(Ordering::Acquire))
    }

    /// Last build watermark observed by the poll loop.
    pub fn build_watermark(&self) -> i64 {
        self.inner.last_watermark.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::BuiltinType;
    use crate::storage::memory::MemoryTablet;
    use crate::storage::{FieldSpec, TableKind, TableSchema};
    use std::thread;

    fn sample_tablet() -> MemoryTablet {
        MemoryTablet::new(TableSchema {
            table_name: "item".to_string(),
            kind: TableKind::Kv,
            primary_key: "pk".to_string(),
            suffix_key: None,
            fields: vec![
                FieldSpec::single("pk", BuiltinType::Int64),
                FieldSpec::single("attr2", BuiltinType::Int32),
            ],
        })
    }

    #[test]
    fn reached_watermark_completes_immediately() {
        let tablet = sample_tablet();
        tablet.set_build_watermark(100);
        let gate = WatermarkGate::new(Arc::new(tablet), AsyncPipe::new());
        gate.start_wait(50, Duration::from_secs(1)).expect("start");
        assert!(gate.async_pipe().wait_ready(Duration::from_secs(5)));
        assert!(!gate.wait_failed());
        assert_eq!(gate.build_watermark(), 100);
    }

    #[test]
    fn catch_up_wakes_the_pipe() {
        let tablet = sample_tablet();
        let gate = WatermarkGate::new(Arc::new(tablet.clone()), AsyncPipe::new());
        gate.start_wait(10, Duration::from_secs(5)).expect("start");
        let bumper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            tablet.set_build_watermark(10);
        });
        assert!(gate.async_pipe().wait_ready(Duration::from_secs(5)));
        assert!(!gate.wait_failed());
        assert!(gate.build_watermark() >= 10);
        bumper.join().expect("join bumper");
    }

    #[test]
    fn timeout_marks_wait_failed() {
        let tablet = sample_tablet();
        let gate = WatermarkGate::new(Arc::new(tablet), AsyncPipe::new());
        gate.start_wait(10, Duration::from_millis(20)).expect("start");
        assert!(gate.async_pipe().wait_ready(Duration::from_secs(5)));
        assert!(gate.wait_failed());
    }

    #[test]
    fn gate_respects_single_suspension() {
        let tablet = sample_tablet();
        let pipe = AsyncPipe::new();
        pipe.arm().expect("arm elsewhere");
        let gate = WatermarkGate::new(Arc::new(tablet), pipe);
        let err = gate
            .start_wait(10, Duration::from_millis(20))
            .expect_err("pipe busy");
        assert!(err.contains("only one pending suspension"), "err={}", err);
    }
}
