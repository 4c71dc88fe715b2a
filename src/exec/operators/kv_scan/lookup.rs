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
//! Asynchronous batched key lookup for one scan instance.
//!
//! Responsibilities:
//! - Runs one lookup round at a time on the global lookup runtime, capped by
//!   `max_concurrency` and bounded by the round's remaining time budget.
//! - Keeps results positionally aligned with the submitted key order; a
//!   missing key or an expired get leaves its slot empty.
//! - Wraps both storage reader generations behind `LookupBackend`.
//!
//! Key exported interfaces:
//! - Types: `AsyncLookupContext`, `LookupState`, `PartitionReaderBackend`,
//!   `TabletReaderBackend`.
//! - Traits: `LookupBackend`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::common::logging::{info, warn};
use crate::runtime::async_pipe::AsyncPipe;
use crate::runtime::lookup_runtime::{lookup_block_on, lookup_runtime_handle};
use crate::storage::{LookupOption, LookupPayload, PartitionReader, TableSchema, TabletReader};

const METRICS_REPORT_ROUNDS: u64 = 64;

/// Lookup round lifecycle. There is no retry state: a failed round surfaces
/// through the failed count and the degrade policy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LookupState {
    Idle,
    Running,
    Completed,
}

/// One storage reader generation as seen by the lookup round.
pub trait LookupBackend: Send + Sync {
    fn table_name(&self) -> &str;
    fn schema(&self) -> Arc<TableSchema>;
    fn schema_version(&self) -> u64;
    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<LookupPayload>, String>>;
}

/// Legacy generation: synchronous gets offloaded to the blocking pool.
pub struct PartitionReaderBackend {
    reader: Arc<dyn PartitionReader>,
}

impl PartitionReaderBackend {
    pub fn new(reader: Arc<dyn PartitionReader>) -> Self {
        Self { reader }
    }
}

impl LookupBackend for PartitionReaderBackend {
    fn table_name(&self) -> &str {
        self.reader.table_name()
    }

    fn schema(&self) -> Arc<TableSchema> {
        self.reader.schema()
    }

    fn schema_version(&self) -> u64 {
        self.reader.schema_version()
    }

    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<LookupPayload>, String>> {
        let reader = Arc::clone(&self.reader);
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || reader.get_sync(&key)).await {
                Ok(result) => result,
                Err(e) => Err(format!("blocking lookup task failed: {}", e)),
            }
        })
    }
}

/// Tablet generation: natively asynchronous gets.
pub struct TabletReaderBackend {
    reader: Arc<dyn TabletReader>,
}

impl TabletReaderBackend {
    pub fn new(reader: Arc<dyn TabletReader>) -> Self {
        Self { reader }
    }
}

impl LookupBackend for TabletReaderBackend {
    fn table_name(&self) -> &str {
        self.reader.table_name()
    }

    fn schema(&self) -> Arc<TableSchema> {
        self.reader.schema()
    }

    fn schema_version(&self) -> u64 {
        self.reader.schema_version()
    }

    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<LookupPayload>, String>> {
        self.reader.get(&key)
    }
}

struct RoundState {
    state: LookupState,
    results: Vec<Option<LookupPayload>>,
    failed: u64,
    seek_time: Duration,
}

/// Drives lookup rounds for one scan instance.
///
/// The backend and its schema version are bound at construction; a version
/// change observed later fails `is_schema_match` and aborts the round.
pub struct AsyncLookupContext {
    backend: Arc<dyn LookupBackend>,
    bound_schema_version: u64,
    pipe: Option<Arc<AsyncPipe>>,
    round: Arc<Mutex<RoundState>>,
    rounds_done: AtomicU64,
    total_failed: AtomicU64,
}

impl AsyncLookupContext {
    pub fn new(backend: Arc<dyn LookupBackend>, pipe: Option<Arc<AsyncPipe>>) -> Self {
        let bound_schema_version = backend.schema_version();
        Self {
            backend,
            bound_schema_version,
            pipe,
            round: Arc::new(Mutex::new(RoundState {
                state: LookupState::Idle,
                results: Vec::new(),
                failed: 0,
                seek_time: Duration::ZERO,
            })),
            rounds_done: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LookupState {
        let guard = self.round.lock().unwrap_or_else(|e| e.into_inner());
        guard.state
    }

    /// Submit one round on the lookup runtime and return immediately. The
    /// owning pipe, if any, is armed now and woken on completion.
    pub fn start(&self, keys: Vec<String>, option: LookupOption) -> Result<(), String> {
        let handle = lookup_runtime_handle()?;
        self.begin_round()?;
        if let Some(pipe) = self.pipe.as_ref() {
            if let Err(e) = pipe.arm() {
                let mut guard = self.round.lock().unwrap_or_else(|e| e.into_inner());
                guard.state = LookupState::Idle;
                return Err(e);
            }
        }
        let backend = Arc::clone(&self.backend);
        let round = Arc::clone(&self.round);
        let pipe = self.pipe.clone();
        handle.spawn(async move {
            let started = Instant::now();
            let (results, failed) = execute_round(backend, keys, &option).await;
            {
                let mut guard = round.lock().unwrap_or_else(|e| e.into_inner());
                guard.results = results;
                guard.failed = failed;
                guard.seek_time = started.elapsed();
                guard.state = LookupState::Completed;
            }
            if let Some(pipe) = pipe {
                pipe.wake();
            }
        });
        Ok(())
    }

    /// Run one round to completion on the calling thread.
    pub fn run_sync(&self, keys: Vec<String>, option: LookupOption) -> Result<(), String> {
        self.begin_round()?;
        let started = Instant::now();
        let backend = Arc::clone(&self.backend);
        let (results, failed) = lookup_block_on(execute_round(backend, keys, &option))?;
        let mut guard = self.round.lock().unwrap_or_else(|e| e.into_inner());
        guard.results = results;
        guard.failed = failed;
        guard.seek_time = started.elapsed();
        guard.state = LookupState::Completed;
        Ok(())
    }

    fn begin_round(&self) -> Result<(), String> {
        let mut guard = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if guard.state == LookupState::Running {
            return Err("lookup round already running".to_string());
        }
        guard.state = LookupState::Running;
        guard.results.clear();
        guard.failed = 0;
        guard.seek_time = Duration::ZERO;
        Ok(())
    }

    /// Take the completed round's results, positionally aligned with the
    /// submitted keys. Valid only in the Completed state.
    pub fn get_results(&self) -> Result<Vec<Option<LookupPayload>>, String> {
        let mut guard = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if guard.state != LookupState::Completed {
            return Err(format!(
                "lookup results not ready: state is {:?}",
                guard.state
            ));
        }
        guard.state = LookupState::Idle;
        self.rounds_done.fetch_add(1, Ordering::AcqRel);
        self.total_failed.fetch_add(guard.failed, Ordering::AcqRel);
        Ok(std::mem::take(&mut guard.results))
    }

    /// Failed or expired gets in the last completed round. A clean miss is
    /// not a failure.
    pub fn get_failed_count(&self) -> u64 {
        let guard = self.round.lock().unwrap_or_else(|e| e.into_inner());
        guard.failed
    }

    pub fn get_seek_time(&self) -> Duration {
        let guard = self.round.lock().unwrap_or_else(|e| e.into_inner());
        guard.seek_time
    }

    /// The reader's schema version must still match the one captured at
    /// construction; a mismatch is always fatal to the round.
    pub fn is_schema_match(&self) -> bool {
        self.backend.schema_version() == self.bound_schema_version
    }

    pub fn try_report_metrics(&self) {
        let rounds = self.rounds_done.load(Ordering::Acquire);
        if rounds == 0 || rounds % METRICS_REPORT_ROUNDS != 0 {
            return;
        }
        info!(
            table = self.backend.table_name(),
            rounds,
            total_failed = self.total_failed.load(Ordering::Acquire),
            "lookup context metrics"
        );
    }
}

async fn execute_round(
    backend: Arc<dyn LookupBackend>,
    keys: Vec<String>,
    option: &LookupOption,
) -> (Vec<Option<LookupPayload>>, u64) {
    let total = keys.len();
    let deadline = Instant::now() + option.left_time;
    let semaphore = Arc::new(Semaphore::new(option.max_concurrency.max(1)));
    let mut tasks = Vec::with_capacity(total);
    for (idx, key) in keys.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let backend = Arc::clone(&backend);
        tasks.push(tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (idx, Err("lookup semaphore closed".to_string())),
            };
            let left = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(left, backend.get(key)).await {
                Ok(result) => (idx, result),
                Err(_) => (idx, Err("lookup deadline exceeded".to_string())),
            }
        }));
    }

    let mut results = vec![None; total];
    let mut failed = 0u64;
    for task in tasks {
        match task.await {
            Ok((idx, Ok(payload))) => results[idx] = payload,
            Ok((idx, Err(err))) => {
                failed += 1;
                warn!(
                    "lookup in table {} failed at key slot {}: {}",
                    option.table_name, idx, err
                );
            }
            Err(e) => {
                failed += 1;
                warn!("lookup task join failed: {}", e);
            }
        }
    }
    (results, failed)
}
