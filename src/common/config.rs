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
//! Process-level configuration knobs.
//!
//! Responsibilities:
//! - Loads the optional JSON config file named by `PETREL_CONFIG`.
//! - Exposes accessor functions with built-in defaults for runtime tuning.

use std::sync::OnceLock;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub lookup_runtime_worker_threads: Option<usize>,
    pub lookup_runtime_max_blocking_threads: Option<usize>,
    pub lookup_default_max_concurrency: Option<usize>,
    pub lookup_default_left_time_ms: Option<u64>,
    pub watermark_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PetrelConfig {
    pub runtime: RuntimeConfig,
}

static CONFIG: OnceLock<Result<PetrelConfig, String>> = OnceLock::new();

pub fn config() -> Result<&'static PetrelConfig, String> {
    match CONFIG.get_or_init(load_config) {
        Ok(cfg) => Ok(cfg),
        Err(err) => Err(err.clone()),
    }
}

fn load_config() -> Result<PetrelConfig, String> {
    let Ok(path) = std::env::var("PETREL_CONFIG") else {
        return Ok(PetrelConfig::default());
    };
    let path = path.trim();
    if path.is_empty() {
        return Ok(PetrelConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("read config file {} failed: {}", path, e))?;
    serde_json::from_str(&raw).map_err(|e| format!("parse config file {} failed: {}", path, e))
}

pub(crate) fn lookup_runtime_worker_threads() -> usize {
    config()
        .ok()
        .and_then(|c| c.runtime.lookup_runtime_worker_threads)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn lookup_runtime_max_blocking_threads() -> usize {
    config()
        .ok()
        .and_then(|c| c.runtime.lookup_runtime_max_blocking_threads)
        .unwrap_or(16)
}

pub(crate) fn lookup_default_max_concurrency() -> usize {
    config()
        .ok()
        .and_then(|c| c.runtime.lookup_default_max_concurrency)
        .unwrap_or(16)
}

pub(crate) fn lookup_default_left_time_ms() -> u64 {
    config()
        .ok()
        .and_then(|c| c.runtime.lookup_default_left_time_ms)
        .unwrap_or(1_000)
}

pub(crate) fn watermark_poll_interval_ms() -> u64 {
    config()
        .ok()
        .and_then(|c| c.runtime.watermark_poll_interval_ms)
        .unwrap_or(1)
}
