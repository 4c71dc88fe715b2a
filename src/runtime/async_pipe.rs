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
//! Single-slot suspension handle shared by a scan instance.
//!
//! Responsibilities:
//! - Lets one in-flight asynchronous wait (lookup round or watermark catch-up)
//!   wake the owning computation when it completes.
//! - Enforces at most one pending suspension per scan instance: arming twice
//!   without an intervening completion is an error.
//!
//! Key exported interfaces:
//! - Types: `AsyncPipe`, `PipeObserver`, `DeferWake`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Callback invoked when the pipe completes a suspension.
pub type PipeObserver = Arc<dyn Fn() + Send + Sync + 'static>;

struct PipeState {
    armed: bool,
    ready: bool,
}

/// One suspension channel owned by a scan instance.
///
/// The lookup round and the watermark gate take turns on the same pipe; each
/// arms it before handing work to the lookup runtime and wakes it on
/// completion.
pub struct AsyncPipe {
    state: Mutex<PipeState>,
    cv: Condvar,
    observers: Mutex<Vec<PipeObserver>>,
}

impl AsyncPipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState {
                armed: false,
                ready: false,
            }),
            cv: Condvar::new(),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn add_observer(&self, observer: PipeObserver) {
        let mut guard = self.observers.lock().expect("async pipe observers lock");
        guard.push(observer);
    }

    /// Begin one suspension. Fails if a previous suspension is still pending.
    pub fn arm(&self) -> Result<(), String> {
        let mut guard = self.state.lock().expect("async pipe state lock");
        if guard.armed {
            return Err("async pipe already armed: only one pending suspension allowed".to_string());
        }
        guard.armed = true;
        guard.ready = false;
        Ok(())
    }

    /// Complete the pending suspension and wake waiters/observers.
    pub fn wake(&self) {
        let notify = {
            let mut guard = self.state.lock().expect("async pipe state lock");
            if guard.ready {
                return;
            }
            guard.armed = false;
            guard.ready = true;
            self.cv.notify_all();
            self.defer_wake()
        };
        notify.arm();
    }

    pub fn is_ready(&self) -> bool {
        let guard = self.state.lock().expect("async pipe state lock");
        guard.ready
    }

    /// Block the calling thread until the pending suspension completes.
    ///
    /// Returns false on timeout. A pipe that was never armed counts as ready.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().expect("async pipe state lock");
        while guard.armed && !guard.ready {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            let (next, wait) = self
                .cv
                .wait_timeout(guard, left)
                .expect("async pipe condvar wait");
            guard = next;
            if wait.timed_out() && guard.armed && !guard.ready {
                return false;
            }
        }
        true
    }

    fn defer_wake(&self) -> DeferWake {
        let observers = {
            let guard = self.observers.lock().expect("async pipe observers lock");
            guard.clone()
        };
        DeferWake {
            observers,
            armed: AtomicBool::new(false),
        }
    }
}

/// RAII helper that delivers observer callbacks outside the state lock.
#[must_use]
pub struct DeferWake {
    observers: Vec<PipeObserver>,
    armed: AtomicBool,
}

impl DeferWake {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }
}

impl Drop for DeferWake {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            for observer in &self.observers {
                observer();
            }
        }
    }
}
