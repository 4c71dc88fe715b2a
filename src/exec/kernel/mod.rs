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
//! Execution-kernel contract the surrounding DAG framework drives.
//!
//! Responsibilities:
//! - Declares the `Kernel` lifecycle (def, config, init, compute) and the
//!   contexts each phase receives.
//! - Chunks cross kernel boundaries through named ports carrying a chunk
//!   plus an eof mark.
//!
//! Key exported interfaces:
//! - Traits: `Kernel`.
//! - Types: `ErrorCode`, `KernelDef`, `KernelDefBuilder`, `KernelConfigContext`,
//!   `KernelInitContext`, `ComputeContext`, `Port`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::common::logging::error;
use crate::exec::chunk::Chunk;
use crate::runtime::mem_tracker::MemTracker;
use crate::storage::{PartitionRoute, ReaderProvider};

/// Phase outcome at the kernel boundary. Failure details go through
/// `abort()` on the phase context and the log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    None,
    Abort,
}

impl ErrorCode {
    pub fn is_abort(self) -> bool {
        self == Self::Abort
    }
}

/// Static shape of a kernel: its name and named input/output ports.
#[derive(Clone, Debug, Default)]
pub struct KernelDef {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Default)]
pub struct KernelDefBuilder {
    def: KernelDef,
}

impl KernelDefBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.def.name = name.into();
        self
    }

    pub fn input(&mut self, name: impl Into<String>) -> &mut Self {
        self.def.inputs.push(name.into());
        self
    }

    pub fn output(&mut self, name: impl Into<String>) -> &mut Self {
        self.def.outputs.push(name.into());
        self
    }

    pub fn build(&self) -> KernelDef {
        self.def.clone()
    }
}

/// Typed view over a kernel's JSON attribute map.
#[derive(Debug)]
pub struct KernelConfigContext {
    attrs: serde_json::Map<String, Value>,
}

impl KernelConfigContext {
    pub fn new(attrs: Value) -> Result<Self, String> {
        match attrs {
            Value::Object(attrs) => Ok(Self { attrs }),
            Value::Null => Ok(Self {
                attrs: serde_json::Map::new(),
            }),
            other => Err(format!(
                "kernel attributes must be a json object, got {}",
                other
            )),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &str) -> Result<&str, String> {
        match self.attrs.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(format!("attribute {} must be a string, got {}", key, other)),
            None => Err(format!("missing required attribute {}", key)),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(format!("attribute {} must be a bool, got {}", key, other)),
        }
    }

    pub fn get_u64_opt(&self, key: &str) -> Result<Option<u64>, String> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| format!("attribute {} must be a non-negative integer", key)),
            Some(other) => Err(format!("attribute {} must be a number, got {}", key, other)),
        }
    }

    pub fn get_i64_opt(&self, key: &str) -> Result<Option<i64>, String> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| format!("attribute {} must be an integer", key)),
            Some(other) => Err(format!("attribute {} must be a number, got {}", key, other)),
        }
    }

    pub fn get_str_array(&self, key: &str) -> Result<Option<Vec<String>>, String> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let s = item.as_str().ok_or_else(|| {
                        format!("attribute {} must be an array of strings, got {}", key, item)
                    })?;
                    out.push(s.to_string());
                }
                Ok(Some(out))
            }
            Some(other) => Err(format!("attribute {} must be an array, got {}", key, other)),
        }
    }
}

/// Shared resources handed to a kernel during `init`.
pub struct KernelInitContext {
    reader_provider: Arc<dyn ReaderProvider>,
    route: PartitionRoute,
    mem_tracker: Arc<MemTracker>,
    error: Option<String>,
}

impl KernelInitContext {
    pub fn new(
        reader_provider: Arc<dyn ReaderProvider>,
        route: PartitionRoute,
        mem_tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            reader_provider,
            route,
            mem_tracker,
            error: None,
        }
    }

    pub fn reader_provider(&self) -> &Arc<dyn ReaderProvider> {
        &self.reader_provider
    }

    pub fn route(&self) -> PartitionRoute {
        self.route
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn abort(&mut self, msg: impl Into<String>) -> ErrorCode {
        let msg = msg.into();
        error!("kernel init aborted: {}", msg);
        self.error = Some(msg);
        ErrorCode::Abort
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// One named port holding at most one pending chunk plus the eof mark.
#[derive(Debug, Default)]
pub struct Port {
    pub chunk: Option<Chunk>,
    pub eof: bool,
}

/// Per-tick context for `compute`: input ports filled by the framework,
/// output ports drained by it afterwards.
#[derive(Default)]
pub struct ComputeContext {
    inputs: HashMap<String, Port>,
    outputs: HashMap<String, Port>,
    error: Option<String>,
}

impl ComputeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, name: impl Into<String>, chunk: Option<Chunk>, eof: bool) {
        self.inputs.insert(name.into(), Port { chunk, eof });
    }

    /// Drain the named input port; `None` means no data arrived this tick.
    pub fn take_input(&mut self, name: &str) -> Option<Port> {
        self.inputs.remove(name)
    }

    pub fn push_output(&mut self, name: impl Into<String>, chunk: Option<Chunk>, eof: bool) {
        self.outputs.insert(name.into(), Port { chunk, eof });
    }

    pub fn take_output(&mut self, name: &str) -> Option<Port> {
        self.outputs.remove(name)
    }

    pub fn abort(&mut self, msg: impl Into<String>) -> ErrorCode {
        let msg = msg.into();
        error!("kernel compute aborted: {}", msg);
        self.error = Some(msg);
        ErrorCode::Abort
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Lifecycle contract every execution kernel implements.
///
/// The framework calls `def` once to learn the port shape, `config` with the
/// kernel's attribute map, `init` with shared resources, then `compute` once
/// per tick until every output port reports eof.
pub trait Kernel: Send {
    fn def(&self, builder: &mut KernelDefBuilder);
    fn config(&mut self, ctx: &KernelConfigContext) -> Result<(), String>;
    fn init(&mut self, ctx: &mut KernelInitContext) -> ErrorCode;
    fn compute(&mut self, ctx: &mut ComputeContext) -> ErrorCode;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn def_builder_collects_ports() {
        let mut builder = KernelDefBuilder::new();
        builder.name("LookupJoinKernel").input("left").output("out");
        let def = builder.build();
        assert_eq!(def.name, "LookupJoinKernel");
        assert_eq!(def.inputs, vec!["left".to_string()]);
        assert_eq!(def.outputs, vec!["out".to_string()]);
    }

    #[test]
    fn config_context_type_checks() {
        let ctx = KernelConfigContext::new(json!({
            "table_name": "item",
            "kv_async": true,
            "limit": 10,
            "outputs": ["a", "b"],
        }))
        .expect("config");
        assert_eq!(ctx.require_str("table_name").expect("str"), "item");
        assert!(ctx.get_bool("kv_async", false).expect("bool"));
        assert!(ctx.get_bool("absent", true).expect("default"));
        assert_eq!(ctx.get_u64_opt("limit").expect("u64"), Some(10));
        assert_eq!(
            ctx.get_str_array("outputs").expect("array"),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let err = ctx.require_str("limit").expect_err("wrong type");
        assert!(err.contains("must be a string"), "err={}", err);
        let err = ctx.require_str("missing").expect_err("missing");
        assert!(err.contains("missing required attribute"), "err={}", err);
    }

    #[test]
    fn non_object_attrs_rejected() {
        assert!(KernelConfigContext::new(json!(null)).is_ok());
        let err = KernelConfigContext::new(json!([1, 2])).expect_err("array attrs");
        assert!(err.contains("must be a json object"), "err={}", err);
    }

    #[test]
    fn compute_context_ports_roundtrip() {
        let mut ctx = ComputeContext::new();
        ctx.set_input("left", None, true);
        let port = ctx.take_input("left").expect("port");
        assert!(port.eof);
        assert!(port.chunk.is_none());
        assert!(ctx.take_input("left").is_none());

        ctx.push_output("out", None, true);
        assert!(ctx.take_output("out").expect("port").eof);

        assert_eq!(ctx.abort("boom"), ErrorCode::Abort);
        assert_eq!(ctx.last_error(), Some("boom"));
    }
}
