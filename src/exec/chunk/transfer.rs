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
//! Chunk handoff between a producing operator and its consumer.
//!
//! A producer that resets its builders between rounds must not hand out
//! chunks aliasing those buffers, so the handoff either moves the chunk or
//! deep-copies it through the Arrow IPC stream format.

use std::io::Cursor;

use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;

use super::Chunk;

/// How a chunk crossed the operator boundary.
#[derive(Debug)]
pub enum Transferred {
    Moved(Chunk),
    Copied(Chunk),
}

impl Transferred {
    pub fn into_chunk(self) -> Chunk {
        match self {
            Self::Moved(c) | Self::Copied(c) => c,
        }
    }

    pub fn is_copied(&self) -> bool {
        matches!(self, Self::Copied(_))
    }
}

/// Hand `chunk` to the consumer. With `reuse_source` the producer keeps its
/// buffers for the next round, so the consumer gets a deep copy.
pub fn transfer_chunk(chunk: Chunk, reuse_source: bool) -> Result<Transferred, String> {
    if !reuse_source {
        return Ok(Transferred::Moved(chunk));
    }
    let copied = deep_copy_batch(&chunk.batch)?;
    Ok(Transferred::Copied(Chunk::try_new(copied)?))
}

/// IPC stream roundtrip detaches every buffer from the source batch while
/// keeping field metadata (slot ids) intact.
fn deep_copy_batch(batch: &RecordBatch) -> Result<RecordBatch, String> {
    let mut encoded = Vec::with_capacity(batch.get_array_memory_size());
    {
        let mut writer = StreamWriter::try_new(&mut encoded, batch.schema_ref())
            .map_err(|e| format!("ipc stream writer: {}", e))?;
        writer
            .write(batch)
            .map_err(|e| format!("ipc encode batch: {}", e))?;
        writer
            .finish()
            .map_err(|e| format!("ipc finish stream: {}", e))?;
    }
    let mut reader = StreamReader::try_new(Cursor::new(encoded), None)
        .map_err(|e| format!("ipc stream reader: {}", e))?;
    let copied = reader
        .next()
        .ok_or_else(|| "ipc stream produced no batch".to_string())?
        .map_err(|e| format!("ipc decode batch: {}", e))?;
    Ok(copied)
}
