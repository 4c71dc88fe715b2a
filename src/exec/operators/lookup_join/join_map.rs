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
//! Hash-only join map from key hash to right-side row index.
//!
//! The map stores only the 64-bit hash, not the key value: equal hashes of
//! distinct keys conflate, and duplicate keys resolve last-writer-wins. Both
//! sides of a join must hash through the same map instance so the seeds
//! agree.

use std::hash::{BuildHasher, Hash};

use hashbrown::{DefaultHashBuilder, HashMap};

use crate::common::logging::debug;

pub struct JoinHashMap {
    map: HashMap<u64, u32>,
    hasher: DefaultHashBuilder,
    overwrites: u64,
}

impl JoinHashMap {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            hasher: DefaultHashBuilder::default(),
            overwrites: 0,
        }
    }

    pub fn hash_one<T: Hash>(&self, value: &T) -> u64 {
        self.hasher.hash_one(value)
    }

    /// Insert one right-side row under its key hash, last writer wins.
    pub fn insert(&mut self, hash: u64, row: u32) {
        if let Some(old) = self.map.insert(hash, row) {
            self.overwrites += 1;
            debug!("join key hash {:#018x} row {} overwrites row {}", hash, row, old);
        }
    }

    pub fn get(&self, hash: u64) -> Option<u32> {
        self.map.get(&hash).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn overwrites(&self) -> u64 {
        self.overwrites
    }
}

impl Default for JoinHashMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_probe() {
        let mut map = JoinHashMap::new();
        let h1 = map.hash_one(&1_i64);
        let h2 = map.hash_one(&2_i64);
        map.insert(h1, 10);
        map.insert(h2, 20);
        assert_eq!(map.get(h1), Some(10));
        assert_eq!(map.get(h2), Some(20));
        assert_eq!(map.get(map.hash_one(&3_i64)), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn duplicate_key_keeps_the_last_row() {
        let mut map = JoinHashMap::new();
        let h = map.hash_one(&"dup");
        map.insert(h, 1);
        map.insert(h, 2);
        assert_eq!(map.get(h), Some(2));
        assert_eq!(map.overwrites(), 1);
        assert_eq!(map.len(), 1);
    }
}
