// This file is part of dagtree-core.
// Copyright (C) 2026 the dagtree-core authors.
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The backing KV storage contract (§6 external interface) plus an
//! in-memory reference implementation.
//!
//! This crate treats the backing key/value store as an external
//! collaborator: any transactional store providing ordered byte-keyed
//! reads/writes under an RW lock, with strict serializable isolation, can
//! sit underneath [`crate::dag::DagStore`]. The only implementation shipped
//! here is [`MemoryKv`], a `BTreeMap` guarded by `parking_lot::RwLock`,
//! sufficient for tests and for embedding this crate without an external
//! database.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An opaque error from the backing KV store.
#[derive(Debug, Clone)]
pub struct KvError(pub String);

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kv backend error: {}", self.0)
    }
}

impl std::error::Error for KvError {}

/// A read-only snapshot handle over the KV backend.
///
/// Implementors must guarantee that the view returned here never observes
/// writes committed after the handle was acquired (strict serializable
/// isolation, §5).
pub trait KvRead {
    /// True iff `key` has a recorded value.
    fn has(&self, key: &[u8]) -> bool;
    /// The value under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Iterate all keys with the given prefix, in byte order.
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
    /// Release the read lock. Idempotent; dropping the handle also releases.
    fn release(self: Box<Self>) {}
}

/// A read-write handle over the KV backend.
///
/// Only one `KvWrite` may be outstanding at a time per backend (single
/// writer, multi reader, §5). Writes are only visible to other handles once
/// [`KvWrite::commit`] returns.
pub trait KvWrite: KvRead {
    /// Buffer an insert/overwrite of `key`.
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);
    /// Buffer a deletion of `key`. A no-op if absent.
    fn del(&mut self, key: &[u8]);
    /// Atomically apply all buffered puts/deletes.
    fn commit(self: Box<Self>) -> Result<(), KvError>;
    /// Abandon all buffered puts/deletes and release the write lock.
    fn release(self: Box<Self>) {}
}

/// An in-memory KV backend over a `BTreeMap`, guarded by a `parking_lot`
/// reader-writer lock. Keys are ordered by byte value, matching the KV
/// layout in [`crate::dag`].
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKv {
    /// A fresh, empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// A read handle, cloning the current snapshot so later writes from
    /// other handles can't leak in.
    pub fn read(&self) -> MemoryKvRead {
        let span = tracing::debug_span!("kv_read_acquire");
        let _enter = span.enter();
        let snapshot = self.inner.read().clone();
        MemoryKvRead { snapshot }
    }

    /// A write handle. Blocks (via the underlying `RwLock`) until any
    /// outstanding readers/writer release.
    pub fn write(&self) -> MemoryKvWrite {
        let wait_start = std::time::Instant::now();
        let guard = self.inner.write_arc();
        tracing::debug!(waited_us = wait_start.elapsed().as_micros(), "kv_write_acquire");
        let snapshot = guard.clone();
        MemoryKvWrite {
            snapshot,
            puts: BTreeMap::new(),
            deletes: std::collections::BTreeSet::new(),
            _guard: Some(guard),
        }
    }
}

impl Clone for MemoryKv {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A read-only snapshot of a [`MemoryKv`].
pub struct MemoryKvRead {
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl KvRead for MemoryKvRead {
    fn has(&self, key: &[u8]) -> bool {
        self.snapshot.contains_key(key)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.snapshot.get(key).cloned()
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.snapshot
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A write handle into a [`MemoryKv`], holding the write lock until
/// [`KvWrite::commit`] or [`KvWrite::release`].
pub struct MemoryKvWrite {
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
    puts: BTreeMap<Vec<u8>, Vec<u8>>,
    deletes: std::collections::BTreeSet<Vec<u8>>,
    _guard: Option<parking_lot::ArcRwLockWriteGuard<parking_lot::RawRwLock, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl KvRead for MemoryKvWrite {
    fn has(&self, key: &[u8]) -> bool {
        if self.deletes.contains(key) {
            return false;
        }
        self.puts.contains_key(key) || self.snapshot.contains_key(key)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self.deletes.contains(key) {
            return None;
        }
        self.puts
            .get(key)
            .cloned()
            .or_else(|| self.snapshot.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .snapshot
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in self.puts.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                continue;
            }
            merged.insert(k.clone(), v.clone());
        }
        for k in &self.deletes {
            if k.starts_with(prefix) {
                merged.remove(k);
            }
        }
        merged.into_iter().collect()
    }
}

impl KvWrite for MemoryKvWrite {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.deletes.remove(&key);
        self.puts.insert(key, value);
    }

    fn del(&mut self, key: &[u8]) {
        self.puts.remove(key);
        self.deletes.insert(key.to_vec());
    }

    fn commit(mut self: Box<Self>) -> Result<(), KvError> {
        let mut guard = self._guard.take().expect("write guard taken twice");
        for k in &self.deletes {
            guard.remove(k);
        }
        for (k, v) in self.puts {
            guard.insert(k, v);
        }
        Ok(())
    }
}
