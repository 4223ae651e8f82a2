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

//! The lazy two-tier store (C3): an in-memory overlay over a slower
//! "source" [`crate::dag::DagStore`].
//!
//! Chunks are either *memory-only* (produced by writers here, not yet
//! persisted to the source) or *cached source chunks* (pulled in on demand,
//! bounded in total byte size and evicted LRU). Heads live entirely in
//! memory, independent of the source's own heads. The store keeps its own
//! `refcounts`/`refs` tables, counting reachability from its own heads only.

use crate::cache::Cache;
use crate::chunk::Chunk;
use crate::dag::{Backend, DagReadTxn, DagStore};
use crate::error::{Result, StoreError};
use crate::hash::Hash;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};

/// Computes the byte size a chunk contributes to the cache's size budget.
/// The default counts the payload plus one hash width per ref, matching the
/// on-disk footprint of the `c/<hash>/d` and `c/<hash>/m` KV records.
pub fn default_chunk_size(chunk: &Chunk) -> usize {
    chunk.data().len() + chunk.refs().len() * crate::hash::HASH_BYTES
}

/// The byte-size-bounded LRU tier holding cached source chunks. Kept behind
/// its own lock (independent of [`LazyInner`]'s) so a promoting `get` can
/// run under either a read or a write transaction without upgrading the
/// outer lock.
struct LruTier {
    cache: Cache<Hash, (Chunk, usize)>,
    total_size: usize,
    limit: usize,
}

impl LruTier {
    fn new(limit: usize) -> Self {
        Self {
            cache: Cache::unbounded(),
            total_size: 0,
            limit,
        }
    }

    fn get(&mut self, h: &Hash) -> Option<Chunk> {
        if self.cache.promote(h) {
            self.cache.peek(h).map(|(c, _)| c.clone())
        } else {
            None
        }
    }

    fn contains(&self, h: &Hash) -> bool {
        self.cache.peek(h).is_some()
    }

    /// Insert (or refresh) a chunk, then evict from the LRU end until back
    /// within `limit`. A chunk whose own size exceeds `limit` is never
    /// inserted (§4.2).
    fn insert(&mut self, h: Hash, chunk: Chunk, size: usize) {
        if size > self.limit {
            return;
        }
        if let Some((_, old_size)) = self.cache.peek(&h) {
            let old_size = *old_size;
            self.total_size = self.total_size - old_size + size;
            self.cache.update_in_place(h, (chunk, size));
        } else {
            self.total_size += size;
            if let Some((evicted_hash, (_, evicted_size))) = self.cache.set(h, (chunk, size)) {
                let _ = evicted_hash;
                self.total_size -= evicted_size;
            }
        }
        self.evict_to_limit();
    }

    fn evict_to_limit(&mut self) {
        while self.total_size > self.limit {
            match self.cache.pop_lru() {
                Some((_, (_, size))) => self.total_size -= size,
                None => break,
            }
        }
    }

    fn remove(&mut self, h: &Hash) {
        if let Some((_, size)) = self.cache.remove(h) {
            self.total_size -= size;
        }
    }
}

/// The heads, memory-only chunks, and reachability bookkeeping that must be
/// mutated under a single write lock (§5 "the write lock must be held for
/// head or memory-only map mutation").
struct LazyInner {
    heads: HashMap<String, Hash>,
    mem_only: HashMap<Hash, Chunk>,
    refcounts: HashMap<Hash, u32>,
    refs: HashMap<Hash, Vec<Hash>>,
    /// `> 0` while inside `with_suspended_evicts_and_deletes`.
    suspend_depth: u32,
    /// Hashes whose refcount reached zero while suspended; replayed on exit.
    suspended_deletes: Vec<Hash>,
}

/// The in-memory overlay store (C3).
pub struct LazyStore<B: Backend> {
    source: DagStore<B>,
    state: RwLock<LazyInner>,
    lru: Mutex<LruTier>,
    size_of: fn(&Chunk) -> usize,
}

impl<B: Backend> LazyStore<B> {
    /// A fresh lazy store with no heads, backed by `source`, bounding the
    /// cached tier to `cache_size_limit` bytes.
    pub fn new(source: DagStore<B>, cache_size_limit: usize) -> Self {
        Self::with_size_fn(source, cache_size_limit, default_chunk_size)
    }

    /// As [`LazyStore::new`], with a custom chunk-size function (e.g. one
    /// accounting for an out-of-band storage overhead).
    pub fn with_size_fn(
        source: DagStore<B>,
        cache_size_limit: usize,
        size_of: fn(&Chunk) -> usize,
    ) -> Self {
        Self {
            source,
            state: RwLock::new(LazyInner {
                heads: HashMap::new(),
                mem_only: HashMap::new(),
                refcounts: HashMap::new(),
                refs: HashMap::new(),
                suspend_depth: 0,
                suspended_deletes: Vec::new(),
            }),
            lru: Mutex::new(LruTier::new(cache_size_limit)),
            size_of,
        }
    }

    /// The backing source store this overlay pulls from.
    pub fn source(&self) -> &DagStore<B> {
        &self.source
    }

    /// True iff `h` is held locally (memory-only or cached), without falling
    /// through to the source. Used by persist/refresh to decide what still
    /// needs to cross the gap (`crate::sync`).
    pub fn contains_locally(&self, h: &Hash) -> bool {
        self.state.read().mem_only.contains_key(h) || self.lru.lock().contains(h)
    }

    /// True iff `h` is specifically memory-only (not yet durable in the
    /// source). Persist walks memory-only chunks stopping at the first
    /// non-memory-only hash it reaches (§4.6 step 3).
    pub fn is_memory_only(&self, h: &Hash) -> bool {
        self.state.read().mem_only.contains_key(h)
    }

    /// The configured chunk-size function, exposed so callers computing a
    /// gather byte budget (§4.6 refresh step 1a) use the same accounting the
    /// cache itself does.
    pub fn chunk_size(&self, chunk: &Chunk) -> usize {
        (self.size_of)(chunk)
    }

    /// Open a read transaction over the lazy tier.
    pub fn read(&self) -> LazyReadTxn<'_, B> {
        LazyReadTxn {
            store: self,
            state: self.state.read(),
            source: self.source.read(),
        }
    }

    /// Open the (sole) write transaction over the lazy tier.
    pub fn write(&self) -> LazyWriteTxn<'_, B> {
        LazyWriteTxn {
            store: self,
            state: self.state.write(),
            source: self.source.read(),
            pending_head_changes: HashMap::new(),
            pending_mem_only_chunks: HashMap::new(),
            pending_cached_chunks: HashMap::new(),
            created_chunks: HashSet::new(),
        }
    }

    /// Delay cache evictions and zero-refcount deletes until `f` returns.
    /// Used by refresh (§4.6) so chunks already loaded during a pull are not
    /// transiently evicted while the new snapshot is assembled.
    pub fn with_suspended_evicts_and_deletes<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut state = self.state.write();
            state.suspend_depth += 1;
        }
        let result = f();
        let deletes = {
            let mut state = self.state.write();
            state.suspend_depth -= 1;
            if state.suspend_depth == 0 {
                std::mem::take(&mut state.suspended_deletes)
            } else {
                Vec::new()
            }
        };
        if !deletes.is_empty() {
            let mut lru = self.lru.lock();
            let state = self.state.read();
            for h in deletes {
                if state.refcounts.get(&h).copied().unwrap_or(0) == 0 {
                    lru.remove(&h);
                }
            }
            lru.evict_to_limit();
        }
        result
    }

    /// Move `hashes` from the memory-only tier into the cached tier. Called
    /// by the persist pipeline (§4.6 step 5) once those chunks are durable
    /// in the source.
    pub fn chunks_persisted(&self, hashes: &[Hash]) {
        let mut state = self.state.write();
        let mut lru = self.lru.lock();
        for h in hashes {
            if let Some(chunk) = state.mem_only.remove(h) {
                let size = (self.size_of)(&chunk);
                lru.insert(h.clone(), chunk, size);
            }
        }
        lru.evict_to_limit();
    }

    fn refs_from_cache_or_source(&self, state: &LazyInner, h: &Hash) -> Option<Vec<Hash>> {
        if let Some(refs) = state.refs.get(h) {
            return Some(refs.clone());
        }
        if let Some(c) = state.mem_only.get(h) {
            return Some(c.refs().to_vec());
        }
        let mut lru = self.lru.lock();
        if let Some((c, _)) = lru.cache.peek(h) {
            return Some(c.refs().to_vec());
        }
        drop(lru);
        self.source.read().get_chunk(h).map(|c| c.refs().to_vec())
    }
}

// Expose the inner `Cache` for `LruTier::get`'s peek-without-promote path.
impl LruTier {
    #[allow(dead_code)]
    fn peek_size(&self, h: &Hash) -> Option<usize> {
        self.cache.peek(h).map(|(_, s)| *s)
    }
}

/// A read-only lazy-store transaction.
pub struct LazyReadTxn<'a, B: Backend> {
    store: &'a LazyStore<B>,
    state: RwLockReadGuard<'a, LazyInner>,
    source: DagReadTxn<B::Read>,
}

impl<'a, B: Backend> LazyReadTxn<'a, B> {
    /// See §4.2's read path.
    pub fn get_chunk(&self, h: &Hash) -> Option<Chunk> {
        if let Some(c) = self.state.mem_only.get(h) {
            return Some(c.clone());
        }
        {
            let mut lru = self.store.lru.lock();
            if let Some(c) = lru.get(h) {
                return Some(c);
            }
        }
        let chunk = self.source.get_chunk(h)?;
        if self.state.refcounts.get(h).copied().unwrap_or(0) > 0 {
            let size = (self.store.size_of)(&chunk);
            self.store.lru.lock().insert(h.clone(), chunk.clone(), size);
        }
        Some(chunk)
    }

    /// True iff `h` is resolvable (memory-only, cached, or fetchable from
    /// source).
    pub fn has_chunk(&self, h: &Hash) -> bool {
        self.state.mem_only.contains_key(h)
            || self.store.lru.lock().contains(h)
            || self.source.has_chunk(h)
    }

    /// See [`crate::dag::DagReadTxn::must_get_chunk`].
    pub fn must_get_chunk(&self, h: &Hash) -> Result<Chunk> {
        self.get_chunk(h)
            .ok_or_else(|| StoreError::ChunkNotFound(h.clone()))
    }

    /// The lazy store's own head, independent of the source's heads.
    pub fn get_head(&self, name: &str) -> Option<Hash> {
        self.state.heads.get(name).cloned()
    }
}

/// A write lazy-store transaction. Buffers everything until [`LazyWriteTxn::commit`].
pub struct LazyWriteTxn<'a, B: Backend> {
    store: &'a LazyStore<B>,
    state: RwLockWriteGuard<'a, LazyInner>,
    source: DagReadTxn<B::Read>,
    pending_head_changes: HashMap<String, (Option<Hash>, Option<Hash>)>,
    pending_mem_only_chunks: HashMap<Hash, Chunk>,
    pending_cached_chunks: HashMap<Hash, (Chunk, usize)>,
    created_chunks: HashSet<Hash>,
}

impl<'a, B: Backend> LazyWriteTxn<'a, B> {
    /// See [`LazyReadTxn::get_chunk`]; additionally observes this
    /// transaction's own pending writes (read-your-writes).
    pub fn get_chunk(&mut self, h: &Hash) -> Option<Chunk> {
        if let Some(c) = self.pending_mem_only_chunks.get(h) {
            return Some(c.clone());
        }
        if let Some(c) = self.state.mem_only.get(h) {
            return Some(c.clone());
        }
        if let Some((c, _)) = self.pending_cached_chunks.get(h) {
            return Some(c.clone());
        }
        {
            let mut lru = self.store.lru.lock();
            if let Some(c) = lru.get(h) {
                return Some(c);
            }
        }
        let chunk = self.source.get_chunk(h)?;
        if self.state.refcounts.get(h).copied().unwrap_or(0) > 0 {
            let size = (self.store.size_of)(&chunk);
            self.pending_cached_chunks
                .insert(h.clone(), (chunk.clone(), size));
        }
        Some(chunk)
    }

    /// See [`LazyReadTxn::has_chunk`].
    pub fn has_chunk(&mut self, h: &Hash) -> bool {
        self.get_chunk(h).is_some()
    }

    /// See [`crate::dag::DagReadTxn::must_get_chunk`].
    pub fn must_get_chunk(&mut self, h: &Hash) -> Result<Chunk> {
        self.get_chunk(h)
            .ok_or_else(|| StoreError::ChunkNotFound(h.clone()))
    }

    /// See [`LazyReadTxn::get_head`]; observes pending head changes.
    pub fn get_head(&self, name: &str) -> Option<Hash> {
        if let Some((_, new)) = self.pending_head_changes.get(name) {
            return new.clone();
        }
        self.state.heads.get(name).cloned()
    }

    /// Create a fresh chunk, stage it memory-only, and return it. Chunks
    /// built by the B-tree writer's `flush()` arrive here.
    pub fn create_chunk(&mut self, data: Vec<u8>, refs: Vec<Hash>) -> Result<Chunk> {
        let chunk = Chunk::new(data, refs)?;
        self.created_chunks.insert(chunk.hash().clone());
        self.pending_mem_only_chunks
            .insert(chunk.hash().clone(), chunk.clone());
        Ok(chunk)
    }

    /// Stage an already-built chunk as memory-only (e.g. one migrated back
    /// in from a cache promotion during a merge).
    pub fn put_chunk(&mut self, chunk: Chunk) {
        self.pending_mem_only_chunks
            .insert(chunk.hash().clone(), chunk);
    }

    /// Point head `name` at `h`.
    pub fn set_head(&mut self, name: &str, h: Hash) {
        let original = self.original_head(name);
        self.pending_head_changes
            .entry(name.to_string())
            .or_insert((original, None))
            .1 = Some(h);
    }

    /// Remove head `name`.
    pub fn remove_head(&mut self, name: &str) {
        let original = self.original_head(name);
        self.pending_head_changes
            .entry(name.to_string())
            .or_insert((original, None))
            .1 = None;
    }

    fn original_head(&self, name: &str) -> Option<Hash> {
        if let Some((orig, _)) = self.pending_head_changes.get(name) {
            return orig.clone();
        }
        self.state.heads.get(name).cloned()
    }

    /// Run the lazy store's refcount pass (mirrors §4.1's algorithm, against
    /// this store's own tables) and apply everything staged in this
    /// transaction.
    pub fn commit(mut self) -> Result<()> {
        let mut pending: HashMap<Hash, u32> = HashMap::new();
        for (old, new) in self.pending_head_changes.values() {
            if old == new {
                continue;
            }
            if let Some(h) = old {
                decrement(&self.state, &self.pending_mem_only_chunks, &self.pending_cached_chunks, self.store, &mut pending, h);
            }
            if let Some(h) = new {
                increment(&self.state, &self.pending_mem_only_chunks, &self.pending_cached_chunks, self.store, &mut pending, h);
            }
        }

        // Mirrors the DAG store's commit pass: the refcount sweep starts
        // from head deltas *and the union of pending chunks*, so a freshly
        // created chunk not yet wired into any head-reachable tree is still
        // evaluated (and dropped) instead of leaking into `mem_only`
        // unconditionally.
        for h in self.pending_mem_only_chunks.keys().chain(self.pending_cached_chunks.keys()) {
            pending
                .entry(h.clone())
                .or_insert_with(|| self.state.refcounts.get(h).copied().unwrap_or(0));
        }

        // Chunks reaching refcount 0 that are memory-only are dropped
        // outright rather than handed to the cache (§4.2 step 2).
        let mut dropped = Vec::new();
        for (h, count) in &pending {
            if *count == 0
                && (self.state.mem_only.contains_key(h) || self.pending_mem_only_chunks.contains_key(h))
            {
                dropped.push(h.clone());
            }
        }
        for h in &dropped {
            self.state.mem_only.remove(h);
            self.pending_mem_only_chunks.remove(h);
            self.state.refs.remove(h);
            self.state.refcounts.remove(h);
            pending.remove(h);
        }

        for (h, count) in pending {
            if count == 0 {
                if self.state.suspend_depth > 0 {
                    self.state.suspended_deletes.push(h.clone());
                } else {
                    self.store.lru.lock().remove(&h);
                }
                self.state.refcounts.remove(&h);
                self.state.refs.remove(&h);
            } else {
                self.state.refcounts.insert(h.clone(), count);
            }
        }

        for (h, c) in self.pending_mem_only_chunks {
            self.state.refs.entry(h.clone()).or_insert_with(|| c.refs().to_vec());
            self.state.mem_only.insert(h, c);
        }

        if self.state.suspend_depth == 0 {
            let mut lru = self.store.lru.lock();
            for (h, (c, size)) in self.pending_cached_chunks {
                self.state.refs.entry(h.clone()).or_insert_with(|| c.refs().to_vec());
                if self.state.refcounts.get(&h).copied().unwrap_or(0) > 0 {
                    lru.insert(h, c, size);
                }
            }
        } else {
            for (h, (c, _)) in self.pending_cached_chunks {
                self.state.refs.entry(h.clone()).or_insert_with(|| c.refs().to_vec());
            }
        }

        for (name, (_, new)) in self.pending_head_changes {
            match new {
                Some(h) => {
                    self.state.heads.insert(name, h);
                }
                None => {
                    self.state.heads.remove(&name);
                }
            }
        }

        Ok(())
    }

    /// Abandon the transaction without applying anything.
    pub fn release(self) {}
}

// Free functions rather than methods: `commit` needs simultaneous access to
// `self.state` (already exclusively borrowed by the guard) and several
// other `self` fields, which a method taking `&mut self` throughout cannot
// express without re-borrowing conflicts.
fn lookup_refs<B: Backend>(
    state: &LazyInner,
    pending_mem_only: &HashMap<Hash, Chunk>,
    pending_cached: &HashMap<Hash, (Chunk, usize)>,
    store: &LazyStore<B>,
    h: &Hash,
) -> Vec<Hash> {
    if let Some(c) = pending_mem_only.get(h) {
        return c.refs().to_vec();
    }
    if let Some((c, _)) = pending_cached.get(h) {
        return c.refs().to_vec();
    }
    store.refs_from_cache_or_source(state, h).unwrap_or_default()
}

fn current_rc(state: &LazyInner, pending: &HashMap<Hash, u32>, h: &Hash) -> u32 {
    if let Some(rc) = pending.get(h) {
        return *rc;
    }
    state.refcounts.get(h).copied().unwrap_or(0)
}

fn increment<B: Backend>(
    state: &LazyInner,
    pending_mem_only: &HashMap<Hash, Chunk>,
    pending_cached: &HashMap<Hash, (Chunk, usize)>,
    store: &LazyStore<B>,
    pending: &mut HashMap<Hash, u32>,
    h: &Hash,
) {
    let rc = current_rc(state, pending, h);
    pending.insert(h.clone(), rc + 1);
    if rc == 0 {
        for child in lookup_refs(state, pending_mem_only, pending_cached, store, h) {
            increment(state, pending_mem_only, pending_cached, store, pending, &child);
        }
    }
}

fn decrement<B: Backend>(
    state: &LazyInner,
    pending_mem_only: &HashMap<Hash, Chunk>,
    pending_cached: &HashMap<Hash, (Chunk, usize)>,
    store: &LazyStore<B>,
    pending: &mut HashMap<Hash, u32>,
    h: &Hash,
) {
    let rc = current_rc(state, pending, h);
    let new_rc = rc.saturating_sub(1);
    pending.insert(h.clone(), new_rc);
    if new_rc == 0 {
        for child in lookup_refs(state, pending_mem_only, pending_cached, store, h) {
            decrement(state, pending_mem_only, pending_cached, store, pending, &child);
        }
    }
}
