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

//! The backing DAG store (C1 + C2): chunks, heads and refcount GC layered
//! directly over a [`crate::kv`] backend.
//!
//! A transaction is either a [`DagReadTxn`] (many may be outstanding at
//! once) or a [`DagWriteTxn`] (exactly one at a time). Writes are only
//! visible to others once [`DagWriteTxn::commit`] runs the refcount GC pass
//! described in module docs below and flushes to the KV.

use crate::chunk::Chunk;
use crate::error::{Result, StoreError};
use crate::hash::{HASH_BYTES, Hash};
use crate::kv::{KvRead, KvWrite};
use std::collections::HashMap;

fn chunk_data_key(h: &Hash) -> Vec<u8> {
    format!("c/{h:?}/d").into_bytes()
}

fn chunk_refs_key(h: &Hash) -> Vec<u8> {
    format!("c/{h:?}/m").into_bytes()
}

fn chunk_refcount_key(h: &Hash) -> Vec<u8> {
    format!("c/{h:?}/r").into_bytes()
}

fn head_key(name: &str) -> Vec<u8> {
    format!("h/{name}").into_bytes()
}

/// Reserved head-name prefix backing GC pins (§4.6 refresh step 1a's
/// "client's refresh list"): a pin is just a head under a name no
/// application caller should also use, so it rides the same reachability
/// machinery as any other head without being surfaced by [`DagReadTxn::get_head`]
/// under an application-chosen name.
const PIN_HEAD_PREFIX: &str = "__pin__/";

pub(crate) fn pin_head_name(h: &Hash) -> String {
    format!("{PIN_HEAD_PREFIX}{h:?}")
}

fn encode_head(h: &Hash) -> Vec<u8> {
    h.0.to_vec()
}

fn decode_head(bytes: &[u8]) -> Option<Hash> {
    if bytes.len() != HASH_BYTES {
        return None;
    }
    let mut buf = [0u8; HASH_BYTES];
    buf.copy_from_slice(bytes);
    Some(Hash(buf))
}

fn encode_refs(refs: &[Hash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(refs.len() * HASH_BYTES);
    for r in refs {
        out.extend_from_slice(&r.0);
    }
    out
}

fn decode_refs(bytes: &[u8]) -> Result<Vec<Hash>> {
    if bytes.len() % HASH_BYTES != 0 {
        return Err(StoreError::InvalidHash(format!(
            "refs blob has length {} not a multiple of {HASH_BYTES}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(HASH_BYTES)
        .map(|c| {
            let mut buf = [0u8; HASH_BYTES];
            buf.copy_from_slice(c);
            Hash(buf)
        })
        .collect())
}

fn encode_refcount(count: u32) -> Result<Vec<u8>> {
    if count > u16::MAX as u32 {
        return Err(StoreError::InvalidRefcount(count));
    }
    Ok((count as u16).to_be_bytes().to_vec())
}

fn decode_refcount(bytes: &[u8]) -> Result<u32> {
    if bytes.len() != 2 {
        return Err(StoreError::InvalidRefcount(bytes.len() as u32));
    }
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as u32)
}

/// Rejects refs that can never be legitimate chunk hashes. Chunk hashers are
/// injected by the caller in a full deployment; this default implementation
/// only rejects the reserved [`Hash::EMPTY`] sentinel, matching §4.1's
/// `assert_valid_hash` predicate.
pub fn default_assert_valid_hash(h: &Hash) -> bool {
    !h.is_empty()
}

/// A factory for read/write handles into a backing KV store. Implemented by
/// [`crate::kv::MemoryKv`]; any transactional, byte-ordered KV backend with
/// strict serializable isolation can implement this.
pub trait Backend: Clone {
    /// The read-handle type this backend produces.
    type Read: KvRead;
    /// The write-handle type this backend produces.
    type Write: KvWrite;
    /// Acquire a read snapshot.
    fn read(&self) -> Self::Read;
    /// Acquire the (sole) write handle, blocking until prior writers/readers
    /// release per §5's RW lock discipline.
    fn write(&self) -> Self::Write;
}

impl Backend for crate::kv::MemoryKv {
    type Read = crate::kv::MemoryKvRead;
    type Write = crate::kv::MemoryKvWrite;

    fn read(&self) -> Self::Read {
        self.read()
    }

    fn write(&self) -> Self::Write {
        self.write()
    }
}

/// The chunk graph store: chunks, heads, and refcount GC over a `B`-backed
/// KV store.
#[derive(Clone)]
pub struct DagStore<B: Backend> {
    backend: B,
    assert_valid_hash: fn(&Hash) -> bool,
}

impl<B: Backend> DagStore<B> {
    /// A store over `backend`, using the default ref-validity predicate
    /// ([`default_assert_valid_hash`]).
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            assert_valid_hash: default_assert_valid_hash,
        }
    }

    /// A store over `backend` with a custom ref-validity predicate.
    pub fn with_validator(backend: B, assert_valid_hash: fn(&Hash) -> bool) -> Self {
        Self {
            backend,
            assert_valid_hash,
        }
    }

    /// Open a read transaction. Many may be outstanding concurrently.
    pub fn read(&self) -> DagReadTxn<B::Read> {
        DagReadTxn { kv: self.backend.read() }
    }

    /// Open the (sole) write transaction.
    pub fn write(&self) -> DagWriteTxn<B::Write> {
        DagWriteTxn {
            kv: self.backend.write(),
            head_changes: HashMap::new(),
            put_chunks: HashMap::new(),
            assert_valid_hash: self.assert_valid_hash,
        }
    }

    /// GC-pin `h`: record it under a reserved head name so the commit
    /// refcount pass treats it as reachable even though no application head
    /// points at it yet (§4.6 refresh step 1a). Idempotent; safe to call
    /// even when `h` is already pinned.
    pub fn pin(&self, h: &Hash) -> Result<()> {
        let mut w = self.write();
        w.set_head(&pin_head_name(h), h.clone());
        w.commit()
    }

    /// Release a pin recorded by [`DagStore::pin`] (§4.6 step 2, "unpin
    /// refresh hashes on the source side after success"). A no-op if `h`
    /// was not pinned.
    pub fn unpin(&self, h: &Hash) -> Result<()> {
        let mut w = self.write();
        w.remove_head(&pin_head_name(h));
        w.commit()
    }
}

/// A read-only DAG transaction.
pub struct DagReadTxn<R: KvRead> {
    kv: R,
}

impl<R: KvRead> DagReadTxn<R> {
    /// Fetch the chunk at `h`, or `None` if absent from the store.
    pub fn get_chunk(&self, h: &Hash) -> Option<Chunk> {
        let data = self.kv.get(&chunk_data_key(h))?;
        let refs = match self.kv.get(&chunk_refs_key(h)) {
            Some(bytes) => decode_refs(&bytes).ok()?,
            None => Vec::new(),
        };
        Some(Chunk::from_parts(h.clone(), data, refs))
    }

    /// True iff `h` names a chunk present in the store.
    pub fn has_chunk(&self, h: &Hash) -> bool {
        self.kv.has(&chunk_data_key(h))
    }

    /// Fetch the chunk at `h`, failing with [`StoreError::ChunkNotFound`] if
    /// absent. Used throughout the B-tree reader, where a missing chunk
    /// indicates corruption rather than an expected absence.
    pub fn must_get_chunk(&self, h: &Hash) -> Result<Chunk> {
        self.get_chunk(h)
            .ok_or_else(|| StoreError::ChunkNotFound(h.clone()))
    }

    /// The hash a named head currently points to, if any.
    pub fn get_head(&self, name: &str) -> Option<Hash> {
        let bytes = self.kv.get(&head_key(name))?;
        decode_head(&bytes)
    }

    /// Release the read lock early, before the handle is dropped.
    pub fn release(self) {
        Box::new(self.kv).release();
    }
}

/// A write DAG transaction. Buffers head changes and newly-put chunks until
/// [`DagWriteTxn::commit`] runs the refcount GC pass.
pub struct DagWriteTxn<W: KvWrite> {
    kv: W,
    /// name -> (original hash before this txn, current pending hash)
    head_changes: HashMap<String, (Option<Hash>, Option<Hash>)>,
    /// Chunks created or re-put during this transaction, by hash.
    put_chunks: HashMap<Hash, Chunk>,
    assert_valid_hash: fn(&Hash) -> bool,
}

impl<W: KvWrite> DagWriteTxn<W> {
    /// See [`DagReadTxn::get_chunk`]. Observes this transaction's own
    /// pending writes (read-your-writes, §5).
    pub fn get_chunk(&self, h: &Hash) -> Option<Chunk> {
        if let Some(c) = self.put_chunks.get(h) {
            return Some(c.clone());
        }
        let data = self.kv.get(&chunk_data_key(h))?;
        let refs = match self.kv.get(&chunk_refs_key(h)) {
            Some(bytes) => decode_refs(&bytes).ok()?,
            None => Vec::new(),
        };
        Some(Chunk::from_parts(h.clone(), data, refs))
    }

    /// See [`DagReadTxn::has_chunk`].
    pub fn has_chunk(&self, h: &Hash) -> bool {
        self.put_chunks.contains_key(h) || self.kv.has(&chunk_data_key(h))
    }

    /// See [`DagReadTxn::must_get_chunk`].
    pub fn must_get_chunk(&self, h: &Hash) -> Result<Chunk> {
        self.get_chunk(h)
            .ok_or_else(|| StoreError::ChunkNotFound(h.clone()))
    }

    /// See [`DagReadTxn::get_head`]. Observes this transaction's own
    /// pending head changes.
    pub fn get_head(&self, name: &str) -> Option<Hash> {
        if let Some((_, new)) = self.head_changes.get(name) {
            return new.clone();
        }
        let bytes = self.kv.get(&head_key(name))?;
        decode_head(&bytes)
    }

    /// Create a new chunk from `data`/`refs`, assigning it a hash, and stage
    /// it for insertion. Rejects self-references and refs failing the
    /// injected validity predicate.
    pub fn create_chunk(&mut self, data: Vec<u8>, refs: Vec<Hash>) -> Result<Chunk> {
        for r in &refs {
            if !(self.assert_valid_hash)(r) {
                return Err(StoreError::InvalidHash(format!("{r:?}")));
            }
        }
        let chunk = Chunk::new(data, refs)?;
        self.put_chunk_inner(chunk.clone());
        Ok(chunk)
    }

    /// Insert an already-constructed chunk (e.g. migrated in from the lazy
    /// store). Does not re-validate refs; callers are expected to have
    /// validated at construction time.
    pub fn put_chunk(&mut self, chunk: Chunk) {
        self.put_chunk_inner(chunk);
    }

    fn put_chunk_inner(&mut self, chunk: Chunk) {
        let hash = chunk.hash().clone();
        self.kv.put(chunk_data_key(&hash), chunk.data().to_vec());
        if !chunk.refs().is_empty() {
            self.kv.put(chunk_refs_key(&hash), encode_refs(chunk.refs()));
        }
        self.put_chunks.insert(hash, chunk);
    }

    /// Point head `name` at `h`, recording the change for the refcount pass
    /// at commit.
    pub fn set_head(&mut self, name: &str, h: Hash) {
        let original = self.original_head(name);
        self.head_changes
            .entry(name.to_string())
            .or_insert((original, None))
            .1 = Some(h);
    }

    /// Remove head `name`, decrementing its former target at commit.
    pub fn remove_head(&mut self, name: &str) {
        let original = self.original_head(name);
        self.head_changes
            .entry(name.to_string())
            .or_insert((original, None))
            .1 = None;
    }

    fn original_head(&self, name: &str) -> Option<Hash> {
        if let Some((orig, _)) = self.head_changes.get(name) {
            return orig.clone();
        }
        self.kv.get(&head_key(name)).and_then(|bytes| decode_head(&bytes))
    }

    /// Run the refcount GC pass (§4.1 step 2-4) and flush to the KV.
    pub fn commit(mut self) -> Result<()> {
        let span = tracing::debug_span!("dag_commit", heads = self.head_changes.len(), puts = self.put_chunks.len());
        let _enter = span.enter();

        let mut pass = RefcountPass {
            kv: &self.kv,
            put_chunks: &self.put_chunks,
            pending: HashMap::new(),
        };
        for (old, new) in self.head_changes.values() {
            if old == new {
                continue;
            }
            if let Some(h) = old {
                pass.decrement(h)?;
            }
            if let Some(h) = new {
                pass.increment(h)?;
            }
        }
        // §4.1 step 2: the pass starts from head deltas *and newly-put
        // chunks*. A chunk put this transaction but never reached by a head
        // delta (e.g. not yet wired into any referenced tree) must still be
        // evaluated so it's collected rather than leaked.
        for h in self.put_chunks.keys() {
            pass.touch(h)?;
        }
        let pending = pass.pending;

        for (h, count) in &pending {
            if *count == 0 {
                self.kv.del(&chunk_data_key(h));
                self.kv.del(&chunk_refs_key(h));
                self.kv.del(&chunk_refcount_key(h));
                tracing::trace!(hash = ?h, "gc_collect");
            } else {
                self.kv.put(chunk_refcount_key(h), encode_refcount(*count)?);
            }
        }

        for (name, (_, new)) in self.head_changes {
            match new {
                Some(h) => self.kv.put(head_key(&name), encode_head(&h)),
                None => self.kv.del(&head_key(&name)),
            }
        }

        Box::new(self.kv).commit().map_err(StoreError::from)
    }

    /// Abandon the transaction without writing anything.
    pub fn release(self) {
        Box::new(self.kv).release();
    }
}

/// Scratch state for one commit's refcount pass. `pending` accumulates the
/// *final* new refcount for every hash touched by this commit; hashes not
/// in `pending` are untouched and keep whatever the KV already has.
struct RefcountPass<'a, W: KvWrite> {
    kv: &'a W,
    put_chunks: &'a HashMap<Hash, Chunk>,
    pending: HashMap<Hash, u32>,
}

impl<'a, W: KvWrite> RefcountPass<'a, W> {
    fn current_rc(&self, h: &Hash) -> Result<u32> {
        if let Some(rc) = self.pending.get(h) {
            return Ok(*rc);
        }
        match self.kv.get(&chunk_refcount_key(h)) {
            Some(bytes) => decode_refcount(&bytes),
            None => Ok(0),
        }
    }

    /// Ensure `h` has a baseline entry in `pending` without altering its
    /// count or cascading, so it participates in the commit's keep/delete
    /// decision even when nothing incremented or decremented it this pass.
    fn touch(&mut self, h: &Hash) -> Result<()> {
        if !self.pending.contains_key(h) {
            let rc = self.current_rc(h)?;
            self.pending.insert(h.clone(), rc);
        }
        Ok(())
    }

    fn refs_of(&self, h: &Hash) -> Result<Vec<Hash>> {
        if let Some(c) = self.put_chunks.get(h) {
            return Ok(c.refs().to_vec());
        }
        match self.kv.get(&chunk_refs_key(h)) {
            Some(bytes) => decode_refs(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Increment `h`'s refcount. If this is the transition from unreachable
    /// (0) to reachable, cascade the increment through `h`'s own refs —
    /// they were not counted while `h` itself was dead.
    fn increment(&mut self, h: &Hash) -> Result<()> {
        let rc = self.current_rc(h)?;
        self.pending.insert(h.clone(), rc + 1);
        if rc == 0 {
            for child in self.refs_of(h)? {
                self.increment(&child)?;
            }
        }
        Ok(())
    }

    /// Decrement `h`'s refcount. If this drops it to 0, cascade the
    /// decrement through its refs — they're no longer reachable through
    /// `h`, though they may still be reachable some other way (handled by
    /// the same recursive accounting).
    fn decrement(&mut self, h: &Hash) -> Result<()> {
        let rc = self.current_rc(h)?;
        let new_rc = rc.saturating_sub(1);
        self.pending.insert(h.clone(), new_rc);
        if new_rc == 0 {
            for child in self.refs_of(h)? {
                self.decrement(&child)?;
            }
        }
        Ok(())
    }
}
