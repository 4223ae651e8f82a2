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

//! Copy-on-write B-tree mutation (C5): put/del/putMany, the partition
//! algorithm, and flush.
//!
//! A [`BTreeWriter`] holds its own root, edited lazily in a "pending" shape
//! (§4.4's "Node representation while editing") until [`BTreeWriter::flush`]
//! assigns hashes and turns pending nodes into chunks.

use super::node::{EntryPayload, Node, NodeFormat, decode_node, encode_node};
use super::read::ChunkSource;
use crate::chunk::Chunk;
use crate::error::Result;
use crate::hash::Hash;
use std::sync::Arc;

/// Anything a B-tree write can flush chunks into.
pub trait ChunkSink {
    /// Stage a fresh chunk, assigning its hash.
    fn create_chunk(&mut self, data: Vec<u8>, refs: Vec<Hash>) -> Result<Chunk>;
}

impl<W: crate::kv::KvWrite> ChunkSink for crate::dag::DagWriteTxn<W> {
    fn create_chunk(&mut self, data: Vec<u8>, refs: Vec<Hash>) -> Result<Chunk> {
        crate::dag::DagWriteTxn::create_chunk(self, data, refs)
    }
}

impl<B: crate::dag::Backend> ChunkSink for crate::lazy::LazyWriteTxn<'_, B> {
    fn create_chunk(&mut self, data: Vec<u8>, refs: Vec<Hash>) -> Result<Chunk> {
        crate::lazy::LazyWriteTxn::create_chunk(self, data, refs)
    }
}

/// Per-entry and per-node size accounting, injected so the tree treats size
/// as a black box (§3 "Size").
#[derive(Clone)]
pub struct TreeConfig {
    /// Lower bound for a non-root node's total size.
    pub min_size: u32,
    /// Upper bound for any node's total size.
    pub max_size: u32,
    /// Fixed per-node overhead counted toward `min_size`/`max_size`.
    pub header_size: u32,
    /// Size contribution of a level-0 entry given its key and value.
    pub leaf_entry_size: Arc<dyn Fn(&str, &[u8]) -> u32 + Send + Sync>,
    /// Size contribution of an internal entry given its (high) key.
    pub internal_entry_size: Arc<dyn Fn(&str) -> u32 + Send + Sync>,
    /// Wire format new chunks are encoded with.
    pub format: NodeFormat,
}

impl TreeConfig {
    /// A config where every entry, leaf or internal, costs exactly `unit` —
    /// the shape used by spec.md's worked examples (§8 scenarios 1-2).
    pub fn uniform(min_size: u32, max_size: u32, unit: u32) -> Self {
        TreeConfig {
            min_size,
            max_size,
            header_size: 0,
            leaf_entry_size: Arc::new(move |_, _| unit),
            internal_entry_size: Arc::new(move |_| unit),
            format: NodeFormat::B,
        }
    }

    /// A byte-accounting config: a leaf entry costs `key.len() + value.len()`;
    /// an internal entry costs `key.len() + 32` (one hash width).
    pub fn byte_sized(min_size: u32, max_size: u32) -> Self {
        TreeConfig {
            min_size,
            max_size,
            header_size: 8,
            leaf_entry_size: Arc::new(|k, v| (k.len() + v.len()) as u32),
            internal_entry_size: Arc::new(|k| (k.len() + crate::hash::HASH_BYTES) as u32),
            format: NodeFormat::B,
        }
    }

    fn max_entries_budget(&self) -> u32 {
        self.max_size.saturating_sub(self.header_size).max(1)
    }

    fn min_entries_budget(&self) -> u32 {
        self.min_size.saturating_sub(self.header_size)
    }
}

/// A child pointer in the pending tree: either unchanged since the last
/// flush (a hash) or actively being edited (boxed, to bound `ChildRef`'s
/// own size).
#[derive(Clone)]
enum ChildRef {
    Hash(Hash),
    Pending(Box<PendingNode>),
}

#[derive(Clone)]
enum PendingPayload {
    Leaf(Vec<u8>),
    Internal(ChildRef),
}

#[derive(Clone)]
struct PendingEntry {
    key: String,
    size: u32,
    payload: PendingPayload,
}

#[derive(Clone)]
struct PendingNode {
    level: u32,
    entries: Vec<PendingEntry>,
}

fn node_to_pending(node: Node) -> PendingNode {
    let level = node.level;
    let entries = node
        .entries
        .into_iter()
        .map(|e| match e.payload {
            EntryPayload::Leaf(v) => PendingEntry {
                key: e.key,
                size: 0,
                payload: PendingPayload::Leaf(v),
            },
            EntryPayload::Internal(h) => PendingEntry {
                key: e.key,
                size: 0,
                payload: PendingPayload::Internal(ChildRef::Hash(h)),
            },
        })
        .collect();
    PendingNode { level, entries }
}

/// Recompute every entry's size in place from `config`'s injected
/// functions. Sizes carried on disk are never trusted (see
/// `Entry::persisted_size`'s docs); this is run once right after a node is
/// unchained for editing.
fn recompute_sizes(config: &TreeConfig, node: &mut PendingNode) {
    for entry in node.entries.iter_mut() {
        entry.size = match &entry.payload {
            PendingPayload::Leaf(v) => (config.leaf_entry_size)(&entry.key, v),
            PendingPayload::Internal(_) => (config.internal_entry_size)(&entry.key),
        };
    }
}

fn entries_size(entries: &[PendingEntry]) -> u64 {
    entries.iter().map(|e| e.size as u64).sum()
}

fn choose_child_index(node: &PendingNode, key: &str) -> usize {
    node.entries
        .iter()
        .position(|e| e.key.as_str() >= key)
        .unwrap_or_else(|| node.entries.len().saturating_sub(1))
}

/// Deterministic greedy partition of an ordered entry run into size-bounded
/// chunks (§4.4 "Partition algorithm").
fn partition_entries(config: &TreeConfig, entries: Vec<PendingEntry>) -> Vec<Vec<PendingEntry>> {
    if entries.is_empty() {
        return vec![Vec::new()];
    }
    let max = config.max_entries_budget() as u64;
    let min = config.min_entries_budget() as u64;
    let total = entries_size(&entries);
    if total <= max {
        return vec![entries];
    }
    let target_count = total.div_ceil(max).max(1);
    let target = total.div_ceil(target_count);

    let mut chunks: Vec<Vec<PendingEntry>> = Vec::new();
    let mut current: Vec<PendingEntry> = Vec::new();
    let mut current_sum: u64 = 0;

    for entry in entries {
        let size = entry.size as u64;
        if size > max {
            // A singleton over-size run is admissible on its own (I4).
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_sum = 0;
            }
            chunks.push(vec![entry]);
            continue;
        }
        if !current.is_empty() && (current_sum + size > max || current_sum >= target) {
            chunks.push(std::mem::take(&mut current));
            current_sum = 0;
        }
        current_sum += size;
        current.push(entry);
    }
    if !current.is_empty() {
        if current_sum < min {
            if let Some(last) = chunks.last() {
                let prev_sum = entries_size(last);
                if prev_sum + current_sum <= max {
                    chunks.last_mut().unwrap().extend(current);
                } else {
                    chunks.push(current);
                }
            } else {
                chunks.push(current);
            }
        } else {
            chunks.push(current);
        }
    }
    chunks
}

fn take_child_pending<X: ChunkSource>(source: &mut X, entry: &mut PendingEntry) -> Result<Box<PendingNode>> {
    match &mut entry.payload {
        PendingPayload::Internal(child_ref) => {
            let taken = std::mem::replace(child_ref, ChildRef::Hash(Hash::EMPTY));
            match taken {
                ChildRef::Pending(n) => Ok(n),
                ChildRef::Hash(h) => {
                    let chunk = source.must_get_chunk(&h)?;
                    Ok(Box::new(node_to_pending(decode_node(chunk.data())?)))
                }
            }
        }
        PendingPayload::Leaf(_) => unreachable!("take_child_pending called on a leaf entry"),
    }
}

/// Insert (or promote to pending with fresh size) a child back into its
/// parent slot after recursing into it, possibly splitting it into several
/// sibling entries if it overflowed, or dropping it entirely if it's an
/// emptied leaf (del's "empty children are removed from their parent").
fn reinsert_child(config: &TreeConfig, node: &mut PendingNode, idx: usize, mut child: Box<PendingNode>) {
    recompute_sizes(config, &mut child);
    if child.entries.is_empty() {
        node.entries.remove(idx);
        return;
    }
    let total = entries_size(&child.entries);
    if total > config.max_entries_budget() as u64 && child.entries.len() > 1 {
        let level = child.level;
        let siblings = partition_entries(config, child.entries);
        let mut new_entries = Vec::with_capacity(siblings.len());
        for sibling_entries in siblings {
            let key = sibling_entries.last().unwrap().key.clone();
            let size = (config.internal_entry_size)(&key);
            new_entries.push(PendingEntry {
                key,
                size,
                payload: PendingPayload::Internal(ChildRef::Pending(Box::new(PendingNode {
                    level,
                    entries: sibling_entries,
                }))),
            });
        }
        node.entries.splice(idx..=idx, new_entries);
    } else {
        let key = child.entries.last().unwrap().key.clone();
        let size = (config.internal_entry_size)(&key);
        node.entries[idx] = PendingEntry {
            key,
            size,
            payload: PendingPayload::Internal(ChildRef::Pending(child)),
        };
    }
}

fn insert_leaf_entry(config: &TreeConfig, node: &mut PendingNode, key: &str, value: Vec<u8>) {
    let size = (config.leaf_entry_size)(key, &value);
    match node.entries.binary_search_by(|e| e.key.as_str().cmp(key)) {
        Ok(pos) => {
            node.entries[pos] = PendingEntry {
                key: key.to_string(),
                size,
                payload: PendingPayload::Leaf(value),
            };
        }
        Err(pos) => node.entries.insert(
            pos,
            PendingEntry {
                key: key.to_string(),
                size,
                payload: PendingPayload::Leaf(value),
            },
        ),
    }
}

fn put_into<X: ChunkSource>(
    source: &mut X,
    config: &TreeConfig,
    node: &mut PendingNode,
    key: &str,
    value: Vec<u8>,
) -> Result<()> {
    if node.level == 0 {
        insert_leaf_entry(config, node, key, value);
        return Ok(());
    }
    let idx = choose_child_index(node, key);
    let mut child = take_child_pending(source, &mut node.entries[idx])?;
    recompute_sizes(config, &mut child);
    put_into(source, config, &mut child, key, value)?;
    reinsert_child(config, node, idx, child);
    Ok(())
}

fn del_from<X: ChunkSource>(
    source: &mut X,
    config: &TreeConfig,
    node: &mut PendingNode,
    key: &str,
) -> Result<bool> {
    if node.level == 0 {
        return match node.entries.iter().position(|e| e.key == key) {
            Some(pos) => {
                node.entries.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        };
    }
    if node.entries.is_empty() {
        return Ok(false);
    }
    let idx = choose_child_index(node, key);
    let mut child = take_child_pending(source, &mut node.entries[idx])?;
    recompute_sizes(config, &mut child);
    let existed = del_from(source, config, &mut child, key)?;
    if existed {
        reinsert_child(config, node, idx, child);
    } else {
        node.entries[idx].payload = PendingPayload::Internal(ChildRef::Pending(child));
    }
    Ok(existed)
}

fn finish_root<X: ChunkSource>(source: &mut X, config: &TreeConfig, mut root: Box<PendingNode>) -> Result<Box<PendingNode>> {
    loop {
        let total = entries_size(&root.entries);
        if total <= config.max_entries_budget() as u64 || root.entries.len() <= 1 {
            break;
        }
        let level = root.level;
        let siblings = partition_entries(config, root.entries);
        let mut new_entries = Vec::with_capacity(siblings.len());
        for sibling_entries in siblings {
            let key = sibling_entries.last().unwrap().key.clone();
            let size = (config.internal_entry_size)(&key);
            new_entries.push(PendingEntry {
                key,
                size,
                payload: PendingPayload::Internal(ChildRef::Pending(Box::new(PendingNode {
                    level,
                    entries: sibling_entries,
                }))),
            });
        }
        root = Box::new(PendingNode {
            level: level + 1,
            entries: new_entries,
        });
    }
    loop {
        if root.level > 0 && root.entries.len() == 1 {
            let only = root.entries.pop().unwrap();
            match only.payload {
                PendingPayload::Internal(ChildRef::Pending(child)) => {
                    root = child;
                    continue;
                }
                PendingPayload::Internal(ChildRef::Hash(h)) => {
                    let chunk = source.must_get_chunk(&h)?;
                    root = Box::new(node_to_pending(decode_node(chunk.data())?));
                    continue;
                }
                PendingPayload::Leaf(_) => unreachable!("leaf entry at an internal root"),
            }
        }
        break;
    }
    Ok(root)
}

fn flush_node<X: ChunkSink>(child_ref: &mut ChildRef, sink: &mut X, format: NodeFormat) -> Result<Hash> {
    match child_ref {
        ChildRef::Hash(h) => Ok(h.clone()),
        ChildRef::Pending(node) => {
            let mut child_hashes = Vec::new();
            if node.level > 0 {
                for entry in node.entries.iter_mut() {
                    if let PendingPayload::Internal(inner) = &mut entry.payload {
                        child_hashes.push(flush_node(inner, sink, format)?);
                    }
                }
            }
            let on_disk_entries: Vec<super::node::Entry> = node
                .entries
                .iter()
                .map(|e| {
                    let payload = match &e.payload {
                        PendingPayload::Leaf(v) => EntryPayload::Leaf(v.clone()),
                        PendingPayload::Internal(ChildRef::Hash(h)) => EntryPayload::Internal(h.clone()),
                        PendingPayload::Internal(ChildRef::Pending(_)) => {
                            unreachable!("child flushed before its parent is encoded")
                        }
                    };
                    super::node::Entry {
                        key: e.key.clone(),
                        payload,
                        persisted_size: Some(e.size),
                    }
                })
                .collect();
            let data = encode_node(
                &Node {
                    level: node.level,
                    entries: on_disk_entries,
                },
                format,
            );
            let chunk = sink.create_chunk(data, child_hashes)?;
            let hash = chunk.hash().clone();
            *child_ref = ChildRef::Hash(hash.clone());
            Ok(hash)
        }
    }
}

/// A copy-on-write B-tree mutator (C5). Edits accumulate against an
/// in-memory pending tree until [`BTreeWriter::flush`].
pub struct BTreeWriter {
    root: ChildRef,
    config: TreeConfig,
    touched: bool,
}

impl BTreeWriter {
    /// A writer rooted at `root_hash` (pass [`Hash::EMPTY`] for a fresh
    /// tree).
    pub fn new(root_hash: Hash, config: TreeConfig) -> Self {
        BTreeWriter {
            root: ChildRef::Hash(root_hash),
            config,
            touched: false,
        }
    }

    fn take_root_pending<X: ChunkSource>(&mut self, source: &mut X) -> Result<Box<PendingNode>> {
        let current = std::mem::replace(&mut self.root, ChildRef::Hash(Hash::EMPTY));
        let mut pending = match current {
            ChildRef::Pending(n) => n,
            ChildRef::Hash(h) if h.is_empty() => Box::new(PendingNode {
                level: 0,
                entries: Vec::new(),
            }),
            ChildRef::Hash(h) => {
                let chunk = source.must_get_chunk(&h)?;
                Box::new(node_to_pending(decode_node(chunk.data())?))
            }
        };
        recompute_sizes(&self.config, &mut pending);
        Ok(pending)
    }

    /// Insert or replace `key`'s value.
    pub fn put<X: ChunkSource>(&mut self, source: &mut X, key: &str, value: Vec<u8>) -> Result<()> {
        self.touched = true;
        let mut root = self.take_root_pending(source)?;
        put_into(source, &self.config, &mut root, key, value)?;
        self.root = ChildRef::Pending(finish_root(source, &self.config, root)?);
        Ok(())
    }

    /// Remove `key`, returning whether it existed.
    pub fn del<X: ChunkSource>(&mut self, source: &mut X, key: &str) -> Result<bool> {
        if matches!(&self.root, ChildRef::Hash(h) if h.is_empty()) {
            return Ok(false);
        }
        self.touched = true;
        let mut root = self.take_root_pending(source)?;
        let existed = del_from(source, &self.config, &mut root, key)?;
        self.root = ChildRef::Pending(finish_root(source, &self.config, root)?);
        Ok(existed)
    }

    /// Batch insert. Entries need not be sorted; duplicates within the
    /// batch resolve last-write-wins (§4.4, §9 open question).
    pub fn put_many<X: ChunkSource>(
        &mut self,
        source: &mut X,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut by_key: std::collections::HashMap<String, Vec<u8>> = std::collections::HashMap::new();
        for (k, v) in entries {
            by_key.insert(k, v);
        }
        let mut sorted: Vec<(String, Vec<u8>)> = by_key.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let is_fresh_empty_tree =
            !self.touched && matches!(&self.root, ChildRef::Hash(h) if h.is_empty());
        self.touched = true;

        if is_fresh_empty_tree {
            self.root = ChildRef::Pending(Box::new(build_from_sorted(&self.config, sorted)));
            return Ok(());
        }

        for (k, v) in sorted {
            self.put(source, &k, v)?;
        }
        Ok(())
    }

    /// Assign hashes to every pending node and stage them as chunks,
    /// returning the new root hash ([`Hash::EMPTY`] if this writer was
    /// never mutated — §9's "deleted-but-empty root never reverts to
    /// `empty_hash`" only applies once a mutation has actually happened).
    pub fn flush<X: ChunkSink>(&mut self, sink: &mut X) -> Result<Hash> {
        if !self.touched {
            return Ok(Hash::EMPTY);
        }
        flush_node(&mut self.root, sink, self.config.format)
    }

    /// The root hash, if this writer has already been flushed since its
    /// last mutation.
    pub fn flushed_root_hash(&self) -> Option<Hash> {
        match &self.root {
            ChildRef::Hash(h) => Some(h.clone()),
            ChildRef::Pending(_) => None,
        }
    }
}

/// Build a tree bottom-up from an already-sorted, deduplicated run of
/// entries — the fast path from an empty tree (§4.4 `putMany`). Produces
/// byte-identical results for identical inputs and `(min_size, max_size)`,
/// regardless of insertion order of the original (unsorted) batch.
fn build_from_sorted(config: &TreeConfig, sorted: Vec<(String, Vec<u8>)>) -> PendingNode {
    if sorted.is_empty() {
        return PendingNode {
            level: 0,
            entries: Vec::new(),
        };
    }
    let leaf_entries: Vec<PendingEntry> = sorted
        .into_iter()
        .map(|(k, v)| {
            let size = (config.leaf_entry_size)(&k, &v);
            PendingEntry {
                key: k,
                size,
                payload: PendingPayload::Leaf(v),
            }
        })
        .collect();

    let mut level_nodes: Vec<PendingNode> = partition_entries(config, leaf_entries)
        .into_iter()
        .map(|entries| PendingNode { level: 0, entries })
        .collect();

    let mut level = 0u32;
    while level_nodes.len() > 1 {
        level += 1;
        let internal_entries: Vec<PendingEntry> = level_nodes
            .into_iter()
            .map(|node| {
                let key = node.entries.last().unwrap().key.clone();
                let size = (config.internal_entry_size)(&key);
                PendingEntry {
                    key,
                    size,
                    payload: PendingPayload::Internal(ChildRef::Pending(Box::new(node))),
                }
            })
            .collect();
        level_nodes = partition_entries(config, internal_entries)
            .into_iter()
            .map(|entries| PendingNode { level, entries })
            .collect();
    }
    level_nodes.into_iter().next().unwrap()
}
