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

//! Lazy B-tree reads (C4): find-leaf, get, has, scan, keys.
//!
//! `scan`/`keys` are modeled as explicit stack-of-frames iterators rather
//! than generators — there is no coroutine here, just a `Vec<(Node, next
//! child index)>` driven by `Iterator::next` (see `design notes` in
//! `SPEC_FULL.md` on why).

use super::node::{EntryPayload, Node, decode_node};
use crate::chunk::Chunk;
use crate::error::Result;
use crate::hash::Hash;

/// Anything a B-tree read can resolve chunk hashes against: a raw DAG
/// transaction or a lazy-store transaction. Mutable because the lazy
/// store's read path promotes LRU entries as a side effect of fetching.
pub trait ChunkSource {
    /// Resolve `h`, failing with [`crate::error::StoreError::ChunkNotFound`]
    /// if it can't be.
    fn must_get_chunk(&mut self, h: &Hash) -> Result<Chunk>;
}

impl<R: crate::kv::KvRead> ChunkSource for crate::dag::DagReadTxn<R> {
    fn must_get_chunk(&mut self, h: &Hash) -> Result<Chunk> {
        (*self).must_get_chunk(h)
    }
}

impl<W: crate::kv::KvWrite> ChunkSource for crate::dag::DagWriteTxn<W> {
    fn must_get_chunk(&mut self, h: &Hash) -> Result<Chunk> {
        (*self).must_get_chunk(h)
    }
}

impl<B: crate::dag::Backend> ChunkSource for crate::lazy::LazyReadTxn<'_, B> {
    fn must_get_chunk(&mut self, h: &Hash) -> Result<Chunk> {
        (*self).must_get_chunk(h)
    }
}

impl<B: crate::dag::Backend> ChunkSource for crate::lazy::LazyWriteTxn<'_, B> {
    fn must_get_chunk(&mut self, h: &Hash) -> Result<Chunk> {
        self.must_get_chunk(h)
    }
}

fn load_node<S: ChunkSource>(source: &mut S, h: &Hash) -> Result<Node> {
    let chunk = source.must_get_chunk(h)?;
    decode_node(chunk.data())
}

/// The first entry index whose key is `>= key`, or the last index if none
/// (descend into the "last leaf", per §4.3).
fn choose_index(node: &Node, key: &str) -> usize {
    node.entries
        .iter()
        .position(|e| e.key.as_str() >= key)
        .unwrap_or_else(|| node.entries.len().saturating_sub(1))
}

/// Descend from `start` to the leaf that would contain `key`.
pub fn find_leaf<S: ChunkSource>(source: &mut S, start: &Hash, key: &str) -> Result<Node> {
    let mut node = load_node(source, start)?;
    while node.level > 0 {
        if node.entries.is_empty() {
            break;
        }
        let idx = choose_index(&node, key);
        let child = match &node.entries[idx].payload {
            EntryPayload::Internal(h) => h.clone(),
            EntryPayload::Leaf(_) => unreachable!("internal node holding a leaf payload"),
        };
        node = load_node(source, &child)?;
    }
    Ok(node)
}

/// `get(key)`. `root` being [`Hash::EMPTY`] represents the empty tree.
pub fn get<S: ChunkSource>(source: &mut S, root: &Hash, key: &str) -> Result<Option<Vec<u8>>> {
    if root.is_empty() {
        return Ok(None);
    }
    let leaf = find_leaf(source, root, key)?;
    Ok(leaf.entries.into_iter().find(|e| e.key == key).map(
        |e| match e.payload {
            EntryPayload::Leaf(v) => v,
            EntryPayload::Internal(_) => unreachable!("leaf node holding an internal payload"),
        },
    ))
}

/// `has(key)`.
pub fn has<S: ChunkSource>(source: &mut S, root: &Hash, key: &str) -> Result<bool> {
    Ok(get(source, root, key)?.is_some())
}

/// One frame of the scan stack: a node together with the index of the next
/// child (internal) or entry (leaf) to yield.
struct Frame {
    node: Node,
    next: usize,
}

/// An in-order, single-shot, finite traversal of leaf entries starting at
/// the first key `>= from_key` (§4.3 `scan`).
pub struct ScanIter<'s, S: ChunkSource> {
    source: &'s mut S,
    /// Ancestor frames above the current leaf, root at index 0.
    stack: Vec<Frame>,
    done: bool,
}

impl<'s, S: ChunkSource> ScanIter<'s, S> {
    fn new(source: &'s mut S, root: &Hash, from_key: &str) -> Result<Self> {
        if root.is_empty() {
            return Ok(ScanIter {
                source,
                stack: Vec::new(),
                done: true,
            });
        }
        let mut stack = Vec::new();
        let mut node = load_node(source, root)?;
        loop {
            if node.level == 0 {
                let idx = node
                    .entries
                    .iter()
                    .position(|e| e.key.as_str() >= from_key)
                    .unwrap_or(node.entries.len());
                stack.push(Frame { node, next: idx });
                break;
            }
            let idx = choose_index(&node, from_key);
            let child = match &node.entries[idx].payload {
                EntryPayload::Internal(h) => h.clone(),
                EntryPayload::Leaf(_) => unreachable!(),
            };
            stack.push(Frame {
                node,
                next: idx + 1,
            });
            node = load_node(source, &child)?;
        }
        Ok(ScanIter {
            source,
            stack,
            done: false,
        })
    }

    fn advance_to_next_leaf(&mut self) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(false);
            };
            if top.node.level == 0 {
                return Ok(true);
            }
            if top.next >= top.node.entries.len() {
                self.stack.pop();
                continue;
            }
            let child = match &top.node.entries[top.next].payload {
                EntryPayload::Internal(h) => h.clone(),
                EntryPayload::Leaf(_) => unreachable!(),
            };
            top.next += 1;
            let node = load_node(self.source, &child)?;
            self.stack.push(Frame { node, next: 0 });
        }
    }

    /// Pull the next `(key, value)` pair, or `None` at the end of the scan.
    pub fn next_entry(&mut self) -> Result<Option<(String, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if !self.advance_to_next_leaf()? {
                self.done = true;
                return Ok(None);
            }
            let top = self.stack.last_mut().unwrap();
            if top.next < top.node.entries.len() {
                let entry = top.node.entries[top.next].clone();
                top.next += 1;
                let value = match entry.payload {
                    EntryPayload::Leaf(v) => v,
                    EntryPayload::Internal(_) => unreachable!(),
                };
                return Ok(Some((entry.key, value)));
            }
            self.stack.pop();
        }
    }
}

/// Begin a scan over `root` starting at the first key `>= from_key`.
pub fn scan<'s, S: ChunkSource>(
    source: &'s mut S,
    root: &Hash,
    from_key: &str,
) -> Result<ScanIter<'s, S>> {
    ScanIter::new(source, root, from_key)
}

/// Like [`scan`], projecting only keys.
pub fn keys<'s, S: ChunkSource>(
    source: &'s mut S,
    root: &Hash,
    from_key: &str,
) -> Result<impl Iterator<Item = Result<String>> + 's> {
    let mut iter = ScanIter::new(source, root, from_key)?;
    Ok(std::iter::from_fn(move || match iter.next_entry() {
        Ok(Some((k, _))) => Some(Ok(k)),
        Ok(None) => None,
        Err(e) => Some(Err(e)),
    }))
}
