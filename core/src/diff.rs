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

//! Structural diff between two B-tree roots (C6).
//!
//! Two lazy cursors, one per tree, each a stack of `(node, next entry
//! index)` frames resolved one level at a time — the same shape as
//! `btree::read`'s scan stack, except a frame here is pushed only when the
//! merge actually needs to look inside it. At each step the two cursors'
//! current frontier entries are compared by key: equal keys with equal
//! child hashes mean the whole subtree is byte-identical by content
//! addressing (I6), so it's skipped unread; equal keys with differing
//! hashes (or mismatched leaf/internal shapes) descend both sides one
//! level for a finer comparison; unequal keys descend whichever side is
//! still an unresolved subtree, since its range may yet overlap the
//! other's, or — once the larger side is a bare leaf key, settling the
//! question outright — resolve the smaller side's whole candidate as a
//! bulk insert/remove. This stays correct when the two trees were
//! partitioned differently (independent builds, unrelated to either root),
//! unlike a merge keyed on matching high-keys alone, which only holds up
//! when both sides happen to share partition boundaries.

use crate::btree::{ChunkSource, scan};
use crate::error::Result;
use crate::hash::Hash;
use crate::btree::node::{Entry, EntryPayload, Node, decode_node};

/// One change between an old and a new tree, in ascending key order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffOp {
    /// `key` is present in the new tree but not the old.
    Inserted {
        /// The inserted key.
        key: String,
        /// Its value in the new tree.
        value: Vec<u8>,
    },
    /// `key` is present in both trees with differing values.
    Updated {
        /// The changed key.
        key: String,
        /// Its value in the old tree.
        old_value: Vec<u8>,
        /// Its value in the new tree.
        new_value: Vec<u8>,
    },
    /// `key` was present in the old tree but not the new.
    Removed {
        /// The removed key.
        key: String,
        /// Its value in the old tree.
        old_value: Vec<u8>,
    },
}

impl DiffOp {
    /// The key this op concerns.
    pub fn key(&self) -> &str {
        match self {
            DiffOp::Inserted { key, .. } => key,
            DiffOp::Updated { key, .. } => key,
            DiffOp::Removed { key, .. } => key,
        }
    }
}

/// Diff `old_root` against `new_root`, returning every changed key in
/// ascending order. Two roots with an equal hash are known identical
/// without reading either tree (§4.5's root-equality short-circuit).
pub fn diff<S: ChunkSource>(
    source: &mut S,
    old_root: &Hash,
    new_root: &Hash,
) -> Result<Vec<DiffOp>> {
    let mut ops = Vec::new();
    diff_subtrees(source, old_root, new_root, &mut ops)?;
    Ok(ops)
}

fn load<S: ChunkSource>(source: &mut S, h: &Hash) -> Result<Node> {
    let chunk = source.must_get_chunk(h)?;
    decode_node(chunk.data())
}

fn diff_subtrees<S: ChunkSource>(
    source: &mut S,
    old_h: &Hash,
    new_h: &Hash,
    ops: &mut Vec<DiffOp>,
) -> Result<()> {
    if old_h == new_h {
        return Ok(());
    }
    let mut old = Cursor::new(source, old_h)?;
    let mut new = Cursor::new(source, new_h)?;
    merge(source, &mut old, &mut new, ops)
}

/// One frame of a diff cursor's stack: a node together with the index of
/// the next entry to consider. Unlike `btree::read`'s `ScanIter`, a frame
/// is pushed only when `descend` is called — the cursor never auto-resolves
/// down to a leaf, so the merge can compare at whatever level both sides
/// currently agree to look.
struct Frame {
    node: Node,
    next: usize,
}

/// A resumable position in one tree's in-order entry sequence, advanced one
/// step at a time by the merge below.
struct Cursor {
    stack: Vec<Frame>,
}

impl Cursor {
    fn new<S: ChunkSource>(source: &mut S, root: &Hash) -> Result<Self> {
        let mut stack = Vec::new();
        if !root.is_empty() {
            stack.push(Frame {
                node: load(source, root)?,
                next: 0,
            });
        }
        Ok(Cursor { stack })
    }

    /// Drop frames whose entries are fully consumed, exposing the parent's
    /// next pending sibling.
    fn settle(&mut self) {
        while let Some(top) = self.stack.last() {
            if top.next >= top.node.entries.len() {
                self.stack.pop();
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<&Entry> {
        self.stack.last().map(|f| &f.node.entries[f.next])
    }

    /// Consume the current entry at this level without looking inside it.
    fn advance(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.next += 1;
        }
    }

    /// Consume the current entry at this level and push its child frame.
    fn descend<S: ChunkSource>(&mut self, source: &mut S) -> Result<()> {
        let top = self.stack.last_mut().expect("descend with no current entry");
        let child = child_hash(&top.node.entries[top.next]);
        top.next += 1;
        self.stack.push(Frame {
            node: load(source, &child)?,
            next: 0,
        });
        Ok(())
    }
}

fn merge<S: ChunkSource>(
    source: &mut S,
    old: &mut Cursor,
    new: &mut Cursor,
    ops: &mut Vec<DiffOp>,
) -> Result<()> {
    loop {
        old.settle();
        new.settle();
        let (oe, ne) = match (old.peek(), new.peek()) {
            (None, None) => return Ok(()),
            (None, Some(_)) => return drain(source, new, ops, Side::New),
            (Some(_), None) => return drain(source, old, ops, Side::Old),
            (Some(oe), Some(ne)) => (oe.clone(), ne.clone()),
        };

        match oe.key.cmp(&ne.key) {
            std::cmp::Ordering::Equal => match (&oe.payload, &ne.payload) {
                (EntryPayload::Leaf(ov), EntryPayload::Leaf(nv)) => {
                    if ov != nv {
                        ops.push(DiffOp::Updated {
                            key: oe.key,
                            old_value: ov.clone(),
                            new_value: nv.clone(),
                        });
                    }
                    old.advance();
                    new.advance();
                }
                (EntryPayload::Internal(oh), EntryPayload::Internal(nh)) => {
                    if oh == nh {
                        old.advance();
                        new.advance();
                    } else {
                        old.descend(source)?;
                        new.descend(source)?;
                    }
                }
                (EntryPayload::Leaf(_), EntryPayload::Internal(_)) => new.descend(source)?,
                (EntryPayload::Internal(_), EntryPayload::Leaf(_)) => old.descend(source)?,
            },
            std::cmp::Ordering::Less => {
                resolve_disjoint(source, old, &oe, new, &ne, ops, Side::Old)?
            }
            std::cmp::Ordering::Greater => {
                resolve_disjoint(source, new, &ne, old, &oe, ops, Side::New)?
            }
        }
    }
}

/// Handle a merge step where `smaller`'s current entry sorts strictly
/// before `larger`'s. If `larger`'s entry is an exact leaf key, it bounds
/// nothing above it, so `smaller`'s whole candidate (a single key, or an
/// entire subtree by I2) has no counterpart and can be resolved wholesale.
/// Otherwise `larger` is still an unread subtree that may yet contain keys
/// overlapping `smaller`'s candidate, so refine: descend whichever side is
/// itself a subtree to expose a finer comparison next step.
fn resolve_disjoint<S: ChunkSource>(
    source: &mut S,
    smaller: &mut Cursor,
    smaller_entry: &Entry,
    larger: &mut Cursor,
    larger_entry: &Entry,
    ops: &mut Vec<DiffOp>,
    smaller_side: Side,
) -> Result<()> {
    match &larger_entry.payload {
        EntryPayload::Leaf(_) => emit_whole(source, smaller, smaller_entry, ops, smaller_side),
        EntryPayload::Internal(_) => match &smaller_entry.payload {
            EntryPayload::Internal(_) => smaller.descend(source),
            EntryPayload::Leaf(_) => larger.descend(source),
        },
    }
}

fn child_hash(entry: &Entry) -> Hash {
    match &entry.payload {
        EntryPayload::Internal(h) => h.clone(),
        EntryPayload::Leaf(_) => unreachable!("internal node holding a leaf payload"),
    }
}

#[derive(Clone, Copy)]
enum Side {
    Old,
    New,
}

/// Emit `entry` as a whole insert/removal — a single op for a leaf, or
/// every leaf under it (via `scan_as`) for an untouched subtree — and
/// consume it on `cursor`.
fn emit_whole<S: ChunkSource>(
    source: &mut S,
    cursor: &mut Cursor,
    entry: &Entry,
    ops: &mut Vec<DiffOp>,
    side: Side,
) -> Result<()> {
    match &entry.payload {
        EntryPayload::Leaf(v) => {
            ops.push(match side {
                Side::Old => DiffOp::Removed {
                    key: entry.key.clone(),
                    old_value: v.clone(),
                },
                Side::New => DiffOp::Inserted {
                    key: entry.key.clone(),
                    value: v.clone(),
                },
            });
        }
        EntryPayload::Internal(h) => scan_as(source, h, ops, side)?,
    }
    cursor.advance();
    Ok(())
}

/// Emit every leaf under `root` as a whole-subtree insert or removal.
fn scan_as<S: ChunkSource>(source: &mut S, root: &Hash, ops: &mut Vec<DiffOp>, side: Side) -> Result<()> {
    let mut iter = scan(source, root, "")?;
    while let Some((key, value)) = iter.next_entry()? {
        ops.push(match side {
            Side::Old => DiffOp::Removed { key, old_value: value },
            Side::New => DiffOp::Inserted { key, value },
        });
    }
    Ok(())
}

/// Drain every remaining entry on `cursor` (the other side having already
/// been exhausted) as whole insert/removals.
fn drain<S: ChunkSource>(
    source: &mut S,
    cursor: &mut Cursor,
    ops: &mut Vec<DiffOp>,
    side: Side,
) -> Result<()> {
    loop {
        cursor.settle();
        let Some(entry) = cursor.peek().cloned() else {
            return Ok(());
        };
        emit_whole(source, cursor, &entry, ops, side)?;
    }
}
