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

//! The on-disk B-tree node payload: `(level, entries)`, and its two wire
//! formats (§4.4).
//!
//! This is the immutable, read-side view of a node — the shape returned by
//! decoding a chunk's `data`. The write path (`crate::btree::write`) edits a
//! parallel "pending" representation and only encodes back down to this
//! shape at `flush()`.

use crate::error::{Result, StoreError};
use crate::hash::{HASH_BYTES, Hash};

/// Which wire format a node is encoded with. Readers parse either; a writer
/// emits the version it was constructed with (§4.4 "Format version").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeFormat {
    /// `[key, value]` — no persisted per-entry size.
    A,
    /// `[key, value, size]` — carries the writer's size at persist time.
    B,
}

const TAG_A: u8 = 0xA1;
const TAG_B: u8 = 0xB2;

/// One entry of a node: a leaf `(key, value)` or an internal `(key,
/// child_hash)`, where an internal entry's key is the maximum key under
/// `child`.
///
/// `persisted_size` carries whatever size a version-B writer recorded; it is
/// informational only (useful to test tooling) and never trusted by this
/// crate's own read or write paths — [`crate::btree::write`] always
/// recomputes sizes from the injected size functions when a node is
/// unchained for editing, so a stale or absent on-disk size can't corrupt
/// the live tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The entry's key (or high-key, for an internal entry).
    pub key: String,
    /// The entry's payload.
    pub payload: EntryPayload,
    /// The size recorded on disk, if the node was written in format B.
    pub persisted_size: Option<u32>,
}

/// The two entry shapes, keyed by node level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryPayload {
    /// A level-0 entry's value.
    Leaf(Vec<u8>),
    /// An internal entry's child hash.
    Internal(Hash),
}

/// A decoded node payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// `0` for leaves, `> 0` for internal nodes.
    pub level: u32,
    /// Entries in strictly ascending key order (I1).
    pub entries: Vec<Entry>,
}

impl Node {
    /// True iff this is a leaf node.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| StoreError::InvalidHash("truncated node payload".to_string()))?;
    *pos = end;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_bytes<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *pos + len;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| StoreError::InvalidHash("truncated node payload".to_string()))?;
    *pos = end;
    Ok(slice)
}

/// Encode a node in the given wire format.
pub fn encode_node(node: &Node, format: NodeFormat) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(match format {
        NodeFormat::A => TAG_A,
        NodeFormat::B => TAG_B,
    });
    write_u32(&mut out, node.level);
    write_u32(&mut out, node.entries.len() as u32);
    for entry in &node.entries {
        let key_bytes = entry.key.as_bytes();
        write_u32(&mut out, key_bytes.len() as u32);
        out.extend_from_slice(key_bytes);
        match &entry.payload {
            EntryPayload::Leaf(value) => {
                write_u32(&mut out, value.len() as u32);
                out.extend_from_slice(value);
            }
            EntryPayload::Internal(hash) => {
                out.extend_from_slice(hash.as_bytes());
            }
        }
        if let NodeFormat::B = format {
            write_u32(&mut out, entry.persisted_size.unwrap_or(0));
        }
    }
    out
}

/// Decode a node payload written by either format.
pub fn decode_node(bytes: &[u8]) -> Result<Node> {
    let mut pos = 0usize;
    let tag = *bytes
        .first()
        .ok_or_else(|| StoreError::InvalidHash("empty node payload".to_string()))?;
    pos += 1;
    let format = match tag {
        TAG_A => NodeFormat::A,
        TAG_B => NodeFormat::B,
        other => {
            return Err(StoreError::InvalidHash(format!(
                "unknown node format tag {other:#x}"
            )));
        }
    };
    let level = read_u32(bytes, &mut pos)?;
    let count = read_u32(bytes, &mut pos)? as usize;
    let mut entries = Vec::with_capacity(count);
    let mut prev_key: Option<String> = None;
    for _ in 0..count {
        let key_len = read_u32(bytes, &mut pos)? as usize;
        let key = String::from_utf8(read_bytes(bytes, &mut pos, key_len)?.to_vec())
            .map_err(|_| StoreError::InvalidHash("non-utf8 key in node payload".to_string()))?;
        let payload = if level == 0 {
            let value_len = read_u32(bytes, &mut pos)? as usize;
            EntryPayload::Leaf(read_bytes(bytes, &mut pos, value_len)?.to_vec())
        } else {
            let hash_bytes = read_bytes(bytes, &mut pos, HASH_BYTES)?;
            let mut buf = [0u8; HASH_BYTES];
            buf.copy_from_slice(hash_bytes);
            EntryPayload::Internal(Hash(buf))
        };
        let persisted_size = if let NodeFormat::B = format {
            Some(read_u32(bytes, &mut pos)?)
        } else {
            None
        };
        if let Some(prev) = &prev_key {
            if *prev >= key {
                return Err(StoreError::InvalidHash(
                    "node entries out of ascending key order".to_string(),
                ));
            }
        }
        prev_key = Some(key.clone());
        entries.push(Entry {
            key,
            payload,
            persisted_size,
        });
    }
    Ok(Node { level, entries })
}
