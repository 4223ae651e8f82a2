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

//! The immutable chunk record, the unit of content-addressed storage.

use crate::hash::Hash;
use std::collections::HashSet;

/// An immutable `(hash, data, refs)` triple.
///
/// `data` is opaque to the DAG layer; the B-tree module is the only thing
/// that interprets it. `refs` never contains the chunk's own hash
/// (self-reference is rejected at construction, see
/// [`crate::dag::DagWriteTxn::create_chunk`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    hash: Hash,
    data: Vec<u8>,
    refs: Vec<Hash>,
}

impl Chunk {
    /// Build a chunk from its already-computed hash. Used when reloading
    /// from the backing KV, where the hash is the record's own key and
    /// trusted rather than recomputed.
    pub(crate) fn from_parts(hash: Hash, data: Vec<u8>, refs: Vec<Hash>) -> Self {
        Chunk { hash, data, refs }
    }

    /// Hash this chunk would have if freshly created from `data`/`refs`.
    /// Rejects a `refs` set containing duplicates or the chunk's own hash.
    pub(crate) fn new(data: Vec<u8>, refs: Vec<Hash>) -> Result<Self, crate::error::StoreError> {
        let mut seen = HashSet::new();
        for r in &refs {
            if !seen.insert(r.clone()) {
                return Err(crate::error::StoreError::InvalidHash(format!(
                    "duplicate ref {r:?}"
                )));
            }
        }
        let hash = crate::hash::hash_chunk(&data, &refs);
        if refs.contains(&hash) {
            return Err(crate::error::StoreError::SelfReference(hash));
        }
        Ok(Chunk { hash, data, refs })
    }

    /// The chunk's content address.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// The opaque payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The set of hashes this chunk refers to.
    pub fn refs(&self) -> &[Hash] {
        &self.refs
    }
}
