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

//! Content-address hashes.
//!
//! A [`Hash`] is the sole means of chunk identity: equal content implies an
//! equal hash, and the store never compares chunk payloads directly once a
//! hash has been assigned.

use sha2::{Digest, Sha256};
use std::fmt;

/// Number of bytes in a [`Hash`]. Fixed at the width of the default hasher's
/// digest.
pub const HASH_BYTES: usize = 32;

/// An opaque, comparable, printable chunk identifier.
///
/// Ordering is lexicographic over the digest bytes; this is what gives the
/// backing KV's `c/<hash>/*` key family its byte-ordered layout (see
/// [`crate::kv`]).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Hash(pub [u8; HASH_BYTES]);

impl Hash {
    /// The distinguished hash denoting "no tree". Never produced by
    /// [`hash_chunk`] for real content (it would require a length-prefixed
    /// preimage of an all-zero digest).
    pub const EMPTY: Hash = Hash([0u8; HASH_BYTES]);

    /// True iff this is [`Hash::EMPTY`].
    pub fn is_empty(&self) -> bool {
        *self == Hash::EMPTY
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Hashes a chunk's payload together with its (already-hashed) child refs,
/// the way the default hasher is invoked throughout this crate: a
/// length-prefixed payload followed by each ref's raw bytes, in the order
/// given. Two chunks with equal `data` and equal `refs` (as an ordered
/// sequence, since callers are expected to hand refs in a canonical order)
/// always hash to the same value (data model invariant I6).
pub fn hash_chunk(data: &[u8], refs: &[Hash]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update((data.len() as u64).to_le_bytes());
    hasher.update(data);
    for r in refs {
        hasher.update(r.0);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_BYTES];
    out.copy_from_slice(&digest);
    Hash(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_addressing_is_deterministic() {
        let a = hash_chunk(b"hello", &[Hash::EMPTY]);
        let b = hash_chunk(b"hello", &[Hash::EMPTY]);
        assert_eq!(a, b);
    }

    #[test]
    fn differing_refs_change_hash() {
        let a = hash_chunk(b"hello", &[Hash::EMPTY]);
        let b = hash_chunk(b"hello", &[hash_chunk(b"x", &[])]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_hash_is_reserved() {
        assert!(Hash::EMPTY.is_empty());
        assert_eq!(format!("{:?}", Hash::EMPTY), "0".repeat(64));
    }
}
