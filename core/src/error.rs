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

//! The error taxonomy shared by every component in this crate.

use crate::hash::Hash;
use thiserror::Error;

/// Errors surfaced at the boundary of this crate.
///
/// Not-found errors (`ChunkNotFound`, `HeadMissing`) are ordinary outcomes a
/// caller should expect and handle; validation errors indicate a
/// programming mistake upstream and abort the enclosing transaction;
/// `Kv` passes storage failures through unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A chunk hash was dereferenced (via `must_get_chunk` or during B-tree
    /// descent) but is absent from both tiers of the store.
    #[error("chunk not found: {0:?}")]
    ChunkNotFound(Hash),

    /// A named head was looked up but has no recorded target.
    #[error("head missing: {0}")]
    HeadMissing(String),

    /// A hash failed the injected `assert_valid_hash` predicate.
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// A refcount read back from the KV fell outside `[0, 65535]`.
    #[error("invalid refcount: {0}")]
    InvalidRefcount(u32),

    /// A chunk listed its own hash among its refs.
    #[error("chunk references itself: {0:?}")]
    SelfReference(Hash),

    /// An error raised by the backing KV store, propagated unchanged.
    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
}

/// Convenient alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
