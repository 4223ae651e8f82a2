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

#![deny(unreachable_pub)]
#![deny(missing_docs)]
//! A persistent, content-addressed B-tree over a two-tier chunk graph
//! store, with reference-counted garbage collection and an LRU-bounded
//! lazy cache.
//!
//! The four subsystems, leaves first:
//!
//! - [`kv`] + [`dag`]: the backing chunk graph (DAG) store — chunks, heads,
//!   and refcount GC layered over a transactional KV backend.
//! - [`lazy`]: an in-memory overlay caching a bounded subset of chunks
//!   lazily loaded from a [`dag::DagStore`], plus a separate memory-only
//!   tier for not-yet-persisted chunks.
//! - [`btree`]: a copy-on-write B-tree whose nodes are chunks in either
//!   tier, with a byte-size-aware split/merge policy and a bulk-insert
//!   fast path.
//! - [`diff`] and [`sync`]: structural diff between two tree roots, and the
//!   persist/refresh protocol moving chunks between the memory and backing
//!   tiers.

pub mod btree;
pub mod chunk;
pub mod dag;
pub mod diff;
pub mod error;
pub mod hash;
pub mod kv;
pub mod lazy;
pub mod sync;

mod cache;

pub use chunk::Chunk;
pub use error::{Result, StoreError};
pub use hash::Hash;
