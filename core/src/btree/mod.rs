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

//! The persistent copy-on-write B-tree (C4 + C5): nodes are chunks in
//! either [`crate::dag`] or [`crate::lazy`], addressed by hash, with the
//! high-key invariant described in `node`'s docs.

pub mod node;
pub mod read;
pub mod write;

pub use node::{Entry, EntryPayload, Node, NodeFormat, decode_node, encode_node};
pub use read::{ChunkSource, ScanIter, find_leaf, get, has, keys, scan};
pub use write::{BTreeWriter, ChunkSink, TreeConfig};
