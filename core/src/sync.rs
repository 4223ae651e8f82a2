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

//! Persist/refresh (C7): moving a [`crate::lazy::LazyStore`]'s memory-tier
//! snapshot into its backing source, and pulling the source's snapshot back
//! into memory.
//!
//! Rebasing in-flight local mutations onto a new head, and any application
//! sync transport, are mutator-replay concerns layered above this crate (see
//! `spec.md`'s out-of-scope list) — `persist`/`refresh` here only move
//! chunks and advance heads; a caller with its own mutation log replays it
//! on top after a successful refresh.

use crate::chunk::Chunk;
use crate::dag::Backend;
use crate::error::Result;
use crate::hash::Hash;
use crate::lazy::LazyStore;
use std::thread;
use std::time::Duration;

/// An opaque, totally-ordered marker of snapshot recency. The sync layer
/// supplies the concrete type (a logical clock, a Lamport tuple, ...); this
/// crate only ever compares cookies with [`Ord`] (§4.6 "cookie comparison").
pub trait SnapshotCookie: Ord + Clone + Send + Sync {}

impl<T: Ord + Clone + Send + Sync> SnapshotCookie for T {}

/// Polled at each stage of persist/refresh; returning `true` aborts cleanly
/// with no partial write (§5 "Cancellation").
pub trait Cancellation {
    /// True if the operation should stop now.
    fn closed(&self) -> bool;
}

impl Cancellation for () {
    fn closed(&self) -> bool {
        false
    }
}

impl<F: Fn() -> bool> Cancellation for F {
    fn closed(&self) -> bool {
        self()
    }
}

/// A named head's hash together with the cookie of the snapshot it points
/// at.
#[derive(Clone, Debug)]
pub struct HeadSnapshot<C> {
    /// The head's current hash.
    pub hash: Hash,
    /// The cookie of the snapshot `hash` denotes.
    pub cookie: C,
}

/// Walk every hash reachable from `root` through a lazy store's own
/// chunks, stopping descent the moment a hash fails `stop_at` (it is still
/// included in the result — only its children are not visited).
fn gather_reachable<B: Backend, C, F>(
    lazy: &LazyStore<B>,
    root: &Hash,
    cancel: &impl Cancellation,
    mut stop_at: F,
) -> Result<Vec<Hash>>
where
    F: FnMut(&Hash) -> bool,
    C: SnapshotCookie,
{
    let mut out = Vec::new();
    if root.is_empty() {
        return Ok(out);
    }
    let mut stack = vec![root.clone()];
    let mut seen = std::collections::HashSet::new();
    let r = lazy.read();
    while let Some(h) = stack.pop() {
        if cancel.closed() {
            break;
        }
        if !seen.insert(h.clone()) {
            continue;
        }
        out.push(h.clone());
        if stop_at(&h) {
            continue;
        }
        if let Some(chunk) = r.get_chunk(&h) {
            for child in chunk.refs() {
                stack.push(child.clone());
            }
        }
    }
    Ok(out)
}

/// Move a memory snapshot into the source (§4.6 "Persist").
///
/// `head_name` names the head on both the lazy store and its source.
/// `new_cookie` is the cookie of the memory snapshot being persisted;
/// `source_cookie` is the cookie currently recorded for the source's head.
/// Returns `true` if the source was actually advanced (as opposed to the
/// no-op "source already at least as new" path).
pub fn persist<B: Backend, C: SnapshotCookie>(
    lazy: &LazyStore<B>,
    head_name: &str,
    new_cookie: &C,
    source_cookie: &C,
    cancel: &impl Cancellation,
) -> Result<bool> {
    let span = tracing::debug_span!("persist", head = head_name);
    let _enter = span.enter();

    if cancel.closed() {
        return Ok(false);
    }

    let memory_head = {
        let r = lazy.read();
        r.get_head(head_name)
    };
    let Some(memory_head) = memory_head else {
        return Ok(false);
    };

    if new_cookie <= source_cookie {
        tracing::trace!("persist: source already at least as new, nothing to do");
        return Ok(false);
    }

    let gathered = gather_reachable::<B, C, _>(lazy, &memory_head, cancel, |h| {
        !lazy.is_memory_only(h)
    })?
    .into_iter()
    .filter(|h| lazy.is_memory_only(h))
    .collect::<Vec<_>>();

    if cancel.closed() {
        return Ok(false);
    }

    let mut chunks = Vec::with_capacity(gathered.len());
    {
        let mut r = lazy.write();
        for h in &gathered {
            if let Some(c) = r.get_chunk(h) {
                chunks.push(c);
            }
        }
        r.release();
    }

    let mut w = lazy.source().write();
    for chunk in chunks {
        w.put_chunk(chunk);
    }
    w.set_head(head_name, memory_head);
    w.commit()?;

    lazy.chunks_persisted(&gathered);
    tracing::debug!(moved = gathered.len(), "persist: complete");
    Ok(true)
}

/// The default pause between gathering source chunks and re-checking the
/// cookie comparison (§4.6 refresh step 1b: "Sleep briefly (implementation
/// chooses ~300 ms) to let any competing pull/push update the memory
/// first").
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Pull the source's latest snapshot into memory (§4.6 "Refresh").
///
/// `byte_budget` bounds how many source bytes are pulled in this call (the
/// spec's example figure is 5 MiB); a refresh that hits the budget still
/// commits what it gathered; the caller re-runs refresh to continue.
/// `settle_delay` is the pause described in [`DEFAULT_SETTLE_DELAY`]; tests
/// pass [`Duration::ZERO`] to stay fast.
/// Returns the diff from the old memory head to the new one, or `None` if
/// refresh aborted (source not newer, or cancelled) without making any
/// change.
pub fn refresh<B: Backend, C: SnapshotCookie>(
    lazy: &LazyStore<B>,
    head_name: &str,
    memory_cookie: &C,
    source_cookie: &C,
    byte_budget: usize,
    settle_delay: Duration,
    cancel: &impl Cancellation,
) -> Result<Option<Vec<crate::diff::DiffOp>>> {
    let span = tracing::debug_span!("refresh", head = head_name);
    let _enter = span.enter();

    if source_cookie <= memory_cookie {
        return Ok(None);
    }

    lazy.with_suspended_evicts_and_deletes(|| {
        if cancel.closed() {
            return Ok(None);
        }

        // §4.6 step 1a: under a source write, gather chunks reachable from
        // the source head not already held locally, and record the head on
        // the refresh-list (GC pin) in the same commit, so a concurrent
        // source write can't collect what we just gathered before we've
        // landed it in memory. The pin survives whether or not the rest of
        // this refresh goes on to complete (step 2 only unpins on success).
        let (source_head, gathered) = {
            let mut w = lazy.source().write();
            let Some(source_head) = w.get_head(head_name) else {
                w.release();
                return Ok(None);
            };

            let mut gathered: Vec<Chunk> = Vec::new();
            let mut budget_used = 0usize;
            let mut stack = vec![source_head.clone()];
            let mut seen = std::collections::HashSet::new();
            while let Some(h) = stack.pop() {
                if cancel.closed() {
                    break;
                }
                if budget_used >= byte_budget {
                    tracing::trace!(budget_used, byte_budget, "refresh: byte budget reached");
                    break;
                }
                if !seen.insert(h.clone()) {
                    continue;
                }
                if lazy.contains_locally(&h) {
                    continue;
                }
                let Some(chunk) = w.get_chunk(&h) else {
                    continue;
                };
                for child in chunk.refs() {
                    stack.push(child.clone());
                }
                budget_used += lazy.chunk_size(&chunk);
                gathered.push(chunk);
            }

            w.set_head(&crate::dag::pin_head_name(&source_head), source_head.clone());
            w.commit()?;
            (source_head, gathered)
        };

        if cancel.closed() {
            tracing::trace!("refresh: cancelled after gather, pin left in place");
            return Ok(None);
        }

        thread::sleep(settle_delay);

        if source_cookie <= memory_cookie {
            return Ok(None);
        }

        let old_head = {
            let r = lazy.read();
            r.get_head(head_name).unwrap_or(Hash::EMPTY)
        };

        {
            let mut w = lazy.write();
            for chunk in gathered {
                w.put_chunk(chunk);
            }
            w.set_head(head_name, source_head.clone());
            w.commit()?;
        }

        // §4.6 step 2: release the pin now that the source head's subtree
        // has safely landed in memory.
        lazy.source().unpin(&source_head)?;

        let mut r = lazy.read();
        let ops = crate::diff::diff(&mut r, &old_head, &source_head)?;
        tracing::debug!(changed = ops.len(), "refresh: complete");
        Ok(Some(ops))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTreeWriter, TreeConfig};
    use crate::dag::DagStore;
    use crate::kv::MemoryKv;

    fn build_tree<B: Backend>(
        lazy: &LazyStore<B>,
        head: &str,
        entries: &[(&str, &str)],
    ) -> Hash {
        let mut w = lazy.write();
        let root = w.get_head(head).unwrap_or(Hash::EMPTY);
        let mut tree = BTreeWriter::new(root, TreeConfig::uniform(2, 4, 1));
        for (k, v) in entries {
            tree.put(&mut w, k, v.as_bytes().to_vec()).unwrap();
        }
        let new_root = tree.flush(&mut w).unwrap();
        w.set_head(head, new_root.clone());
        w.commit().unwrap();
        new_root
    }

    #[test]
    fn persist_moves_memory_only_chunks_to_source_and_advances_head() {
        let lazy = LazyStore::new(DagStore::new(MemoryKv::new()), 1 << 20);
        let root = build_tree(&lazy, "main", &[("a", "1"), ("b", "2")]);

        let moved = persist(&lazy, "main", &1u64, &0u64, &()).unwrap();
        assert!(moved);

        let sr = lazy.source().read();
        assert_eq!(sr.get_head("main"), Some(root));
        assert!(sr.has_chunk(&root));
    }

    #[test]
    fn persist_is_a_no_op_when_source_already_as_new() {
        let lazy = LazyStore::new(DagStore::new(MemoryKv::new()), 1 << 20);
        build_tree(&lazy, "main", &[("a", "1")]);
        let moved = persist(&lazy, "main", &0u64, &5u64, &()).unwrap();
        assert!(!moved);
    }

    #[test]
    fn refresh_pulls_source_head_into_memory_and_reports_diff() {
        let source = DagStore::new(MemoryKv::new());
        let mut w = source.write();
        let mut tree = BTreeWriter::new(Hash::EMPTY, TreeConfig::uniform(2, 4, 1));
        tree.put(&mut w, "x", b"1".to_vec()).unwrap();
        tree.put(&mut w, "y", b"2".to_vec()).unwrap();
        let root = tree.flush(&mut w).unwrap();
        w.set_head("main", root.clone());
        w.commit().unwrap();

        let lazy = LazyStore::new(source, 1 << 20);
        let ops = refresh(&lazy, "main", &0u64, &1u64, 1 << 20, Duration::ZERO, &()).unwrap();
        let ops = ops.expect("refresh should have pulled a new snapshot");
        assert_eq!(ops.len(), 2);

        let r = lazy.read();
        assert_eq!(r.get_head("main"), Some(root));
    }

    #[test]
    fn refresh_is_a_no_op_when_memory_already_as_new() {
        let source = DagStore::new(MemoryKv::new());
        let lazy = LazyStore::new(source, 1 << 20);
        let ops = refresh(&lazy, "main", &5u64, &0u64, 1 << 20, Duration::ZERO, &()).unwrap();
        assert!(ops.is_none());
    }

    #[test]
    fn cancellation_aborts_persist_cleanly() {
        let lazy = LazyStore::new(DagStore::new(MemoryKv::new()), 1 << 20);
        build_tree(&lazy, "main", &[("a", "1")]);
        let moved = persist(&lazy, "main", &1u64, &0u64, &|| true).unwrap();
        assert!(!moved);
        let sr = lazy.source().read();
        assert_eq!(sr.get_head("main"), None);
    }

    #[test]
    fn refresh_cancelled_after_gather_leaves_memory_unchanged_but_pins_source_head() {
        let source = DagStore::new(MemoryKv::new());
        let mut w = source.write();
        let mut tree = BTreeWriter::new(Hash::EMPTY, TreeConfig::uniform(2, 4, 1));
        tree.put(&mut w, "x", b"1".to_vec()).unwrap();
        let root = tree.flush(&mut w).unwrap();
        w.set_head("main", root.clone());
        w.commit().unwrap();

        let lazy = LazyStore::new(source, 1 << 20);
        // Cancel only after the gather+pin commit has had a chance to run
        // (it's checked before the first budget/seen-set iteration and
        // again right after the gather commit; this closure returns false
        // until the count passes a couple of polls, then stays cancelled).
        let polls = std::cell::Cell::new(0u32);
        let cancel = || {
            let n = polls.get() + 1;
            polls.set(n);
            n > 2
        };
        let ops = refresh(&lazy, "main", &0u64, &1u64, 1 << 20, Duration::ZERO, &cancel).unwrap();
        assert!(ops.is_none());

        let r = lazy.read();
        assert_eq!(r.get_head("main"), None, "memory head must be untouched");

        let sr = lazy.source().read();
        assert_eq!(
            sr.get_head(&crate::dag::pin_head_name(&root)),
            Some(root),
            "source head must remain on the refresh-pin list after an aborted refresh"
        );
    }
}
