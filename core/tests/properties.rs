//! Property-based coverage (only built with `--features proptest`, see the
//! `required-features` entry in `Cargo.toml`) for two invariants that are
//! easier to trust from randomized inputs than from a handful of hand-picked
//! cases: partition determinism/size-bounds (I3, I6) and the diff/inverse
//! round trip implied by §4.5's "diff is the inverse of replaying a patch".

mod common;

use common::{assert_tree_invariants, collect_keys};
use dagtree_core::btree::{BTreeWriter, TreeConfig};
use dagtree_core::dag::DagStore;
use dagtree_core::diff::{DiffOp, diff};
use dagtree_core::kv::MemoryKv;
use dagtree_core::Hash;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn key_strategy() -> impl Strategy<Value = String> {
    (0u32..200).prop_map(|n| format!("k{n:04}"))
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(proptest::num::u8::ANY, 0..12)
}

fn entry_map_strategy(max_len: usize) -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    proptest::collection::btree_map(key_strategy(), value_strategy(), 0..max_len)
}

fn build_via_put_many(entries: Vec<(String, Vec<u8>)>) -> (DagStore<MemoryKv>, Hash) {
    let store = DagStore::new(MemoryKv::new());
    let mut w = store.write();
    let mut writer = BTreeWriter::new(Hash::EMPTY, TreeConfig::byte_sized(24, 96));
    writer.put_many(&mut w, entries).unwrap();
    let root = writer.flush(&mut w).unwrap();
    w.commit().unwrap();
    (store, root)
}

proptest! {
    /// Building the same final key set via `put_many`'s bulk fast path, in
    /// two independently shuffled orders, produces a byte-identical root
    /// hash (§4.4's determinism requirement), and the resulting tree obeys
    /// I1-I3 regardless of how it was shuffled going in.
    #[test]
    fn put_many_is_order_independent_and_size_bounded(
        map in entry_map_strategy(60),
        seed_a in proptest::num::u64::ANY,
        seed_b in proptest::num::u64::ANY,
    ) {
        let mut entries: Vec<(String, Vec<u8>)> = map.into_iter().collect();
        if entries.is_empty() {
            return;
        }

        let shuffled_a = deterministic_shuffle(entries.clone(), seed_a);
        let shuffled_b = deterministic_shuffle(std::mem::take(&mut entries), seed_b);

        let (store_a, root_a) = build_via_put_many(shuffled_a);
        let (store_b, root_b) = build_via_put_many(shuffled_b);

        assert_eq!(root_a, root_b);

        let mut r = store_a.read();
        assert_tree_invariants(&r, &root_a, &TreeConfig::byte_sized(24, 96));
        drop(r);
        let mut r = store_b.read();
        assert_tree_invariants(&r, &root_b, &TreeConfig::byte_sized(24, 96));
    }

    /// Diffing `old` against `new` and replaying the *inverse* of every op
    /// onto `new` reconstructs exactly `old`'s key/value set.
    #[test]
    fn diff_inverse_reconstructs_the_old_tree(
        old_map in entry_map_strategy(40),
        new_map in entry_map_strategy(40),
    ) {
        let (store, old_root) = build_via_put_many(old_map.clone().into_iter().collect());
        let mut w = store.write();
        let mut new_writer = BTreeWriter::new(Hash::EMPTY, TreeConfig::byte_sized(24, 96));
        // Feed the batch through `put_many` in sub-batches rather than one call,
        // so this exercises repeated `put_many` invocations on the same writer
        // instead of only ever a single one.
        use itertools::Itertools;
        let iter = new_map.clone().into_iter();
        let chunks = iter.chunks(7);
        for chunk in chunks.into_iter() {
            new_writer.put_many(&mut w, chunk.collect()).unwrap();
        }
        let new_root = new_writer.flush(&mut w).unwrap();

        let ops = diff(&mut w, &old_root, &new_root).unwrap();

        let mut rebuild = BTreeWriter::new(new_root, TreeConfig::byte_sized(24, 96));
        for op in &ops {
            match op {
                DiffOp::Inserted { key, .. } => {
                    rebuild.del(&mut w, key).unwrap();
                }
                DiffOp::Updated { key, old_value, .. } => {
                    rebuild.put(&mut w, key, old_value.clone()).unwrap();
                }
                DiffOp::Removed { key, old_value } => {
                    rebuild.put(&mut w, key, old_value.clone()).unwrap();
                }
            }
        }
        let rebuilt_root = rebuild.flush(&mut w).unwrap();

        let mut rebuilt_entries = Vec::new();
        for key in collect_keys(&mut w, &rebuilt_root) {
            let value = dagtree_core::btree::get(&mut w, &rebuilt_root, &key)
                .unwrap()
                .unwrap();
            rebuilt_entries.push((key, value));
        }
        let expected: Vec<(String, Vec<u8>)> = old_map.into_iter().collect();
        assert_eq!(rebuilt_entries, expected);
    }
}

/// A small Fisher-Yates shuffle seeded deterministically, so a failing case
/// shrinks and replays exactly (proptest's own `Vec` shuffling combinators
/// don't preserve a fixed final key set the way this does).
fn deterministic_shuffle<T>(mut items: Vec<T>, seed: u64) -> Vec<T> {
    let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let n = items.len();
    for i in (1..n).rev() {
        let j = (next() as usize) % (i + 1);
        items.swap(i, j);
    }
    items
}
