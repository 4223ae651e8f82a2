//! Shared fixtures for the integration suite: tree-building and invariant
//! assertions exercised through the crate's public API only, the way an
//! external consumer of `dagtree-core` would.

use dagtree_core::btree::{BTreeWriter, EntryPayload, Node, TreeConfig, decode_node};
use dagtree_core::dag::DagReadTxn;
use dagtree_core::kv::KvRead;
use dagtree_core::Hash;

/// Initializes a test-local tracing subscriber once per process, so
/// `RUST_LOG`-gated output from the crate under test shows up under `cargo
/// test -- --nocapture` without every test paying for its own subscriber.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

/// Applies `entries` to `writer` one at a time (the sequential `put` path,
/// as opposed to `put_many`'s bulk path), flushing at the end.
pub fn put_sequential<X: dagtree_core::btree::ChunkSource + dagtree_core::btree::ChunkSink>(
    source: &mut X,
    config: TreeConfig,
    entries: &[(&str, &str)],
) -> Hash {
    let mut writer = BTreeWriter::new(Hash::EMPTY, config);
    for (k, v) in entries {
        writer.put(source, k, v.as_bytes().to_vec()).unwrap();
    }
    writer.flush(source).unwrap()
}

fn node_size(cfg: &TreeConfig, node: &Node) -> u32 {
    let mut total = cfg.header_size;
    for e in &node.entries {
        total += match &e.payload {
            EntryPayload::Leaf(v) => (cfg.leaf_entry_size)(&e.key, v),
            EntryPayload::Internal(_) => (cfg.internal_entry_size)(&e.key),
        };
    }
    total
}

/// Walks every node reachable from `root` and checks I1 (ascending keys),
/// I2 (an internal entry's key equals its child's maximum key) and I3 (node
/// size within `[min_size, max_size]`, except the root and the
/// singleton-oversize-entry exception). Panics on violation.
pub fn assert_tree_invariants<R: KvRead>(r: &DagReadTxn<R>, root: &Hash, cfg: &TreeConfig) {
    if root.is_empty() {
        return;
    }
    walk(r, root, cfg, true);
}

fn walk<R: KvRead>(r: &DagReadTxn<R>, h: &Hash, cfg: &TreeConfig, is_root: bool) -> String {
    let chunk = r.must_get_chunk(h).expect("reachable chunk must exist");
    let node = decode_node(chunk.data()).expect("reachable chunk must decode as a node");

    // Only the root may be a materialized-but-empty leaf (a tree drained by
    // deletes without reverting to `Hash::EMPTY`, per the "deleted-but-empty
    // root" decision in DESIGN.md); no non-root node may ever be empty.
    if node.entries.is_empty() {
        assert!(is_root, "I3 violated: non-root node has no entries");
        return String::new();
    }

    for w in node.entries.windows(2) {
        assert!(w[0].key < w[1].key, "I1 violated: {} >= {}", w[0].key, w[1].key);
    }

    let size = node_size(cfg, &node);
    let singleton = node.entries.len() == 1;
    if !is_root {
        assert!(
            size >= cfg.min_size || singleton,
            "I3 violated: node size {size} below min {}",
            cfg.min_size
        );
    }
    assert!(
        size <= cfg.max_size || singleton,
        "I3 violated: node size {size} above max {}",
        cfg.max_size
    );

    for e in &node.entries {
        if let EntryPayload::Internal(child_hash) = &e.payload {
            let child_max_key = walk(r, child_hash, cfg, false);
            assert_eq!(
                child_max_key, e.key,
                "I2 violated: high-key {} doesn't match child's max key {child_max_key}",
                e.key
            );
        }
    }

    node.entries.last().expect("a node always has at least one entry").key.clone()
}

/// All keys in ascending order, read back through `dagtree_core::btree::scan`.
pub fn collect_keys<X: dagtree_core::btree::ChunkSource>(source: &mut X, root: &Hash) -> Vec<String> {
    dagtree_core::btree::keys(source, root, "")
        .expect("scan from an existing root must not fail")
        .map(|r| r.expect("chunk reachable from a valid root must load"))
        .collect()
}
