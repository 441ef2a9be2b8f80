//! Storage abstraction for the catalog.
//!
//! The VP-tree, ingestion pipeline and scanner only ever talk to a
//! [`Catalog`]; the tree is an arena keyed by `phash_id` that lives entirely
//! behind these operations, so a different storage engine can be dropped in
//! without touching the index.

use std::collections::HashSet;

use super::{CatalogStats, NodeView, QueuedFingerprint, Side, TreeNode};
use crate::error::Result;
use crate::fingerprint::Fingerprint;

pub trait Catalog: Send {
    // === Transactions ===

    /// Open a transaction scope. Scopes do not nest.
    fn begin(&self) -> Result<()>;

    /// Commit the open transaction scope
    fn commit(&self) -> Result<()>;

    /// Roll back the open transaction scope
    fn rollback(&self) -> Result<()>;

    // === Schema ===

    /// Create or migrate the schema. Fails if the catalog is newer than this build.
    fn initialize(&self) -> Result<()>;

    fn schema_version(&self) -> Result<u32>;

    // === Files ===

    /// Surrogate id for a file, created on first sight
    fn add_file(&self, file_hash: &str) -> Result<i64>;

    fn file_id(&self, file_hash: &str) -> Result<Option<i64>>;

    fn file_hash(&self, hash_id: i64) -> Result<Option<String>>;

    /// Forget a file removed from the library, along with its mapping and search state
    fn remove_file(&self, file_hash: &str) -> Result<bool>;

    /// Every file that is mapped to a fingerprint or waiting in the ingest queue
    fn fingerprinted_files(&self) -> Result<HashSet<String>>;

    // === Fingerprints ===

    /// Surrogate id for a fingerprint, created on first sight
    fn add_fingerprint(&self, fingerprint: &Fingerprint) -> Result<i64>;

    fn fingerprint_id(&self, fingerprint: &Fingerprint) -> Result<Option<i64>>;

    fn fingerprints(&self, phash_ids: &[i64]) -> Result<Vec<(i64, Fingerprint)>>;

    fn delete_fingerprints(&self, phash_ids: &[i64]) -> Result<()>;

    // === File -> fingerprint map ===

    /// Point a file at a fingerprint, replacing any previous mapping and
    /// marking the file's neighbourhood as unsearched
    fn associate(&self, hash_id: i64, phash_id: i64) -> Result<()>;

    /// The fingerprint a file is currently mapped to
    fn fingerprint_of_file(&self, hash_id: i64) -> Result<Option<(i64, Fingerprint)>>;

    /// `(phash_id, hash_id)` for every file mapped to one of the fingerprints
    fn files_with_fingerprints(&self, phash_ids: &[i64]) -> Result<Vec<(i64, i64)>>;

    /// The subset of `phash_ids` that at least one file is mapped to
    fn mapped_among(&self, phash_ids: &[i64]) -> Result<HashSet<i64>>;

    /// Every fingerprint that at least one file is mapped to
    fn mapped_fingerprints(&self) -> Result<Vec<(i64, Fingerprint)>>;

    /// Drop mappings whose file is gone and fingerprints no file maps to.
    /// Returns the number of fingerprints removed.
    fn prune_orphans(&self) -> Result<usize>;

    // === VP-tree nodes ===

    /// The node without a parent, if the tree is not empty
    fn root_id(&self) -> Result<Option<i64>>;

    /// A node together with its fingerprint
    fn tree_node(&self, phash_id: i64) -> Result<Option<(TreeNode, Fingerprint)>>;

    /// Search view of every requested node that exists in the tree
    fn node_views(&self, phash_ids: &[i64]) -> Result<Vec<(i64, NodeView)>>;

    fn has_node(&self, phash_id: i64) -> Result<bool>;

    /// Insert or overwrite node rows
    fn put_nodes(&self, nodes: &[TreeNode]) -> Result<()>;

    /// Link `child` under `parent` on the given side. An inner link also sets
    /// the parent's radius if it was a leaf.
    fn link_child(&self, parent_id: i64, side: Side, child_id: i64, radius: u32) -> Result<()>;

    /// Overwrite one child slot and its population
    fn set_child(&self, parent_id: i64, side: Side, child_id: Option<i64>, population: u32) -> Result<()>;

    /// Bump the inner population of every node in `inner` and the outer
    /// population of every node in `outer`
    fn add_populations(&self, inner: &[i64], outer: &[i64]) -> Result<()>;

    /// Ids of the branch rooted at `root_id`, root included
    fn branch_ids(&self, root_id: i64) -> Result<Vec<i64>>;

    fn delete_nodes(&self, phash_ids: &[i64]) -> Result<()>;

    fn clear_tree(&self) -> Result<()>;

    fn tree_size(&self) -> Result<u64>;

    // === Maintenance queue ===

    fn enqueue_maintenance(&self, phash_id: i64) -> Result<()>;

    /// The queued branch with the largest population that is still in the tree
    fn largest_pending_branch(&self) -> Result<Option<i64>>;

    fn maintenance_len(&self) -> Result<u64>;

    fn dequeue_maintenance(&self, phash_ids: &[i64]) -> Result<()>;

    fn clear_maintenance(&self) -> Result<()>;

    // === Search cache ===

    /// Files whose neighbourhood has not been searched out to `distance`
    fn pending_searches(&self, distance: u32) -> Result<Vec<i64>>;

    /// Like [`Catalog::pending_searches`] but stops counting at `limit`
    fn count_pending_searches(&self, distance: u32, limit: usize) -> Result<usize>;

    /// Record that a file has been searched out to `distance`. Never lowers
    /// an existing value.
    fn mark_searched(&self, hash_id: i64, distance: u32) -> Result<()>;

    /// Forget every recorded search distance
    fn clear_search_cache(&self) -> Result<()>;

    // === Ingest queue ===

    fn enqueue_ingest(&self, file_hash: &str, fingerprint: &Fingerprint) -> Result<()>;

    fn next_ingest_batch(&self, limit: usize) -> Result<Vec<QueuedFingerprint>>;

    fn dequeue_ingest(&self, file_hash: &str) -> Result<()>;

    fn ingest_queue_len(&self) -> Result<u64>;

    // === Bulk operations ===

    /// Empty the tree, maintenance queue and search cache, and queue every
    /// mapped fingerprint for re-insertion. Returns the number queued.
    fn clear_search_tree(&self) -> Result<usize>;

    fn stats(&self) -> Result<CatalogStats>;
}
