mod backend;
mod migrate;
mod schema;
mod sqlite;

pub use backend::Catalog;
pub use migrate::{run_migrations, schema_version};
pub use schema::{MIGRATIONS, SCHEMA_VERSION};
pub use sqlite::SqliteCatalog;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// Which child slot of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Inner,
    Outer,
}

/// One row of the VP-tree arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub phash_id: i64,
    pub parent_id: Option<i64>,
    /// `None` for a leaf
    pub radius: Option<u32>,
    pub inner_id: Option<i64>,
    pub inner_population: u32,
    pub outer_id: Option<i64>,
    pub outer_population: u32,
}

impl TreeNode {
    pub fn leaf(phash_id: i64, parent_id: Option<i64>) -> Self {
        Self {
            phash_id,
            parent_id,
            radius: None,
            inner_id: None,
            inner_population: 0,
            outer_id: None,
            outer_population: 0,
        }
    }

    pub fn child(&self, side: Side) -> Option<i64> {
        match side {
            Side::Inner => self.inner_id,
            Side::Outer => self.outer_id,
        }
    }

    pub fn population(&self) -> u32 {
        self.inner_population + self.outer_population
    }
}

/// What search needs to know about a node.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub fingerprint: Fingerprint,
    pub radius: Option<u32>,
    pub inner_id: Option<i64>,
    pub outer_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFingerprint {
    pub file_hash: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogStats {
    pub files: u64,
    pub fingerprints: u64,
    pub tree_nodes: u64,
    pub ingest_queue: u64,
    pub maintenance_queue: u64,
    pub unsearched_files: u64,
    /// On-disk size, `None` for in-memory catalogs
    pub size_bytes: Option<u64>,
}

/// Run `f` inside one transaction scope on `catalog`, committing on success
/// and rolling back on error.
pub fn in_transaction<C, T, F>(catalog: &C, f: F) -> Result<T>
where
    C: Catalog + ?Sized,
    F: FnOnce() -> Result<T>,
{
    catalog.begin()?;
    match f() {
        Ok(value) => {
            catalog.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = catalog.rollback() {
                tracing::error!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}
