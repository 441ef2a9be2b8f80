//! Persistent vantage-point tree over fingerprints.
//!
//! The tree is an arena of [`TreeNode`] rows keyed by `phash_id` and stored in
//! the [`Catalog`]; every link is an id looked up through the catalog, so the
//! structure survives restarts and partial runs. Each node with a radius splits
//! its descendants into an inner sphere (distance <= radius from the node's
//! fingerprint) and an outer shell (distance > radius).
//!
//! Insertion is incremental and only ever appends leaves, so the tree drifts
//! out of balance as a library grows. Inserts that leave an ancestor lopsided
//! queue it for maintenance; [`VpTreeIndex::schedule_maintenance`] later
//! rebuilds those branches with freshly chosen pivots.
//!
//! Search prunes with the triangle inequality. Distances derived from a
//! similarity score only approximate a metric, so a neighbour lying right on a
//! sphere boundary can occasionally be missed. That is accepted: disabling
//! pruning would turn every search into a full scan.

mod insert;
mod pivot;
mod rebuild;
mod search;

pub use insert::InsertOutcome;
pub use pivot::{choose_pivot, MAX_SAMPLE, MAX_VIEWPOINTS};
pub use rebuild::RebuildStats;

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use tracing::{error, info};

use crate::db::{Catalog, NodeView};
use crate::error::Result;
use crate::fingerprint::Metric;
use crate::progress::{CancelToken, Phase, Reporter};

/// Node views kept in memory before the search cache is flushed.
pub const NODE_CACHE_LIMIT: usize = 1_000_000;

/// Branches smaller than this are never queued for rebalancing.
pub const REBALANCE_MIN_POPULATION: u32 = 16;

/// A branch whose smaller side holds less than this share of its larger side
/// is considered unbalanced.
pub const REBALANCE_MIN_RATIO: f64 = 0.5;

/// Unsearched files needed before maintenance is worth running.
pub const MAINTENANCE_BACKLOG: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    pub branches: usize,
    pub nodes: usize,
    pub cancelled: bool,
}

pub struct VpTreeIndex<'a, C: Catalog + ?Sized, M: Metric> {
    catalog: &'a C,
    metric: M,
    nodes: HashMap<i64, NodeView>,
    /// Ids looked up during search that turned out not to be tree nodes
    untreed: HashSet<i64>,
    cache_limit: usize,
    reported_damage: bool,
    rng: StdRng,
}

impl<'a, C, M> VpTreeIndex<'a, C, M>
where
    C: Catalog + ?Sized,
    M: Metric,
{
    pub fn new(catalog: &'a C, metric: M) -> Self {
        Self::with_rng(catalog, metric, StdRng::from_entropy())
    }

    /// Index whose pivot sampling is reproducible.
    pub fn with_seed(catalog: &'a C, metric: M, seed: u64) -> Self {
        Self::with_rng(catalog, metric, StdRng::seed_from_u64(seed))
    }

    fn with_rng(catalog: &'a C, metric: M, rng: StdRng) -> Self {
        Self {
            catalog,
            metric,
            nodes: HashMap::new(),
            untreed: HashSet::new(),
            cache_limit: NODE_CACHE_LIMIT,
            reported_damage: false,
            rng,
        }
    }

    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit;
        self
    }

    pub fn catalog(&self) -> &'a C {
        self.catalog
    }

    pub fn metric(&self) -> &M {
        &self.metric
    }

    /// Number of node views currently held by the search cache.
    pub fn cached_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn forget(&mut self, ids: &[i64]) {
        for id in ids {
            self.nodes.remove(id);
            self.untreed.remove(id);
        }
    }

    fn reset_cache(&mut self) {
        self.nodes.clear();
        self.untreed.clear();
    }

    /// Log tree damage once for the lifetime of this index.
    fn report_damage(&mut self, missing_id: i64) {
        if !self.reported_damage {
            self.reported_damage = true;
            error!(
                missing_id,
                "Search tree is damaged; run with --rebuild-tree to regenerate it"
            );
        }
    }

    /// Whether enough files are waiting to be searched at `distance` to make
    /// rebalancing worthwhile first.
    pub fn maintenance_due(&self, distance: u32) -> Result<bool> {
        let pending = self
            .catalog
            .count_pending_searches(distance, MAINTENANCE_BACKLOG)?;
        Ok(pending >= MAINTENANCE_BACKLOG)
    }

    /// Rebuild queued branches, largest first, until the queue is empty or
    /// the run is cancelled.
    pub fn schedule_maintenance(
        &mut self,
        cancel: &CancelToken,
        reporter: &Reporter,
    ) -> Result<MaintenanceStats> {
        let mut stats = MaintenanceStats::default();
        reporter.started(Phase::Maintenance, Some(self.catalog.maintenance_len()?));

        loop {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let Some(branch_id) = self.catalog.largest_pending_branch()? else {
                // Whatever is left refers to ids that are no longer in the tree
                self.catalog.clear_maintenance()?;
                break;
            };

            let rebuilt = self.rebuild_branch(branch_id)?;
            self.catalog.dequeue_maintenance(&[branch_id])?;
            stats.branches += 1;
            stats.nodes += rebuilt.nodes;
            reporter.progress(Phase::Maintenance, stats.branches as u64);
        }

        if stats.branches > 0 {
            info!(branches = stats.branches, nodes = stats.nodes, "Rebalanced search tree");
        }
        reporter.finished(Phase::Maintenance, stats.cancelled);
        Ok(stats)
    }
}
