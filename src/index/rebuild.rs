use std::cmp::Ordering;
use std::collections::VecDeque;
use tracing::{debug, info};

use super::pivot::choose_pivot;
use super::VpTreeIndex;
use crate::db::{Catalog, Side, TreeNode};
use crate::error::Result;
use crate::fingerprint::{Fingerprint, Metric};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Nodes in the rebuilt branch
    pub nodes: usize,
    /// Fingerprints dropped because no file maps to them any more
    pub orphans_removed: usize,
}

impl<C, M> VpTreeIndex<'_, C, M>
where
    C: Catalog + ?Sized,
    M: Metric,
{
    /// Throw the tree away and build it again from every mapped fingerprint.
    pub fn rebuild_tree(&mut self) -> Result<RebuildStats> {
        let orphans_removed = self.catalog.prune_orphans()?;
        self.catalog.clear_tree()?;
        self.reset_cache();

        let mut members = self.catalog.mapped_fingerprints()?;
        let nodes = members.len();
        if let Some(pivot) = choose_pivot(&mut members, &self.metric, &mut self.rng) {
            let rows = self.build_branch(None, pivot, members);
            self.catalog.put_nodes(&rows)?;
        }
        self.catalog.clear_maintenance()?;

        info!(nodes, orphans_removed, "Rebuilt search tree");
        Ok(RebuildStats {
            nodes,
            orphans_removed,
        })
    }

    /// Rebuild the branch rooted at `root_id` in place, splicing the new
    /// branch root into the slot the old one occupied. Rebuilding the tree
    /// root rebuilds every node reachable from it.
    pub fn rebuild_branch(&mut self, root_id: i64) -> Result<RebuildStats> {
        let Some((root, _)) = self.catalog.tree_node(root_id)? else {
            self.catalog.dequeue_maintenance(&[root_id])?;
            return Ok(RebuildStats::default());
        };

        let slot = match root.parent_id {
            None => None,
            Some(parent_id) => {
                let side = match self.catalog.tree_node(parent_id)? {
                    Some((parent, _)) if parent.inner_id == Some(root_id) => Some(Side::Inner),
                    Some((parent, _)) if parent.outer_id == Some(root_id) => Some(Side::Outer),
                    _ => None,
                };
                let Some(side) = side else {
                    // Nothing sensible to splice into; only a full rebuild can help
                    self.catalog.clear_maintenance()?;
                    self.report_damage(parent_id);
                    return Ok(RebuildStats::default());
                };
                Some((parent_id, side))
            }
        };

        let ids = self.catalog.branch_ids(root_id)?;
        self.catalog.delete_nodes(&ids)?;
        self.catalog.dequeue_maintenance(&ids)?;
        self.forget(&ids);

        let mapped = self.catalog.mapped_among(&ids)?;
        let (useful, orphans): (Vec<i64>, Vec<i64>) =
            ids.iter().partition(|id| mapped.contains(*id));
        self.catalog.delete_fingerprints(&orphans)?;

        let mut members = self.catalog.fingerprints(&useful)?;
        let population = members.len() as u32;
        let pivot = choose_pivot(&mut members, &self.metric, &mut self.rng);

        if let Some((parent_id, side)) = slot {
            self.catalog
                .set_child(parent_id, side, pivot.as_ref().map(|(id, _)| *id), population)?;
            self.forget(&[parent_id]);
        }
        if let Some(pivot) = pivot {
            let rows = self.build_branch(slot.map(|(parent_id, _)| parent_id), pivot, members);
            self.catalog.put_nodes(&rows)?;
        }

        debug!(
            branch = root_id,
            nodes = population,
            orphans = orphans.len(),
            "Rebuilt branch"
        );
        Ok(RebuildStats {
            nodes: population as usize,
            orphans_removed: orphans.len(),
        })
    }

    /// Lay out a balanced branch under `parent_id`, breadth first. Returns the
    /// node rows; nothing is written.
    fn build_branch(
        &mut self,
        parent_id: Option<i64>,
        pivot: (i64, Fingerprint),
        members: Vec<(i64, Fingerprint)>,
    ) -> Vec<TreeNode> {
        let mut rows = Vec::with_capacity(members.len() + 1);
        let mut work = VecDeque::new();
        work.push_back((parent_id, pivot, members));

        while let Some((parent_id, (id, fingerprint), children)) = work.pop_front() {
            let mut node = TreeNode::leaf(id, parent_id);
            if !children.is_empty() {
                let mut measured: Vec<(u32, (i64, Fingerprint))> = children
                    .into_iter()
                    .map(|child| (self.metric.distance(&fingerprint, &child.1), child))
                    .collect();
                measured.sort_by_key(|(d, _)| *d);
                let median = measured[measured.len() / 2].0;

                let mut inner = Vec::new();
                let mut boundary = Vec::new();
                let mut outer = Vec::new();
                for (d, child) in measured {
                    match d.cmp(&median) {
                        Ordering::Less => inner.push(child),
                        Ordering::Equal => boundary.push(child),
                        Ordering::Greater => outer.push(child),
                    }
                }

                // Everything at the median joins the smaller side. Inner is
                // non-empty whenever it is the larger side, so median >= 1.
                let radius = if inner.len() <= outer.len() {
                    inner.append(&mut boundary);
                    median
                } else {
                    outer.append(&mut boundary);
                    median - 1
                };

                node.radius = Some(radius);
                node.inner_population = inner.len() as u32;
                node.outer_population = outer.len() as u32;
                if let Some(child) = choose_pivot(&mut inner, &self.metric, &mut self.rng) {
                    node.inner_id = Some(child.0);
                    work.push_back((Some(id), child, inner));
                }
                if let Some(child) = choose_pivot(&mut outer, &self.metric, &mut self.rng) {
                    node.outer_id = Some(child.0);
                    work.push_back((Some(id), child, outer));
                }
            }
            rows.push(node);
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::HammingMetric;
    use crate::index::tests::{add, assert_tree_invariants, catalog, fp};

    fn build_line(index: &mut VpTreeIndex<'_, crate::db::SqliteCatalog, HammingMetric>) -> Vec<i64> {
        (0..=16u32)
            .map(|bits| {
                let value: u16 = if bits == 0 { 0 } else { u16::MAX >> (16 - bits) };
                add(index, &format!("b{}", bits), &fp(&value.to_le_bytes()))
            })
            .collect()
    }

    #[test]
    fn test_rebuild_tree_is_balanced() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 8);
        build_line(&mut index);

        let stats = index.rebuild_tree().unwrap();
        assert_eq!(stats.nodes, 17);
        assert_eq!(stats.orphans_removed, 0);
        assert_tree_invariants(&catalog, &HammingMetric);

        let root_id = catalog.root_id().unwrap().unwrap();
        let (root, _) = catalog.tree_node(root_id).unwrap().unwrap();
        assert_eq!(root.population(), 16);
        assert!(root.inner_population.abs_diff(root.outer_population) <= 2);
    }

    #[test]
    fn test_rebuild_tree_drops_removed_files() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 8);
        build_line(&mut index);
        catalog.remove_file("b3").unwrap();
        catalog.remove_file("b9").unwrap();

        let stats = index.rebuild_tree().unwrap();
        assert_eq!(stats.nodes, 15);
        assert_eq!(stats.orphans_removed, 2);
        assert_eq!(catalog.tree_size().unwrap(), 15);
        assert_tree_invariants(&catalog, &HammingMetric);
    }

    #[test]
    fn test_rebuild_outer_branch_splices_into_parent() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 8);
        build_line(&mut index);
        index.rebuild_tree().unwrap();

        let root_id = catalog.root_id().unwrap().unwrap();
        let (root, _) = catalog.tree_node(root_id).unwrap().unwrap();
        let outer_id = root.outer_id.unwrap();

        // Drop one file whose fingerprint lives in the outer branch
        let doomed = catalog.branch_ids(outer_id).unwrap()[0];
        let (_, doomed_file) = catalog.files_with_fingerprints(&[doomed]).unwrap()[0];
        let doomed_hash = catalog.file_hash(doomed_file).unwrap().unwrap();
        catalog.remove_file(&doomed_hash).unwrap();

        let stats = index.rebuild_branch(outer_id).unwrap();
        assert_eq!(stats.orphans_removed, 1);
        assert_eq!(stats.nodes as u32 + 1, root.outer_population);

        let (root_after, _) = catalog.tree_node(root_id).unwrap().unwrap();
        assert_eq!(root_after.inner_id, root.inner_id);
        assert!(root_after.outer_id.is_some());
        assert_eq!(root_after.outer_population as usize, stats.nodes);
        assert!(catalog.fingerprints(&[doomed]).unwrap().is_empty());
        assert_eq!(catalog.tree_size().unwrap(), 16);
        assert_tree_invariants(&catalog, &HammingMetric);
    }

    #[test]
    fn test_rebuild_with_broken_parent_clears_queue() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 8);
        build_line(&mut index);
        index.rebuild_tree().unwrap();

        let root_id = catalog.root_id().unwrap().unwrap();
        let (root, _) = catalog.tree_node(root_id).unwrap().unwrap();
        let (mut child, _) = catalog.tree_node(root.inner_id.unwrap()).unwrap().unwrap();
        child.parent_id = Some(9999);
        catalog.put_nodes(&[child.clone()]).unwrap();
        catalog.enqueue_maintenance(child.phash_id).unwrap();

        let stats = index.rebuild_branch(child.phash_id).unwrap();
        assert_eq!(stats, RebuildStats::default());
        assert_eq!(catalog.maintenance_len().unwrap(), 0);
        assert!(index.reported_damage);
        assert!(catalog.has_node(child.phash_id).unwrap());
    }

    #[test]
    fn test_rebuild_missing_branch_is_dequeued() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 8);
        catalog.enqueue_maintenance(77).unwrap();
        assert_eq!(index.rebuild_branch(77).unwrap(), RebuildStats::default());
        assert_eq!(catalog.maintenance_len().unwrap(), 0);
    }
}
