use std::collections::HashSet;
use tracing::debug;

use super::{VpTreeIndex, REBALANCE_MIN_POPULATION, REBALANCE_MIN_RATIO};
use crate::db::{Catalog, Side, TreeNode};
use crate::error::Result;
use crate::fingerprint::{Fingerprint, Metric};

/// Where an inserted fingerprint ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The tree was empty
    Root,
    /// Linked into an empty child slot of `parent_id`
    Child { parent_id: i64, side: Side },
    /// The descent hit a link to a node that no longer exists. The new leaf
    /// hangs off the missing id until the tree is rebuilt.
    Ghost { parent_id: i64 },
    /// The fingerprint already has a node
    Existing,
}

/// An ancestor on the insertion path with its populations after the insert.
struct PathEntry {
    phash_id: i64,
    inner_population: u32,
    outer_population: u32,
}

impl PathEntry {
    fn is_unbalanced(&self) -> bool {
        let (small, large) = if self.inner_population <= self.outer_population {
            (self.inner_population, self.outer_population)
        } else {
            (self.outer_population, self.inner_population)
        };
        small + large > REBALANCE_MIN_POPULATION && (small as f64 / large as f64) < REBALANCE_MIN_RATIO
    }
}

/// The unbalanced ancestor closest to the new leaf. Rebuilding it also
/// rebuilds everything beneath it.
fn nearest_unbalanced(path: &[PathEntry]) -> Option<i64> {
    path.iter()
        .rev()
        .find(|entry| entry.is_unbalanced())
        .map(|entry| entry.phash_id)
}

impl<C, M> VpTreeIndex<'_, C, M>
where
    C: Catalog + ?Sized,
    M: Metric,
{
    /// Add a fingerprint to the tree as a new leaf.
    pub fn insert(&mut self, phash_id: i64, fingerprint: &Fingerprint) -> Result<InsertOutcome> {
        if self.catalog.has_node(phash_id)? {
            return Ok(InsertOutcome::Existing);
        }

        let Some(root_id) = self.catalog.root_id()? else {
            self.catalog.put_nodes(&[TreeNode::leaf(phash_id, None)])?;
            self.forget(&[phash_id]);
            return Ok(InsertOutcome::Root);
        };

        let mut inner_path = Vec::new();
        let mut outer_path = Vec::new();
        let mut path: Vec<PathEntry> = Vec::new();
        let mut seen = HashSet::new();
        let mut next = root_id;

        let outcome = loop {
            let found = if seen.insert(next) {
                self.catalog.tree_node(next)?
            } else {
                // A cycle is as broken as a dangling link
                None
            };
            let Some((ancestor, ancestor_fingerprint)) = found else {
                self.report_damage(next);
                break InsertOutcome::Ghost { parent_id: next };
            };

            let d = self.metric.distance(fingerprint, &ancestor_fingerprint);
            let side = match ancestor.radius {
                Some(radius) if d > radius => Side::Outer,
                _ => Side::Inner,
            };
            let mut entry = PathEntry {
                phash_id: ancestor.phash_id,
                inner_population: ancestor.inner_population,
                outer_population: ancestor.outer_population,
            };
            match side {
                Side::Inner => {
                    inner_path.push(ancestor.phash_id);
                    entry.inner_population += 1;
                }
                Side::Outer => {
                    outer_path.push(ancestor.phash_id);
                    entry.outer_population += 1;
                }
            }
            path.push(entry);

            match ancestor.child(side) {
                Some(child) => next = child,
                None => {
                    self.catalog.link_child(ancestor.phash_id, side, phash_id, d)?;
                    break InsertOutcome::Child {
                        parent_id: ancestor.phash_id,
                        side,
                    };
                }
            }
        };

        self.catalog.add_populations(&inner_path, &outer_path)?;
        if let Some(unbalanced) = nearest_unbalanced(&path) {
            debug!(branch = unbalanced, "Queued unbalanced branch for maintenance");
            self.catalog.enqueue_maintenance(unbalanced)?;
        }

        let parent_id = match outcome {
            InsertOutcome::Child { parent_id, .. } | InsertOutcome::Ghost { parent_id } => parent_id,
            InsertOutcome::Root | InsertOutcome::Existing => root_id,
        };
        self.catalog
            .put_nodes(&[TreeNode::leaf(phash_id, Some(parent_id))])?;
        self.forget(&[parent_id, phash_id]);

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::HammingMetric;
    use crate::index::tests::{add, catalog, fp};

    fn entry(phash_id: i64, inner: u32, outer: u32) -> PathEntry {
        PathEntry {
            phash_id,
            inner_population: inner,
            outer_population: outer,
        }
    }

    #[test]
    fn test_nearest_unbalanced_prefers_deepest() {
        let path = [entry(1, 2, 30), entry(2, 1, 20), entry(3, 3, 4)];
        assert_eq!(nearest_unbalanced(&path), Some(2));
    }

    #[test]
    fn test_small_or_balanced_branches_are_ignored() {
        assert_eq!(nearest_unbalanced(&[entry(1, 1, 15)]), None);
        assert_eq!(nearest_unbalanced(&[entry(1, 9, 17)]), None);
        assert_eq!(nearest_unbalanced(&[entry(1, 8, 17)]), Some(1));
        assert_eq!(nearest_unbalanced(&[entry(1, 17, 0)]), Some(1));
    }

    #[test]
    fn test_first_child_sets_leaf_radius() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 1);
        add(&mut index, "root", &fp(&[0b0000_0000]));
        add(&mut index, "near", &fp(&[0b0000_0011]));
        add(&mut index, "far", &fp(&[0b0011_1111]));

        let root_id = catalog.root_id().unwrap().unwrap();
        let (root, _) = catalog.tree_node(root_id).unwrap().unwrap();
        assert_eq!(root.radius, Some(2));
        assert_eq!(root.inner_population, 1);
        assert_eq!(root.outer_population, 1);
        assert!(root.inner_id.is_some());
        assert!(root.outer_id.is_some());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 1);
        add(&mut index, "a", &fp(&[1]));
        let phash_id = catalog.add_fingerprint(&fp(&[2])).unwrap();

        assert!(matches!(
            index.insert(phash_id, &fp(&[2])).unwrap(),
            InsertOutcome::Child { .. }
        ));
        assert_eq!(index.insert(phash_id, &fp(&[2])).unwrap(), InsertOutcome::Existing);
        assert_eq!(catalog.tree_size().unwrap(), 2);

        let root_id = catalog.root_id().unwrap().unwrap();
        let (root, _) = catalog.tree_node(root_id).unwrap().unwrap();
        assert_eq!(root.population(), 1);
    }

    #[test]
    fn test_dangling_link_attaches_to_ghost() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 1);
        add(&mut index, "a", &fp(&[0b0000_0000]));
        let b = add(&mut index, "b", &fp(&[0b0000_0001]));
        let (b_phash, _) = catalog.fingerprint_of_file(b).unwrap().unwrap();
        catalog.delete_nodes(&[b_phash]).unwrap();

        let c_hash = catalog.add_file("c").unwrap();
        let c_phash = catalog.add_fingerprint(&fp(&[0b0000_0010])).unwrap();
        catalog.associate(c_hash, c_phash).unwrap();
        let outcome = index.insert(c_phash, &fp(&[0b0000_0010])).unwrap();
        assert_eq!(outcome, InsertOutcome::Ghost { parent_id: b_phash });
        assert!(index.reported_damage);

        let (c_node, _) = catalog.tree_node(c_phash).unwrap().unwrap();
        assert_eq!(c_node.parent_id, Some(b_phash));

        // A further insert through the same dangling link is not fatal either
        add(&mut index, "d", &fp(&[0b0000_0100]));

        index.rebuild_tree().unwrap();
        crate::index::tests::assert_tree_invariants(&catalog, &HammingMetric);
        let found = index.search_file(b, 0).unwrap();
        assert!(found.contains_key(&b));
        assert_eq!(catalog.tree_size().unwrap(), 4);
    }
}
