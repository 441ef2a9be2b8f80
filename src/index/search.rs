use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use super::VpTreeIndex;
use crate::db::Catalog;
use crate::error::Result;
use crate::fingerprint::{Fingerprint, Metric};

impl<C, M> VpTreeIndex<'_, C, M>
where
    C: Catalog + ?Sized,
    M: Metric,
{
    /// Every file whose fingerprint lies within `max_distance` of any query,
    /// keyed by `hash_id` with the smallest distance seen.
    ///
    /// A `max_distance` of 0 only matches identical fingerprints and skips
    /// the tree entirely.
    pub fn search(
        &mut self,
        queries: &[Fingerprint],
        max_distance: u32,
    ) -> Result<BTreeMap<i64, u32>> {
        let mut hits: HashMap<i64, u32> = HashMap::new();
        if queries.is_empty() {
            return Ok(BTreeMap::new());
        }

        if max_distance == 0 {
            for query in queries {
                if let Some(phash_id) = self.catalog.fingerprint_id(query)? {
                    hits.insert(phash_id, 0);
                }
            }
        } else if let Some(root_id) = self.catalog.root_id()? {
            for query in queries {
                self.search_from(root_id, query, max_distance, &mut hits)?;
            }
        }

        self.files_for(hits)
    }

    /// Walk the tree level by level from `root_id`, pruning children whose
    /// sphere cannot intersect the query's.
    fn search_from(
        &mut self,
        root_id: i64,
        query: &Fingerprint,
        max_distance: u32,
        hits: &mut HashMap<i64, u32>,
    ) -> Result<()> {
        let mut visited = HashSet::from([root_id]);
        let mut frontier = vec![root_id];

        while !frontier.is_empty() {
            self.load_nodes(&frontier)?;
            let mut next = Vec::new();
            for id in &frontier {
                let Some(node) = self.nodes.get(id) else {
                    continue;
                };
                let d = self.metric.distance(query, &node.fingerprint);
                if d <= max_distance {
                    hits.entry(*id)
                        .and_modify(|best| *best = (*best).min(d))
                        .or_insert(d);
                }

                let Some(radius) = node.radius else {
                    continue;
                };
                if let Some(inner) = node.inner_id {
                    if d <= radius.saturating_add(max_distance) && visited.insert(inner) {
                        next.push(inner);
                    }
                }
                if let Some(outer) = node.outer_id {
                    if d.saturating_add(max_distance) > radius && visited.insert(outer) {
                        next.push(outer);
                    }
                }
            }
            frontier = next;
        }
        Ok(())
    }

    /// Make sure every id in `ids` is either in the node cache or known not
    /// to be a tree node.
    fn load_nodes(&mut self, ids: &[i64]) -> Result<()> {
        if self.nodes.len() > self.cache_limit {
            let keep: HashSet<i64> = ids.iter().copied().collect();
            self.nodes.retain(|id, _| keep.contains(id));
            debug!(kept = self.nodes.len(), "Evicted search node cache");
        }
        if self.untreed.len() > self.cache_limit {
            self.untreed.clear();
        }

        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !self.nodes.contains_key(id) && !self.untreed.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        for (id, view) in self.catalog.node_views(&missing)? {
            self.nodes.insert(id, view);
        }
        for id in missing {
            if !self.nodes.contains_key(&id) {
                self.untreed.insert(id);
            }
        }
        Ok(())
    }

    /// Expand fingerprint hits to every file mapped to them.
    fn files_for(&self, hits: HashMap<i64, u32>) -> Result<BTreeMap<i64, u32>> {
        let phash_ids: Vec<i64> = hits.keys().copied().collect();
        let mut files = BTreeMap::new();
        for (phash_id, hash_id) in self.catalog.files_with_fingerprints(&phash_ids)? {
            let Some(&d) = hits.get(&phash_id) else {
                continue;
            };
            files
                .entry(hash_id)
                .and_modify(|best: &mut u32| *best = (*best).min(d))
                .or_insert(d);
        }
        Ok(files)
    }

    /// Neighbours of a catalogued file. The file itself is always part of the
    /// result at distance 0.
    pub fn search_file(&mut self, hash_id: i64, max_distance: u32) -> Result<BTreeMap<i64, u32>> {
        let mut results = match self.catalog.fingerprint_of_file(hash_id)? {
            Some((_, fingerprint)) => self.search(std::slice::from_ref(&fingerprint), max_distance)?,
            None => {
                debug!(hash_id, "File has no fingerprint to search with");
                BTreeMap::new()
            }
        };
        results.insert(hash_id, 0);
        Ok(results)
    }
}
