use std::collections::HashSet;
use tracing::{info, warn};

use crate::db::Catalog;
use crate::error::Result;
use crate::fingerprint::Metric;
use crate::index::VpTreeIndex;
use crate::media::MediaStore;
use crate::progress::{CancelToken, Phase, Reporter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Files whose neighbourhood was searched
    pub files: usize,
    /// Distinct unordered pairs handed to the store
    pub pairs: usize,
    pub report_failures: usize,
    pub cancelled: bool,
}

/// Search around every file not yet searched out to `distance` and report
/// each neighbour to `store`.
///
/// A file is only marked searched once all of its pairs were reported, so a
/// store outage just means the file is searched again next run. Callers own
/// the transaction scope.
pub fn scan_for_duplicates<C, M>(
    index: &mut VpTreeIndex<'_, C, M>,
    store: &dyn MediaStore,
    distance: u32,
    cancel: &CancelToken,
    reporter: &Reporter,
) -> Result<ScanStats>
where
    C: Catalog + ?Sized,
    M: Metric,
{
    let catalog = index.catalog();
    let pending = catalog.pending_searches(distance)?;
    let mut stats = ScanStats::default();
    let mut pairs: HashSet<(i64, i64)> = HashSet::new();
    reporter.started(Phase::Scanning, Some(pending.len() as u64));

    for hash_id in pending {
        if cancel.is_cancelled() {
            stats.cancelled = true;
            break;
        }
        let Some(file_hash) = catalog.file_hash(hash_id)? else {
            continue;
        };

        let mut failed = false;
        for (other_id, d) in index.search_file(hash_id, distance)? {
            if other_id == hash_id {
                continue;
            }
            let Some(other_hash) = catalog.file_hash(other_id)? else {
                continue;
            };
            match store.report_duplicate(&file_hash, &other_hash) {
                Ok(()) => {
                    if pairs.insert((hash_id.min(other_id), hash_id.max(other_id))) {
                        info!(a = %file_hash, b = %other_hash, distance = d, "Similar files found");
                    }
                }
                Err(e) => {
                    warn!(a = %file_hash, b = %other_hash, error = %e, "Failed to report duplicate pair");
                    stats.report_failures += 1;
                    failed = true;
                }
            }
        }

        if !failed {
            catalog.mark_searched(hash_id, distance)?;
        }
        stats.files += 1;
        reporter.progress(Phase::Scanning, stats.files as u64);
    }

    stats.pairs = pairs.len();
    reporter.finished(Phase::Scanning, stats.cancelled);
    info!(files = stats.files, pairs = stats.pairs, "Duplicate scan finished");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::HammingMetric;
    use crate::index::tests::{add, catalog, fp};
    use crate::media::memory::MemoryStore;

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    fn scenario(index: &mut VpTreeIndex<'_, crate::db::SqliteCatalog, HammingMetric>) {
        add(index, "A", &fp(&[0b0000_0000]));
        add(index, "B", &fp(&[0b0000_0001]));
        add(index, "C", &fp(&[0b0000_0011]));
        add(index, "D", &fp(&[0b1111_1111]));
        add(index, "E", &fp(&[0b1111_1110]));
    }

    #[test]
    fn test_scan_reports_every_pair_within_distance() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 2);
        scenario(&mut index);
        let store = MemoryStore::default();

        let stats =
            scan_for_duplicates(&mut index, &store, 1, &CancelToken::new(), &Reporter::silent())
                .unwrap();

        assert_eq!(stats.files, 5);
        assert_eq!(stats.pairs, 3);
        assert_eq!(
            store.reported_pairs(),
            vec![pair("A", "B"), pair("B", "C"), pair("D", "E")]
        );
    }

    #[test]
    fn test_repeated_scans_report_nothing_new() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 2);
        scenario(&mut index);
        let store = MemoryStore::default();
        let cancel = CancelToken::new();

        scan_for_duplicates(&mut index, &store, 1, &cancel, &Reporter::silent()).unwrap();
        let calls = store.reported.lock().unwrap().len();

        let again = scan_for_duplicates(&mut index, &store, 1, &cancel, &Reporter::silent()).unwrap();
        assert_eq!(again.files, 0);
        assert_eq!(store.reported.lock().unwrap().len(), calls);

        // A wider search revisits everything and finds A-C as well
        let wider = scan_for_duplicates(&mut index, &store, 2, &cancel, &Reporter::silent()).unwrap();
        assert_eq!(wider.files, 5);
        assert!(store.reported_pairs().contains(&pair("A", "C")));

        // Narrowing again never lowers what was already searched
        let narrower = scan_for_duplicates(&mut index, &store, 1, &cancel, &Reporter::silent()).unwrap();
        assert_eq!(narrower.files, 0);
        assert!(catalog.pending_searches(2).unwrap().is_empty());
    }

    #[test]
    fn test_failed_reports_leave_file_unsearched() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 2);
        scenario(&mut index);
        let store = MemoryStore::default().refusing_reports();

        let stats =
            scan_for_duplicates(&mut index, &store, 1, &CancelToken::new(), &Reporter::silent())
                .unwrap();
        assert_eq!(stats.pairs, 0);
        assert!(stats.report_failures > 0);

        // Every file in the scenario has a neighbour at distance 1
        assert_eq!(catalog.pending_searches(1).unwrap().len(), 5);
    }

    #[test]
    fn test_cancelled_scan_marks_nothing() {
        let catalog = catalog();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 2);
        scenario(&mut index);
        let store = MemoryStore::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let stats = scan_for_duplicates(&mut index, &store, 1, &cancel, &Reporter::silent()).unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.files, 0);
        assert_eq!(catalog.pending_searches(1).unwrap().len(), 5);
    }
}
