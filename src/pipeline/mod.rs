//! The deduplication run: fingerprint new files, merge them into the search
//! tree, rebalance if a backlog has built up, then scan for duplicates.
//!
//! Every phase after fingerprinting runs inside its own transaction scope. A
//! cancelled phase still commits what it finished and the phases after it
//! are skipped.

mod ingest;
mod scan;

pub use ingest::{drain_ingest_queue, DrainStats, Fingerprinter, IngestStats, DRAIN_BATCH_SIZE};
pub use scan::{scan_for_duplicates, ScanStats};

use tracing::{info, warn};

use crate::config::DedupeConfig;
use crate::db::{in_transaction, Catalog};
use crate::error::Result;
use crate::fingerprint::{similarity_to_distance, Hasher, Metric, SimilarityMetric};
use crate::index::{MaintenanceStats, RebuildStats, VpTreeIndex};
use crate::media::{FailureSink, MediaStore};
use crate::progress::{CancelToken, Reporter};

#[derive(Debug, Clone)]
pub struct DedupeOptions {
    /// Minimum similarity (0-100) for a pair to be reported
    pub threshold: f64,
    pub jobs: usize,
    pub query: Vec<String>,
    pub skip_hashing: bool,
    /// Re-fingerprint files that already have a fingerprint
    pub overwrite: bool,
    /// Rebuild the whole search tree after merging instead of rebalancing
    /// queued branches
    pub rebuild_tree: bool,
}

impl DedupeOptions {
    pub fn from_config(config: &DedupeConfig) -> Self {
        Self {
            threshold: config.threshold,
            jobs: config.job_count,
            query: config.query.clone(),
            skip_hashing: config.skip_hashing,
            overwrite: config.overwrite,
            rebuild_tree: false,
        }
    }

    pub fn search_distance(&self) -> u32 {
        similarity_to_distance(self.threshold)
    }
}

/// What a run did, phase by phase.
#[derive(Debug, Clone, Default)]
pub struct DedupeReport {
    pub ingest: IngestStats,
    pub drain: DrainStats,
    pub maintenance: Option<MaintenanceStats>,
    pub rebuild: Option<RebuildStats>,
    pub scan: ScanStats,
    /// Relationships the store gained during the scan, when it could tell
    pub new_duplicates: Option<u64>,
    pub cancelled: bool,
}

pub struct Deduplicator<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
    store: &'a dyn MediaStore,
    hasher: &'a dyn Hasher,
    failures: Option<&'a dyn FailureSink>,
    options: DedupeOptions,
}

impl<'a, C: Catalog + ?Sized> Deduplicator<'a, C> {
    pub fn new(
        catalog: &'a C,
        store: &'a dyn MediaStore,
        hasher: &'a dyn Hasher,
        options: DedupeOptions,
    ) -> Self {
        Self {
            catalog,
            store,
            hasher,
            failures: None,
            options,
        }
    }

    pub fn with_failure_sink(mut self, sink: &'a dyn FailureSink) -> Self {
        self.failures = Some(sink);
        self
    }

    /// Run every phase with the hasher's own similarity as the tree metric.
    pub fn run(&self, cancel: &CancelToken, reporter: &Reporter) -> Result<DedupeReport> {
        let mut index = VpTreeIndex::new(self.catalog, SimilarityMetric::new(self.hasher));
        self.run_with_index(&mut index, cancel, reporter)
    }

    pub fn run_with_index<M: Metric>(
        &self,
        index: &mut VpTreeIndex<'_, C, M>,
        cancel: &CancelToken,
        reporter: &Reporter,
    ) -> Result<DedupeReport> {
        let mut report = DedupeReport::default();
        let distance = self.options.search_distance();

        if !self.options.skip_hashing {
            report.ingest = self.fingerprint_new_files(cancel, reporter)?;
            if cancel.is_cancelled() {
                return Ok(cancelled(report));
            }
        }

        report.drain = in_transaction(self.catalog, || drain_ingest_queue(index, cancel, reporter))?;
        if report.drain.cancelled || cancel.is_cancelled() {
            return Ok(cancelled(report));
        }

        if self.options.rebuild_tree {
            report.rebuild = Some(in_transaction(self.catalog, || index.rebuild_tree())?);
        } else if index.maintenance_due(distance)? {
            let stats = in_transaction(self.catalog, || index.schedule_maintenance(cancel, reporter))?;
            report.maintenance = Some(stats);
            if stats.cancelled {
                return Ok(cancelled(report));
            }
        }

        let before = self.count_duplicates();
        report.scan = in_transaction(self.catalog, || {
            scan_for_duplicates(index, self.store, distance, cancel, reporter)
        })?;
        let after = self.count_duplicates();
        report.new_duplicates = before.zip(after).map(|(b, a)| a.saturating_sub(b));
        report.cancelled = report.scan.cancelled;

        info!(
            hashed = report.ingest.hashed,
            merged = report.drain.merged,
            scanned = report.scan.files,
            pairs = report.scan.pairs,
            "Deduplication finished"
        );
        Ok(report)
    }

    fn fingerprint_new_files(&self, cancel: &CancelToken, reporter: &Reporter) -> Result<IngestStats> {
        let ids = match self.store.list_ids(&self.options.query) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Could not list files; continuing with what is already catalogued");
                return Ok(IngestStats::default());
            }
        };

        let new: Vec<String> = if self.options.overwrite {
            info!(files = ids.len(), "Fingerprinting every listed file again");
            ids
        } else {
            let known = self.catalog.fingerprinted_files()?;
            let new: Vec<String> = ids.into_iter().filter(|id| !known.contains(id)).collect();
            info!(new = new.len(), known = known.len(), "Found files to fingerprint");
            new
        };

        let mut fingerprinter = Fingerprinter::new(self.store, self.hasher, self.options.jobs);
        if let Some(sink) = self.failures {
            fingerprinter = fingerprinter.with_failure_sink(sink);
        }
        fingerprinter.run(self.catalog, &new, cancel, reporter)
    }

    fn count_duplicates(&self) -> Option<u64> {
        match self.store.count_duplicates() {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Could not count duplicates");
                None
            }
        }
    }
}

fn cancelled(mut report: DedupeReport) -> DedupeReport {
    info!("Run cancelled; finished work has been saved");
    report.cancelled = true;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprint, HammingMetric, HashError};
    use crate::index::tests::catalog;
    use crate::media::memory::{MemorySink, MemoryStore};

    struct BytesHasher;

    impl Hasher for BytesHasher {
        fn compute(&self, bytes: &[u8]) -> std::result::Result<Fingerprint, HashError> {
            match bytes {
                [] => Err(HashError::Decode("no frames".to_string())),
                _ => Ok(Fingerprint::from_bytes(bytes.to_vec())),
            }
        }

        fn similarity(&self, a: &Fingerprint, b: &Fingerprint) -> f64 {
            let bits = (a.as_bytes().len().max(b.as_bytes().len()) * 8) as f64;
            let distance = crate::fingerprint::hamming_distance(a.as_bytes(), b.as_bytes()) as f64;
            100.0 * (1.0 - distance / bits)
        }
    }

    fn options(threshold: f64) -> DedupeOptions {
        DedupeOptions {
            threshold,
            jobs: 2,
            query: Vec::new(),
            skip_hashing: false,
            overwrite: false,
            rebuild_tree: false,
        }
    }

    fn library() -> MemoryStore {
        MemoryStore::default()
            .with_file("A", &[0b0000_0000])
            .with_file("B", &[0b0000_0001])
            .with_file("C", &[0b0000_0011])
            .with_file("D", &[0b1111_1111])
            .with_file("E", &[0b1111_1110])
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_run_finds_hamming_neighbours() {
        let catalog = catalog();
        let store = library();
        let dedupe = Deduplicator::new(&catalog, &store, &BytesHasher, options(100.0));
        assert_eq!(dedupe.options.search_distance(), 1);

        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 6);
        let report = dedupe
            .run_with_index(&mut index, &CancelToken::new(), &Reporter::silent())
            .unwrap();

        assert_eq!(report.ingest.hashed, 5);
        assert_eq!(report.drain.merged, 5);
        assert_eq!(report.maintenance, None);
        assert_eq!(report.scan.files, 5);
        assert_eq!(report.scan.pairs, 3);
        assert_eq!(report.new_duplicates, Some(3));
        assert!(!report.cancelled);
        assert_eq!(
            store.reported_pairs(),
            vec![pair("A", "B"), pair("B", "C"), pair("D", "E")]
        );
    }

    #[test]
    fn test_second_run_does_no_repeat_work() {
        let catalog = catalog();
        let store = library();
        let dedupe = Deduplicator::new(&catalog, &store, &BytesHasher, options(100.0));
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 6);
        dedupe
            .run_with_index(&mut index, &CancelToken::new(), &Reporter::silent())
            .unwrap();
        let fetches = store.fetches.lock().unwrap().len();
        let reports = store.reported.lock().unwrap().len();

        let again = dedupe
            .run_with_index(&mut index, &CancelToken::new(), &Reporter::silent())
            .unwrap();
        assert_eq!(again.ingest.hashed, 0);
        assert_eq!(again.scan.files, 0);
        assert_eq!(again.new_duplicates, Some(0));
        assert_eq!(store.fetches.lock().unwrap().len(), fetches);
        assert_eq!(store.reported.lock().unwrap().len(), reports);
    }

    #[test]
    fn test_real_metric_groups_similar_files() {
        let catalog = catalog();
        let store = MemoryStore::default()
            .with_file("x1", &[0x00, 0x00])
            .with_file("x2", &[0x01, 0x00])
            .with_file("y1", &[0xff, 0xff])
            .with_file("broken", &[])
            .with_unreachable("gone");
        let sink = MemorySink::default();

        // 1 bit in 16 differs: similarity 93.75
        let report = Deduplicator::new(&catalog, &store, &BytesHasher, options(90.0))
            .with_failure_sink(&sink)
            .run(&CancelToken::new(), &Reporter::silent())
            .unwrap();

        assert_eq!(report.ingest.hashed, 3);
        assert_eq!(report.ingest.hash_failures, 1);
        assert_eq!(report.ingest.fetch_failures, 1);
        assert_eq!(*sink.failures.lock().unwrap(), vec!["broken".to_string()]);
        assert_eq!(store.reported_pairs(), vec![pair("x1", "x2")]);
    }

    #[test]
    fn test_skip_hashing_still_drains_queue() {
        let catalog = catalog();
        catalog
            .enqueue_ingest("left-over", &Fingerprint::from_bytes(vec![7]))
            .unwrap();
        let store = library();
        let mut opts = options(100.0);
        opts.skip_hashing = true;

        let report = Deduplicator::new(&catalog, &store, &BytesHasher, opts)
            .run(&CancelToken::new(), &Reporter::silent())
            .unwrap();
        assert_eq!(report.ingest, IngestStats::default());
        assert_eq!(report.drain.merged, 1);
        assert!(store.fetches.lock().unwrap().is_empty());
        assert_eq!(catalog.ingest_queue_len().unwrap(), 0);
    }

    #[test]
    fn test_cancel_skips_remaining_phases() {
        let catalog = catalog();
        let store = library();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = Deduplicator::new(&catalog, &store, &BytesHasher, options(100.0))
            .run(&cancel, &Reporter::silent())
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.drain, DrainStats::default());
        assert_eq!(report.scan, ScanStats::default());
        assert!(store.reported.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_replaces_fingerprint_and_resets_search() {
        let catalog = catalog();
        Deduplicator::new(&catalog, &library(), &BytesHasher, options(100.0))
            .run(&CancelToken::new(), &Reporter::silent())
            .unwrap();
        let a = catalog.file_id("A").unwrap().unwrap();
        assert!(catalog.pending_searches(1).unwrap().is_empty());

        // A's content changed since it was catalogued
        let changed = MemoryStore::default().with_file("A", &[0b1010_1010]);

        let report = Deduplicator::new(&catalog, &changed, &BytesHasher, options(100.0))
            .fingerprint_new_files(&CancelToken::new(), &Reporter::silent())
            .unwrap();
        assert_eq!(report.hashed, 0);
        assert!(changed.fetches.lock().unwrap().is_empty());

        let mut opts = options(100.0);
        opts.overwrite = true;
        let dedupe = Deduplicator::new(&catalog, &changed, &BytesHasher, opts);
        let report = dedupe
            .fingerprint_new_files(&CancelToken::new(), &Reporter::silent())
            .unwrap();
        assert_eq!(report.hashed, 1);

        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 3);
        drain_ingest_queue(&mut index, &CancelToken::new(), &Reporter::silent()).unwrap();

        let (_, fingerprint) = catalog.fingerprint_of_file(a).unwrap().unwrap();
        assert_eq!(fingerprint, Fingerprint::from_bytes(vec![0b1010_1010]));
        assert_eq!(catalog.pending_searches(1).unwrap(), vec![a]);
    }

    #[test]
    fn test_rebuild_tree_repairs_damaged_tree() {
        let catalog = catalog();
        let store = library();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 6);
        Deduplicator::new(&catalog, &store, &BytesHasher, options(100.0))
            .run_with_index(&mut index, &CancelToken::new(), &Reporter::silent())
            .unwrap();

        let b = catalog.file_id("B").unwrap().unwrap();
        let (b_phash, _) = catalog.fingerprint_of_file(b).unwrap().unwrap();
        catalog.delete_nodes(&[b_phash]).unwrap();
        catalog.clear_search_cache().unwrap();
        assert_eq!(catalog.tree_size().unwrap(), 4);

        let mut opts = options(100.0);
        opts.skip_hashing = true;
        opts.rebuild_tree = true;
        let fresh = library();
        let mut index = VpTreeIndex::with_seed(&catalog, HammingMetric, 6);
        let report = Deduplicator::new(&catalog, &fresh, &BytesHasher, opts)
            .run_with_index(&mut index, &CancelToken::new(), &Reporter::silent())
            .unwrap();

        assert_eq!(report.rebuild.map(|r| r.nodes), Some(5));
        assert_eq!(report.maintenance, None);
        assert_eq!(catalog.tree_size().unwrap(), 5);
        assert_eq!(catalog.maintenance_len().unwrap(), 0);
        assert_eq!(
            fresh.reported_pairs(),
            vec![pair("A", "B"), pair("B", "C"), pair("D", "E")]
        );
    }

    #[test]
    fn test_query_limits_listed_files() {
        let catalog = catalog();
        let store = library();
        let mut opts = options(100.0);
        opts.query = vec!["D".to_string()];

        let report = Deduplicator::new(&catalog, &store, &BytesHasher, opts)
            .run(&CancelToken::new(), &Reporter::silent())
            .unwrap();
        assert_eq!(report.ingest.hashed, 1);
        assert_eq!(catalog.fingerprinted_files().unwrap().len(), 1);
    }
}
