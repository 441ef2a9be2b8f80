use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::Catalog;
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, HashError, Hasher, Metric};
use crate::index::{InsertOutcome, VpTreeIndex};
use crate::media::{FailureSink, MediaError, MediaStore};
use crate::progress::{CancelToken, Phase, Reporter};

/// Queue entries merged per read of the ingest queue.
pub const DRAIN_BATCH_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub hashed: usize,
    pub fetch_failures: usize,
    pub hash_failures: usize,
    /// Ids never attempted because the run was cancelled
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub merged: usize,
    /// Entries whose fingerprint already had a tree node
    pub shared: usize,
    pub cancelled: bool,
}

enum Outcome {
    Hashed(Fingerprint),
    FetchFailed(MediaError),
    HashFailed(HashError),
}

/// Parallel fetch-and-hash stage. Workers never touch the catalog; results
/// are written by the calling thread as they arrive.
pub struct Fingerprinter<'a> {
    store: &'a dyn MediaStore,
    hasher: &'a dyn Hasher,
    failures: Option<&'a dyn FailureSink>,
    jobs: usize,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(store: &'a dyn MediaStore, hasher: &'a dyn Hasher, jobs: usize) -> Self {
        Self {
            store,
            hasher,
            failures: None,
            jobs: jobs.max(1),
        }
    }

    /// Files that fail to fingerprint are also handed to `sink`.
    pub fn with_failure_sink(mut self, sink: &'a dyn FailureSink) -> Self {
        self.failures = Some(sink);
        self
    }

    fn fingerprint_one(&self, id: &str) -> Outcome {
        let bytes = match self.store.fetch(id) {
            Ok(bytes) => bytes,
            Err(e) => return Outcome::FetchFailed(e),
        };
        match self.hasher.compute(&bytes) {
            Ok(fingerprint) if fingerprint.is_empty() => Outcome::HashFailed(HashError::Empty),
            Ok(fingerprint) => Outcome::Hashed(fingerprint),
            Err(e) => Outcome::HashFailed(e),
        }
    }

    /// Fingerprint `ids` and stage every result in the ingest queue. Each
    /// queue write commits on its own so finished work survives a crash.
    pub fn run<C: Catalog + ?Sized>(
        &self,
        catalog: &C,
        ids: &[String],
        cancel: &CancelToken,
        reporter: &Reporter,
    ) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        if ids.is_empty() {
            return Ok(stats);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        reporter.started(Phase::Fingerprinting, Some(ids.len() as u64));
        info!(files = ids.len(), jobs = self.jobs, "Fingerprinting files");

        let abort = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<(&str, Outcome)>();

        let written: Result<usize> = std::thread::scope(|scope| {
            let pool = &pool;
            let abort = &abort;
            scope.spawn(move || {
                pool.install(|| {
                    ids.par_iter().for_each_with(tx, |tx, id| {
                        if cancel.is_cancelled() || abort.load(Ordering::Relaxed) {
                            return;
                        }
                        let _ = tx.send((id.as_str(), self.fingerprint_one(id)));
                    });
                });
            });

            let mut processed = 0;
            for (id, outcome) in rx {
                processed += 1;
                match outcome {
                    Outcome::Hashed(fingerprint) => {
                        if let Err(e) = catalog.enqueue_ingest(id, &fingerprint) {
                            abort.store(true, Ordering::Relaxed);
                            return Err(e);
                        }
                        stats.hashed += 1;
                    }
                    Outcome::FetchFailed(e) => {
                        warn!(file = id, error = %e, "Failed to fetch file");
                        stats.fetch_failures += 1;
                    }
                    Outcome::HashFailed(e) => {
                        warn!(file = id, error = %e, "Failed to fingerprint file");
                        stats.hash_failures += 1;
                        if let Some(sink) = self.failures {
                            sink.record_failure(id, &e.to_string());
                        }
                    }
                }
                reporter.progress(Phase::Fingerprinting, processed as u64);
            }
            Ok(processed)
        });

        let processed = written?;
        stats.skipped = ids.len() - processed;
        stats.cancelled = cancel.is_cancelled() && stats.skipped > 0;
        reporter.finished(Phase::Fingerprinting, stats.cancelled);

        info!(
            hashed = stats.hashed,
            fetch_failures = stats.fetch_failures,
            hash_failures = stats.hash_failures,
            skipped = stats.skipped,
            "Fingerprinting finished"
        );
        Ok(stats)
    }
}

/// Merge every staged fingerprint into the catalog and the tree.
///
/// Each entry is removed from the queue right after it is merged, and merging
/// an entry twice changes nothing, so an interrupted drain can simply be run
/// again. Callers own the transaction scope.
pub fn drain_ingest_queue<C, M>(
    index: &mut VpTreeIndex<'_, C, M>,
    cancel: &CancelToken,
    reporter: &Reporter,
) -> Result<DrainStats>
where
    C: Catalog + ?Sized,
    M: Metric,
{
    let catalog = index.catalog();
    let mut stats = DrainStats::default();
    reporter.started(Phase::Merging, Some(catalog.ingest_queue_len()?));

    loop {
        if cancel.is_cancelled() {
            stats.cancelled = true;
            break;
        }
        let batch = catalog.next_ingest_batch(DRAIN_BATCH_SIZE)?;
        if batch.is_empty() {
            break;
        }

        for entry in batch {
            let hash_id = catalog.add_file(&entry.file_hash)?;
            let phash_id = catalog.add_fingerprint(&entry.fingerprint)?;
            catalog.associate(hash_id, phash_id)?;
            match index.insert(phash_id, &entry.fingerprint)? {
                InsertOutcome::Existing => stats.shared += 1,
                outcome => debug!(file = %entry.file_hash, ?outcome, "Inserted fingerprint"),
            }
            catalog.dequeue_ingest(&entry.file_hash)?;
            stats.merged += 1;
        }
        reporter.progress(Phase::Merging, stats.merged as u64);
    }

    reporter.finished(Phase::Merging, stats.cancelled);
    if stats.merged > 0 {
        info!(merged = stats.merged, shared = stats.shared, "Merged ingest queue");
    }
    Ok(stats)
}
