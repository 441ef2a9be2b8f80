use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::warn;

use vidupe::config::Config;
use vidupe::db::{in_transaction, Catalog, CatalogStats, SqliteCatalog};
use vidupe::fingerprint::{Hasher, ImageHasher};
use vidupe::logging;
use vidupe::media::{DirectoryStore, HydrusClient, HydrusPageLogger};
use vidupe::pipeline::{DedupeOptions, DedupeReport, Deduplicator};
use vidupe::progress::{CancelToken, PhaseUpdate, Reporter};

#[derive(Parser, Debug)]
#[command(
    name = "vidupe",
    version,
    about = "Find near-duplicate videos in a Hydrus client or a local directory"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Catalog database to use
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Minimum similarity (0-100) for two files to count as duplicates
    #[arg(short, long)]
    threshold: Option<f64>,

    /// Number of fingerprinting workers
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Extra search term, may be repeated
    #[arg(short, long, value_name = "TERM")]
    query: Vec<String>,

    /// Deduplicate a local directory instead of a Hydrus client
    #[arg(long, value_name = "DIR")]
    library: Option<PathBuf>,

    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// PEM certificate of the Hydrus client API; enables certificate checks
    #[arg(long, value_name = "PATH")]
    verify_cert: Option<PathBuf>,

    /// Hydrus page that files which fail to fingerprint are sent to
    #[arg(long, value_name = "NAME")]
    failed_page_name: Option<String>,

    /// Only merge and search what is already fingerprinted
    #[arg(long)]
    skip_hashing: bool,

    /// Fingerprint every file again, even ones already in the catalog
    #[arg(long)]
    overwrite: bool,

    /// Throw away the search tree and re-insert every fingerprint one by one
    #[arg(long)]
    clear_search_tree: bool,

    /// Rebuild the search tree from scratch after merging new files;
    /// repairs a damaged tree
    #[arg(long)]
    rebuild_tree: bool,

    /// Forget which files were already searched
    #[arg(long)]
    clear_search_cache: bool,

    /// Remove a file from the catalog, may be repeated
    #[arg(long, value_name = "FILE_HASH")]
    forget: Vec<String>,

    /// Also log to stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Command line settings win over the config file and the environment.
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.database {
            config.db_path = path.clone();
        }
        if let Some(threshold) = self.threshold {
            config.dedupe.threshold = threshold;
        }
        if let Some(jobs) = self.jobs {
            config.dedupe.job_count = jobs;
        }
        if !self.query.is_empty() {
            config.dedupe.query = self.query.clone();
        }
        if self.skip_hashing {
            config.dedupe.skip_hashing = true;
        }
        if self.overwrite {
            config.dedupe.overwrite = true;
        }
        if let Some(dir) = &self.library {
            config.library.path = Some(dir.clone());
        }
        if let Some(url) = &self.api_url {
            config.hydrus.api_url = url.clone();
        }
        if let Some(key) = &self.api_key {
            config.hydrus.api_key = Some(key.clone());
        }
        if let Some(path) = &self.verify_cert {
            config.hydrus.verify_cert = Some(path.clone());
        }
        if let Some(page) = &self.failed_page_name {
            config.hydrus.failed_page_name = Some(page.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(None, cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => Config::load()?,
    };
    config.apply_env();
    cli.apply(&mut config);
    config.validate()?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, saving progress...");
                cancel.cancel();
            }
        });
    }

    let (tx, rx) = mpsc::channel();
    let renderer = std::thread::spawn(move || render_progress(rx));

    let worker_cancel = cancel.clone();
    let report = tokio::task::spawn_blocking(move || {
        run(&cli, &config, &worker_cancel, Reporter::new(tx))
    })
    .await
    .context("Deduplication task failed")?;
    let _ = renderer.join();

    print_report(&report?);
    Ok(())
}

fn run(cli: &Cli, config: &Config, cancel: &CancelToken, reporter: Reporter) -> Result<DedupeReport> {
    let catalog = SqliteCatalog::open(&config.db_path)
        .with_context(|| format!("Failed to open catalog {:?}", config.db_path))?;
    catalog.initialize()?;

    if !cli.forget.is_empty() {
        let removed = in_transaction(&catalog, || {
            let mut removed = 0;
            for file_hash in &cli.forget {
                if catalog.remove_file(file_hash)? {
                    removed += 1;
                } else {
                    warn!(file = %file_hash, "Not in the catalog");
                }
            }
            Ok(removed)
        })?;
        println!("Forgot {} file(s)", removed);
    }
    if cli.clear_search_tree {
        let queued = in_transaction(&catalog, || catalog.clear_search_tree())?;
        println!("Cleared search tree; {} fingerprint(s) queued for re-insertion", queued);
    }
    if cli.clear_search_cache {
        catalog.clear_search_cache()?;
        println!("Cleared search cache");
    }

    print_stats(&catalog.stats()?);

    let hasher = ImageHasher::new();
    let mut options = DedupeOptions::from_config(&config.dedupe);
    options.rebuild_tree = cli.rebuild_tree;

    let report = match &config.library.path {
        Some(root) => {
            let store = DirectoryStore::new(root, &config.library.extensions, config.report_path());
            println!("Duplicate pairs are written to {}", store.report_path().display());
            Deduplicator::new(&catalog, &store, &hasher, options).run(cancel, &reporter)?
        }
        None => {
            let client = HydrusClient::connect(&config.hydrus)
                .context("Could not connect to the Hydrus client API")?
                .with_filetypes(hasher.filetypes());
            let page_logger = config
                .hydrus
                .failed_page_name
                .as_deref()
                .map(|name| HydrusPageLogger::new(&client, name));

            let mut dedupe = Deduplicator::new(&catalog, &client, &hasher, options);
            if let Some(logger) = &page_logger {
                dedupe = dedupe.with_failure_sink(logger);
            }
            dedupe.run(cancel, &reporter)?
        }
    };
    Ok(report)
}

fn render_progress(updates: mpsc::Receiver<PhaseUpdate>) {
    let mut bar: Option<ProgressBar> = None;

    for update in updates {
        match update {
            PhaseUpdate::Started { phase, total } => {
                let (pb, template) = match total {
                    Some(total) => (
                        ProgressBar::new(total),
                        "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                    ),
                    None => (ProgressBar::new_spinner(), "{spinner:.green} {msg}"),
                };
                if let Ok(style) = ProgressStyle::with_template(template) {
                    pb.set_style(style.progress_chars("=> "));
                }
                pb.set_message(phase.display_name());
                pb.enable_steady_tick(Duration::from_millis(100));
                bar = Some(pb);
            }
            PhaseUpdate::Progress { current, .. } => {
                if let Some(pb) = &bar {
                    pb.set_position(current);
                }
            }
            PhaseUpdate::Finished { phase, cancelled } => {
                if let Some(pb) = bar.take() {
                    let state = if cancelled { "cancelled" } else { "done" };
                    pb.finish_with_message(format!("{}: {}", phase.display_name(), state));
                }
            }
        }
    }
}

fn print_stats(stats: &CatalogStats) {
    println!("Catalog:");
    println!("  Files:              {}", stats.files);
    println!("  Fingerprints:       {}", stats.fingerprints);
    println!("  Search tree nodes:  {}", stats.tree_nodes);
    println!("  Waiting to merge:   {}", stats.ingest_queue);
    println!("  Never searched:     {}", stats.unsearched_files);
    if let Some(bytes) = stats.size_bytes {
        println!("  Size:               {:.1} MiB", bytes as f64 / (1024.0 * 1024.0));
    }
}

fn print_report(report: &DedupeReport) {
    println!();
    println!("Fingerprinted {} file(s)", report.ingest.hashed);
    if report.ingest.fetch_failures + report.ingest.hash_failures > 0 {
        println!(
            "  {} could not be fetched, {} could not be fingerprinted",
            report.ingest.fetch_failures, report.ingest.hash_failures
        );
    }
    println!("Merged {} file(s) into the search tree", report.drain.merged);
    if let Some(maintenance) = &report.maintenance {
        println!(
            "Rebalanced {} branch(es), {} node(s)",
            maintenance.branches, maintenance.nodes
        );
    }
    if let Some(rebuild) = &report.rebuild {
        println!(
            "Rebuilt search tree: {} node(s), {} orphaned fingerprint(s) dropped",
            rebuild.nodes, rebuild.orphans_removed
        );
    }
    println!(
        "Searched {} file(s), found {} similar pair(s)",
        report.scan.files, report.scan.pairs
    );
    if report.scan.report_failures > 0 {
        println!(
            "  {} pair(s) could not be reported and will be retried",
            report.scan.report_failures
        );
    }
    if let Some(new) = report.new_duplicates {
        println!("New potential duplicates: {}", new);
    }
    if report.cancelled {
        println!("Run was interrupted; rerun to pick up where it stopped");
    }
}
