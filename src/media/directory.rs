//! A plain directory of media files.
//!
//! Files are identified by the SHA-256 of their contents so ids stay stable
//! when files are moved or renamed. Duplicate pairs are appended to a CSV
//! report instead of being written back anywhere.

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{MediaError, MediaStore};

const REPORT_HEADER: [&str; 4] = ["file_a", "file_b", "path_a", "path_b"];

pub struct DirectoryStore {
    root: PathBuf,
    extensions: Vec<String>,
    report_path: PathBuf,
    /// Content hash -> where it was last seen
    paths: RwLock<HashMap<String, PathBuf>>,
    /// Set once `paths` covers the whole library
    fully_indexed: AtomicBool,
    report_lock: Mutex<()>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String], report_path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            report_path: report_path.into(),
            paths: RwLock::new(HashMap::new()),
            fully_indexed: AtomicBool::new(false),
            report_lock: Mutex::new(()),
        }
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    fn discover(&self, query: &[String]) -> Vec<PathBuf> {
        let terms: Vec<String> = query
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();

        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.has_media_extension(path))
            .filter(|path| {
                let relative = path
                    .strip_prefix(&self.root)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .to_lowercase();
                terms.iter().all(|term| relative.contains(term.as_str()))
            })
            .collect();

        files.sort();
        files
    }

    fn has_media_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.contains(&ext))
    }

    /// Where `id` lives. Ids that were never listed in this run, e.g. when
    /// hashing was skipped, trigger one walk of the whole library.
    fn path_of(&self, id: &str) -> Option<PathBuf> {
        if let Some(path) = self.cached_path(id) {
            return Some(path);
        }
        if !self.fully_indexed.load(Ordering::Acquire) {
            if let Err(e) = self.index_library(&[]) {
                warn!(root = %self.root.display(), error = %e, "Could not index library");
            }
            return self.cached_path(id);
        }
        None
    }

    fn cached_path(&self, id: &str) -> Option<PathBuf> {
        let paths = self.paths.read().unwrap_or_else(|e| e.into_inner());
        paths.get(id).cloned()
    }

    /// Hash every matching file and remember where each id was found.
    fn index_library(&self, query: &[String]) -> Result<Vec<String>, MediaError> {
        if !self.root.is_dir() {
            return Err(MediaError::NotFound(self.root.display().to_string()));
        }

        let files = self.discover(query);
        info!(files = files.len(), root = %self.root.display(), "Discovered library files");

        let hashed: Vec<(String, PathBuf)> = files
            .into_par_iter()
            .filter_map(|path| match sha256_file(&path) {
                Ok(id) => Some((id, path)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not read file");
                    None
                }
            })
            .collect();

        let mut paths = self.paths.write().unwrap_or_else(|e| e.into_inner());
        let mut ids = Vec::with_capacity(hashed.len());
        for (id, path) in hashed {
            if let Some(previous) = paths.insert(id.clone(), path.clone()) {
                if previous != path {
                    debug!(first = %previous.display(), second = %path.display(), "Identical files");
                }
            }
            ids.push(id);
        }
        if query.iter().all(|term| term.trim().is_empty()) {
            self.fully_indexed.store(true, Ordering::Release);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Streaming SHA-256 of a file, as lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

impl MediaStore for DirectoryStore {
    fn list_ids(&self, query: &[String]) -> Result<Vec<String>, MediaError> {
        self.index_library(query)
    }

    fn fetch(&self, id: &str) -> Result<Vec<u8>, MediaError> {
        let path = self
            .path_of(id)
            .ok_or_else(|| MediaError::NotFound(id.to_string()))?;
        Ok(std::fs::read(path)?)
    }

    fn report_duplicate(&self, a: &str, b: &str) -> Result<(), MediaError> {
        let _guard = self.report_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.report_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let needs_header = std::fs::metadata(&self.report_path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.report_path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            writer.write_record(REPORT_HEADER)?;
        }
        let display = |id: &str| {
            self.path_of(id)
                .map(|path| path.display().to_string())
                .unwrap_or_default()
        };
        writer.write_record([a, b, display(a).as_str(), display(b).as_str()])?;
        writer.flush()?;
        Ok(())
    }

    fn count_duplicates(&self) -> Result<u64, MediaError> {
        let _guard = self.report_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.report_path.exists() {
            return Ok(0);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.report_path)?;

        let mut pairs = HashSet::new();
        for record in reader.records() {
            let record = record?;
            if let (Some(a), Some(b)) = (record.get(0), record.get(1)) {
                let pair = if a <= b { (a.to_string(), b.to_string()) } else { (b.to_string(), a.to_string()) };
                pairs.insert(pair);
            }
        }
        Ok(pairs.len() as u64)
    }
}
