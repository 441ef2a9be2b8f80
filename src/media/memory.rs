use std::collections::HashMap;
use std::sync::Mutex;

use super::{FailureSink, MediaError, MediaStore};

/// In-memory store for exercising the pipeline.
#[derive(Default)]
pub struct MemoryStore {
    files: HashMap<String, Vec<u8>>,
    unreachable: Vec<String>,
    refuse_reports: bool,
    pub reported: Mutex<Vec<(String, String)>>,
    pub fetches: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn with_file(mut self, id: &str, bytes: &[u8]) -> Self {
        self.files.insert(id.to_string(), bytes.to_vec());
        self
    }

    /// Listed by `list_ids` but every fetch fails
    pub fn with_unreachable(mut self, id: &str) -> Self {
        self.unreachable.push(id.to_string());
        self
    }

    /// Every `report_duplicate` call fails
    pub fn refusing_reports(mut self) -> Self {
        self.refuse_reports = true;
        self
    }

    pub fn reported_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .reported
            .lock()
            .unwrap()
            .iter()
            .map(|(a, b)| if a <= b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) })
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }
}

impl MediaStore for MemoryStore {
    fn list_ids(&self, query: &[String]) -> Result<Vec<String>, MediaError> {
        let mut ids: Vec<String> = self
            .files
            .keys()
            .chain(self.unreachable.iter())
            .filter(|id| query.iter().all(|term| id.contains(term.as_str())))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn fetch(&self, id: &str) -> Result<Vec<u8>, MediaError> {
        self.fetches.lock().unwrap().push(id.to_string());
        self.files
            .get(id)
            .cloned()
            .ok_or_else(|| MediaError::Transport(format!("{} is unreachable", id)))
    }

    fn report_duplicate(&self, a: &str, b: &str) -> Result<(), MediaError> {
        if self.refuse_reports {
            return Err(MediaError::Status {
                endpoint: "report".to_string(),
                code: 503,
            });
        }
        self.reported
            .lock()
            .unwrap()
            .push((a.to_string(), b.to_string()));
        Ok(())
    }

    fn count_duplicates(&self) -> Result<u64, MediaError> {
        Ok(self.reported_pairs().len() as u64)
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub failures: Mutex<Vec<String>>,
}

impl FailureSink for MemorySink {
    fn record_failure(&self, id: &str, _reason: &str) {
        self.failures.lock().unwrap().push(id.to_string());
    }
}
