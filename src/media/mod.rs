//! Media libraries the deduplicator reads files from and reports pairs to.

pub mod directory;
pub mod hydrus;
mod tls;
#[cfg(test)]
pub(crate) mod memory;

pub use directory::DirectoryStore;
pub use hydrus::{HydrusClient, HydrusPageLogger};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("{endpoint} returned HTTP {code}")]
    Status { endpoint: String, code: u16 },

    #[error("Unexpected response from {endpoint}: {reason}")]
    Response { endpoint: String, reason: String },

    #[error("Unknown file {0}")]
    NotFound(String),

    #[error("Missing configuration: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Report error: {0}")]
    Report(#[from] csv::Error),
}

/// A library of media files addressed by stable content ids.
///
/// Every call may fail independently; callers isolate failures per file.
pub trait MediaStore: Send + Sync {
    /// Ids of every file matching `query`
    fn list_ids(&self, query: &[String]) -> Result<Vec<String>, MediaError>;

    /// Raw bytes of one file
    fn fetch(&self, id: &str) -> Result<Vec<u8>, MediaError>;

    /// Record that two files look like duplicates. Reporting the same pair
    /// twice, in either order, must be harmless.
    fn report_duplicate(&self, a: &str, b: &str) -> Result<(), MediaError>;

    /// Number of duplicate relationships the store currently knows about
    fn count_duplicates(&self) -> Result<u64, MediaError>;
}

/// Somewhere to surface files that could not be fingerprinted.
pub trait FailureSink: Send + Sync {
    fn record_failure(&self, id: &str, reason: &str);
}
