use thiserror::Error;

use crate::fingerprint::HashError;
use crate::media::MediaError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Catalog error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Media store error: {0}")]
    Media(#[from] MediaError),

    #[error("Fingerprint error: {0}")]
    Hash(#[from] HashError),

    #[error("Catalog schema version {found} is newer than the newest supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
