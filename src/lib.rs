//! Near-duplicate video detection over a persistent VP-tree index.
//!
//! Files are listed and fetched from a [`media::MediaStore`], fingerprinted in
//! parallel, staged in a durable ingest queue and merged one at a time into a
//! vantage-point tree kept in the [`db::Catalog`]. The duplicate scanner then
//! walks the tree for every file whose neighbourhood has not yet been searched
//! at the current threshold and reports the pairs it finds back to the store.

pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod progress;

pub use error::{Error, Result};
