//! The configuration descriptor a [`crate::Folder`] is opened with.
//!
//! Mirrors the teacher's convention (`Repository::new`/`MultiFile::open_defaults`
//! taking their settings by value at construction) rather than reading from
//! any process-global configuration singleton.
use std::path::PathBuf;
use std::time::Duration;

use lv_chunker::FastCDC;
use lv_core::Secret;

/// Settings a [`crate::Folder`] is opened with.
#[derive(Clone, Debug)]
pub struct FolderConfig {
    /// Root of the user-visible synchronized tree.
    pub open_path: PathBuf,
    /// Directory holding base32-named ciphertext blob files.
    pub block_path: PathBuf,
    /// Path to the embedded relational index database file.
    pub db_path: PathBuf,
    /// This folder's capability token.
    pub secret: Secret,
    /// How long a path must go unmodified before the `AutoIndexer` submits it.
    pub debounce: Duration,
    /// Content-defined chunking parameters.
    pub chunk_settings: FastCDC,
    /// Size of the worker pool backing the `Indexer`'s per-chunk crypto/hash work.
    pub pipeline_workers: usize,
}

impl FolderConfig {
    /// Convenience constructor with the defaults used throughout this
    /// crate's tests: a 5 second debounce window (SPEC_FULL §4.6) and one
    /// pipeline worker per physical core.
    pub fn new(open_path: impl Into<PathBuf>, block_path: impl Into<PathBuf>, db_path: impl Into<PathBuf>, secret: Secret) -> FolderConfig {
        FolderConfig {
            open_path: open_path.into(),
            block_path: block_path.into(),
            db_path: db_path.into(),
            secret,
            debounce: Duration::from_secs(5),
            chunk_settings: FastCDC::default(),
            pipeline_workers: num_cpus::get_physical().max(1),
        }
    }
}
