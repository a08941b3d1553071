//! The embedded relational index (SPEC_FULL §4.3): signed Meta storage,
//! chunk bookkeeping, and the `openfs` placement table that records which
//! chunks are currently materialized in the user's working tree.
//!
//! The public surface is [`IndexHandle`], a clonable async handle over a
//! `rusqlite::Connection` owned by one dedicated task — the same
//! `BackendHandle`/`SyncBackend` pattern
//! `asuran::repository::backend::common::sync_backend` uses to give a
//! synchronous, not-meant-to-be-shared implementation a safe async face,
//! here applied so SQLite access is serialized on a single logical lane
//! per SPEC_FULL §5 instead of behind a mutex.
mod handle;
mod sqlite_index;

pub use handle::IndexHandle;
pub use sqlite_index::{ChunkPresence, PutOutcome};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Meta(#[from] lv_core::MetaError),
    #[error("no Meta stored for that path")]
    NotFound,
    #[error("index task is no longer running")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, IndexError>;
