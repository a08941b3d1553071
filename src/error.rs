//! Crate-level error type, composing every submodule's error the way
//! `asuran::repository::RepositoryError` composes `ChunkError`/`BackendError`.
use thiserror::Error;

use crate::index::IndexError;
use crate::storage::StorageError;
use crate::{assembler::AssembleError, autoindexer::IndexerError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Secret(#[from] lv_core::SecretError),
    #[error(transparent)]
    Meta(#[from] lv_core::MetaError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
