//! The unified chunk address space (SPEC_FULL §4.4): every `ChunkInfo`
//! names a chunk by `ciphertext_hash`, and that single address may resolve
//! to an explicit encrypted blob in [`EncStorage`] or to a plaintext slice
//! of a materialized working-tree file that [`OpenStorage`] re-encrypts on
//! demand. [`ChunkStorage`] is the facade a caller goes through instead of
//! picking one or the other itself.
mod enc_storage;
mod open_storage;

pub use enc_storage::EncStorage;
pub use open_storage::OpenStorage;

use std::path::PathBuf;
use std::sync::Arc;

use lv_core::{CiphertextHash, PathId, Secret};
use thiserror::Error;
use tracing::debug;

use crate::index::{IndexError, IndexHandle};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] lv_core::CryptoError),
    #[error(transparent)]
    Secret(#[from] lv_core::SecretError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("a peer offered ciphertext for a chunk address this folder has not seen in any Meta")]
    UnknownChunk,
    #[error("the ciphertext a peer submitted did not hash to the address it was sent under")]
    HashMismatch,
    #[error("neither EncStorage nor a materialized working-tree copy could produce this chunk")]
    ChunkUnavailable,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Outcome of a [`ChunkStorage::collect_garbage`] sweep.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Blob files deleted because no `chunks` row referenced them any more.
    pub orphans_deleted: usize,
    /// Blob files deleted because every reference to that chunk is already
    /// materialized in the working tree (demoted to openfs-backed).
    pub demoted: usize,
}

/// Resolves chunk reads and writes across `EncStorage` and `OpenStorage`.
#[derive(Clone)]
pub struct ChunkStorage {
    enc: EncStorage,
    open: OpenStorage,
    index: IndexHandle,
    secret: Arc<Secret>,
}

impl ChunkStorage {
    pub fn new(block_path: PathBuf, open_path: PathBuf, secret: Arc<Secret>, index: IndexHandle) -> ChunkStorage {
        ChunkStorage {
            enc: EncStorage::new(block_path),
            open: OpenStorage::new(open_path, secret.clone(), index.clone()),
            index,
            secret,
        }
    }

    /// Fetches the ciphertext for `hash`, the chunk at `path_id`'s offset
    /// carrying that address. Tries the explicit blob store first, falling
    /// back to re-encrypting the working-tree copy.
    pub async fn get_chunk(&self, path_id: PathId, hash: CiphertextHash) -> Result<Vec<u8>> {
        if let Some(bytes) = self.enc.get(hash).await? {
            return Ok(bytes);
        }
        if let Some(bytes) = self.open.get(path_id, hash).await? {
            return Ok(bytes);
        }
        Err(StorageError::ChunkUnavailable)
    }

    /// Accepts ciphertext offered by a peer for `hash`, writing it into
    /// `EncStorage` once its content address and registration are verified.
    pub async fn put_chunk(&self, hash: CiphertextHash, ciphertext: &[u8]) -> Result<()> {
        if !self.index.chunk_known(hash).await? {
            return Err(StorageError::UnknownChunk);
        }
        if lv_core::crypto::ciphertext_hash(ciphertext) != hash.0 {
            return Err(StorageError::HashMismatch);
        }
        self.enc.put(hash, ciphertext).await?;
        self.index.mark_enc_stored(hash).await?;
        debug!(hash = %hash.to_hex(), bytes = ciphertext.len(), "chunk stored");
        Ok(())
    }

    /// True if `hash` can currently be served, through either storage.
    pub async fn have_chunk(&self, path_id: PathId, hash: CiphertextHash) -> Result<bool> {
        Ok(self.enc.exists(hash).await? || self.open.available(path_id, hash).await?)
    }

    /// Hash-only ciphertext fetch for the peer-facing surface of SPEC_FULL
    /// §6, which does not carry a `path_id`: falls back to the index to
    /// find some file whose working-tree copy can serve this address.
    pub async fn get_ciphertext(&self, hash: CiphertextHash) -> Result<Vec<u8>> {
        if let Some(bytes) = self.enc.get(hash).await? {
            return Ok(bytes);
        }
        if let Some(path_id) = self.index.chunk_owner(hash).await? {
            if let Some(bytes) = self.open.get(path_id, hash).await? {
                return Ok(bytes);
            }
        }
        Err(StorageError::ChunkUnavailable)
    }

    /// Hash-only presence check mirroring [`ChunkStorage::get_ciphertext`].
    pub async fn have_ciphertext(&self, hash: CiphertextHash) -> Result<bool> {
        if self.enc.exists(hash).await? {
            return Ok(true);
        }
        match self.index.chunk_owner(hash).await? {
            Some(path_id) => self.open.available(path_id, hash).await,
            None => Ok(false),
        }
    }

    /// Fetches and decrypts the plaintext for `hash`. Requires `ReadOnly`+
    /// (the secret's encryption key) — see SPEC_FULL §4.4.
    pub async fn get_plaintext(&self, hash: CiphertextHash) -> Result<Vec<u8>> {
        let ciphertext = self.get_ciphertext(hash).await?;
        let (_, iv) = self
            .index
            .chunk_info(hash)
            .await?
            .ok_or(StorageError::UnknownChunk)?;
        Ok(lv_core::crypto::aes_cbc_decrypt(self.secret.encryption_key()?, &iv, &ciphertext)?)
    }

    /// Sweeps `EncStorage` (SPEC_FULL §4.4's GC): deletes blob files that no
    /// longer correspond to any `chunks` row (the Meta that introduced them
    /// was replaced or deleted), and demotes blob files whose chunk is fully
    /// materialized in the working tree, freeing the redundant copy.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let mut report = GcReport::default();

        for hash in self.enc.list_hashes().await? {
            if self.index.is_orphaned(hash).await? {
                self.enc.delete(hash).await?;
                report.orphans_deleted += 1;
            }
        }

        for hash in self.index.demotable_chunks().await? {
            self.enc.delete(hash).await?;
            self.index.unmark_enc_stored(hash).await?;
            report.demoted += 1;
        }

        if report.orphans_deleted > 0 || report.demoted > 0 {
            debug!(
                orphans_deleted = report.orphans_deleted,
                demoted = report.demoted,
                "chunk storage garbage collection"
            );
        }
        Ok(report)
    }
}
