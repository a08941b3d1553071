//! Re-encrypts plaintext slices of the user's own working tree on demand,
//! so a chunk that has been materialized by [`crate::assembler::FileAssembler`]
//! but never explicitly exported to `EncStorage` can still be served at its
//! `ciphertext_hash` address (SPEC_FULL §4.4).
use std::path::PathBuf;
use std::sync::Arc;

use lv_core::{CiphertextHash, PathId, Secret};
use tokio::fs;
use tokio::task;

use super::Result;
use crate::index::IndexHandle;

#[derive(Clone)]
pub struct OpenStorage {
    root: PathBuf,
    secret: Arc<Secret>,
    index: IndexHandle,
}

impl OpenStorage {
    pub fn new(root: PathBuf, secret: Arc<Secret>, index: IndexHandle) -> OpenStorage {
        OpenStorage { root, secret, index }
    }

    /// Re-encrypts the plaintext slice backing `hash` at `path_id`, if the
    /// index believes that slice is currently materialized and its content
    /// still hashes to `hash`. Returns `Ok(None)` rather than an error when
    /// the working file has since changed out from under it — the caller
    /// falls back to treating the chunk as unavailable.
    pub async fn get(&self, path_id: PathId, hash: CiphertextHash) -> Result<Option<Vec<u8>>> {
        let slice = match self.index.assembled_slice(path_id, hash).await? {
            Some(slice) => slice,
            None => return Ok(None),
        };
        let (offset, size, iv) = slice;

        let relative_path = match self.relative_path(path_id).await? {
            Some(path) => path,
            None => return Ok(None),
        };

        let plaintext = match self.read_slice(&relative_path, offset, size).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let ciphertext = lv_core::crypto::aes_cbc_encrypt(self.secret.encryption_key()?, &iv, &plaintext)?;
        if lv_core::crypto::ciphertext_hash(&ciphertext) != hash.0 {
            // The working copy has drifted from the Meta this index entry
            // describes. `Indexer` will pick the change up and update the
            // index; until then this chunk cannot be served from here.
            return Ok(None);
        }
        Ok(Some(ciphertext))
    }

    pub async fn available(&self, path_id: PathId, hash: CiphertextHash) -> Result<bool> {
        Ok(self.index.assembled_slice(path_id, hash).await?.is_some())
    }

    async fn relative_path(&self, path_id: PathId) -> Result<Option<String>> {
        let signed = match self.index.get_meta(path_id).await {
            Ok(signed) => signed,
            Err(_) => return Ok(None),
        };
        Ok(signed.meta_unchecked().decrypt_path(&self.secret).ok())
    }

    async fn read_slice(&self, relative_path: &str, offset: i64, size: u64) -> Result<Option<Vec<u8>>> {
        use std::io::{Read, Seek, SeekFrom};

        let full_path = self.root.join(relative_path);
        if fs::metadata(&full_path).await.is_err() {
            return Ok(None);
        }
        let result = task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut file = std::fs::File::open(&full_path)?;
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = vec![0_u8; size as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
        .expect("blocking read task panicked");
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
