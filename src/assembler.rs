//! Materializes a `Meta` into the working tree (SPEC_FULL §4.7): decrypts
//! each chunk in turn into a temp file, renames it into place, applies
//! attributes, and marks the chunks it wrote as assembled so `OpenStorage`
//! can serve them back out again.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filetime::FileTime;
use lv_core::{CiphertextHash, MetaType, PathId, Secret};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, instrument, warn};

use crate::autoindexer::AutoIndexer;
use crate::config::FolderConfig;
use crate::index::{IndexError, IndexHandle};
use crate::storage::{ChunkStorage, StorageError};

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] lv_core::CryptoError),
    #[error(transparent)]
    Secret(#[from] lv_core::SecretError),
    #[error(transparent)]
    Meta(#[from] lv_core::MetaError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("not every chunk for this path is available locally yet")]
    Incomplete,
}

pub type Result<T> = std::result::Result<T, AssembleError>;

/// How long `FileAssembler` suppresses `AutoIndexer` on a path it just
/// wrote, covering the trailing notify event the write itself generates.
pub(crate) const ECHO_SUPPRESSION: Duration = Duration::from_secs(2);

/// Drains a queue of `PathId`s, materializing each into the working tree.
///
/// A path that fails with [`AssembleError::Incomplete`] (chunks still in
/// flight from a peer) stays pending and is retried on the next tick rather
/// than treated as an error.
pub struct FileAssembler {
    queue: mpsc::UnboundedSender<PathId>,
    pending: Arc<Mutex<Vec<PathId>>>,
}

impl FileAssembler {
    /// `autoindexer` is `None` at capability levels below `Owner`, where
    /// there is no local indexing to suppress an echo against — a peer
    /// receiving synced files still needs to materialize them.
    pub fn spawn(
        config: &FolderConfig,
        storage: ChunkStorage,
        index: IndexHandle,
        autoindexer: Option<Arc<AutoIndexer>>,
    ) -> FileAssembler {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathId>();
        let pending: Arc<Mutex<Vec<PathId>>> = Arc::new(Mutex::new(Vec::new()));
        let open_path = config.open_path.clone();
        let secret = Arc::new(config.secret.clone());

        let recv_pending = pending.clone();
        let recv_open_path = open_path.clone();
        let recv_secret = secret.clone();
        let recv_storage = storage.clone();
        let recv_index = index.clone();
        let recv_autoindexer = autoindexer.clone();
        task::spawn(async move {
            while let Some(path_id) = rx.recv().await {
                try_assemble(
                    &recv_open_path,
                    &recv_secret,
                    &recv_storage,
                    &recv_index,
                    &recv_autoindexer,
                    path_id,
                    &recv_pending,
                )
                .await;
            }
        });

        let retry_pending = pending.clone();
        task::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                let due: Vec<PathId> = retry_pending.lock().unwrap().clone();
                for path_id in due {
                    try_assemble(&open_path, &secret, &storage, &index, &autoindexer, path_id, &retry_pending).await;
                }
            }
        });

        FileAssembler { queue: tx, pending }
    }

    /// Enqueues `path_id` for immediate assembly.
    pub fn queue_assemble(&self, path_id: PathId) {
        let _ = self.queue.send(path_id);
    }

    /// True while any path is queued or waiting on missing chunks. Used by
    /// `Folder::is_indexing`-style readiness checks.
    pub fn is_idle(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

#[instrument(skip(open_path, secret, storage, index, autoindexer, pending))]
async fn try_assemble(
    open_path: &Path,
    secret: &Secret,
    storage: &ChunkStorage,
    index: &IndexHandle,
    autoindexer: &Option<Arc<AutoIndexer>>,
    path_id: PathId,
    pending: &Arc<Mutex<Vec<PathId>>>,
) {
    match assemble_one(open_path, secret, storage, index, autoindexer, path_id).await {
        Ok(()) => {
            pending.lock().unwrap().retain(|p| *p != path_id);
            debug!(path = %path_id.to_hex(), "assembled");
        }
        Err(AssembleError::Incomplete) => {
            let mut pending = pending.lock().unwrap();
            if !pending.contains(&path_id) {
                pending.push(path_id);
            }
        }
        Err(err) => {
            pending.lock().unwrap().retain(|p| *p != path_id);
            warn!(path = %path_id.to_hex(), error = %err, "failed to assemble path");
        }
    }
}

async fn assemble_one(
    open_path: &Path,
    secret: &Secret,
    storage: &ChunkStorage,
    index: &IndexHandle,
    autoindexer: &Option<Arc<AutoIndexer>>,
    path_id: PathId,
) -> Result<()> {
    let signed = index.get_meta(path_id).await?;
    let meta = signed.verify(secret)?;
    let relative_path = meta.decrypt_path(secret)?;
    let absolute = open_path.join(&relative_path);

    if let Some(autoindexer) = autoindexer {
        autoindexer.prepare_assemble(&relative_path, ECHO_SUPPRESSION);
    }

    match &meta.meta_type {
        MetaType::Deleted => remove_path(&absolute).await?,
        MetaType::Directory => {
            tokio::fs::create_dir_all(&absolute).await?;
            apply_attributes(&absolute, meta.attributes).await?;
        }
        MetaType::Symlink { enc_target, target_iv } => {
            let target = lv_core::crypto::aes_cbc_decrypt(secret.encryption_key()?, target_iv, enc_target)?;
            let target = String::from_utf8_lossy(&target).into_owned();
            if let Some(parent) = absolute.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            create_symlink(&absolute, &target).await?;
        }
        MetaType::File { chunks } => {
            // Check availability before touching disk, so a half-available
            // file never gets partially overwritten.
            for chunk in chunks {
                if !storage.have_chunk(path_id, chunk.ciphertext_hash).await? {
                    return Err(AssembleError::Incomplete);
                }
            }

            if let Some(parent) = absolute.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let temp_path = absolute.with_extension(format!(
                "lv-sync-tmp-{}",
                path_id.to_hex().get(..8).unwrap_or_default()
            ));
            {
                let mut file = tokio::fs::File::create(&temp_path).await?;
                for chunk in chunks {
                    let ciphertext = storage.get_chunk(path_id, chunk.ciphertext_hash).await?;
                    let plaintext = lv_core::crypto::aes_cbc_decrypt(secret.encryption_key()?, &chunk.iv, &ciphertext)?;
                    file.write_all(&plaintext).await?;
                }
                file.flush().await?;
                file.sync_all().await?;
            }
            tokio::fs::rename(&temp_path, &absolute).await?;
            apply_attributes(&absolute, meta.attributes).await?;

            for chunk in chunks {
                index.mark_assembled(path_id, chunk.ciphertext_hash, true).await?;
            }
        }
    }

    Ok(())
}

async fn remove_path(absolute: &Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(absolute).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(absolute).await?;
    } else {
        tokio::fs::remove_file(absolute).await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(absolute: &Path, target: &str) -> Result<()> {
    let _ = tokio::fs::remove_file(absolute).await;
    tokio::fs::symlink(target, absolute).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(absolute: &Path, target: &str) -> Result<()> {
    tokio::fs::write(absolute, target.as_bytes()).await?;
    Ok(())
}

#[cfg(unix)]
async fn apply_attributes(absolute: &Path, attributes: lv_core::Attributes) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let absolute = absolute.to_path_buf();
    task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::set_permissions(&absolute, std::fs::Permissions::from_mode(attributes.mode))?;
        let secs = attributes.mtime_ns.div_euclid(1_000_000_000);
        let nanos = attributes.mtime_ns.rem_euclid(1_000_000_000) as u32;
        filetime::set_file_mtime(&absolute, FileTime::from_unix_time(secs, nanos))?;
        Ok(())
    })
    .await
    .expect("blocking attribute-apply task panicked")
    .map_err(AssembleError::from)
}

#[cfg(not(unix))]
async fn apply_attributes(absolute: &Path, attributes: lv_core::Attributes) -> Result<()> {
    let absolute = absolute.to_path_buf();
    task::spawn_blocking(move || -> std::io::Result<()> {
        let secs = attributes.mtime_ns.div_euclid(1_000_000_000);
        let nanos = attributes.mtime_ns.rem_euclid(1_000_000_000) as u32;
        filetime::set_file_mtime(&absolute, FileTime::from_unix_time(secs, nanos))?;
        Ok(())
    })
    .await
    .expect("blocking attribute-apply task panicked")
    .map_err(AssembleError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lv_core::{Attributes, ChunkInfo, Meta, Secret};

    async fn harness(open_dir: &Path) -> (FolderConfig, ChunkStorage, IndexHandle, Arc<AutoIndexer>) {
        let block_dir = tempfile::tempdir().unwrap();
        let secret = Secret::generate();
        let config = FolderConfig::new(open_dir.to_path_buf(), block_dir.path().to_path_buf(), PathBuf::from(":memory:"), secret);
        let index = IndexHandle::open_in_memory().unwrap();
        let storage = ChunkStorage::new(
            config.block_path.clone(),
            config.open_path.clone(),
            Arc::new(config.secret.clone()),
            index.clone(),
        );
        let indexer = Arc::new(crate::indexer::Indexer::new(&config, index.clone()));
        let autoindexer = Arc::new(AutoIndexer::spawn(&config, indexer, index.clone()).unwrap());
        (config, storage, index, autoindexer)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_file_meta_with_all_chunks_available_is_written_to_disk() {
        let open_dir = tempfile::tempdir().unwrap();
        let (config, storage, index, autoindexer) = harness(open_dir.path()).await;
        let secret = &config.secret;

        let plaintext = b"hello, assembled file";
        let iv = [9_u8; 16];
        let ciphertext = lv_core::crypto::aes_cbc_encrypt(secret.encryption_key().unwrap(), &iv, plaintext).unwrap();
        let hash = CiphertextHash(lv_core::crypto::ciphertext_hash(&ciphertext));

        let meta = Meta::new(
            secret,
            "greeting.txt",
            1,
            Attributes {
                mode: 0o644,
                windows_attrib: 0,
                mtime_ns: 0,
            },
            MetaType::File {
                chunks: vec![ChunkInfo {
                    ciphertext_hash: hash,
                    plaintext_hash: None,
                    size: plaintext.len() as u64,
                    iv,
                }],
            },
        )
        .unwrap()
        .sign(secret)
        .unwrap();
        let path_id = meta.meta_unchecked().path_id;
        index.put_meta(meta).await.unwrap();
        storage.put_chunk(hash, &ciphertext).await.unwrap();

        let assembler = FileAssembler::spawn(&config, storage, index, Some(autoindexer));
        assembler.queue_assemble(path_id);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let written = tokio::fs::read(open_dir.path().join("greeting.txt")).await.unwrap();
        assert_eq!(written, plaintext);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_file_meta_missing_a_chunk_stays_pending_instead_of_erroring() {
        let open_dir = tempfile::tempdir().unwrap();
        let (config, storage, index, autoindexer) = harness(open_dir.path()).await;
        let secret = &config.secret;

        let hash = CiphertextHash([7_u8; 32]);
        let meta = Meta::new(
            secret,
            "missing.txt",
            1,
            Attributes::default(),
            MetaType::File {
                chunks: vec![ChunkInfo {
                    ciphertext_hash: hash,
                    plaintext_hash: None,
                    size: 4,
                    iv: [1_u8; 16],
                }],
            },
        )
        .unwrap()
        .sign(secret)
        .unwrap();
        let path_id = meta.meta_unchecked().path_id;
        index.put_meta(meta).await.unwrap();

        let assembler = FileAssembler::spawn(&config, storage, index, Some(autoindexer));
        assembler.queue_assemble(path_id);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!assembler.is_idle());
        assert!(!open_dir.path().join("missing.txt").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_deleted_meta_removes_an_existing_file() {
        let open_dir = tempfile::tempdir().unwrap();
        let (config, storage, index, autoindexer) = harness(open_dir.path()).await;
        let secret = &config.secret;
        tokio::fs::write(open_dir.path().join("gone.txt"), b"bye").await.unwrap();

        let meta = Meta::new(secret, "gone.txt", 1, Attributes::default(), MetaType::Deleted)
            .unwrap()
            .sign(secret)
            .unwrap();
        let path_id = meta.meta_unchecked().path_id;
        index.put_meta(meta).await.unwrap();

        let assembler = FileAssembler::spawn(&config, storage, index, Some(autoindexer));
        assembler.queue_assemble(path_id);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!open_dir.path().join("gone.txt").exists());
    }
}
