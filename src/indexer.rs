//! Turns one relative path into a signed [`Meta`] (SPEC_FULL §4.5): stats
//! the path, routes on its type, and for regular files runs content-defined
//! chunking against the previous `FileMap` (if any) so unchanged regions of
//! an edited file keep their prior `ciphertext_hash`/IV.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lv_chunker::{Chunker, FastCDC};
use lv_core::{Attributes, ChunkInfo, Meta, MetaType, PathId, Secret, SignedMeta};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::task;
use tracing::{debug, instrument, trace};

use crate::autoindexer::IndexerError;
use crate::config::FolderConfig;
use crate::index::IndexHandle;
use crate::pipeline::Pipeline;

type Result<T> = std::result::Result<T, IndexerError>;

/// Stat-derived routing for a path, resolved on a blocking thread before
/// any crypto or chunking work starts.
enum PathKind {
    File,
    Directory,
    Symlink(String),
    Missing,
}

/// Path → signed Meta. Holds no per-path state of its own; concurrency
/// across paths is whatever the caller (`AutoIndexer`'s debounce worker or
/// `Folder::trigger_full_rescan`) chooses to apply.
pub struct Indexer {
    secret: Arc<Secret>,
    open_path: PathBuf,
    chunker: FastCDC,
    pipeline: Pipeline,
    index: IndexHandle,
}

impl Indexer {
    pub fn new(config: &FolderConfig, index: IndexHandle) -> Indexer {
        Indexer {
            secret: Arc::new(config.secret.clone()),
            open_path: config.open_path.clone(),
            chunker: config.chunk_settings,
            pipeline: Pipeline::new(config.pipeline_workers),
            index,
        }
    }

    /// Indexes `relative_path`, producing a signed Meta. Does not commit it
    /// to the [`IndexHandle`] itself — the caller decides when to `put_meta`
    /// (`AutoIndexer`'s debounce worker does so immediately; a full rescan
    /// may want to batch).
    #[instrument(skip(self))]
    pub async fn index_path(&self, relative_path: &str) -> Result<SignedMeta> {
        let absolute = self.open_path.join(relative_path);
        let kind_and_attrs = stat_path(absolute.clone()).await?;

        let previous = self.index.get_meta(PathId::compute(&self.secret, relative_path)?).await.ok();
        let previous_chunks = previous
            .as_ref()
            .and_then(|signed| match &signed.meta_unchecked().meta_type {
                MetaType::File { chunks } => Some(chunks.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let (kind, attrs) = kind_and_attrs;
        let revision = attrs.mtime_ns;
        let meta_type = match kind {
            PathKind::Missing => {
                debug!(path = relative_path, "indexing deleted path");
                MetaType::Deleted
            }
            PathKind::Directory => MetaType::Directory,
            PathKind::Symlink(target) => {
                let mut target_iv = [0_u8; 16];
                OsRng.fill_bytes(&mut target_iv);
                let enc_target =
                    lv_core::crypto::aes_cbc_encrypt(self.secret.encryption_key()?, &target_iv, target.as_bytes())?;
                MetaType::Symlink { enc_target, target_iv }
            }
            PathKind::File => {
                let chunks = self.build_file_map(&absolute, previous_chunks).await?;
                MetaType::File { chunks }
            }
        };

        let revision = if matches!(meta_type, MetaType::Deleted) {
            now_ns()
        } else {
            revision
        };

        let meta = Meta::new(&self.secret, relative_path, revision, attrs, meta_type)?;
        Ok(meta.sign(&self.secret)?)
    }

    /// Builds the ordered `FileMap` for a regular file, reusing
    /// `ciphertext_hash`/IV from `previous_chunks` wherever a newly cut
    /// chunk's plaintext hash matches one already on record — SPEC_FULL
    /// §4.5's "IVs are sticky per chunk across updates" property.
    async fn build_file_map(&self, absolute: &std::path::Path, previous_chunks: Vec<ChunkInfo>) -> Result<Vec<ChunkInfo>> {
        let by_plaintext_hash: HashMap<[u8; 32], ChunkInfo> = previous_chunks
            .into_iter()
            .filter_map(|chunk| chunk.plaintext_hash.map(|hash| (hash, chunk)))
            .collect();

        let raw_chunks = self.read_chunks(absolute).await?;
        let mut chunks = Vec::with_capacity(raw_chunks.len());
        let encryption_key = *self.secret.encryption_key()?;

        for piece in raw_chunks {
            let plaintext_hash = lv_core::crypto::plaintext_hash(&encryption_key, &piece)?;
            let size = piece.len() as u64;
            if let Some(reused) = by_plaintext_hash.get(&plaintext_hash) {
                trace!(size, "reusing unchanged chunk");
                chunks.push(ChunkInfo {
                    ciphertext_hash: reused.ciphertext_hash,
                    plaintext_hash: Some(plaintext_hash),
                    size,
                    iv: reused.iv,
                });
            } else {
                let mut iv = [0_u8; 16];
                OsRng.fill_bytes(&mut iv);
                let digest = self.pipeline.digest(piece, encryption_key, iv).await?;
                trace!(size, "encrypted new chunk");
                chunks.push(ChunkInfo {
                    ciphertext_hash: digest.ciphertext_hash,
                    plaintext_hash: Some(digest.plaintext_hash),
                    size,
                    iv,
                });
            }
            // Yield between chunks so indexing a large file cannot starve
            // the internal lane (SPEC_FULL §5).
            task::yield_now().await;
        }
        Ok(chunks)
    }

    async fn read_chunks(&self, absolute: &std::path::Path) -> Result<Vec<Vec<u8>>> {
        let absolute = absolute.to_path_buf();
        let chunker = self.chunker;
        task::spawn_blocking(move || -> Result<Vec<Vec<u8>>> {
            let file = std::fs::File::open(&absolute)?;
            let mut pieces = Vec::new();
            for piece in chunker.chunk(file) {
                pieces.push(piece?);
            }
            Ok(pieces)
        })
        .await
        .expect("blocking chunk-read task panicked")
    }
}

async fn stat_path(absolute: PathBuf) -> Result<(PathKind, Attributes)> {
    task::spawn_blocking(move || -> std::io::Result<(PathKind, Attributes)> {
        let metadata = match std::fs::symlink_metadata(&absolute) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((PathKind::Missing, Attributes::default()));
            }
            Err(err) => return Err(err),
        };

        let file_type = metadata.file_type();
        let attrs = attributes_of(&metadata);

        if file_type.is_symlink() {
            let target = std::fs::read_link(&absolute)?;
            Ok((PathKind::Symlink(target.to_string_lossy().into_owned()), attrs))
        } else if file_type.is_dir() {
            Ok((PathKind::Directory, attrs))
        } else {
            Ok((PathKind::File, attrs))
        }
    })
    .await
    .expect("blocking stat task panicked")
    .map_err(IndexerError::from)
}

#[cfg(unix)]
fn attributes_of(metadata: &std::fs::Metadata) -> Attributes {
    use std::os::unix::fs::MetadataExt;
    Attributes {
        mode: metadata.mode(),
        windows_attrib: 0,
        mtime_ns: mtime_ns(metadata),
    }
}

#[cfg(not(unix))]
fn attributes_of(metadata: &std::fs::Metadata) -> Attributes {
    Attributes {
        mode: 0,
        windows_attrib: 0,
        mtime_ns: mtime_ns(metadata),
    }
}

fn mtime_ns(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as i64)
        .unwrap_or_else(now_ns)
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lv_core::SecretLevel;

    fn config(open_path: PathBuf) -> FolderConfig {
        FolderConfig::new(open_path, PathBuf::from("/tmp/unused-blocks"), PathBuf::from(":memory:"), Secret::generate())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn indexing_a_file_produces_a_file_meta_with_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("hello.txt"), b"hello\n").await.unwrap();
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Indexer::new(&config(dir.path().to_path_buf()), index);

        let signed = indexer.index_path("hello.txt").await.unwrap();
        let meta = signed.meta_unchecked();
        match &meta.meta_type {
            MetaType::File { chunks } => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(chunks[0].size, 6);
            }
            other => panic!("expected MetaType::File, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reindexing_an_unchanged_file_reuses_chunk_identity() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("hello.txt"), b"hello\n").await.unwrap();
        let cfg = config(dir.path().to_path_buf());
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Indexer::new(&cfg, index.clone());

        let first = indexer.index_path("hello.txt").await.unwrap();
        index.put_meta(first.clone()).await.unwrap();
        let second = indexer.index_path("hello.txt").await.unwrap();

        let first_chunks = match &first.meta_unchecked().meta_type {
            MetaType::File { chunks } => chunks.clone(),
            _ => panic!("expected file"),
        };
        let second_chunks = match &second.meta_unchecked().meta_type {
            MetaType::File { chunks } => chunks.clone(),
            _ => panic!("expected file"),
        };
        assert_eq!(first_chunks.len(), second_chunks.len());
        assert_eq!(first_chunks[0].ciphertext_hash, second_chunks[0].ciphertext_hash);
        assert_eq!(first_chunks[0].iv, second_chunks[0].iv);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn editing_the_middle_of_a_file_keeps_prefix_and_suffix_chunk_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FolderConfig {
            chunk_settings: lv_chunker::FastCDC {
                min_size: 64,
                avg_size: 128,
                max_size: 256,
            },
            ..config(dir.path().to_path_buf())
        };
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Indexer::new(&cfg, index.clone());

        let mut original = vec![0_u8; 4000];
        for (i, byte) in original.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        tokio::fs::write(dir.path().join("big.bin"), &original).await.unwrap();
        let before = indexer.index_path("big.bin").await.unwrap();
        index.put_meta(before.clone()).await.unwrap();

        let mut edited = original.clone();
        let midpoint = edited.len() / 2;
        edited.splice(midpoint..midpoint, vec![0xAB_u8; 30]);
        tokio::fs::write(dir.path().join("big.bin"), &edited).await.unwrap();
        let after = indexer.index_path("big.bin").await.unwrap();

        let before_chunks = match &before.meta_unchecked().meta_type {
            MetaType::File { chunks } => chunks.clone(),
            _ => panic!("expected file"),
        };
        let after_chunks = match &after.meta_unchecked().meta_type {
            MetaType::File { chunks } => chunks.clone(),
            _ => panic!("expected file"),
        };
        assert_eq!(before_chunks.first().unwrap().ciphertext_hash, after_chunks.first().unwrap().ciphertext_hash);
        assert_eq!(before_chunks.last().unwrap().ciphertext_hash, after_chunks.last().unwrap().ciphertext_hash);
        assert!(after_chunks.len() >= before_chunks.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_missing_path_indexes_as_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Indexer::new(&config(dir.path().to_path_buf()), index);
        let signed = indexer.index_path("ghost.txt").await.unwrap();
        assert!(matches!(signed.meta_unchecked().meta_type, MetaType::Deleted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_directory_indexes_with_no_file_map() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Indexer::new(&config(dir.path().to_path_buf()), index);
        let signed = indexer.index_path("sub").await.unwrap();
        assert!(matches!(signed.meta_unchecked().meta_type, MetaType::Directory));
    }

    #[test]
    fn readonly_secret_cannot_reach_encryption_key_for_indexing() {
        let owner = Secret::generate();
        let readonly = owner.derive(SecretLevel::ReadOnly).unwrap();
        assert!(readonly.encryption_key().is_ok());
        let download = owner.derive(SecretLevel::Download).unwrap();
        assert!(download.encryption_key().is_err());
    }
}
