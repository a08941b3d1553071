//! The facade a caller outside this crate goes through (SPEC_FULL §6):
//! wires a [`FolderConfig`] into an [`IndexHandle`], a [`ChunkStorage`],
//! and — at `Owner` only — an [`Indexer`]/[`AutoIndexer`] pair, alongside
//! the [`FileAssembler`] every capability level gets.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lv_core::{CiphertextHash, PathId, SecretError, SignedMeta};
use tokio::task;
use tracing::{debug, instrument, warn};

use crate::assembler::{FileAssembler, ECHO_SUPPRESSION};
use crate::autoindexer::AutoIndexer;
use crate::config::FolderConfig;
use crate::error::{Result, SyncError};
use crate::index::{IndexHandle, PutOutcome};
use crate::indexer::Indexer;
use crate::lock::FolderLock;
use crate::storage::ChunkStorage;

/// How often `Folder::open` sweeps `ChunkStorage` for orphaned and
/// demotable blob files (SPEC_FULL §4.4's GC).
const GC_INTERVAL: Duration = Duration::from_secs(300);

/// One open sync folder.
///
/// `autoindexer` is `Some` only when `config.secret` retains its signing
/// key (`Owner` — see `Secret::derive` and `DESIGN.md`'s Open Question 3):
/// submitting a locally observed change means signing a `Meta`, which no
/// other capability level can do. Every level still gets a
/// [`FileAssembler`], since receiving and materializing synced files
/// requires no more than the verifying key every level holds.
pub struct Folder {
    config: FolderConfig,
    index: IndexHandle,
    storage: ChunkStorage,
    autoindexer: Option<Arc<AutoIndexer>>,
    assembler: Arc<FileAssembler>,
    _lock: FolderLock,
}

impl Folder {
    /// Opens (creating if absent) the index database named by
    /// `config.db_path`, and starts the background tasks this capability
    /// level is entitled to run.
    ///
    /// Fails if another process already holds `config.db_path`'s lock
    /// file, so two daemons never open the same folder at once.
    pub async fn open(config: FolderConfig) -> Result<Folder> {
        let lock = FolderLock::acquire(&config.db_path)?;

        let index = if config.db_path == Path::new(":memory:") {
            IndexHandle::open_in_memory()?
        } else {
            IndexHandle::open(config.db_path.clone())?
        };

        let secret = Arc::new(config.secret.clone());
        let storage = ChunkStorage::new(
            config.block_path.clone(),
            config.open_path.clone(),
            secret.clone(),
            index.clone(),
        );

        let autoindexer = if config.secret.signing_key().is_ok() {
            let indexer = Arc::new(Indexer::new(&config, index.clone()));
            Some(Arc::new(AutoIndexer::spawn(&config, indexer, index.clone())?))
        } else {
            None
        };

        let assembler = Arc::new(FileAssembler::spawn(&config, storage.clone(), index.clone(), autoindexer.clone()));

        let gc_storage = storage.clone();
        task::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it.
            loop {
                ticker.tick().await;
                match gc_storage.collect_garbage().await {
                    Ok(report) if report.orphans_deleted > 0 || report.demoted > 0 => {
                        debug!(?report, "chunk storage gc sweep");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "chunk storage gc sweep failed"),
                }
            }
        });

        Ok(Folder {
            config,
            index,
            storage,
            autoindexer,
            assembler,
            _lock: lock,
        })
    }

    /// This folder's capability token.
    pub fn secret(&self) -> &lv_core::Secret {
        &self.config.secret
    }

    /// True while a local scan is still debouncing changes or the
    /// assembler still has paths queued or waiting on missing chunks.
    pub fn is_indexing(&self) -> bool {
        let autoindexer_busy = match &self.autoindexer {
            Some(autoindexer) => !autoindexer.is_idle(),
            None => false,
        };
        autoindexer_busy || !self.assembler.is_idle()
    }

    /// Walks the working tree and re-submits every path, bypassing the
    /// debounce window. Requires the signing key (`Owner`).
    pub fn trigger_full_rescan(&self) -> Result<()> {
        match &self.autoindexer {
            Some(autoindexer) => {
                autoindexer.full_rescan();
                Ok(())
            }
            None => Err(SyncError::Secret(SecretError::CapabilityMissing)),
        }
    }

    /// Every `Meta` submitted after `since`, in ascending revision order.
    pub async fn list_path_revisions(&self, since: i64) -> Result<Vec<SignedMeta>> {
        Ok(self.index.get_meta_since(since).await?)
    }

    /// The current `Meta` for `path_id`, if this folder has one.
    pub async fn get_meta(&self, path_id: PathId) -> Result<SignedMeta> {
        Ok(self.index.get_meta(path_id).await?)
    }

    /// Accepts a `Meta` — from a peer or from this folder's own
    /// `AutoIndexer` — verifying its signature before trusting it, storing
    /// it, and queuing the path for assembly.
    #[instrument(skip(self, signed))]
    pub async fn submit_meta(&self, signed: SignedMeta) -> Result<PutOutcome> {
        let verified = signed.clone().verify(&self.config.secret)?;
        let path_id = verified.path_id;
        let outcome = self.index.put_meta(signed).await?;
        if outcome == PutOutcome::Applied {
            self.assembler.queue_assemble(path_id);
        }
        Ok(outcome)
    }

    /// Whether this folder can currently serve ciphertext for `hash`.
    pub async fn have_chunk(&self, hash: CiphertextHash) -> Result<bool> {
        Ok(self.storage.have_ciphertext(hash).await?)
    }

    /// Fetches the ciphertext for `hash`, for serving to a requesting peer.
    pub async fn get_ciphertext(&self, hash: CiphertextHash) -> Result<Vec<u8>> {
        Ok(self.storage.get_ciphertext(hash).await?)
    }

    /// Accepts ciphertext offered by a peer.
    pub async fn put_ciphertext(&self, hash: CiphertextHash, ciphertext: &[u8]) -> Result<()> {
        Ok(self.storage.put_chunk(hash, ciphertext).await?)
    }

    /// Queues `path_id` for (re-)assembly into the working tree, e.g. once
    /// enough of its chunks have arrived from peers.
    pub fn queue_assemble(&self, path_id: PathId) {
        self.assembler.queue_assemble(path_id);
    }

    /// Runs one `ChunkStorage` garbage-collection sweep immediately, rather
    /// than waiting for the periodic background sweep `Folder::open` already
    /// schedules every [`GC_INTERVAL`].
    pub async fn collect_garbage(&self) -> Result<crate::storage::GcReport> {
        Ok(self.storage.collect_garbage().await?)
    }

    /// Suppresses this folder's own `AutoIndexer` for `relative_path`, for
    /// a caller that is about to write to the working tree outside of
    /// `FileAssembler` itself (e.g. a control API applying a conflict
    /// resolution chosen by the user).
    pub fn prepare_assemble(&self, relative_path: &str) {
        if let Some(autoindexer) = &self.autoindexer {
            autoindexer.prepare_assemble(relative_path, ECHO_SUPPRESSION);
        }
    }
}
