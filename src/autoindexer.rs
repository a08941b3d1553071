//! Watches a folder's working tree and submits debounced `Meta` updates
//! without anyone calling `Indexer::index_path` by hand (SPEC_FULL §4.6).
//!
//! Bridges `notify`'s synchronous callback into async the same way
//! `asuran::repository::backend::common::sync_backend` bridges a
//! synchronous backend into an async-facing handle: the callback only ever
//! pushes onto a channel, and a dedicated task owns everything else.
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lv_core::{MetaType, SignedMeta};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, instrument, trace, warn};
use walkdir::WalkDir;

use crate::config::FolderConfig;
use crate::index::{IndexError, IndexHandle, PutOutcome};
use crate::indexer::Indexer;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] lv_core::CryptoError),
    #[error(transparent)]
    Secret(#[from] lv_core::SecretError),
    #[error(transparent)]
    Meta(#[from] lv_core::MetaError),
    #[error(transparent)]
    Chunker(#[from] lv_chunker::ChunkerError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("filesystem watcher error")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, IndexerError>;

struct Shared {
    /// Paths modified since their last submission, mapped to when they
    /// become eligible for indexing. A path absent from this map is either
    /// clean or already submitted; presence is the only "dirty" state the
    /// drain loop needs to track.
    pending: Mutex<HashMap<String, Instant>>,
    /// Paths `FileAssembler` is currently writing to disk. Events against
    /// them are this process's own echo and must not re-trigger indexing.
    suppressed: Mutex<HashSet<String>>,
}

/// Debounces filesystem notifications into signed `Meta` submissions.
///
/// Only ever constructed for an `Owner`-level `Secret`: submitting a `Meta`
/// means signing it, and only `Owner` retains the signing key
/// (`Secret::derive` drops it at every lower level). `Folder::open` gates
/// construction on `secret.signing_key().is_ok()` rather than on a capability
/// comparison for exactly this reason.
pub struct AutoIndexer {
    shared: Arc<Shared>,
    open_path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl AutoIndexer {
    /// Starts watching `config.open_path` and spawns the debounce-drain
    /// task that submits settled paths through `indexer`/`index`.
    pub fn spawn(config: &FolderConfig, indexer: Arc<Indexer>, index: IndexHandle) -> Result<AutoIndexer> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            suppressed: Mutex::new(HashSet::new()),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&config.open_path, RecursiveMode::Recursive)?;

        let open_path = config.open_path.clone();
        let debounce = config.debounce;

        let event_shared = shared.clone();
        let event_open_path = open_path.clone();
        task::spawn(async move {
            while let Some(event) = rx.recv().await {
                for absolute in event.paths {
                    let relative = match absolute.strip_prefix(&event_open_path) {
                        Ok(relative) => relative,
                        Err(_) => continue,
                    };
                    let relative = relative.to_string_lossy().replace('\\', "/");
                    if relative.is_empty() {
                        continue;
                    }
                    if event_shared.suppressed.lock().unwrap().contains(&relative) {
                        trace!(path = relative, "suppressing self-triggered event");
                        continue;
                    }
                    let deadline = Instant::now() + debounce;
                    event_shared.pending.lock().unwrap().insert(relative, deadline);
                }
            }
        });

        let drain_shared = shared.clone();
        task::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            loop {
                ticker.tick().await;
                let ready: Vec<String> = {
                    let mut pending = drain_shared.pending.lock().unwrap();
                    let now = Instant::now();
                    let ready: Vec<String> = pending
                        .iter()
                        .filter_map(|(path, deadline)| if *deadline <= now { Some(path.clone()) } else { None })
                        .collect();
                    for path in &ready {
                        pending.remove(path);
                    }
                    ready
                };
                for relative_path in ready {
                    match indexer.index_path(&relative_path).await {
                        Ok(signed) => commit_local_meta(&index, &relative_path, signed).await,
                        Err(err) => warn!(path = relative_path, error = %err, "failed to index path"),
                    }
                }
            }
        });

        Ok(AutoIndexer {
            shared,
            open_path,
            _watcher: watcher,
        })
    }

    /// Suppresses auto-indexing of `relative_path` for `grace`, called by
    /// `FileAssembler` right before it writes so its own write doesn't loop
    /// back around as a self-triggered re-index (SPEC_FULL §4.7).
    pub fn prepare_assemble(&self, relative_path: &str, grace: Duration) {
        let relative_path = relative_path.to_string();
        self.shared.suppressed.lock().unwrap().insert(relative_path.clone());
        self.shared.pending.lock().unwrap().remove(&relative_path);

        let shared = self.shared.clone();
        task::spawn(async move {
            tokio::time::sleep(grace).await;
            shared.suppressed.lock().unwrap().remove(&relative_path);
        });
    }

    /// True once every path known to be dirty has settled and been
    /// submitted. Used by `Folder::is_indexing`.
    pub fn is_idle(&self) -> bool {
        self.shared.pending.lock().unwrap().is_empty()
    }

    /// Walks the working tree and marks every path immediately eligible for
    /// indexing, bypassing the debounce window (`Folder::trigger_full_rescan`).
    #[instrument(skip(self))]
    pub fn full_rescan(&self) {
        let open_path = self.open_path.clone();
        let shared = self.shared.clone();
        task::spawn_blocking(move || {
            let now = Instant::now();
            let mut pending = HashMap::new();
            for entry in WalkDir::new(&open_path).into_iter().filter_map(|entry| entry.ok()) {
                if entry.path() == open_path {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&open_path) {
                    Ok(relative) => relative,
                    Err(_) => continue,
                };
                pending.insert(relative.to_string_lossy().replace('\\', "/"), now);
            }
            shared.pending.lock().unwrap().extend(pending);
        });
    }
}

/// Commits a `Meta` this folder's own `Indexer` just derived from the live
/// working tree, and marks every chunk it carries as `assembled` — the
/// `Indexer` built that `FileMap` by reading the file's current bytes, so
/// the working copy already *is* the plaintext backing each chunk, with no
/// `FileAssembler` write needed to earn that flag (SPEC_FULL §4.3
/// invariant 4, §4.4's `OpenStorage`).
async fn commit_local_meta(index: &IndexHandle, relative_path: &str, signed: SignedMeta) {
    let path_id = signed.meta_unchecked().path_id;
    let chunk_hashes: Vec<_> = match &signed.meta_unchecked().meta_type {
        MetaType::File { chunks } => chunks.iter().map(|chunk| chunk.ciphertext_hash).collect(),
        _ => Vec::new(),
    };
    match index.put_meta(signed).await {
        Ok(PutOutcome::Applied) => {
            for hash in chunk_hashes {
                if let Err(err) = index.mark_assembled(path_id, hash, true).await {
                    warn!(path = relative_path, error = %err, "failed to mark locally indexed chunk assembled");
                }
            }
            debug!(path = relative_path, "auto-indexed");
        }
        Ok(PutOutcome::Stale) => {}
        Err(err) => warn!(path = relative_path, error = %err, "failed to commit auto-indexed meta"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lv_core::Secret;
    use std::time::Duration as StdDuration;

    fn config(open_path: PathBuf, debounce: StdDuration) -> FolderConfig {
        FolderConfig {
            debounce,
            ..FolderConfig::new(open_path, PathBuf::from("/tmp/unused-blocks"), PathBuf::from(":memory:"), Secret::generate())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_modified_file_is_indexed_after_the_debounce_window() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf(), StdDuration::from_millis(100));
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Arc::new(Indexer::new(&cfg, index.clone()));
        let auto = AutoIndexer::spawn(&cfg, indexer, index.clone()).unwrap();

        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();
        // Give notify a moment to deliver the create event.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!auto.is_idle());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(auto.is_idle());

        let path_id = lv_core::PathId::compute(&cfg.secret, "a.txt").unwrap();
        assert!(index.get_meta(path_id).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prepare_assemble_suppresses_the_next_event_for_that_path() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf(), StdDuration::from_millis(100));
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Arc::new(Indexer::new(&cfg, index.clone()));
        let auto = AutoIndexer::spawn(&cfg, indexer, index.clone()).unwrap();

        auto.prepare_assemble("b.txt", Duration::from_millis(500));
        tokio::fs::write(dir.path().join("b.txt"), b"assembled").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(auto.is_idle());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_rescan_marks_every_existing_path_dirty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("one.txt"), b"1").await.unwrap();
        tokio::fs::write(dir.path().join("two.txt"), b"2").await.unwrap();
        let cfg = config(dir.path().to_path_buf(), StdDuration::from_secs(60));
        let index = IndexHandle::open_in_memory().unwrap();
        let indexer = Arc::new(Indexer::new(&cfg, index.clone()));
        let auto = AutoIndexer::spawn(&cfg, indexer, index).unwrap();

        auto.full_rescan();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!auto.is_idle());
    }
}
