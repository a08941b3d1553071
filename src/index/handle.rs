//! Converts the synchronous [`SqliteIndex`] into an async, clonable handle
//! by moving it into a dedicated task and talking to it over a channel,
//! the same `BackendHandle<B: SyncBackend>` pattern
//! `asuran::repository::backend::common::sync_backend` uses to give a
//! single-threaded implementation a safe multi-caller async face.
use std::path::PathBuf;

use futures::channel::{mpsc, oneshot};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use lv_core::{CiphertextHash, PathId, SignedMeta};
use tokio::task;

use super::sqlite_index::{ChunkPresence, PutOutcome, SqliteIndex};
use super::{IndexError, Result};

enum Command {
    PutMeta(SignedMeta, oneshot::Sender<Result<PutOutcome>>),
    GetMeta(PathId, oneshot::Sender<Result<SignedMeta>>),
    GetMetaSince(i64, oneshot::Sender<Result<Vec<SignedMeta>>>),
    GetAllMeta(oneshot::Sender<Result<Vec<SignedMeta>>>),
    ChunkPresence(CiphertextHash, oneshot::Sender<Result<ChunkPresence>>),
    MissingChunks(PathId, oneshot::Sender<Result<Vec<CiphertextHash>>>),
    MarkEncStored(CiphertextHash, oneshot::Sender<Result<()>>),
    UnmarkEncStored(CiphertextHash, oneshot::Sender<Result<()>>),
    DemotableChunks(oneshot::Sender<Result<Vec<CiphertextHash>>>),
    IsOrphaned(CiphertextHash, oneshot::Sender<Result<bool>>),
    ChunkInfo(CiphertextHash, oneshot::Sender<Result<Option<(u64, [u8; 16])>>>),
    ChunkKnown(CiphertextHash, oneshot::Sender<Result<bool>>),
    MarkAssembled(PathId, CiphertextHash, bool, oneshot::Sender<Result<()>>),
    AssembledSlice(
        PathId,
        CiphertextHash,
        oneshot::Sender<Result<Option<(i64, i64, [u8; 16])>>>,
    ),
    ChunkOwner(CiphertextHash, oneshot::Sender<Result<Option<PathId>>>),
    DeleteMeta(PathId, oneshot::Sender<Result<()>>),
}

/// A clonable async handle over an embedded index database, backed by a
/// `rusqlite::Connection` owned by one dedicated task. SQLite access is
/// serialized on that task rather than behind a mutex, so every method
/// here is a round trip over a channel instead of a lock acquisition.
#[derive(Clone)]
pub struct IndexHandle {
    channel: mpsc::Sender<Command>,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IndexHandle")
    }
}

impl IndexHandle {
    /// Opens (creating if absent) the index database at `path` on a
    /// dedicated task and returns a handle to it.
    pub fn open(path: PathBuf) -> Result<IndexHandle> {
        let index = SqliteIndex::open(&path)?;
        Ok(IndexHandle::spawn(index))
    }

    /// An index that lives only for the lifetime of the process. Used by
    /// tests and by `Folder` configurations that do not need persistence.
    pub fn open_in_memory() -> Result<IndexHandle> {
        let index = SqliteIndex::open_in_memory()?;
        Ok(IndexHandle::spawn(index))
    }

    fn spawn(mut index: SqliteIndex) -> IndexHandle {
        let (input, mut output) = mpsc::channel(100);
        task::spawn(async move {
            while let Some(command) = output.next().await {
                task::block_in_place(|| match command {
                    Command::PutMeta(meta, ret) => {
                        let _ = ret.send(index.put_meta(&meta));
                    }
                    Command::GetMeta(path_id, ret) => {
                        let _ = ret.send(index.get_meta(path_id));
                    }
                    Command::GetMetaSince(revision, ret) => {
                        let _ = ret.send(index.get_meta_since(revision));
                    }
                    Command::GetAllMeta(ret) => {
                        let _ = ret.send(index.get_all_meta());
                    }
                    Command::ChunkPresence(hash, ret) => {
                        let _ = ret.send(index.chunk_presence(hash));
                    }
                    Command::MissingChunks(path_id, ret) => {
                        let _ = ret.send(index.missing_chunks(path_id));
                    }
                    Command::MarkEncStored(hash, ret) => {
                        let _ = ret.send(index.mark_enc_stored(hash));
                    }
                    Command::UnmarkEncStored(hash, ret) => {
                        let _ = ret.send(index.unmark_enc_stored(hash));
                    }
                    Command::DemotableChunks(ret) => {
                        let _ = ret.send(index.demotable_chunks());
                    }
                    Command::IsOrphaned(hash, ret) => {
                        let _ = ret.send(index.is_orphaned(hash));
                    }
                    Command::ChunkInfo(hash, ret) => {
                        let _ = ret.send(index.chunk_info(hash));
                    }
                    Command::ChunkKnown(hash, ret) => {
                        let _ = ret.send(index.chunk_known(hash));
                    }
                    Command::MarkAssembled(path_id, hash, assembled, ret) => {
                        let _ = ret.send(index.mark_assembled(path_id, hash, assembled));
                    }
                    Command::AssembledSlice(path_id, hash, ret) => {
                        let _ = ret.send(index.assembled_slice(path_id, hash));
                    }
                    Command::ChunkOwner(hash, ret) => {
                        let _ = ret.send(index.chunk_owner(hash));
                    }
                    Command::DeleteMeta(path_id, ret) => {
                        let _ = ret.send(index.delete_meta(path_id));
                    }
                });
            }
        });
        IndexHandle { channel: input }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (input, output) = oneshot::channel();
        self.channel
            .clone()
            .send(build(input))
            .await
            .map_err(|_| IndexError::ChannelClosed)?;
        output.await.map_err(|_| IndexError::ChannelClosed)?
    }

    pub async fn put_meta(&self, meta: SignedMeta) -> Result<PutOutcome> {
        self.call(|ret| Command::PutMeta(meta, ret)).await
    }

    pub async fn get_meta(&self, path_id: PathId) -> Result<SignedMeta> {
        self.call(|ret| Command::GetMeta(path_id, ret)).await
    }

    pub async fn get_meta_since(&self, revision: i64) -> Result<Vec<SignedMeta>> {
        self.call(|ret| Command::GetMetaSince(revision, ret)).await
    }

    pub async fn get_all_meta(&self) -> Result<Vec<SignedMeta>> {
        self.call(Command::GetAllMeta).await
    }

    pub async fn chunk_presence(&self, hash: CiphertextHash) -> Result<ChunkPresence> {
        self.call(|ret| Command::ChunkPresence(hash, ret)).await
    }

    pub async fn missing_chunks(&self, path_id: PathId) -> Result<Vec<CiphertextHash>> {
        self.call(|ret| Command::MissingChunks(path_id, ret)).await
    }

    pub async fn mark_enc_stored(&self, hash: CiphertextHash) -> Result<()> {
        self.call(|ret| Command::MarkEncStored(hash, ret)).await
    }

    pub async fn unmark_enc_stored(&self, hash: CiphertextHash) -> Result<()> {
        self.call(|ret| Command::UnmarkEncStored(hash, ret)).await
    }

    pub async fn demotable_chunks(&self) -> Result<Vec<CiphertextHash>> {
        self.call(Command::DemotableChunks).await
    }

    pub async fn is_orphaned(&self, hash: CiphertextHash) -> Result<bool> {
        self.call(|ret| Command::IsOrphaned(hash, ret)).await
    }

    pub async fn chunk_info(&self, hash: CiphertextHash) -> Result<Option<(u64, [u8; 16])>> {
        self.call(|ret| Command::ChunkInfo(hash, ret)).await
    }

    pub async fn chunk_known(&self, hash: CiphertextHash) -> Result<bool> {
        self.call(|ret| Command::ChunkKnown(hash, ret)).await
    }

    pub async fn mark_assembled(&self, path_id: PathId, hash: CiphertextHash, assembled: bool) -> Result<()> {
        self.call(|ret| Command::MarkAssembled(path_id, hash, assembled, ret)).await
    }

    pub async fn assembled_slice(
        &self,
        path_id: PathId,
        hash: CiphertextHash,
    ) -> Result<Option<(i64, i64, [u8; 16])>> {
        self.call(|ret| Command::AssembledSlice(path_id, hash, ret)).await
    }

    pub async fn chunk_owner(&self, hash: CiphertextHash) -> Result<Option<PathId>> {
        self.call(|ret| Command::ChunkOwner(hash, ret)).await
    }

    pub async fn delete_meta(&self, path_id: PathId) -> Result<()> {
        self.call(|ret| Command::DeleteMeta(path_id, ret)).await
    }
}
