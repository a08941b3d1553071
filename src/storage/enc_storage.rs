//! Explicit ciphertext blob storage: one file per chunk, named by the
//! base32 encoding of its `ciphertext_hash`, written atomically.
//!
//! The write discipline (stage into a sibling file, `fsync`, then `rename`
//! into place) is the same durability guarantee
//! `asuran/src/repository/backend/common/files.rs`'s `LockedFile` gives the
//! teacher's index/manifest files, adapted here for content-addressed blobs
//! that never need an exclusive lock (a given address is only ever written
//! once, since it names its own content).
use std::path::{Path, PathBuf};

use lv_core::CiphertextHash;
use tokio::fs;
use tokio::task;

use super::Result;

#[derive(Clone)]
pub struct EncStorage {
    root: PathBuf,
}

impl EncStorage {
    pub fn new(root: PathBuf) -> EncStorage {
        EncStorage { root }
    }

    fn blob_path(&self, hash: CiphertextHash) -> PathBuf {
        self.root.join(base32_name(hash))
    }

    pub async fn exists(&self, hash: CiphertextHash) -> Result<bool> {
        Ok(fs::metadata(self.blob_path(hash)).await.is_ok())
    }

    pub async fn get(&self, hash: CiphertextHash) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(hash)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `ciphertext` under `hash`, staging it in a `.part` sibling
    /// file and renaming it into place only after the contents have hit
    /// disk. A crash mid-write leaves only an orphaned `.part` file behind,
    /// never a truncated blob at the real path.
    pub async fn put(&self, hash: CiphertextHash, ciphertext: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let final_path = self.blob_path(hash);
        let part_path = final_path.with_extension("part");
        let data = ciphertext.to_vec();
        let part_path_blocking = part_path.clone();
        task::spawn_blocking(move || write_and_fsync(&part_path_blocking, &data))
            .await
            .expect("blocking write task panicked")?;
        fs::rename(&part_path, &final_path).await?;
        Ok(())
    }

    pub async fn delete(&self, hash: CiphertextHash) -> Result<()> {
        match fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Every `ciphertext_hash` currently backed by a blob file here, for the
    /// GC sweep in [`super::ChunkStorage::collect_garbage`]. Filenames that
    /// do not decode to a 32-byte hash (e.g. a leftover `.part` from a crash
    /// mid-write) are skipped rather than treated as an error.
    pub async fn list_hashes(&self) -> Result<Vec<CiphertextHash>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut hashes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(hash) = decode_base32_name(name) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }
}

fn decode_base32_name(name: &str) -> Option<CiphertextHash> {
    let bytes = base32::decode(base32::Alphabet::Crockford, name)?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0_u8; 32];
    hash.copy_from_slice(&bytes);
    Some(CiphertextHash(hash))
}

fn write_and_fsync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn base32_name(hash: CiphertextHash) -> String {
    base32::encode(base32::Alphabet::Crockford, &hash.0)
}
