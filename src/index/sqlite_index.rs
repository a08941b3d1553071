use std::collections::HashSet;
use std::path::Path;

use lv_core::{CiphertextHash, MetaType, PathId, SignedMeta};
use rusqlite::{params, Connection, OptionalExtension};

use super::{IndexError, Result};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS files (
    path_id      BLOB PRIMARY KEY,
    revision     INTEGER NOT NULL,
    signed_meta  BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    ciphertext_hash  BLOB PRIMARY KEY,
    size             INTEGER NOT NULL,
    iv               BLOB NOT NULL,
    in_enc_storage   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS openfs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id   BLOB NOT NULL REFERENCES chunks(ciphertext_hash) ON DELETE CASCADE,
    file_id    BLOB NOT NULL REFERENCES files(path_id) ON DELETE CASCADE,
    offset     INTEGER NOT NULL,
    assembled  INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS openfs_chunk_id_idx ON openfs(chunk_id);
CREATE INDEX IF NOT EXISTS openfs_file_id_idx ON openfs(file_id);

CREATE VIEW IF NOT EXISTS chunk_presence AS
SELECT
    c.ciphertext_hash AS ciphertext_hash,
    (c.in_enc_storage = 1
        OR EXISTS(SELECT 1 FROM openfs o WHERE o.chunk_id = c.ciphertext_hash AND o.assembled = 1)
    ) AS present,
    c.in_enc_storage AS in_enc_storage,
    EXISTS(SELECT 1 FROM openfs o WHERE o.chunk_id = c.ciphertext_hash AND o.assembled = 1) AS in_openfs
FROM chunks c;

CREATE TRIGGER IF NOT EXISTS openfs_cleanup_chunks AFTER DELETE ON openfs
BEGIN
    DELETE FROM chunks
    WHERE ciphertext_hash = OLD.chunk_id
      AND NOT EXISTS (SELECT 1 FROM openfs WHERE chunk_id = OLD.chunk_id);
END;
";

/// Presence of a chunk, as recorded by the index (SPEC_FULL §4.3 invariant 4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkPresence {
    Absent,
    InEncStorageOnly,
    InOpenStorageOnly,
    Both,
}

/// Outcome of a [`SqliteIndex::put_meta`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The submission replaced the prior Meta (or there was none).
    Applied,
    /// The submission's revision was not strictly greater than the stored one.
    Stale,
}

/// The synchronous SQLite-backed implementation. Not exposed directly;
/// always driven from the dedicated task owned by [`super::IndexHandle`].
pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    pub fn open(path: &Path) -> Result<SqliteIndex> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteIndex { conn })
    }

    pub fn open_in_memory() -> Result<SqliteIndex> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteIndex { conn })
    }

    /// Inserts or replaces the Meta for `signed.meta_unchecked().path_id`.
    ///
    /// `signed` must already have had its signature verified by the caller;
    /// the index itself holds no verifying key.
    pub fn put_meta(&mut self, signed: &SignedMeta) -> Result<PutOutcome> {
        let meta = signed.meta_unchecked();
        let path_id = meta.path_id.0.to_vec();
        let tx = self.conn.transaction()?;

        let existing_revision: Option<i64> = tx
            .query_row(
                "SELECT revision FROM files WHERE path_id = ?1",
                params![path_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(existing) = existing_revision {
            if meta.revision <= existing {
                return Ok(PutOutcome::Stale);
            }
        }

        // Capture which (chunk_id, offset) pairs were already assembled,
        // so an unchanged region of the file keeps its assembled flag
        // across a Meta replacement (SPEC_FULL §4.3 invariant 3/4).
        let mut previously_assembled: HashSet<(Vec<u8>, i64)> = HashSet::new();
        {
            let mut stmt = tx.prepare(
                "SELECT chunk_id, offset FROM openfs WHERE file_id = ?1 AND assembled = 1",
            )?;
            let rows = stmt.query_map(params![path_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                previously_assembled.insert(row?);
            }
        }

        // Deleting this file's openfs rows below can, via the cascade
        // trigger, drop a chunk's row entirely if this was its last
        // reference — even when the same chunk is about to be
        // re-referenced by the new FileMap. Remember which of those
        // chunks were `in_enc_storage` so that flag can be restored
        // after the new rows are inserted, instead of silently
        // resetting to 0 and losing track of a blob that is still on
        // disk in EncStorage.
        let mut previously_enc_stored: HashSet<Vec<u8>> = HashSet::new();
        if let MetaType::File { chunks } = &meta.meta_type {
            let mut stmt = tx.prepare("SELECT in_enc_storage FROM chunks WHERE ciphertext_hash = ?1")?;
            for chunk in chunks {
                let hash = chunk.ciphertext_hash.0.to_vec();
                let stored: Option<bool> = stmt.query_row(params![hash], |row| row.get(0)).optional()?;
                if stored == Some(true) {
                    previously_enc_stored.insert(hash);
                }
            }
        }

        tx.execute(
            "INSERT INTO files (path_id, revision, signed_meta)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(path_id) DO UPDATE SET
                revision = excluded.revision,
                signed_meta = excluded.signed_meta",
            params![path_id, meta.revision, signed.to_bytes()?],
        )?;

        // Replacing openfs rows: delete the old layout (cascades nothing
        // here, since chunks are cleaned up only once truly orphaned) and
        // insert the new one.
        tx.execute("DELETE FROM openfs WHERE file_id = ?1", params![path_id])?;

        if let MetaType::File { chunks } = &meta.meta_type {
            let mut offset: i64 = 0;
            for chunk in chunks {
                let hash = chunk.ciphertext_hash.0.to_vec();
                let restore_enc_stored = previously_enc_stored.contains(&hash);
                tx.execute(
                    "INSERT INTO chunks (ciphertext_hash, size, iv, in_enc_storage)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(ciphertext_hash) DO UPDATE SET
                        in_enc_storage = in_enc_storage OR excluded.in_enc_storage",
                    params![hash, chunk.size as i64, chunk.iv.to_vec(), restore_enc_stored as i64],
                )?;
                let assembled = previously_assembled.contains(&(hash.clone(), offset));
                tx.execute(
                    "INSERT INTO openfs (chunk_id, file_id, offset, assembled)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![hash, path_id, offset, assembled as i64],
                )?;
                offset += chunk.size as i64;
            }
        }

        tx.commit()?;
        Ok(PutOutcome::Applied)
    }

    pub fn get_meta(&mut self, path_id: PathId) -> Result<SignedMeta> {
        let bytes: Vec<u8> = self
            .conn
            .query_row(
                "SELECT signed_meta FROM files WHERE path_id = ?1",
                params![path_id.0.to_vec()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(IndexError::NotFound)?;
        Ok(SignedMeta::from_bytes(&bytes)?)
    }

    pub fn get_meta_since(&mut self, revision: i64) -> Result<Vec<SignedMeta>> {
        let mut stmt = self
            .conn
            .prepare("SELECT signed_meta FROM files WHERE revision > ?1 ORDER BY revision ASC")?;
        let rows = stmt.query_map(params![revision], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(SignedMeta::from_bytes(&row?)?);
        }
        Ok(out)
    }

    pub fn get_all_meta(&mut self) -> Result<Vec<SignedMeta>> {
        self.get_meta_since(i64::MIN)
    }

    pub fn chunk_presence(&mut self, hash: CiphertextHash) -> Result<ChunkPresence> {
        let row: Option<(bool, bool)> = self
            .conn
            .query_row(
                "SELECT in_enc_storage, in_openfs FROM chunk_presence WHERE ciphertext_hash = ?1",
                params![hash.0.to_vec()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            None => ChunkPresence::Absent,
            Some((true, true)) => ChunkPresence::Both,
            Some((true, false)) => ChunkPresence::InEncStorageOnly,
            Some((false, true)) => ChunkPresence::InOpenStorageOnly,
            Some((false, false)) => ChunkPresence::Absent,
        })
    }

    /// Chunks still missing for a path, preserving file offset order.
    pub fn missing_chunks(&mut self, path_id: PathId) -> Result<Vec<CiphertextHash>> {
        let mut stmt = self.conn.prepare(
            "SELECT o.chunk_id
             FROM openfs o
             JOIN chunk_presence p ON p.ciphertext_hash = o.chunk_id
             WHERE o.file_id = ?1 AND p.present = 0
             ORDER BY o.offset ASC",
        )?;
        let rows = stmt.query_map(params![path_id.0.to_vec()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            let bytes = row?;
            let mut hash = [0_u8; 32];
            hash.copy_from_slice(&bytes);
            out.push(CiphertextHash(hash));
        }
        Ok(out)
    }

    /// Marks a chunk already known to the index (from some `put_meta` call)
    /// as present in `EncStorage`.
    pub fn mark_enc_stored(&mut self, hash: CiphertextHash) -> Result<()> {
        self.conn.execute(
            "UPDATE chunks SET in_enc_storage = 1 WHERE ciphertext_hash = ?1",
            params![hash.0.to_vec()],
        )?;
        Ok(())
    }

    /// Clears the `in_enc_storage` flag, once GC has deleted the backing
    /// blob file because every reference to the chunk is now openfs-backed.
    pub fn unmark_enc_stored(&mut self, hash: CiphertextHash) -> Result<()> {
        self.conn.execute(
            "UPDATE chunks SET in_enc_storage = 0 WHERE ciphertext_hash = ?1",
            params![hash.0.to_vec()],
        )?;
        Ok(())
    }

    /// Chunks that are stored in `EncStorage` but whose every `openfs` row is
    /// `assembled = true` — the blob file is redundant with the working-tree
    /// copy and can be demoted (SPEC_FULL §4.4's GC demotion).
    pub fn demotable_chunks(&mut self) -> Result<Vec<CiphertextHash>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.ciphertext_hash
             FROM chunks c
             WHERE c.in_enc_storage = 1
               AND EXISTS (SELECT 1 FROM openfs o WHERE o.chunk_id = c.ciphertext_hash)
               AND NOT EXISTS (
                   SELECT 1 FROM openfs o WHERE o.chunk_id = c.ciphertext_hash AND o.assembled = 0
               )",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let bytes = row?;
            let mut hash = [0_u8; 32];
            hash.copy_from_slice(&bytes);
            out.push(CiphertextHash(hash));
        }
        Ok(out)
    }

    /// True iff no `chunks` row exists for `hash` — an `EncStorage` blob with
    /// no matching row is an orphan GC should delete (it belonged to a Meta
    /// that has since been replaced or deleted).
    pub fn is_orphaned(&mut self, hash: CiphertextHash) -> Result<bool> {
        Ok(!self.chunk_known(hash)?)
    }

    /// The recorded plaintext size and IV for a known chunk, independent of
    /// any particular file (every `ChunkInfo` sharing a `ciphertext_hash`
    /// was encrypted under the same IV, since the address is a hash of the
    /// resulting ciphertext).
    pub fn chunk_info(&mut self, hash: CiphertextHash) -> Result<Option<(u64, [u8; 16])>> {
        let row: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT size, iv FROM chunks WHERE ciphertext_hash = ?1",
                params![hash.0.to_vec()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(size, iv)| {
            let mut iv_arr = [0_u8; 16];
            iv_arr.copy_from_slice(&iv);
            (size as u64, iv_arr)
        }))
    }

    /// Returns true if a `chunks` row exists for `hash` (required before a
    /// peer may `put_ciphertext` for it — SPEC_FULL §4.4's `UnknownChunk`).
    pub fn chunk_known(&mut self, hash: CiphertextHash) -> Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM chunks WHERE ciphertext_hash = ?1",
                params![hash.0.to_vec()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Sets the `assembled` flag for every `openfs` row of `path_id` whose
    /// chunk is `hash`, after `FileAssembler` has written that chunk's
    /// plaintext into the working file.
    pub fn mark_assembled(&mut self, path_id: PathId, hash: CiphertextHash, assembled: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE openfs SET assembled = ?1 WHERE file_id = ?2 AND chunk_id = ?3",
            params![assembled as i64, path_id.0.to_vec(), hash.0.to_vec()],
        )?;
        Ok(())
    }

    /// The `(offset, size, iv)` of every `openfs` row for `path_id` whose
    /// chunk is `hash` and which is currently assembled — used by
    /// `OpenStorage` to locate the plaintext slice to re-encrypt.
    pub fn assembled_slice(&mut self, path_id: PathId, hash: CiphertextHash) -> Result<Option<(i64, i64, [u8; 16])>> {
        let row: Option<(i64, i64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT o.offset, c.size, c.iv
                 FROM openfs o JOIN chunks c ON c.ciphertext_hash = o.chunk_id
                 WHERE o.file_id = ?1 AND o.chunk_id = ?2 AND o.assembled = 1",
                params![path_id.0.to_vec(), hash.0.to_vec()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(offset, size, iv)| {
            let mut iv_arr = [0_u8; 16];
            iv_arr.copy_from_slice(&iv);
            (offset, size, iv_arr)
        }))
    }

    /// Any one `path_id` whose `openfs` rows reference `hash`, used to
    /// resolve a peer-facing, hash-only chunk lookup (SPEC_FULL §6's
    /// `have_chunk`/`get_ciphertext`) down to the `(path_id, hash)` pair
    /// `OpenStorage` needs. Several files can in principle share a chunk
    /// address; any one of them re-encrypts to the same ciphertext.
    pub fn chunk_owner(&mut self, hash: CiphertextHash) -> Result<Option<PathId>> {
        let row: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT file_id FROM openfs WHERE chunk_id = ?1 AND assembled = 1 LIMIT 1",
                params![hash.0.to_vec()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.map(|bytes| {
            let mut path_id = [0_u8; 28];
            path_id.copy_from_slice(&bytes);
            PathId(path_id)
        }))
    }

    /// Deletes the Meta for `path_id` outright (used once a `DELETED` Meta
    /// has been fully assembled and does not need to be retained).
    pub fn delete_meta(&mut self, path_id: PathId) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE path_id = ?1", params![path_id.0.to_vec()])?;
        Ok(())
    }
}
