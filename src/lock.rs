//! A sidecar lock file next to the index database, so a second daemon
//! cannot open the same folder out from under a running one (SPEC_FULL
//! §5: "a process-wide advisory lock on its database file prevents two
//! daemons from opening the same folder").
//!
//! Grounded on `asuran::repository::backend::common::files::LockedFile`'s
//! paired-lock-file discipline: a `.lock` sentinel created alongside the
//! real file, whose presence alone is the lock, removed on drop. SQLite's
//! own file locking already serializes concurrent *transactions*; this
//! guards the coarser-grained "two processes opened the same folder at
//! all" case that `rusqlite` does not.
use std::fs::{remove_file, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Held for the lifetime of an open [`crate::Folder`]; its `Drop` removes
/// the sentinel file so the folder can be reopened afterward.
#[derive(Debug)]
pub struct FolderLock {
    lock_path: PathBuf,
}

impl FolderLock {
    /// Creates `<db_path>.lock`, failing with `AlreadyExists` if another
    /// process already holds it.
    ///
    /// `db_path == ":memory:"` (an in-process test database with no file
    /// on disk) has nothing to lock against and is always granted.
    pub fn acquire(db_path: &Path) -> io::Result<FolderLock> {
        if db_path == Path::new(":memory:") {
            return Ok(FolderLock { lock_path: PathBuf::new() });
        }
        let lock_path = db_path.with_extension("lock");
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|err| {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{:?} is already locked by another process", db_path),
                    )
                } else {
                    err
                }
            })?;
        Ok(FolderLock { lock_path })
    }
}

impl Drop for FolderLock {
    fn drop(&mut self) {
        if self.lock_path.as_os_str().is_empty() {
            return;
        }
        if self.lock_path.exists() {
            let _ = remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_second_acquire_on_the_same_path_fails_while_the_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("folder.db");
        let first = FolderLock::acquire(&db_path).unwrap();
        assert!(FolderLock::acquire(&db_path).is_err());
        drop(first);
        assert!(FolderLock::acquire(&db_path).is_ok());
    }

    #[test]
    fn in_memory_databases_are_never_locked() {
        let memory = Path::new(":memory:");
        let _first = FolderLock::acquire(memory).unwrap();
        assert!(FolderLock::acquire(memory).is_ok());
    }
}
