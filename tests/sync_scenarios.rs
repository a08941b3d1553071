//! End-to-end scenarios exercising two [`Folder`]s that share a capability
//! token the way two peers holding the same [`lv_core::Secret`] would:
//! one folder observes the working tree through its own `AutoIndexer`, and
//! its `Meta`s/chunks are carried by hand to the other, standing in for the
//! peer transport this crate does not implement (SPEC_FULL §1).
use std::path::Path;
use std::time::Duration;

use lv_core::{Secret, SecretLevel};
use lv_sync::{Folder, FolderConfig};
use tempfile::TempDir;

/// Builds a `Folder` with a short debounce window, so these tests don't
/// have to wait out the production 5 second default.
async fn open_folder(open_path: &Path, secret: Secret) -> (Folder, TempDir) {
    let block_dir = tempfile::tempdir().unwrap();
    let config = FolderConfig {
        debounce: Duration::from_millis(50),
        ..FolderConfig::new(open_path.to_path_buf(), block_dir.path().to_path_buf(), Path::new(":memory:").to_path_buf(), secret)
    };
    (Folder::open(config).await.unwrap(), block_dir)
}

async fn wait_until_idle(folder: &Folder) {
    for _ in 0..100 {
        if !folder.is_indexing() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("folder never settled");
}

/// Carries every `Meta` and chunk `source` currently knows about over to
/// `dest`, standing in for the wire protocol two real peers would use.
async fn replicate(source: &Folder, dest: &Folder) {
    for signed in source.list_path_revisions(i64::MIN).await.unwrap() {
        let meta = signed.clone().verify(source.secret()).unwrap();
        let chunks = match &meta.meta_type {
            lv_core::MetaType::File { chunks } => chunks.clone(),
            _ => Vec::new(),
        };
        dest.submit_meta(signed).await.unwrap();
        for chunk in chunks {
            if dest.have_chunk(chunk.ciphertext_hash).await.unwrap() {
                continue;
            }
            let ciphertext = source.get_ciphertext(chunk.ciphertext_hash).await.unwrap();
            dest.put_ciphertext(chunk.ciphertext_hash, &ciphertext).await.unwrap();
        }
    }
}

/// S1/S5: a file created on an owner replica reaches a read-only replica
/// byte-for-byte once its Meta and chunks are carried across.
#[tokio::test(flavor = "multi_thread")]
async fn create_and_sync_to_a_readonly_replica() {
    let owner_secret = Secret::generate();
    let readonly_secret = owner_secret.derive(SecretLevel::ReadOnly).unwrap();

    let owner_dir = tempfile::tempdir().unwrap();
    let (owner, _owner_blocks) = open_folder(owner_dir.path(), owner_secret).await;

    tokio::fs::write(owner_dir.path().join("hello.txt"), b"hello\n").await.unwrap();
    owner.trigger_full_rescan().unwrap();
    wait_until_idle(&owner).await;

    let replica_dir = tempfile::tempdir().unwrap();
    let (replica, _replica_blocks) = open_folder(replica_dir.path(), readonly_secret).await;

    replicate(&owner, &replica).await;
    wait_until_idle(&replica).await;

    let synced = tokio::fs::read(replica_dir.path().join("hello.txt")).await.unwrap();
    assert_eq!(synced, b"hello\n");
}

/// S2: an edit in the middle of a synced file only needs its changed chunk
/// carried over — the prefix and suffix chunks the replica already has are
/// still addressed the same way.
#[tokio::test(flavor = "multi_thread")]
async fn editing_the_middle_of_a_synced_file_updates_the_replica() {
    let owner_secret = Secret::generate();
    let owner_dir = tempfile::tempdir().unwrap();
    let (owner, _owner_blocks) = open_folder(owner_dir.path(), owner_secret.clone()).await;

    let mut original = vec![0_u8; 4000];
    for (i, byte) in original.iter_mut().enumerate() {
        *byte = (i % 241) as u8;
    }
    tokio::fs::write(owner_dir.path().join("big.bin"), &original).await.unwrap();
    owner.trigger_full_rescan().unwrap();
    wait_until_idle(&owner).await;

    let replica_dir = tempfile::tempdir().unwrap();
    let (replica, _replica_blocks) = open_folder(replica_dir.path(), owner_secret.clone()).await;
    replicate(&owner, &replica).await;
    wait_until_idle(&replica).await;
    assert_eq!(tokio::fs::read(replica_dir.path().join("big.bin")).await.unwrap(), original);

    let mut edited = original.clone();
    let midpoint = edited.len() / 2;
    edited.splice(midpoint..midpoint, vec![0xCD_u8; 40]);
    tokio::fs::write(owner_dir.path().join("big.bin"), &edited).await.unwrap();
    owner.trigger_full_rescan().unwrap();
    wait_until_idle(&owner).await;

    replicate(&owner, &replica).await;
    wait_until_idle(&replica).await;
    assert_eq!(tokio::fs::read(replica_dir.path().join("big.bin")).await.unwrap(), edited);
}

/// S3: deleting a synced file propagates a `DELETED` Meta that removes the
/// replica's copy.
#[tokio::test(flavor = "multi_thread")]
async fn deleting_a_file_propagates_the_removal() {
    let owner_secret = Secret::generate();
    let owner_dir = tempfile::tempdir().unwrap();
    let (owner, _owner_blocks) = open_folder(owner_dir.path(), owner_secret.clone()).await;

    tokio::fs::write(owner_dir.path().join("gone.txt"), b"temporary").await.unwrap();
    owner.trigger_full_rescan().unwrap();
    wait_until_idle(&owner).await;

    let replica_dir = tempfile::tempdir().unwrap();
    let (replica, _replica_blocks) = open_folder(replica_dir.path(), owner_secret.clone()).await;
    replicate(&owner, &replica).await;
    wait_until_idle(&replica).await;
    assert!(replica_dir.path().join("gone.txt").exists());

    tokio::fs::remove_file(owner_dir.path().join("gone.txt")).await.unwrap();
    owner.trigger_full_rescan().unwrap();
    wait_until_idle(&owner).await;

    replicate(&owner, &replica).await;
    wait_until_idle(&replica).await;
    assert!(!replica_dir.path().join("gone.txt").exists());
}

/// S4: a submission whose revision is not strictly greater than the one on
/// record is silently ignored; the newer Meta remains authoritative.
#[tokio::test(flavor = "multi_thread")]
async fn a_stale_submission_does_not_displace_the_newer_meta() {
    let secret = Secret::generate();
    let dir = tempfile::tempdir().unwrap();
    let (folder, _blocks) = open_folder(dir.path(), secret.clone()).await;

    let fresh = lv_core::Meta::new(&secret, "note.txt", 10, lv_core::Attributes::default(), lv_core::MetaType::Directory)
        .unwrap()
        .sign(&secret)
        .unwrap();
    let path_id = fresh.meta_unchecked().path_id;
    folder.submit_meta(fresh).await.unwrap();

    let stale = lv_core::Meta::new(&secret, "note.txt", 3, lv_core::Attributes::default(), lv_core::MetaType::Directory)
        .unwrap()
        .sign(&secret)
        .unwrap();
    assert_eq!(folder.submit_meta(stale).await.unwrap(), lv_sync::index::PutOutcome::Stale);

    let current = folder.get_meta(path_id).await.unwrap();
    assert_eq!(current.meta_unchecked().revision, 10);
}

/// S6: ciphertext that does not hash to the address it is offered under is
/// rejected outright, never reaching `EncStorage`.
#[tokio::test(flavor = "multi_thread")]
async fn tampered_ciphertext_is_rejected_and_never_stored() {
    let secret = Secret::generate();
    let dir = tempfile::tempdir().unwrap();
    let (folder, _blocks) = open_folder(dir.path(), secret.clone()).await;

    tokio::fs::write(dir.path().join("a.txt"), b"real content").await.unwrap();
    folder.trigger_full_rescan().unwrap();
    wait_until_idle(&folder).await;

    let signed = folder
        .list_path_revisions(i64::MIN)
        .await
        .unwrap()
        .into_iter()
        .find(|s| matches!(s.meta_unchecked().meta_type, lv_core::MetaType::File { .. }))
        .unwrap();
    let meta = signed.verify(&secret).unwrap();
    let chunk = match meta.meta_type {
        lv_core::MetaType::File { chunks } => chunks.into_iter().next().unwrap(),
        _ => unreachable!(),
    };

    let result = folder.put_ciphertext(chunk.ciphertext_hash, b"not the right bytes at all").await;
    assert!(result.is_err());
    assert!(!folder.have_chunk(chunk.ciphertext_hash).await.unwrap());
}
