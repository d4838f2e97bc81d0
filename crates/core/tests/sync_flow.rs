//! Versioning, conflicts and maintenance through the vault facade

use std::sync::Arc;
use std::time::Duration;

use vault_core::chunker::{ChunkConfig, ChunkData, chunk_bytes};
use vault_core::config::{DuplicatePolicy, VaultConfig};
use vault_core::{
    BeginOutcome, CommitOutcome, ConflictChoice, ConflictPolicy, ContentHash, EntryState,
    ManualClock, UploadOutcome, UploadPlan, Vault, VaultError,
};

fn config() -> VaultConfig {
    let mut config = VaultConfig::default();
    config.store.chunk_map_size = 64 * 1024 * 1024;
    config.store.meta_map_size = 16 * 1024 * 1024;
    config
}

fn open(dir: &tempfile::TempDir, config: VaultConfig) -> (Vault, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let vault = Vault::open_with(dir.path(), config, clock.clone()).unwrap();
    (vault, clock)
}

fn plan(
    path: &str,
    data: &[u8],
    device: &str,
    base: Option<u64>,
) -> (UploadPlan, Vec<ChunkData>) {
    let chunks = chunk_bytes(data, &ChunkConfig::fixed(1024)).unwrap();
    let plan = UploadPlan {
        path: path.into(),
        chunks: chunks.iter().map(|c| c.chunk).collect(),
        file_hash: ContentHash::from_bytes(data),
        total_size: data.len() as u64,
        device: device.into(),
        base_version: base,
    };
    (plan, chunks)
}

async fn upload(
    vault: &Vault,
    path: &str,
    data: &[u8],
    device: &str,
    base: Option<u64>,
) -> UploadOutcome {
    let (plan, chunks) = plan(path, data, device, base);
    let BeginOutcome::Started(ticket) = vault.begin_upload(plan).await.unwrap() else {
        panic!("upload of {path} was skipped");
    };
    for hash in &ticket.missing {
        let chunk = chunks.iter().find(|c| c.chunk.hash == *hash).unwrap();
        vault
            .send_chunk(ticket.session_id, *hash, chunk.data.clone())
            .await
            .unwrap();
    }
    vault.complete_upload(ticket.session_id).await.unwrap()
}

/// Bring `/notes.txt` to version 3.
async fn notes_at_v3(vault: &Vault, clock: &ManualClock) {
    for (i, base) in [None, Some(1), Some(2)].into_iter().enumerate() {
        upload(vault, "/notes.txt", format!("draft {i}").as_bytes(), "desk", base).await;
        clock.advance(Duration::from_secs(60));
    }
    assert_eq!(vault.get_entry("/notes.txt").unwrap().version, 3);
}

#[tokio::test]
async fn test_stale_base_conflicts_then_keep_newer() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, clock) = open(&dir, config());
    notes_at_v3(&vault, &clock).await;

    let a = upload(&vault, "/notes.txt", b"from device A", "device-a", Some(3)).await;
    match a.commit {
        CommitOutcome::Synced { version, .. } => assert_eq!(version, 4),
        other => panic!("{other:?}"),
    }

    clock.advance(Duration::from_secs(5));
    let b = upload(&vault, "/notes.txt", b"from device B, later", "device-b", Some(3)).await;
    match &b.commit {
        CommitOutcome::Conflicted {
            version,
            resolution,
        } => {
            assert_eq!(*version, 4);
            assert!(resolution.is_none());
        }
        other => panic!("{other:?}"),
    }

    let entry = vault.get_entry("/notes.txt").unwrap();
    assert_eq!(entry.state, EntryState::Conflicted);
    assert_eq!(entry.current_manifest_id, a.manifest_id);
    assert_eq!(vault.list_conflicts().len(), 1);

    // Further commits wait for resolution
    let (blocked, chunks) = plan("/notes.txt", b"third", "device-c", Some(4));
    let BeginOutcome::Started(ticket) = vault.begin_upload(blocked).await.unwrap() else {
        panic!("skipped");
    };
    vault
        .send_chunk(ticket.session_id, chunks[0].chunk.hash, chunks[0].data.clone())
        .await
        .unwrap();
    let err = vault.complete_upload(ticket.session_id).await.unwrap_err();
    assert!(matches!(err, VaultError::Conflict { .. }), "{err}");

    let resolved = vault
        .resolve_conflict("/notes.txt", ConflictChoice::KeepNewer)
        .unwrap();
    assert_eq!(resolved.entry.version, 5);
    assert_eq!(resolved.entry.current_manifest_id, b.manifest_id);
    assert_eq!(resolved.entry.state, EntryState::Pending);
    assert!(resolved.entry.version_history.contains(&a.manifest_id));
    assert!(vault.list_conflicts().is_empty());

    assert!(matches!(
        vault.resolve_conflict("/notes.txt", ConflictChoice::KeepNewer),
        Err(VaultError::NotConflicted(_))
    ));

    // The held-back upload is stale now and becomes the next conflict
    let err = vault.complete_upload(ticket.session_id).await;
    match err {
        Ok(outcome) => assert!(matches!(outcome.commit, CommitOutcome::Conflicted { .. })),
        Err(e) => panic!("{e}"),
    }
}

#[tokio::test]
async fn test_keep_both_policy_creates_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.sync.conflict_policy = ConflictPolicy::KeepBoth;
    let (vault, clock) = open(&dir, config);
    notes_at_v3(&vault, &clock).await;

    upload(&vault, "/notes.txt", b"device A", "device-a", Some(3)).await;
    let b = upload(&vault, "/notes.txt", b"device B", "device-b", Some(3)).await;

    let CommitOutcome::Conflicted {
        resolution: Some(resolution),
        ..
    } = b.commit
    else {
        panic!("expected automatic resolution");
    };
    let sibling = resolution.created.unwrap();
    assert_eq!(sibling.path, "/notes (1).txt");
    assert_eq!(sibling.current_manifest_id, b.manifest_id);
    assert_eq!(vault.get_entry("/notes.txt").unwrap().version, 4);
    assert_eq!(vault.get_entry("/notes (1).txt").unwrap().version, 1);
}

#[tokio::test]
async fn test_duplicate_policies() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.sync.on_duplicate = DuplicatePolicy::Skip;
    let (vault, _clock) = open(&dir, config);

    upload(&vault, "/photo.jpg", b"original", "phone", None).await;
    let (again, _) = plan("/photo.jpg", b"other bytes", "tablet", None);
    assert_eq!(
        vault.begin_upload(again).await.unwrap(),
        BeginOutcome::Skipped {
            path: "/photo.jpg".into(),
            version: 1
        }
    );
    drop(vault);

    let mut config = self::config();
    config.sync.on_duplicate = DuplicatePolicy::KeepBoth;
    let (vault, _clock) = open(&dir, config);
    let outcome = upload(&vault, "/photo.jpg", b"other bytes", "tablet", None).await;
    assert_eq!(outcome.path, "/photo (1).jpg");
    assert_eq!(vault.list_entries("/").len(), 2);
}

#[tokio::test]
async fn test_history_restore_and_retention() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.sync.version_retention = vault_core::Retention::Keep(2);
    let (vault, _clock) = open(&dir, config);

    let mut ids = Vec::new();
    for v in 0..4u64 {
        let base = if v == 0 { None } else { Some(v) };
        let outcome = upload(&vault, "/log.txt", format!("rev {v}").as_bytes(), "desk", base).await;
        ids.push(outcome.manifest_id);
    }

    let entry = vault.get_entry("/log.txt").unwrap();
    assert_eq!(entry.version, 4);
    assert_eq!(entry.version_history, vec![ids[1], ids[2]]);
    // Pushed out of history: manifest is gone
    assert!(vault.read_manifest(&ids[0]).is_err());

    let versions = vault.list_versions("/log.txt").unwrap();
    let listed: Vec<_> = versions.iter().map(|m| m.id).collect();
    assert_eq!(listed, vec![ids[3], ids[2], ids[1]]);

    let restored = vault.restore_version("/log.txt", &ids[1]).unwrap();
    assert_eq!(restored.version, 5);
    assert_eq!(restored.current_manifest_id, ids[1]);

    let mut bytes = Vec::new();
    vault.assemble(&restored.current_manifest_id, &mut bytes).unwrap();
    assert_eq!(bytes, b"rev 1");
}

#[tokio::test]
async fn test_delete_rename_and_garbage_collection() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, clock) = open(&dir, config());

    let kept = upload(&vault, "/keep.txt", b"keep me around", "desk", None).await;
    let gone = upload(&vault, "/gone.txt", b"short lived", "desk", None).await;
    let gone_manifest = vault.read_manifest(&gone.manifest_id).unwrap();

    let renamed = vault.rename_entry("/keep.txt", "/kept.txt").unwrap();
    assert_eq!(renamed.path, "/kept.txt");
    assert!(vault.get_entry("/keep.txt").is_err());

    let deleted = vault.delete_entry("/gone.txt", Some(1)).unwrap();
    assert_eq!(deleted.state, EntryState::Deleted);
    assert!(vault.list_entries("/").iter().all(|e| e.path != "/gone.txt"));
    assert_eq!(vault.list_deleted().len(), 1);

    // Tombstone still young: nothing reclaimed
    let report = vault.collect_garbage().await.unwrap();
    assert_eq!(report.removed_chunks, 0);

    clock.advance(vault.config().sync.tombstone_retention() + Duration::from_secs(1));
    let report = vault.collect_garbage().await.unwrap();
    assert_eq!(report.removed_chunks, gone_manifest.unique_chunks().len() as u64);
    assert_eq!(report.reclaimed_bytes, 11);
    assert!(vault.list_deleted().is_empty());
    assert!(vault.read_manifest(&gone.manifest_id).is_err());

    let mut bytes = Vec::new();
    vault.assemble(&kept.manifest_id, &mut bytes).unwrap();
    assert_eq!(bytes, b"keep me around");
}

#[tokio::test]
async fn test_rename_refused_while_upload_targets_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());
    upload(&vault, "/a.txt", b"first", "desk", None).await;

    let (plan, _) = plan("/a.txt", b"second draft", "desk", Some(1));
    let BeginOutcome::Started(ticket) = vault.begin_upload(plan).await.unwrap() else {
        panic!("skipped");
    };
    assert_eq!(vault.get_entry("/a.txt").unwrap().state, EntryState::Pending);

    let err = vault.rename_entry("/a.txt", "/b.txt").unwrap_err();
    assert!(matches!(err, VaultError::Busy { .. }), "{err}");
    assert!(vault.get_entry("/b.txt").is_err());

    vault.cancel_upload(ticket.session_id).await.unwrap();
    let renamed = vault.rename_entry("/a.txt", "/b.txt").unwrap();
    assert_eq!(renamed.state, EntryState::Synced);
    let listed: Vec<_> = vault
        .list_entries("/")
        .into_iter()
        .map(|e| (e.path, e.state))
        .collect();
    assert_eq!(listed, vec![("/b.txt".to_string(), EntryState::Synced)]);
}

#[tokio::test]
async fn test_gc_compresses_old_versions() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let v1 = b"first draft of the quarterly report. ".repeat(100);
    let v2 = b"second draft, heavily revised. ".repeat(100);
    let first = upload(&vault, "/report.txt", &v1, "desk", None).await;
    upload(&vault, "/report.txt", &v2, "desk", Some(1)).await;
    let before = vault.usage().unwrap();
    let old_chunks = vault
        .read_manifest(&first.manifest_id)
        .unwrap()
        .unique_chunks()
        .len() as u64;

    let report = vault.collect_garbage().await.unwrap();
    assert_eq!(report.removed_chunks, 0);
    assert_eq!(report.packed_chunks, old_chunks);
    let after = vault.usage().unwrap();
    assert_eq!(after.packed_chunks, old_chunks);
    assert_eq!(after.stored_chunks, before.stored_chunks);
    assert!(after.stored_bytes < before.stored_bytes);

    let mut bytes = Vec::new();
    vault.assemble(&first.manifest_id, &mut bytes).unwrap();
    assert_eq!(bytes, v1);

    // Restored content is current again and comes back unpacked
    vault.restore_version("/report.txt", &first.manifest_id).unwrap();
    let report = vault.collect_garbage().await.unwrap();
    assert_eq!(report.unpacked_chunks, old_chunks);
    assert!(report.packed_chunks > 0);
}

#[tokio::test]
async fn test_gc_leaves_versions_raw_when_compression_off() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.sync.compress_versions = false;
    let (vault, _clock) = open(&dir, config);

    upload(&vault, "/log.txt", &b"line one\n".repeat(400), "desk", None).await;
    upload(&vault, "/log.txt", &b"line two\n".repeat(400), "desk", Some(1)).await;

    let report = vault.collect_garbage().await.unwrap();
    assert_eq!(report.packed_chunks, 0);
    assert_eq!(vault.usage().unwrap().packed_chunks, 0);
}

#[tokio::test]
async fn test_gc_spares_chunks_of_live_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let (plan, chunks) = plan("/inflight.bin", &[7u8; 3000], "desk", None);
    let BeginOutcome::Started(ticket) = vault.begin_upload(plan).await.unwrap() else {
        panic!("skipped");
    };
    vault
        .send_chunk(ticket.session_id, chunks[0].chunk.hash, chunks[0].data.clone())
        .await
        .unwrap();

    let report = vault.collect_garbage().await.unwrap();
    assert_eq!(report.removed_chunks, 0);
    assert!(vault.read_chunk(&chunks[0].chunk.hash).is_ok());
}

#[tokio::test]
async fn test_index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (vault, _clock) = open(&dir, config());
        upload(&vault, "/a/one.txt", b"one", "desk", None).await;
        upload(&vault, "/a/two.txt", b"two", "desk", None).await;
        upload(&vault, "/b/three.txt", b"three", "desk", None).await;
    }

    let (vault, _clock) = open(&dir, config());
    let under_a: Vec<_> = vault
        .list_entries("/a/")
        .into_iter()
        .map(|e| e.path)
        .collect();
    assert_eq!(under_a, vec!["/a/one.txt", "/a/two.txt"]);
    assert_eq!(vault.get_entry("/b/three.txt").unwrap().state, EntryState::Synced);
}
