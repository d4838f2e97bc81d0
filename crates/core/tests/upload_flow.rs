//! End-to-end upload flows through the vault facade

use std::sync::Arc;
use std::time::Duration;

use vault_core::chunker::{ChunkConfig, ChunkData, chunk_bytes};
use vault_core::config::VaultConfig;
use vault_core::{
    Admission, BeginOutcome, CommitOutcome, ContentHash, ErrorKind, ManualClock, ReceiptStatus,
    SessionStatus, UploadOutcome, UploadPlan, UploadTicket, Vault, VaultError,
};

const MIB: usize = 1024 * 1024;

fn config() -> VaultConfig {
    let mut config = VaultConfig::default();
    config.store.chunk_map_size = 256 * MIB;
    config.store.meta_map_size = 32 * MIB;
    config
}

fn open(dir: &tempfile::TempDir, config: VaultConfig) -> (Vault, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let vault = Vault::open_with(dir.path(), config, clock.clone()).unwrap();
    (vault, clock)
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed.wrapping_mul(31))
        .collect()
}

fn plan(path: &str, data: &[u8], chunk_size: u32, base: Option<u64>) -> (UploadPlan, Vec<ChunkData>) {
    let chunks = chunk_bytes(data, &ChunkConfig::fixed(chunk_size)).unwrap();
    let plan = UploadPlan {
        path: path.into(),
        chunks: chunks.iter().map(|c| c.chunk).collect(),
        file_hash: ContentHash::from_bytes(data),
        total_size: data.len() as u64,
        device: "laptop".into(),
        base_version: base,
    };
    (plan, chunks)
}

async fn begin(vault: &Vault, plan: UploadPlan) -> UploadTicket {
    match vault.begin_upload(plan).await.unwrap() {
        BeginOutcome::Started(ticket) => ticket,
        other => panic!("expected a started session, got {other:?}"),
    }
}

async fn send_missing(vault: &Vault, ticket: &UploadTicket, chunks: &[ChunkData]) {
    for hash in &ticket.missing {
        let chunk = chunks.iter().find(|c| c.chunk.hash == *hash).unwrap();
        vault
            .send_chunk(ticket.session_id, *hash, chunk.data.clone())
            .await
            .unwrap();
    }
}

async fn upload(vault: &Vault, plan: UploadPlan, chunks: &[ChunkData]) -> UploadOutcome {
    let ticket = begin(vault, plan).await;
    send_missing(vault, &ticket, chunks).await;
    vault.complete_upload(ticket.session_id).await.unwrap()
}

fn synced_version(outcome: &UploadOutcome) -> u64 {
    match &outcome.commit {
        CommitOutcome::Synced { version, .. } => *version,
        other => panic!("expected synced commit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_report_upload_then_dedup_reupload() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let data = patterned(10 * MIB, 1);
    let (first_plan, chunks) = plan("/docs/report.pdf", &data, 4 * MIB as u32, None);
    let lengths: Vec<u32> = first_plan.chunks.iter().map(|c| c.length).collect();
    assert_eq!(lengths, vec![4 * MIB as u32, 4 * MIB as u32, 2 * MIB as u32]);

    let ticket = begin(&vault, first_plan).await;
    assert_eq!(ticket.admission, Admission::Admitted);
    assert_eq!(ticket.missing.len(), 3);
    send_missing(&vault, &ticket, &chunks).await;

    let outcome = vault.complete_upload(ticket.session_id).await.unwrap();
    assert_eq!(synced_version(&outcome), 1);

    let entry = vault.get_entry("/docs/report.pdf").unwrap();
    assert_eq!(entry.version, 1);
    assert_eq!(entry.current_manifest_id, outcome.manifest_id);

    // Same bytes again: nothing to transfer, new version on top
    let (second_plan, _) = plan("/docs/report.pdf", &data, 4 * MIB as u32, None);
    let ticket = begin(&vault, second_plan).await;
    assert!(ticket.missing.is_empty());
    let outcome = vault.complete_upload(ticket.session_id).await.unwrap();
    assert_eq!(synced_version(&outcome), 2);

    let usage = vault.usage().unwrap();
    assert_eq!(usage.stored_chunks, 3);
    assert_eq!(usage.stored_bytes, 10 * MIB as u64);
    assert_eq!(usage.versions, 2);

    let mut restored = Vec::new();
    let written = vault.assemble(&outcome.manifest_id, &mut restored).unwrap();
    assert_eq!(written, data.len() as u64);
    assert_eq!(restored, data);
}

#[tokio::test]
async fn test_complete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let data = patterned(9000, 2);
    let (plan, chunks) = plan("/a.bin", &data, 4096, None);
    let ticket = begin(&vault, plan).await;
    send_missing(&vault, &ticket, &chunks).await;

    let first = vault.complete_upload(ticket.session_id).await.unwrap();
    let second = vault.complete_upload(ticket.session_id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(vault.get_entry("/a.bin").unwrap().version, 1);
}

#[tokio::test]
async fn test_empty_file_upload() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let (plan, _) = plan("/empty.txt", b"", 4096, None);
    assert!(plan.chunks.is_empty());
    let ticket = begin(&vault, plan).await;
    assert!(ticket.missing.is_empty());

    let outcome = vault.complete_upload(ticket.session_id).await.unwrap();
    let manifest = vault.read_manifest(&outcome.manifest_id).unwrap();
    assert_eq!(manifest.total_size, 0);
    assert!(manifest.chunks.is_empty());
}

#[tokio::test]
async fn test_pause_resume_yields_same_manifest_content() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let data = patterned(12_000, 3);
    let (plan, chunks) = plan("/paused.bin", &data, 4096, None);
    let expected_chunks = plan.chunks.clone();
    let ticket = begin(&vault, plan).await;
    assert_eq!(ticket.missing.len(), 3);

    let first = &chunks[0];
    vault
        .send_chunk(ticket.session_id, first.chunk.hash, first.data.clone())
        .await
        .unwrap();
    vault.pause_upload(ticket.session_id).await.unwrap();

    let second = &chunks[1];
    let err = vault
        .send_chunk(ticket.session_id, second.chunk.hash, second.data.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::SessionNotAccepting { .. }), "{err}");

    let missing = vault.resume_upload(ticket.session_id).await.unwrap();
    assert_eq!(missing, vec![chunks[1].chunk.hash, chunks[2].chunk.hash]);
    for chunk in &chunks[1..] {
        vault
            .send_chunk(ticket.session_id, chunk.chunk.hash, chunk.data.clone())
            .await
            .unwrap();
    }

    let outcome = vault.complete_upload(ticket.session_id).await.unwrap();
    let manifest = vault.read_manifest(&outcome.manifest_id).unwrap();
    assert_eq!(manifest.chunks, expected_chunks);
    assert_eq!(manifest.file_hash, ContentHash::from_bytes(&data));
}

#[tokio::test]
async fn test_corrupt_chunk_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let data = patterned(5000, 4);
    let (plan, chunks) = plan("/retry.bin", &data, 4096, None);
    let ticket = begin(&vault, plan).await;

    let mut corrupt = chunks[0].data.to_vec();
    corrupt[10] ^= 0xFF;
    let err = vault
        .send_chunk(ticket.session_id, chunks[0].chunk.hash, corrupt.into())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HashMismatch);
    assert!(err.is_retryable());

    let receipt = vault
        .send_chunk(ticket.session_id, chunks[0].chunk.hash, chunks[0].data.clone())
        .await
        .unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Committed);
    assert_eq!(receipt.remaining, 1);
}

#[tokio::test]
async fn test_integrity_failure_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let data = patterned(8192, 5);
    let (mut plan, chunks) = plan("/broken.bin", &data, 4096, None);
    plan.file_hash = ContentHash::from_bytes(b"not this file");
    let ticket = begin(&vault, plan).await;
    send_missing(&vault, &ticket, &chunks).await;

    let err = vault.complete_upload(ticket.session_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);

    assert!(matches!(
        vault.get_entry("/broken.bin"),
        Err(VaultError::EntryNotFound(_))
    ));
    assert!(matches!(
        vault.session_progress(ticket.session_id).await,
        Err(VaultError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_incomplete_upload_cannot_complete() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let data = patterned(8192, 6);
    let (plan, chunks) = plan("/partial.bin", &data, 4096, None);
    let ticket = begin(&vault, plan).await;
    vault
        .send_chunk(ticket.session_id, chunks[0].chunk.hash, chunks[0].data.clone())
        .await
        .unwrap();

    let err = vault.complete_upload(ticket.session_id).await.unwrap_err();
    assert!(matches!(err, VaultError::UploadIncomplete { missing: 1, .. }), "{err}");

    let progress = vault.session_progress(ticket.session_id).await.unwrap();
    assert_eq!(progress.status, SessionStatus::Transferring);
    assert_eq!(progress.committed_chunks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_share_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());
    let vault = Arc::new(vault);

    let data = patterned(32_768, 7);
    let mut uploads = tokio::task::JoinSet::new();
    for copy in 0..4 {
        let vault = vault.clone();
        let (plan, chunks) = plan(&format!("/copy-{copy}.bin"), &data, 4096, None);
        uploads.spawn(async move {
            let ticket = begin(&vault, plan).await;
            send_missing(&vault, &ticket, &chunks).await;
            vault.complete_upload(ticket.session_id).await.unwrap()
        });
    }

    let mut manifests = std::collections::HashSet::new();
    while let Some(outcome) = uploads.join_next().await {
        let outcome = outcome.unwrap();
        assert_eq!(synced_version(&outcome), 1);
        manifests.insert(outcome.manifest_id);
    }
    assert_eq!(manifests.len(), 4);

    let usage = vault.usage().unwrap();
    assert_eq!(usage.entries, 4);
    assert_eq!(usage.stored_chunks, 8);
    assert_eq!(usage.stored_bytes, 32_768);
    assert_eq!(usage.logical_bytes, 4 * 32_768);
}

#[tokio::test]
async fn test_scheduler_limits_and_promotes_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.transfer.max_concurrent_sessions = 2;
    config.transfer.max_queue_depth = 1;
    let (vault, _clock) = open(&dir, config);

    let mut tickets = Vec::new();
    let mut all_chunks = Vec::new();
    for i in 0..3u8 {
        let data = patterned(4096, 10 + i);
        let (plan, chunks) = plan(&format!("/q/{i}.bin"), &data, 4096, None);
        tickets.push(begin(&vault, plan).await);
        all_chunks.push(chunks);
    }
    assert_eq!(tickets[0].admission, Admission::Admitted);
    assert_eq!(tickets[1].admission, Admission::Admitted);
    assert_eq!(tickets[2].admission, Admission::Queued { position: 0 });

    let (overflow, _) = plan("/q/overflow.bin", b"x", 4096, None);
    let err = vault.begin_upload(overflow).await.unwrap_err();
    assert!(matches!(err, VaultError::QueueFull { .. }), "{err}");
    assert!(err.is_retryable());

    let queued = &tickets[2];
    let err = vault
        .send_chunk(
            queued.session_id,
            all_chunks[2][0].chunk.hash,
            all_chunks[2][0].data.clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::NotAdmitted(_)), "{err}");

    send_missing(&vault, &tickets[0], &all_chunks[0]).await;
    vault.complete_upload(tickets[0].session_id).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(1),
        vault.wait_admitted(queued.session_id),
    )
    .await
    .unwrap()
    .unwrap();
    send_missing(&vault, queued, &all_chunks[2]).await;
    vault.complete_upload(queued.session_id).await.unwrap();
}

#[tokio::test]
async fn test_cancel_keeps_committed_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (vault, _clock) = open(&dir, config());

    let data = patterned(8192, 8);
    let (first_plan, chunks) = plan("/cancel.bin", &data, 4096, None);
    let ticket = begin(&vault, first_plan).await;
    vault
        .send_chunk(ticket.session_id, chunks[0].chunk.hash, chunks[0].data.clone())
        .await
        .unwrap();
    vault.cancel_upload(ticket.session_id).await.unwrap();

    assert!(vault.get_entry("/cancel.bin").is_err());
    assert!(vault.read_chunk(&chunks[0].chunk.hash).is_ok());

    let (retry_plan, _) = plan("/cancel.bin", &data, 4096, None);
    let retry = begin(&vault, retry_plan).await;
    assert_eq!(retry.missing, vec![chunks[1].chunk.hash]);
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(12_288, 9);
    let (plan, chunks) = plan("/resume.bin", &data, 4096, None);

    let session_id = {
        let (vault, _clock) = open(&dir, config());
        let ticket = begin(&vault, plan).await;
        vault
            .send_chunk(ticket.session_id, chunks[0].chunk.hash, chunks[0].data.clone())
            .await
            .unwrap();
        ticket.session_id
    };

    let (vault, _clock) = open(&dir, config());
    let missing = vault.missing_chunks(session_id).await.unwrap();
    assert_eq!(missing, vec![chunks[1].chunk.hash, chunks[2].chunk.hash]);

    for chunk in &chunks[1..] {
        vault
            .send_chunk(session_id, chunk.chunk.hash, chunk.data.clone())
            .await
            .unwrap();
    }
    let outcome = vault.complete_upload(session_id).await.unwrap();
    assert_eq!(synced_version(&outcome), 1);

    drop(vault);
    let (vault, _clock) = open(&dir, config());
    assert_eq!(vault.get_entry("/resume.bin").unwrap().version, 1);
    assert!(vault.session_progress(session_id).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_are_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.transfer.idle_timeout_secs = 30;
    let (vault, _clock) = open(&dir, config);

    let (plan, chunks) = plan("/idle.bin", &patterned(100, 1), 4096, None);
    let ticket = begin(&vault, plan).await;

    assert!(vault.reap_idle().is_empty());
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(vault.reap_idle(), vec![ticket.session_id]);
    assert_eq!(vault.usage().unwrap().sessions.active, 0);

    let err = vault
        .send_chunk(ticket.session_id, chunks[0].chunk.hash, chunks[0].data.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionTimeout);
    let err = vault.complete_upload(ticket.session_id).await.unwrap_err();
    assert!(matches!(err, VaultError::SessionTimeout(id) if id == ticket.session_id));
    let err = vault.session_progress(ticket.session_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionTimeout);
}
