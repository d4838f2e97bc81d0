//! End-to-end tests against a real `vault-agent` child process

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use vault_core::chunker::chunk_bytes;
use vault_core::{
    BeginOutcome, ChunkConfig, CommitOutcome, ConflictChoice, ContentHash, EntryState, ErrorKind,
    UploadPlan, VaultError,
};
use vault_transport::{AgentTransport, UploadOptions, Uploader, VaultSession, restore_file};

fn launch(root: &Path) -> Arc<AgentTransport> {
    let agent = Path::new(env!("CARGO_BIN_EXE_vault-agent"));
    Arc::new(AgentTransport::launch(agent, root).unwrap())
}

fn options(device: &str, parallel_files: usize) -> UploadOptions {
    UploadOptions {
        chunking: ChunkConfig::fixed(256),
        device: device.into(),
        chunk_timeout: Duration::from_secs(10),
        max_retries: 2,
        parallel_files,
    }
}

#[tokio::test]
async fn test_backup_and_restore_through_agent() {
    let vault_dir = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let src = work.path().join("src");
    std::fs::create_dir_all(src.join("docs")).unwrap();
    std::fs::write(src.join("docs/readme.md"), "# readme\n".repeat(100)).unwrap();
    std::fs::write(src.join("config.toml"), "answer = 42\n").unwrap();

    let agent = launch(vault_dir.path());
    let uploader = Uploader::new(agent.clone(), options("laptop", 2));
    let report = uploader.backup_dir(&src, "/project").await.unwrap();
    assert_eq!(report.uploaded, 2);
    assert!(report.failed.is_empty());

    let entries = agent.list_entries("/project").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.state == EntryState::Synced));

    let out = work.path().join("restored.md");
    let written = restore_file(agent.as_ref(), "/project/docs/readme.md", None, &out)
        .await
        .unwrap();
    assert_eq!(written, 900);
    assert_eq!(
        std::fs::read(&out).unwrap(),
        std::fs::read(src.join("docs/readme.md")).unwrap()
    );

    let err = agent.get_entry("/project/nope").await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::Remote {
            kind: ErrorKind::NotFound,
            ..
        }
    ));

    agent.shutdown().await.unwrap();
    assert!(agent.list_entries("/").await.is_err());
}

#[tokio::test]
async fn test_queued_uploads_are_admitted_over_one_pipe() {
    let vault_dir = TempDir::new().unwrap();
    std::fs::write(
        vault_dir.path().join(".vault.toml"),
        "[transfer]\nmax_concurrent_sessions = 1\n",
    )
    .unwrap();
    let work = TempDir::new().unwrap();
    for i in 0..4 {
        std::fs::write(
            work.path().join(format!("file-{i}.bin")),
            vec![i as u8; 1000 + i * 10],
        )
        .unwrap();
    }

    let agent = launch(vault_dir.path());
    let uploader = Uploader::new(agent.clone(), options("desk", 4));
    let report = uploader.backup_dir(work.path(), "/").await.unwrap();
    assert_eq!(report.uploaded, 4, "failed: {:?}", report.failed);

    let usage = agent.usage().await.unwrap();
    assert_eq!(usage.entries, 4);
    assert_eq!(usage.sessions.active, 0);
    assert_eq!(usage.sessions.queued, 0);

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_conflict_resolution_through_agent() {
    let vault_dir = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let file = work.path().join("notes.txt");

    let agent = launch(vault_dir.path());
    let laptop = Uploader::new(agent.clone(), options("laptop", 1));
    std::fs::write(&file, "v1").unwrap();
    laptop.upload_file(&file, "/notes.txt").await.unwrap();
    std::fs::write(&file, "laptop v2").unwrap();
    laptop.upload_file(&file, "/notes.txt").await.unwrap();

    // the phone still believes v1 is current
    let data = b"phone edit based on v1";
    let chunks = chunk_bytes(data, &ChunkConfig::fixed(8)).unwrap();
    let plan = UploadPlan {
        path: "/notes.txt".into(),
        chunks: chunks.iter().map(|c| c.chunk).collect(),
        file_hash: ContentHash::from_bytes(data),
        total_size: data.len() as u64,
        device: "phone".into(),
        base_version: Some(1),
    };
    let BeginOutcome::Started(ticket) = agent.begin_upload(plan).await.unwrap() else {
        panic!("upload skipped");
    };
    for chunk in chunks {
        agent
            .send_chunk(ticket.session_id, chunk.chunk.hash, chunk.data)
            .await
            .unwrap();
    }
    let outcome = agent.complete_upload(ticket.session_id).await.unwrap();
    assert!(matches!(outcome.commit, CommitOutcome::Conflicted { version: 2, .. }));

    let conflicts = agent.list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict.as_ref().unwrap().device, "phone");

    let resolved = agent
        .resolve_conflict("/notes.txt", ConflictChoice::KeepBoth)
        .await
        .unwrap();
    let sibling = resolved.created.expect("keep-both creates a sibling");
    assert_eq!(sibling.path, "/notes (1).txt");
    assert_eq!(resolved.entry.state, EntryState::Synced);
    assert!(agent.list_conflicts().await.unwrap().is_empty());

    agent.shutdown().await.unwrap();
}
