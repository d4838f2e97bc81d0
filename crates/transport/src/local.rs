//! In-process transport
//!
//! Calls straight into a [`Vault`] opened in this process. Used by the CLI
//! for local vault roots and by tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use vault_core::cas::GcReport;
use vault_core::{
    BeginOutcome, ChunkReceipt, ConflictChoice, ContentHash, FileManifest, ManifestId,
    ResolveOutcome, Result, SessionId, SessionProgress, SyncEntry, UploadOutcome, UploadPlan,
    UsageReport, Vault, VaultError,
};

use crate::VaultSession;

pub struct LocalTransport {
    vault: Arc<Vault>,
    closed: AtomicBool,
}

impl LocalTransport {
    /// Open the vault at `root` in this process.
    ///
    /// # Errors
    /// Returns an error if the vault cannot be opened.
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(Vault::open(root)?)))
    }

    #[must_use]
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    fn vault_checked(&self) -> Result<&Vault> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session closed",
            )));
        }
        Ok(&self.vault)
    }
}

#[async_trait]
impl VaultSession for LocalTransport {
    async fn begin_upload(&self, plan: UploadPlan) -> Result<BeginOutcome> {
        self.vault_checked()?.begin_upload(plan).await
    }

    async fn wait_admitted(&self, session: SessionId) -> Result<()> {
        self.vault_checked()?.wait_admitted(session).await
    }

    async fn send_chunk(
        &self,
        session: SessionId,
        hash: ContentHash,
        data: Bytes,
    ) -> Result<ChunkReceipt> {
        self.vault_checked()?.send_chunk(session, hash, data).await
    }

    async fn complete_upload(&self, session: SessionId) -> Result<UploadOutcome> {
        self.vault_checked()?.complete_upload(session).await
    }

    async fn cancel_upload(&self, session: SessionId) -> Result<()> {
        self.vault_checked()?.cancel_upload(session).await
    }

    async fn pause_upload(&self, session: SessionId) -> Result<()> {
        self.vault_checked()?.pause_upload(session).await
    }

    async fn resume_upload(&self, session: SessionId) -> Result<Vec<ContentHash>> {
        self.vault_checked()?.resume_upload(session).await
    }

    async fn missing_chunks(&self, session: SessionId) -> Result<Vec<ContentHash>> {
        self.vault_checked()?.missing_chunks(session).await
    }

    async fn session_progress(&self, session: SessionId) -> Result<SessionProgress> {
        self.vault_checked()?.session_progress(session).await
    }

    async fn get_entry(&self, path: &str) -> Result<SyncEntry> {
        self.vault_checked()?.get_entry(path)
    }

    async fn list_entries(&self, prefix: &str) -> Result<Vec<SyncEntry>> {
        Ok(self.vault_checked()?.list_entries(prefix))
    }

    async fn list_versions(&self, path: &str) -> Result<Vec<FileManifest>> {
        self.vault_checked()?.list_versions(path)
    }

    async fn read_manifest(&self, id: ManifestId) -> Result<FileManifest> {
        self.vault_checked()?.read_manifest(&id)
    }

    async fn read_chunk(&self, hash: ContentHash) -> Result<Bytes> {
        self.vault_checked()?.read_chunk(&hash)
    }

    async fn list_conflicts(&self) -> Result<Vec<SyncEntry>> {
        Ok(self.vault_checked()?.list_conflicts())
    }

    async fn resolve_conflict(
        &self,
        path: &str,
        choice: ConflictChoice,
    ) -> Result<ResolveOutcome> {
        self.vault_checked()?.resolve_conflict(path, choice)
    }

    async fn delete_entry(&self, path: &str, base_version: Option<u64>) -> Result<SyncEntry> {
        self.vault_checked()?.delete_entry(path, base_version)
    }

    async fn restore_version(&self, path: &str, manifest_id: ManifestId) -> Result<SyncEntry> {
        self.vault_checked()?.restore_version(path, &manifest_id)
    }

    async fn rename_entry(&self, from: &str, to: &str) -> Result<SyncEntry> {
        self.vault_checked()?.rename_entry(from, to)
    }

    async fn collect_garbage(&self) -> Result<GcReport> {
        self.vault_checked()?.collect_garbage().await
    }

    async fn usage(&self) -> Result<UsageReport> {
        self.vault_checked()?.usage()
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vault_core::chunker::{ChunkConfig, chunk_bytes};

    #[tokio::test]
    async fn test_local_transport_upload_and_read() {
        let dir = TempDir::new().unwrap();
        let transport = LocalTransport::open(dir.path()).unwrap();

        let data = b"hello from the local transport".to_vec();
        let chunks = chunk_bytes(&data, &ChunkConfig::fixed(8)).unwrap();
        let plan = UploadPlan {
            path: "/hello.txt".into(),
            chunks: chunks.iter().map(|c| c.chunk).collect(),
            file_hash: ContentHash::from_bytes(&data),
            total_size: data.len() as u64,
            device: "test".into(),
            base_version: None,
        };

        let BeginOutcome::Started(ticket) = transport.begin_upload(plan).await.unwrap() else {
            panic!("skipped");
        };
        for chunk in &chunks {
            transport
                .send_chunk(ticket.session_id, chunk.chunk.hash, chunk.data.clone())
                .await
                .unwrap();
        }
        let outcome = transport.complete_upload(ticket.session_id).await.unwrap();

        let manifest = transport.read_manifest(outcome.manifest_id).await.unwrap();
        let first = transport.read_chunk(manifest.chunks[0].hash).await.unwrap();
        assert_eq!(&first[..], &data[..8]);
        assert_eq!(transport.list_entries("/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let dir = TempDir::new().unwrap();
        let transport = LocalTransport::open(dir.path()).unwrap();
        transport.shutdown().await.unwrap();
        assert!(transport.list_entries("/").await.is_err());
    }
}
