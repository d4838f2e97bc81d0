//! vault-transport: client side of a vault
//!
//! [`VaultSession`] is what uploaders and the CLI talk to. It is implemented
//! in-process by [`LocalTransport`] and over a child process speaking the
//! vault protocol by [`AgentTransport`].

pub mod agent;
pub mod local;
pub mod restore;
pub mod uploader;

use async_trait::async_trait;
use bytes::Bytes;

use vault_core::cas::GcReport;
use vault_core::{
    BeginOutcome, ChunkReceipt, ConflictChoice, ContentHash, FileManifest, ManifestId,
    ResolveOutcome, Result, SessionId, SessionProgress, SyncEntry, UploadOutcome, UploadPlan,
    UsageReport,
};

pub use agent::AgentTransport;
pub use local::LocalTransport;
pub use restore::restore_file;
pub use uploader::{
    BackupReport, FileResult, NoopObserver, UploadObserver, UploadOptions, Uploader,
};

/// Operations a client can perform against a vault
#[async_trait]
pub trait VaultSession: Send + Sync {
    async fn begin_upload(&self, plan: UploadPlan) -> Result<BeginOutcome>;

    async fn wait_admitted(&self, session: SessionId) -> Result<()>;

    async fn send_chunk(
        &self,
        session: SessionId,
        hash: ContentHash,
        data: Bytes,
    ) -> Result<ChunkReceipt>;

    async fn complete_upload(&self, session: SessionId) -> Result<UploadOutcome>;

    async fn cancel_upload(&self, session: SessionId) -> Result<()>;

    async fn pause_upload(&self, session: SessionId) -> Result<()>;

    async fn resume_upload(&self, session: SessionId) -> Result<Vec<ContentHash>>;

    async fn missing_chunks(&self, session: SessionId) -> Result<Vec<ContentHash>>;

    async fn session_progress(&self, session: SessionId) -> Result<SessionProgress>;

    async fn get_entry(&self, path: &str) -> Result<SyncEntry>;

    async fn list_entries(&self, prefix: &str) -> Result<Vec<SyncEntry>>;

    async fn list_versions(&self, path: &str) -> Result<Vec<FileManifest>>;

    async fn read_manifest(&self, id: ManifestId) -> Result<FileManifest>;

    async fn read_chunk(&self, hash: ContentHash) -> Result<Bytes>;

    async fn list_conflicts(&self) -> Result<Vec<SyncEntry>>;

    async fn resolve_conflict(&self, path: &str, choice: ConflictChoice)
    -> Result<ResolveOutcome>;

    async fn delete_entry(&self, path: &str, base_version: Option<u64>) -> Result<SyncEntry>;

    async fn restore_version(&self, path: &str, manifest_id: ManifestId) -> Result<SyncEntry>;

    async fn rename_entry(&self, from: &str, to: &str) -> Result<SyncEntry>;

    async fn collect_garbage(&self) -> Result<GcReport>;

    async fn usage(&self) -> Result<UsageReport>;

    /// Close the session. Further calls fail.
    async fn shutdown(&self) -> Result<()>;
}
