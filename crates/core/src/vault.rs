//! The vault: one root directory holding chunks, manifests, sessions and the index
//!
//! Every external operation (upload intent, listing, conflicts, maintenance)
//! goes through [`Vault`].

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cas::{ChunkStore, GcReport};
use crate::checkpoint::CheckpointStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{DuplicatePolicy, VaultConfig};
use crate::conflict::ConflictChoice;
use crate::error::{Result, VaultError};
use crate::hash::{ContentHash, FileHasher};
use crate::manifest::{FileManifest, ManifestId, ManifestStore};
use crate::scheduler::{Admission, SchedulerStats, TransferScheduler};
use crate::session::{
    ChunkReceipt, SessionId, SessionProgress, SessionStatus, UploadOutcome, UploadPlan,
    UploadSession,
};
use crate::sync_index::{CommitOutcome, EntryState, ResolveOutcome, SyncEntry, SyncIndex};

const CHUNKS_DIR: &str = "chunks";
const MANIFESTS_DIR: &str = "manifests";
const SESSIONS_DIR: &str = "sessions";

/// Monotonic time that follows tokio's clock, so paused-time tests apply.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Handed back when an upload session starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTicket {
    pub session_id: SessionId,
    /// Path the upload will commit to; differs from the plan under keep-both
    pub path: String,
    pub admission: Admission,
    /// Chunks the client still has to send, in plan order
    pub missing: Vec<ContentHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum BeginOutcome {
    Started(UploadTicket),
    /// The path exists and duplicates are skipped
    Skipped { path: String, version: u64 },
}

/// Storage accounting across the whole vault
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub entries: usize,
    pub deleted_entries: usize,
    pub conflicted_entries: usize,
    /// Current plus historical versions
    pub versions: usize,
    /// Sum of current file sizes
    pub logical_bytes: u64,
    pub stored_chunks: u64,
    /// Bytes actually on disk after deduplication
    pub stored_bytes: u64,
    /// Stored chunks kept compressed because only old versions use them
    pub packed_chunks: u64,
    pub sessions: SchedulerStats,
}

pub struct Vault {
    root: PathBuf,
    config: VaultConfig,
    chunks: Arc<ChunkStore>,
    manifests: Arc<ManifestStore>,
    checkpoints: CheckpointStore,
    index: SyncIndex,
    scheduler: TransferScheduler,
    sessions: DashMap<SessionId, Arc<Mutex<UploadSession>>>,
    /// Outcomes of finished uploads, so completion can be repeated
    completed: DashMap<SessionId, UploadOutcome>,
    /// Sessions the reaper failed; later calls on them report the timeout
    timed_out: DashSet<SessionId>,
    /// Shared by uploads, exclusive for garbage collection
    gc_gate: RwLock<()>,
    clock: Arc<dyn Clock>,
}

impl Vault {
    /// Open the vault at `root`, reading `.vault.toml` if present.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or any store cannot be opened.
    pub fn open(root: &Path) -> Result<Self> {
        let config = VaultConfig::load(root)?;
        Self::open_with(root, config, Arc::new(SystemClock))
    }

    /// Open with an explicit config and clock.
    ///
    /// Interrupted upload sessions are restored from their checkpoints.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or any store cannot be opened.
    pub fn open_with(root: &Path, config: VaultConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(root)?;

        let chunks = Arc::new(ChunkStore::open(
            &root.join(CHUNKS_DIR),
            config.store.chunk_map_size,
        )?);
        let manifests = Arc::new(ManifestStore::open(
            &root.join(MANIFESTS_DIR),
            config.store.meta_map_size,
        )?);
        let checkpoints =
            CheckpointStore::open(&root.join(SESSIONS_DIR), config.store.meta_map_size)?;
        let index = SyncIndex::load(
            root,
            manifests.clone(),
            config.sync.version_retention,
            config.sync.conflict_policy,
            clock.clone(),
        )?;
        let mut scheduler = TransferScheduler::new(&config.transfer);
        if let Some(window) = config.transfer.bandwidth_window {
            scheduler = scheduler.with_window(window, config.schedule.timezone, clock.clone());
        }

        let vault = Self {
            root: root.to_path_buf(),
            config,
            chunks,
            manifests,
            checkpoints,
            index,
            scheduler,
            sessions: DashMap::new(),
            completed: DashMap::new(),
            timed_out: DashSet::new(),
            gc_gate: RwLock::new(()),
            clock,
        };
        vault.restore_sessions()?;
        info!(root = %vault.root.display(), entries = vault.index.len(), "vault opened");
        Ok(vault)
    }

    fn restore_sessions(&self) -> Result<()> {
        for checkpoint in self.checkpoints.load_all()? {
            let id = checkpoint.id;
            if checkpoint.status.is_terminal() {
                self.checkpoints.remove(&id)?;
                continue;
            }

            let session = match UploadSession::restore(
                id,
                checkpoint.plan,
                checkpoint.status,
                checkpoint.bytes_transferred,
                checkpoint.started_at_ms,
                &self.chunks,
                now(),
            ) {
                Ok(session) => session,
                Err(e) => {
                    warn!(session = %id, error = %e, "dropping unrecoverable checkpoint");
                    self.checkpoints.remove(&id)?;
                    continue;
                }
            };

            if self.scheduler.admit(id) == Admission::Rejected {
                warn!(session = %id, "no room to restore session");
                self.checkpoints.remove(&id)?;
                continue;
            }
            if session.status() == SessionStatus::Paused {
                self.scheduler.set_paused(id, true);
            }
            self.index.begin_pending(session.path());
            self.checkpoints.save(&session)?;
            self.sessions.insert(id, Arc::new(Mutex::new(session)));
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    fn session(&self, id: &SessionId) -> Result<Arc<Mutex<UploadSession>>> {
        if let Some(session) = self.sessions.get(id) {
            return Ok(session.value().clone());
        }
        if self.timed_out.contains(id) {
            return Err(VaultError::SessionTimeout(*id));
        }
        Err(VaultError::SessionNotFound(*id))
    }

    fn persist_index(&self) -> Result<()> {
        self.index.save(&self.root)
    }

    /// Release the chunk references of manifests that no entry keeps anymore.
    fn retire(&self, retired: &[ManifestId]) {
        for id in retired {
            let manifest = match self.manifests.get(id) {
                Ok(manifest) => manifest,
                Err(VaultError::ManifestNotFound(_)) => continue,
                Err(e) => {
                    warn!(manifest = %id, error = %e, "cannot read retired manifest");
                    continue;
                }
            };
            if let Err(e) = self.chunks.release(&manifest.unique_chunks()) {
                warn!(manifest = %id, error = %e, "failed to release chunk references");
                continue;
            }
            if let Err(e) = self.manifests.remove(id) {
                warn!(manifest = %id, error = %e, "failed to remove retired manifest");
            }
            debug!(manifest = %id, "manifest retired");
        }
    }

    /// Bookkeeping once a session reaches a terminal state.
    fn finish(&self, id: &SessionId, path: &str) {
        self.scheduler.release(id);
        if let Err(e) = self.checkpoints.remove(id) {
            warn!(session = %id, error = %e, "failed to remove checkpoint");
        }
        self.index.end_pending(path);
        self.sessions.remove(id);
    }

    fn checkpoint(&self, session: &UploadSession) {
        if let Err(e) = self.checkpoints.save(session) {
            warn!(session = %session.id(), error = %e, "failed to checkpoint session");
        }
    }

    // ---- upload intent ----

    /// Announce an upload and learn which chunks must be sent.
    ///
    /// # Errors
    /// - [`VaultError::InvalidPlan`] if the plan does not validate
    /// - [`VaultError::QueueFull`] if the scheduler rejects the session
    pub async fn begin_upload(&self, mut plan: UploadPlan) -> Result<BeginOutcome> {
        plan.validate()?;
        let _gate = self.gc_gate.read().await;

        let existing = self
            .index
            .get(&plan.path)
            .filter(|entry| entry.state != EntryState::Deleted && plan.base_version.is_none());
        if let Some(entry) = existing {
            match self.config.sync.on_duplicate {
                DuplicatePolicy::Skip => {
                    info!(path = %plan.path, "path exists, skipping upload");
                    return Ok(BeginOutcome::Skipped {
                        path: entry.path,
                        version: entry.version,
                    });
                }
                DuplicatePolicy::KeepBoth => {
                    let sibling = self.index.free_sibling_path(&plan.path);
                    info!(path = %plan.path, copy = %sibling, "path exists, uploading alongside");
                    plan.path = sibling;
                }
                DuplicatePolicy::Replace => plan.base_version = Some(entry.version),
            }
        }

        let id = SessionId::new_v4();
        let admission = self.scheduler.admit(id);
        if admission == Admission::Rejected {
            return Err(VaultError::QueueFull {
                depth: self.scheduler.stats().queued,
            });
        }

        let mut session = match UploadSession::new(id, plan, self.clock.now_millis(), now()) {
            Ok(session) => session,
            Err(e) => {
                self.scheduler.release(&id);
                return Err(e);
            }
        };
        let missing = match session.establish(&self.chunks, now()) {
            Ok(missing) => missing,
            Err(e) => {
                self.scheduler.release(&id);
                return Err(e);
            }
        };

        let path = session.path().to_string();
        self.checkpoint(&session);
        self.index.begin_pending(&path);
        self.sessions.insert(id, Arc::new(Mutex::new(session)));

        Ok(BeginOutcome::Started(UploadTicket {
            session_id: id,
            path,
            admission,
            missing,
        }))
    }

    /// Wait until a queued session is admitted.
    ///
    /// # Errors
    /// - [`VaultError::SessionNotFound`] if the session was cancelled
    /// - [`VaultError::SessionTimeout`] if it was reaped as idle
    pub async fn wait_admitted(&self, id: SessionId) -> Result<()> {
        self.session(&id)?;
        match self.scheduler.wait_admitted(id).await {
            Err(VaultError::SessionNotFound(_)) if self.timed_out.contains(&id) => {
                Err(VaultError::SessionTimeout(id))
            }
            admitted => admitted,
        }
    }

    /// Deliver one chunk. Waits for bandwidth before committing it.
    ///
    /// # Errors
    /// - [`VaultError::NotAdmitted`] while the session is queued
    /// - [`VaultError::HashMismatch`] for corrupt bytes; resend the chunk
    /// - anything [`UploadSession::accept_chunk`] reports
    pub async fn send_chunk(
        &self,
        id: SessionId,
        hash: ContentHash,
        data: Bytes,
    ) -> Result<ChunkReceipt> {
        let session = self.session(&id)?;
        if !self.scheduler.is_admitted(&id) {
            return Err(VaultError::NotAdmitted(id));
        }

        session.lock().await.dispatch(&hash, now())?;
        self.scheduler.acquire(id, data.len() as u64).await?;

        let mut session = session.lock().await;
        let receipt = session.accept_chunk(&hash, &data, &self.chunks, now())?;
        self.checkpoint(&session);
        Ok(receipt)
    }

    /// Verify the upload and commit it to the index. Repeating the call
    /// returns the first outcome without touching the index again.
    ///
    /// # Errors
    /// - [`VaultError::UploadIncomplete`] if chunks are missing
    /// - [`VaultError::Integrity`] if the file hash does not match; the session fails
    /// - [`VaultError::Conflict`] if the target entry awaits resolution; the session
    ///   stays verified and completion can be retried after resolving
    pub async fn complete_upload(&self, id: SessionId) -> Result<UploadOutcome> {
        if let Some(done) = self.completed.get(&id) {
            return Ok(done.value().clone());
        }
        let handle = self.session(&id)?;
        let _gate = self.gc_gate.read().await;
        let mut session = handle.lock().await;

        if let Some(done) = session.outcome() {
            return Ok(done.clone());
        }

        let path = session.path().to_string();
        if session.status() != SessionStatus::Verifying {
            match session.verify(&self.chunks) {
                Ok(()) => {}
                Err(e @ VaultError::UploadIncomplete { .. }) => return Err(e),
                Err(e) => {
                    if session.status() == SessionStatus::Failed {
                        self.finish(&id, &path);
                    }
                    return Err(e);
                }
            }
        }

        let manifest = session.build_manifest(self.clock.now_millis())?;
        let unique = manifest.unique_chunks();
        self.chunks.retain(&unique)?;
        if let Err(e) = self.manifests.put(&manifest) {
            self.chunks.release(&unique)?;
            return Err(e);
        }

        let plan = session.plan();
        let commit = match self
            .index
            .commit(&path, &manifest, &plan.device, plan.base_version)
        {
            Ok(commit) => commit,
            Err(e) => {
                self.chunks.release(&unique)?;
                self.manifests.remove(&manifest.id)?;
                if matches!(e, VaultError::Conflict { .. }) {
                    warn!(session = %id, path = %path, "target is conflicted, resolve first");
                }
                return Err(e);
            }
        };

        match &commit {
            CommitOutcome::Synced { retired, .. } => self.retire(retired),
            CommitOutcome::Conflicted {
                resolution: Some(resolution),
                ..
            } => self.retire(&resolution.retired),
            CommitOutcome::Conflicted { .. } => {}
        }

        let outcome = UploadOutcome {
            session_id: id,
            path: path.clone(),
            manifest_id: manifest.id,
            commit,
        };
        session.complete(outcome.clone())?;
        self.completed.insert(id, outcome.clone());
        self.finish(&id, &path);
        self.persist_index()?;
        Ok(outcome)
    }

    /// Stop an upload. Queued sessions simply leave the queue; committed chunks stay.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] for completed sessions.
    pub async fn cancel_upload(&self, id: SessionId) -> Result<()> {
        if self.completed.contains_key(&id) {
            return Err(VaultError::InvalidTransition {
                session: id,
                from: SessionStatus::Completed,
                to: SessionStatus::Cancelled,
            });
        }
        let handle = self.session(&id)?;
        self.scheduler.cancel_queued(&id);

        let mut session = handle.lock().await;
        session.cancel()?;
        let path = session.path().to_string();
        self.finish(&id, &path);
        Ok(())
    }

    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] unless the session is transferring.
    pub async fn pause_upload(&self, id: SessionId) -> Result<()> {
        let handle = self.session(&id)?;
        let mut session = handle.lock().await;
        session.pause(now())?;
        self.scheduler.set_paused(id, true);
        self.checkpoint(&session);
        Ok(())
    }

    /// Returns the chunks still missing.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] unless the session is paused.
    pub async fn resume_upload(&self, id: SessionId) -> Result<Vec<ContentHash>> {
        let handle = self.session(&id)?;
        let mut session = handle.lock().await;
        let missing = session.resume(now())?;
        self.scheduler.set_paused(id, false);
        self.checkpoint(&session);
        Ok(missing)
    }

    /// Chunks still to send, after reclaiming ones stuck in flight.
    ///
    /// # Errors
    /// Returns [`VaultError::SessionNotFound`] for unknown sessions.
    pub async fn missing_chunks(&self, id: SessionId) -> Result<Vec<ContentHash>> {
        let handle = self.session(&id)?;
        let mut session = handle.lock().await;
        session.reclaim_stalled(now(), self.config.transfer.chunk_timeout());
        Ok(session.missing())
    }

    /// # Errors
    /// Returns [`VaultError::SessionNotFound`] for unknown sessions.
    pub async fn session_progress(&self, id: SessionId) -> Result<SessionProgress> {
        let handle = self.session(&id)?;
        let session = handle.lock().await;
        Ok(session.progress())
    }

    /// Fail sessions idle past the configured window and free their slots.
    ///
    /// Sessions busy with an operation are skipped. Returns the reaped ids.
    pub fn reap_idle(&self) -> Vec<SessionId> {
        let window = self.config.transfer.idle_timeout();
        let chunk_timeout = self.config.transfer.chunk_timeout();
        let handles: Vec<_> = self
            .sessions
            .iter()
            .map(|s| (*s.key(), s.value().clone()))
            .collect();

        let mut reaped = Vec::new();
        for (id, handle) in handles {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            let at = now();
            if !session.is_idle(at, window) {
                session.reclaim_stalled(at, chunk_timeout);
                continue;
            }
            if session.fail().is_ok() {
                let path = session.path().to_string();
                warn!(error = %VaultError::SessionTimeout(id), path = %path, "reaping idle session");
                self.timed_out.insert(id);
                self.finish(&id, &path);
                reaped.push(id);
            }
        }
        reaped
    }

    // ---- listing and reads ----

    /// # Errors
    /// Returns [`VaultError::EntryNotFound`] if the path is unknown.
    pub fn get_entry(&self, path: &str) -> Result<SyncEntry> {
        self.index
            .get(path)
            .ok_or_else(|| VaultError::EntryNotFound(path.to_string()))
    }

    #[must_use]
    pub fn list_entries(&self, prefix: &str) -> Vec<SyncEntry> {
        self.index.list(prefix)
    }

    #[must_use]
    pub fn list_deleted(&self) -> Vec<SyncEntry> {
        self.index.list_deleted()
    }

    /// # Errors
    /// Returns [`VaultError::ManifestNotFound`] if no manifest has this id.
    pub fn read_manifest(&self, id: &ManifestId) -> Result<FileManifest> {
        self.manifests.get(id)
    }

    /// # Errors
    /// Returns [`VaultError::ChunkNotFound`] if the chunk is not stored.
    pub fn read_chunk(&self, hash: &ContentHash) -> Result<Bytes> {
        self.chunks.get(hash)
    }

    /// Current and prior manifests of an entry, newest first
    ///
    /// # Errors
    /// Returns [`VaultError::EntryNotFound`] if the path is unknown.
    pub fn list_versions(&self, path: &str) -> Result<Vec<FileManifest>> {
        let entry = self.get_entry(path)?;
        std::iter::once(entry.current_manifest_id)
            .chain(entry.version_history.iter().rev().copied())
            .map(|id| self.manifests.get(&id))
            .collect()
    }

    /// Write a manifest's bytes to `writer`, checking the whole-file hash.
    ///
    /// # Errors
    /// - [`VaultError::ChunkNotFound`] if a chunk is missing
    /// - [`VaultError::Integrity`] if the reassembled bytes do not match
    pub fn assemble(&self, id: &ManifestId, writer: &mut impl Write) -> Result<u64> {
        let manifest = self.manifests.get(id)?;
        let mut hasher = FileHasher::new();
        let mut written = 0u64;

        for chunk in &manifest.chunks {
            let data = self.chunks.get(&chunk.hash)?;
            hasher.update(&data);
            writer.write_all(&data)?;
            written += data.len() as u64;
        }
        writer.flush()?;

        let actual = hasher.finalize();
        if actual != manifest.file_hash {
            return Err(VaultError::Integrity {
                path: id.to_string(),
                expected: manifest.file_hash,
                actual,
            });
        }
        Ok(written)
    }

    // ---- conflicts ----

    #[must_use]
    pub fn list_conflicts(&self) -> Vec<SyncEntry> {
        self.index.list_conflicts()
    }

    /// # Errors
    /// Returns [`VaultError::NotConflicted`] if the entry has no pending conflict.
    pub fn resolve_conflict(&self, path: &str, choice: ConflictChoice) -> Result<ResolveOutcome> {
        let outcome = self.index.resolve(path, choice)?;
        self.retire(&outcome.retired);
        self.persist_index()?;
        Ok(outcome)
    }

    // ---- maintenance ----

    /// Tombstone an entry. Its content stays restorable until the tombstone expires.
    ///
    /// # Errors
    /// See [`SyncIndex::mark_deleted`].
    pub fn delete_entry(&self, path: &str, base_version: Option<u64>) -> Result<SyncEntry> {
        let entry = self.index.mark_deleted(path, base_version)?;
        self.persist_index()?;
        Ok(entry)
    }

    /// # Errors
    /// See [`SyncIndex::restore_version`].
    pub fn restore_version(&self, path: &str, manifest_id: &ManifestId) -> Result<SyncEntry> {
        let update = self.index.restore_version(path, manifest_id)?;
        self.retire(&update.retired);
        self.persist_index()?;
        Ok(update.entry)
    }

    /// # Errors
    /// See [`SyncIndex::rename`].
    pub fn rename_entry(&self, from: &str, to: &str) -> Result<SyncEntry> {
        let entry = self.index.rename(from, to)?;
        self.persist_index()?;
        Ok(entry)
    }

    /// Purge expired tombstones, then delete chunks no manifest or live upload needs.
    ///
    /// With `compress_versions` on, chunks only history still uses are packed
    /// and packed chunks a current version uses again are unpacked.
    ///
    /// # Errors
    /// Returns an error if the chunk store cannot be swept.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let _gate = self.gc_gate.write().await;

        let purged = self
            .index
            .purge_deleted(self.config.sync.tombstone_retention());
        if !purged.is_empty() {
            info!(manifests = purged.len(), "purging expired tombstones");
            self.retire(&purged);
            self.persist_index()?;
        }

        let handles: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        let mut protected = HashSet::new();
        for handle in handles {
            let session = handle.lock().await;
            protected.extend(session.planned_hashes().copied());
        }

        let mut report = self.chunks.collect_garbage(&protected)?;
        if self.config.sync.compress_versions {
            let mut hot = protected;
            for id in self.index.current_manifests() {
                match self.manifests.get(&id) {
                    Ok(manifest) => hot.extend(manifest.chunks.iter().map(|c| c.hash)),
                    Err(e) => warn!(manifest = %id, error = %e, "current manifest unreadable"),
                }
            }
            let repacked = self.chunks.repack(&hot)?;
            report.packed_chunks = repacked.packed_chunks;
            report.unpacked_chunks = repacked.unpacked_chunks;
            report.packed_savings = repacked.packed_savings;
        }
        Ok(report)
    }

    /// # Errors
    /// Returns an error if the chunk store cannot be read.
    pub fn usage(&self) -> Result<UsageReport> {
        let mut report = UsageReport::default();
        for entry in self.index.list("") {
            report.entries += 1;
            report.versions += 1 + entry.version_history.len();
            if entry.state == EntryState::Conflicted {
                report.conflicted_entries += 1;
            }
            if let Ok(manifest) = self.manifests.get(&entry.current_manifest_id) {
                report.logical_bytes += manifest.total_size;
            }
        }
        report.deleted_entries = self.index.list_deleted().len();

        let stats = self.chunks.stats()?;
        report.stored_chunks = stats.count;
        report.stored_bytes = stats.total_bytes;
        report.packed_chunks = stats.packed;
        report.sessions = self.scheduler.stats();
        Ok(report)
    }
}
