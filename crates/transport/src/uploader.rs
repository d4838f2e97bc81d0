//! Client-side upload driver
//!
//! Plans a local file, announces it, streams the chunks the vault is missing
//! with per-chunk timeouts and retries, re-asks for anything still missing
//! and finally completes the session. Directory backups run several files at
//! once; the vault's scheduler decides how many actually transfer.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use vault_core::chunker::{FilePlan, plan_file};
use vault_core::config::VaultConfig;
use vault_core::{
    Admission, BeginOutcome, Chunk, ChunkConfig, ChunkReceipt, CommitOutcome, ContentHash,
    EntryState, ErrorKind, LocalFile, Result, Scanner, SessionId, UploadOutcome, UploadPlan,
    UploadTicket, VaultError,
};

use crate::VaultSession;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunking: ChunkConfig,
    /// Device name recorded on every version this uploader creates
    pub device: String,
    /// How long one chunk may take before it is sent again
    pub chunk_timeout: Duration,
    pub max_retries: u32,
    /// Files planned and announced at once during a directory backup
    pub parallel_files: usize,
}

impl UploadOptions {
    #[must_use]
    pub fn from_config(config: &VaultConfig, device: impl Into<String>) -> Self {
        Self {
            chunking: config.chunking.clone(),
            device: device.into(),
            chunk_timeout: config.transfer.chunk_timeout(),
            max_retries: 3,
            parallel_files: config.transfer.max_concurrent_sessions.max(1),
        }
    }
}

/// Progress callbacks. All methods default to doing nothing.
pub trait UploadObserver: Send + Sync {
    fn file_started(&self, _path: &str, _total_bytes: u64) {}
    fn bytes_sent(&self, _path: &str, _bytes: u64) {}
    fn file_finished(&self, _path: &str, _result: &FileResult) {}
    fn file_failed(&self, _path: &str, _error: &VaultError) {}
}

pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileResult {
    Uploaded {
        outcome: UploadOutcome,
        /// Bytes actually transferred; the rest was already stored
        sent_bytes: u64,
        total_bytes: u64,
    },
    /// The vault's current version already has these bytes
    Unchanged { path: String, version: u64 },
    /// The vault refused a duplicate upload
    Skipped { path: String, version: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub uploaded: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Paths whose upload ended in a conflict
    pub conflicted: Vec<String>,
    /// Paths that failed, with the error message
    pub failed: Vec<(String, String)>,
    pub bytes_sent: u64,
    pub bytes_total: u64,
}

impl BackupReport {
    fn record(&mut self, path: String, result: Result<FileResult>) {
        match result {
            Ok(FileResult::Uploaded {
                outcome,
                sent_bytes,
                total_bytes,
            }) => {
                self.uploaded += 1;
                self.bytes_sent += sent_bytes;
                self.bytes_total += total_bytes;
                if matches!(
                    outcome.commit,
                    CommitOutcome::Conflicted {
                        resolution: None,
                        ..
                    }
                ) {
                    self.conflicted.push(outcome.path);
                }
            }
            Ok(FileResult::Unchanged { .. }) => self.unchanged += 1,
            Ok(FileResult::Skipped { .. }) => self.skipped += 1,
            Err(e) => self.failed.push((path, e.to_string())),
        }
    }
}

enum Base {
    New,
    Update(u64),
    Unchanged(u64),
}

#[derive(Clone)]
pub struct Uploader {
    session: Arc<dyn VaultSession>,
    options: UploadOptions,
    observer: Arc<dyn UploadObserver>,
}

fn join_error(e: tokio::task::JoinError) -> VaultError {
    VaultError::Io(std::io::Error::other(e))
}

async fn read_range(file: &mut tokio::fs::File, chunk: &Chunk) -> Result<Bytes> {
    let offset = chunk.offset;
    let stream_error = |source| VaultError::StreamRead { offset, source };
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(stream_error)?;
    let mut buf = vec![0u8; chunk.length as usize];
    file.read_exact(&mut buf).await.map_err(stream_error)?;
    Ok(Bytes::from(buf))
}

impl Uploader {
    #[must_use]
    pub fn new(session: Arc<dyn VaultSession>, options: UploadOptions) -> Self {
        Self {
            session,
            options,
            observer: Arc::new(NoopObserver),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = observer;
        self
    }

    async fn base_for(&self, vault_path: &str, file_hash: &ContentHash) -> Result<Base> {
        let entry = match self.session.get_entry(vault_path).await {
            Ok(entry) => entry,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Base::New),
            Err(e) => return Err(e),
        };
        match entry.state {
            EntryState::Deleted => Ok(Base::New),
            EntryState::Conflicted => Ok(Base::Update(entry.version)),
            EntryState::Synced | EntryState::Pending => {
                let current = self.session.read_manifest(entry.current_manifest_id).await?;
                if current.file_hash == *file_hash {
                    Ok(Base::Unchanged(entry.version))
                } else {
                    Ok(Base::Update(entry.version))
                }
            }
        }
    }

    /// Upload one local file to `vault_path`.
    ///
    /// # Errors
    /// Returns the first error that retries could not clear. The session is
    /// cancelled in that case; chunks already sent stay in the vault.
    pub async fn upload_file(&self, local: &Path, vault_path: &str) -> Result<FileResult> {
        let chunking = self.options.chunking.clone();
        let source = local.to_path_buf();
        let plan = tokio::task::spawn_blocking(move || plan_file(&source, &chunking))
            .await
            .map_err(join_error)??;

        let base_version = match self.base_for(vault_path, &plan.file_hash).await? {
            Base::Unchanged(version) => {
                debug!(path = vault_path, version, "unchanged, not uploading");
                return Ok(FileResult::Unchanged {
                    path: vault_path.to_string(),
                    version,
                });
            }
            Base::Update(version) => Some(version),
            Base::New => None,
        };

        self.observer.file_started(vault_path, plan.total_size);
        let upload_plan = UploadPlan {
            path: vault_path.to_string(),
            chunks: plan.chunks.clone(),
            file_hash: plan.file_hash,
            total_size: plan.total_size,
            device: self.options.device.clone(),
            base_version,
        };

        let ticket = match self.session.begin_upload(upload_plan).await? {
            BeginOutcome::Started(ticket) => ticket,
            BeginOutcome::Skipped { path, version } => {
                return Ok(FileResult::Skipped { path, version });
            }
        };

        match self.transfer(local, &plan, &ticket).await {
            Ok((outcome, sent_bytes)) => Ok(FileResult::Uploaded {
                outcome,
                sent_bytes,
                total_bytes: plan.total_size,
            }),
            Err(e) => {
                if let Err(cancel) = self.session.cancel_upload(ticket.session_id).await {
                    debug!(session = %ticket.session_id, error = %cancel, "cancel after failure");
                }
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        local: &Path,
        plan: &FilePlan,
        ticket: &UploadTicket,
    ) -> Result<(UploadOutcome, u64)> {
        let id = ticket.session_id;
        if let Admission::Queued { position } = ticket.admission {
            debug!(session = %id, position, "waiting for a transfer slot");
            self.session.wait_admitted(id).await?;
        }

        let by_hash: HashMap<ContentHash, Chunk> =
            plan.chunks.iter().map(|c| (c.hash, *c)).collect();
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|source| VaultError::StreamRead { offset: 0, source })?;

        let mut missing = ticket.missing.clone();
        let mut sent = 0u64;
        for round in 0..=self.options.max_retries {
            for hash in &missing {
                let chunk = by_hash.get(hash).ok_or(VaultError::UnexpectedChunk {
                    session: id,
                    hash: *hash,
                })?;
                let data = read_range(&mut file, chunk).await?;
                let actual = ContentHash::from_bytes(&data);
                if actual != chunk.hash {
                    // The file changed after it was planned.
                    return Err(VaultError::Integrity {
                        path: local.display().to_string(),
                        expected: chunk.hash,
                        actual,
                    });
                }

                let len = data.len() as u64;
                self.send_with_retry(id, chunk.hash, data).await?;
                sent += len;
                self.observer.bytes_sent(&ticket.path, len);
            }

            missing = self.session.missing_chunks(id).await?;
            if missing.is_empty() {
                break;
            }
            warn!(session = %id, round, missing = missing.len(), "chunks still missing, resending");
        }
        if !missing.is_empty() {
            return Err(VaultError::UploadIncomplete {
                session: id,
                missing: missing.len(),
            });
        }

        let outcome = self.session.complete_upload(id).await?;
        info!(path = %outcome.path, manifest = %outcome.manifest_id, sent, "file uploaded");
        Ok((outcome, sent))
    }

    async fn send_with_retry(
        &self,
        id: SessionId,
        hash: ContentHash,
        data: Bytes,
    ) -> Result<ChunkReceipt> {
        let mut attempt = 0u32;
        loop {
            let sent = tokio::time::timeout(
                self.options.chunk_timeout,
                self.session.send_chunk(id, hash, data.clone()),
            )
            .await;
            let error = match sent {
                Ok(Ok(receipt)) => return Ok(receipt),
                Ok(Err(e)) if e.is_retryable() => e,
                Ok(Err(e)) => return Err(e),
                Err(_) => VaultError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("chunk {hash} timed out"),
                )),
            };

            if attempt >= self.options.max_retries {
                return Err(error);
            }
            attempt += 1;
            let backoff = Duration::from_millis(100 << attempt.min(6));
            warn!(session = %id, %hash, attempt, error = %error, "retrying chunk");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Upload scanned files under `prefix`, several at a time.
    ///
    /// Individual failures are collected in the report rather than aborting the run.
    pub async fn backup_files(
        &self,
        root: &Path,
        files: Vec<LocalFile>,
        prefix: &str,
    ) -> BackupReport {
        let permits = Arc::new(Semaphore::new(self.options.parallel_files.max(1)));
        let mut tasks = JoinSet::new();

        for file in files {
            let uploader = self.clone();
            let permits = permits.clone();
            let local: PathBuf = root.join(&file.path);
            let vault_path = file.vault_path(prefix);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (vault_path, Err(VaultError::Io(std::io::Error::other("closed"))));
                };
                let result = uploader.upload_file(&local, &vault_path).await;
                match &result {
                    Ok(done) => uploader.observer.file_finished(&vault_path, done),
                    Err(e) => {
                        warn!(path = %vault_path, error = %e, "upload failed");
                        uploader.observer.file_failed(&vault_path, e);
                    }
                }
                (vault_path, result)
            });
        }

        let mut report = BackupReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, result)) => report.record(path, result),
                Err(e) => report.failed.push((String::from("<task>"), e.to_string())),
            }
        }
        report.failed.sort();
        report.conflicted.sort();
        report
    }

    /// Scan `root` (honoring ignore files) and back it up under `prefix`.
    ///
    /// # Errors
    /// Returns an error only if scanning fails.
    pub async fn backup_dir(&self, root: &Path, prefix: &str) -> Result<BackupReport> {
        let scan_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || Scanner::new(scan_root).scan())
            .await
            .map_err(join_error)??;
        info!(root = %root.display(), files = files.len(), "scanned directory");
        Ok(self.backup_files(root, files, prefix).await)
    }
}
