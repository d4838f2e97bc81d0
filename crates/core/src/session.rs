//! Resumable per-file upload state machine
//!
//! ```text
//! initializing -> transferring <-> paused
//!                      |
//!                      v
//!                  verifying -> completed
//! ```
//! Every non-terminal state may also move to `failed` or `cancelled`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cas::{ChunkStore, PutOutcome};
use crate::chunker::{Chunk, MAX_CHUNK_SIZE};
use crate::error::{Result, VaultError};
use crate::hash::{ContentHash, FileHasher};
use crate::manifest::{FileManifest, ManifestId, check_contiguous};
use crate::sync_index::CommitOutcome;

/// Identity of one upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VaultError::Serialization(format!("invalid session id {s:?}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Initializing,
    Transferring,
    Paused,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::{
            Cancelled, Completed, Failed, Initializing, Paused, Transferring, Verifying,
        };
        match (self, next) {
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Initializing, Transferring)
            | (Transferring, Paused | Verifying)
            | (Paused, Transferring)
            | (Verifying, Completed) => true,
            _ => false,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Transferring => 1,
            Self::Paused => 2,
            Self::Verifying => 3,
            Self::Completed => 4,
            Self::Failed => 5,
            Self::Cancelled => 6,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Initializing,
            1 => Self::Transferring,
            2 => Self::Paused,
            3 => Self::Verifying,
            4 => Self::Completed,
            5 => Self::Failed,
            6 => Self::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Pending,
    InFlight { since: Instant },
    Committed,
}

/// What a client announces before any bytes move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPlan {
    /// Logical path in the vault
    pub path: String,
    pub chunks: Vec<Chunk>,
    pub file_hash: ContentHash,
    pub total_size: u64,
    /// Device announcing the upload
    pub device: String,
    /// Entry version this upload was based on; `None` for a new path
    #[serde(default)]
    pub base_version: Option<u64>,
}

impl UploadPlan {
    /// # Errors
    /// Returns [`VaultError::InvalidPlan`] for an empty path, oversized chunks or
    /// chunks that do not cover the file exactly.
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(VaultError::InvalidPlan("empty target path".into()));
        }
        if let Some(chunk) = self.chunks.iter().find(|c| c.length > MAX_CHUNK_SIZE) {
            return Err(VaultError::InvalidPlan(format!(
                "chunk at offset {} exceeds {MAX_CHUNK_SIZE} bytes",
                chunk.offset
            )));
        }
        check_contiguous(&self.chunks, self.total_size).map_err(VaultError::InvalidPlan)
    }
}

/// Acknowledgement for one delivered chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub hash: ContentHash,
    pub status: ReceiptStatus,
    /// Distinct chunks still missing after this one
    pub remaining: usize,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReceiptStatus {
    /// Bytes were written to the chunk store
    Committed,
    /// Another session stored identical bytes first
    AlreadyExists,
    /// This session had already accepted the chunk
    Duplicate,
}

/// Result of a completed upload, replayed on repeated completion calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub session_id: SessionId,
    pub path: String,
    pub manifest_id: ManifestId,
    pub commit: CommitOutcome,
}

/// Snapshot of a session for progress reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_id: SessionId,
    pub path: String,
    pub status: SessionStatus,
    pub total_chunks: usize,
    pub committed_chunks: usize,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub started_at_ms: i64,
}

pub struct UploadSession {
    id: SessionId,
    plan: UploadPlan,
    /// One state per distinct planned hash
    chunks: HashMap<ContentHash, ChunkState>,
    lengths: HashMap<ContentHash, u32>,
    bytes_transferred: u64,
    started_at_ms: i64,
    last_activity: Instant,
    status: SessionStatus,
    outcome: Option<UploadOutcome>,
}

impl UploadSession {
    /// # Errors
    /// Returns [`VaultError::InvalidPlan`] if the plan does not validate.
    pub fn new(id: SessionId, plan: UploadPlan, started_at_ms: i64, now: Instant) -> Result<Self> {
        plan.validate()?;

        let mut chunks = HashMap::with_capacity(plan.chunks.len());
        let mut lengths = HashMap::with_capacity(plan.chunks.len());
        for chunk in &plan.chunks {
            chunks.insert(chunk.hash, ChunkState::Pending);
            lengths.insert(chunk.hash, chunk.length);
        }

        Ok(Self {
            id,
            plan,
            chunks,
            lengths,
            bytes_transferred: 0,
            started_at_ms,
            last_activity: now,
            status: SessionStatus::Initializing,
            outcome: None,
        })
    }

    /// Rebuild a session after a restart.
    ///
    /// Committed state comes from the chunk store, not from what was checkpointed.
    ///
    /// # Errors
    /// Returns an error if the plan no longer validates or the store cannot be read.
    pub fn restore(
        id: SessionId,
        plan: UploadPlan,
        checkpointed: SessionStatus,
        bytes_transferred: u64,
        started_at_ms: i64,
        store: &ChunkStore,
        now: Instant,
    ) -> Result<Self> {
        let mut session = Self::new(id, plan, started_at_ms, now)?;
        session.mark_present(store)?;
        session.bytes_transferred = bytes_transferred;
        session.status = match checkpointed {
            SessionStatus::Paused => SessionStatus::Paused,
            _ => SessionStatus::Transferring,
        };
        info!(
            session = %id,
            path = %session.plan.path,
            status = %session.status,
            missing = session.missing().len(),
            "restored upload session"
        );
        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn plan(&self) -> &UploadPlan {
        &self.plan
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.plan.path
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    #[must_use]
    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&UploadOutcome> {
        self.outcome.as_ref()
    }

    /// Distinct planned chunk hashes
    pub fn planned_hashes(&self) -> impl Iterator<Item = &ContentHash> {
        self.chunks.keys()
    }

    fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(VaultError::InvalidTransition {
                session: self.id,
                from: self.status,
                to: next,
            });
        }
        debug!(session = %self.id, from = %self.status, to = %next, "session transition");
        self.status = next;
        Ok(())
    }

    fn mark_present(&mut self, store: &ChunkStore) -> Result<()> {
        for (hash, state) in &mut self.chunks {
            if store.has(hash)? {
                *state = ChunkState::Committed;
            }
        }
        Ok(())
    }

    /// Skip chunks the store already holds, then start transferring.
    ///
    /// Returns the hashes that still need to be sent, in plan order.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] unless the session is initializing.
    pub fn establish(&mut self, store: &ChunkStore, now: Instant) -> Result<Vec<ContentHash>> {
        if self.status != SessionStatus::Initializing {
            return Err(VaultError::InvalidTransition {
                session: self.id,
                from: self.status,
                to: SessionStatus::Transferring,
            });
        }
        self.mark_present(store)?;
        self.transition(SessionStatus::Transferring)?;
        self.last_activity = now;

        let missing = self.missing();
        info!(
            session = %self.id,
            path = %self.plan.path,
            chunks = self.chunks.len(),
            missing = missing.len(),
            "upload session established"
        );
        Ok(missing)
    }

    /// Record that a chunk is on its way.
    ///
    /// # Errors
    /// Returns [`VaultError::UnexpectedChunk`] for hashes outside the plan.
    pub fn dispatch(&mut self, hash: &ContentHash, now: Instant) -> Result<()> {
        let state = self
            .chunks
            .get_mut(hash)
            .ok_or(VaultError::UnexpectedChunk {
                session: self.id,
                hash: *hash,
            })?;
        if *state == ChunkState::Pending {
            *state = ChunkState::InFlight { since: now };
        }
        Ok(())
    }

    /// Validate and commit one chunk. Chunks may arrive in any order.
    ///
    /// # Errors
    /// - [`VaultError::SessionNotAccepting`] unless transferring
    /// - [`VaultError::UnexpectedChunk`] for hashes outside the plan
    /// - [`VaultError::LengthMismatch`] if the length differs from the plan
    /// - [`VaultError::HashMismatch`] if the bytes are corrupt; the chunk goes back
    ///   to pending and the session stays alive
    pub fn accept_chunk(
        &mut self,
        hash: &ContentHash,
        data: &[u8],
        store: &ChunkStore,
        now: Instant,
    ) -> Result<ChunkReceipt> {
        if self.status != SessionStatus::Transferring {
            return Err(VaultError::SessionNotAccepting {
                session: self.id,
                status: self.status,
            });
        }
        let Some(state) = self.chunks.get(hash).copied() else {
            return Err(VaultError::UnexpectedChunk {
                session: self.id,
                hash: *hash,
            });
        };

        if state == ChunkState::Committed {
            self.last_activity = now;
            return Ok(self.receipt(*hash, ReceiptStatus::Duplicate));
        }

        let planned = self.lengths.get(hash).copied().unwrap_or_default();
        if data.len() as u64 != u64::from(planned) {
            self.chunks.insert(*hash, ChunkState::Pending);
            return Err(VaultError::LengthMismatch {
                hash: *hash,
                expected: u64::from(planned),
                actual: data.len() as u64,
            });
        }

        let outcome = match store.put(hash, data) {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, VaultError::HashMismatch { .. }) {
                    warn!(session = %self.id, hash = %hash, "corrupt chunk rejected, awaiting resend");
                }
                self.chunks.insert(*hash, ChunkState::Pending);
                return Err(e);
            }
        };

        self.chunks.insert(*hash, ChunkState::Committed);
        self.bytes_transferred += data.len() as u64;
        self.last_activity = now;

        let status = match outcome {
            PutOutcome::Committed => ReceiptStatus::Committed,
            PutOutcome::AlreadyExists => {
                debug!(session = %self.id, hash = %hash, "chunk already stored");
                ReceiptStatus::AlreadyExists
            }
        };
        Ok(self.receipt(*hash, status))
    }

    fn receipt(&self, hash: ContentHash, status: ReceiptStatus) -> ChunkReceipt {
        ChunkReceipt {
            hash,
            status,
            remaining: self.remaining(),
            bytes_transferred: self.bytes_transferred,
        }
    }

    fn remaining(&self) -> usize {
        self.chunks
            .values()
            .filter(|s| **s != ChunkState::Committed)
            .count()
    }

    /// Distinct uncommitted hashes (pending or in flight), in plan order
    #[must_use]
    pub fn missing(&self) -> Vec<ContentHash> {
        let mut seen = std::collections::HashSet::new();
        self.plan
            .chunks
            .iter()
            .map(|c| c.hash)
            .filter(|h| {
                self.chunks.get(h) != Some(&ChunkState::Committed) && seen.insert(*h)
            })
            .collect()
    }

    /// Return in-flight chunks older than `chunk_timeout` to pending.
    ///
    /// Returns the chunks that should be requested again.
    pub fn reclaim_stalled(&mut self, now: Instant, chunk_timeout: Duration) -> Vec<ContentHash> {
        let mut stalled = Vec::new();
        for (hash, state) in &mut self.chunks {
            let ChunkState::InFlight { since } = *state else {
                continue;
            };
            if now.saturating_duration_since(since) >= chunk_timeout {
                *state = ChunkState::Pending;
                stalled.push(*hash);
            }
        }
        if !stalled.is_empty() {
            warn!(session = %self.id, count = stalled.len(), "in-flight chunks timed out");
        }
        stalled
    }

    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] unless transferring.
    pub fn pause(&mut self, now: Instant) -> Result<()> {
        self.transition(SessionStatus::Paused)?;
        self.last_activity = now;
        info!(session = %self.id, "upload paused");
        Ok(())
    }

    /// Chunks that were in flight when the session paused are expected again.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] unless paused.
    pub fn resume(&mut self, now: Instant) -> Result<Vec<ContentHash>> {
        self.transition(SessionStatus::Transferring)?;
        for state in self.chunks.values_mut() {
            if matches!(state, ChunkState::InFlight { .. }) {
                *state = ChunkState::Pending;
            }
        }
        self.last_activity = now;
        info!(session = %self.id, "upload resumed");
        Ok(self.missing())
    }

    /// Re-read every chunk in plan order and check the whole-file hash.
    ///
    /// On mismatch the session fails and nothing may be committed.
    ///
    /// # Errors
    /// - [`VaultError::UploadIncomplete`] if chunks are still missing (no transition)
    /// - [`VaultError::Integrity`] if the reassembled file does not match
    pub fn verify(&mut self, store: &ChunkStore) -> Result<()> {
        let missing = self.remaining();
        if missing > 0 {
            return Err(VaultError::UploadIncomplete {
                session: self.id,
                missing,
            });
        }
        self.transition(SessionStatus::Verifying)?;

        let mut hasher = FileHasher::new();
        for chunk in &self.plan.chunks {
            let data = match store.get(&chunk.hash) {
                Ok(data) => data,
                Err(e) => {
                    self.status = SessionStatus::Failed;
                    return Err(e);
                }
            };
            hasher.update(&data);
        }

        let actual = hasher.finalize();
        if actual != self.plan.file_hash {
            self.status = SessionStatus::Failed;
            warn!(
                session = %self.id,
                path = %self.plan.path,
                expected = %self.plan.file_hash,
                actual = %actual,
                "integrity check failed"
            );
            return Err(VaultError::Integrity {
                path: self.plan.path.clone(),
                expected: self.plan.file_hash,
                actual,
            });
        }
        Ok(())
    }

    /// Manifest describing the verified file.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] unless verification passed.
    pub fn build_manifest(&self, created_at_ms: i64) -> Result<FileManifest> {
        if self.status != SessionStatus::Verifying {
            return Err(VaultError::InvalidTransition {
                session: self.id,
                from: self.status,
                to: SessionStatus::Completed,
            });
        }
        FileManifest::new(
            self.plan.chunks.clone(),
            self.plan.total_size,
            self.plan.file_hash,
            created_at_ms,
            self.plan.device.clone(),
        )
    }

    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] unless verifying.
    pub fn complete(&mut self, outcome: UploadOutcome) -> Result<()> {
        self.transition(SessionStatus::Completed)?;
        info!(
            session = %self.id,
            path = %self.plan.path,
            manifest = %outcome.manifest_id,
            "upload completed"
        );
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Cancelling twice is a no-op.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] for completed or failed sessions.
    pub fn cancel(&mut self) -> Result<()> {
        if self.status == SessionStatus::Cancelled {
            return Ok(());
        }
        self.transition(SessionStatus::Cancelled)?;
        info!(session = %self.id, path = %self.plan.path, "upload cancelled");
        Ok(())
    }

    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] for sessions already terminal.
    pub fn fail(&mut self) -> Result<()> {
        self.transition(SessionStatus::Failed)
    }

    /// No chunk activity for at least `window` on a live session
    #[must_use]
    pub fn is_idle(&self, now: Instant, window: Duration) -> bool {
        !self.status.is_terminal() && now.saturating_duration_since(self.last_activity) >= window
    }

    #[must_use]
    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            session_id: self.id,
            path: self.plan.path.clone(),
            status: self.status,
            total_chunks: self.chunks.len(),
            committed_chunks: self.chunks.len() - self.remaining(),
            bytes_transferred: self.bytes_transferred,
            total_size: self.plan.total_size,
            started_at_ms: self.started_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkConfig, chunk_bytes};

    fn store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 64 * 1024 * 1024).unwrap();
        (dir, store)
    }

    fn plan_for(data: &[u8], chunk_size: u32) -> (UploadPlan, Vec<crate::chunker::ChunkData>) {
        let chunks = chunk_bytes(data, &ChunkConfig::fixed(chunk_size)).unwrap();
        let plan = UploadPlan {
            path: "/docs/file.bin".into(),
            chunks: chunks.iter().map(|c| c.chunk).collect(),
            file_hash: ContentHash::from_bytes(data),
            total_size: data.len() as u64,
            device: "laptop".into(),
            base_version: None,
        };
        (plan, chunks)
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
    }

    #[test]
    fn test_transition_table() {
        use SessionStatus::*;
        assert!(Initializing.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Transferring));
        assert!(Verifying.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Paused.can_transition_to(Verifying));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Initializing.can_transition_to(Completed));
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (_dir, store) = store();
        let bytes = data(10_000);
        let (plan, chunks) = plan_for(&bytes, 4096);
        let now = Instant::now();

        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        let missing = session.establish(&store, now).unwrap();
        assert_eq!(missing.len(), 3);

        for chunk in chunks.iter().rev() {
            session
                .accept_chunk(&chunk.chunk.hash, &chunk.data, &store, now)
                .unwrap();
        }
        assert!(session.missing().is_empty());
        assert_eq!(session.bytes_transferred(), 10_000);

        session.verify(&store).unwrap();
        let manifest = session.build_manifest(42).unwrap();
        assert_eq!(manifest.total_size, 10_000);
    }

    #[test]
    fn test_establish_skips_present_chunks() {
        let (_dir, store) = store();
        let bytes = data(10_000);
        let (plan, chunks) = plan_for(&bytes, 4096);
        store.put(&chunks[1].chunk.hash, &chunks[1].data).unwrap();

        let now = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        let missing = session.establish(&store, now).unwrap();
        assert_eq!(missing, vec![chunks[0].chunk.hash, chunks[2].chunk.hash]);
    }

    #[test]
    fn test_corrupt_chunk_keeps_session_alive() {
        let (_dir, store) = store();
        let bytes = data(5000);
        let (plan, chunks) = plan_for(&bytes, 4096);
        let now = Instant::now();

        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        session.establish(&store, now).unwrap();

        let mut corrupt = chunks[0].data.to_vec();
        corrupt[0] ^= 0xFF;
        let err = session
            .accept_chunk(&chunks[0].chunk.hash, &corrupt, &store, now)
            .unwrap_err();
        assert!(matches!(err, VaultError::HashMismatch { .. }));
        assert_eq!(session.status(), SessionStatus::Transferring);
        assert_eq!(session.bytes_transferred(), 0);

        let receipt = session
            .accept_chunk(&chunks[0].chunk.hash, &chunks[0].data, &store, now)
            .unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Committed);
        assert_eq!(receipt.remaining, 1);
    }

    #[test]
    fn test_unexpected_chunk_rejected() {
        let (_dir, store) = store();
        let (plan, _) = plan_for(&data(100), 4096);
        let now = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        session.establish(&store, now).unwrap();

        let stray = b"not planned";
        let err = session
            .accept_chunk(&ContentHash::from_bytes(stray), stray, &store, now)
            .unwrap_err();
        assert!(matches!(err, VaultError::UnexpectedChunk { .. }));
    }

    #[test]
    fn test_duplicate_delivery_is_acknowledged() {
        let (_dir, store) = store();
        let (plan, chunks) = plan_for(&data(100), 4096);
        let now = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        session.establish(&store, now).unwrap();

        let h = chunks[0].chunk.hash;
        session.accept_chunk(&h, &chunks[0].data, &store, now).unwrap();
        let again = session.accept_chunk(&h, &chunks[0].data, &store, now).unwrap();
        assert_eq!(again.status, ReceiptStatus::Duplicate);
        assert_eq!(session.bytes_transferred(), 100);
    }

    #[test]
    fn test_paused_session_rejects_chunks_and_keeps_state() {
        let (_dir, store) = store();
        let (plan, chunks) = plan_for(&data(9000), 4096);
        let now = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        session.establish(&store, now).unwrap();
        session
            .accept_chunk(&chunks[0].chunk.hash, &chunks[0].data, &store, now)
            .unwrap();
        session.dispatch(&chunks[1].chunk.hash, now).unwrap();

        session.pause(now).unwrap();
        let err = session
            .accept_chunk(&chunks[1].chunk.hash, &chunks[1].data, &store, now)
            .unwrap_err();
        assert!(matches!(err, VaultError::SessionNotAccepting { .. }));

        let missing = session.resume(now).unwrap();
        assert_eq!(missing, vec![chunks[1].chunk.hash, chunks[2].chunk.hash]);
        assert_eq!(session.progress().committed_chunks, 1);
    }

    #[test]
    fn test_integrity_failure_fails_session() {
        let (_dir, store) = store();
        let bytes = data(3000);
        let (mut plan, chunks) = plan_for(&bytes, 1024);
        plan.file_hash = ContentHash::from_bytes(b"something else");
        let now = Instant::now();

        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        session.establish(&store, now).unwrap();
        for chunk in &chunks {
            session
                .accept_chunk(&chunk.chunk.hash, &chunk.data, &store, now)
                .unwrap();
        }

        let err = session.verify(&store).unwrap_err();
        assert!(matches!(err, VaultError::Integrity { .. }));
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.build_manifest(0).is_err());
    }

    #[test]
    fn test_verify_requires_all_chunks() {
        let (_dir, store) = store();
        let (plan, _) = plan_for(&data(3000), 1024);
        let now = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        session.establish(&store, now).unwrap();
        assert!(matches!(
            session.verify(&store),
            Err(VaultError::UploadIncomplete { missing: 3, .. })
        ));
        assert_eq!(session.status(), SessionStatus::Transferring);
    }

    #[test]
    fn test_stalled_chunks_are_reclaimed() {
        let (_dir, store) = store();
        let (plan, chunks) = plan_for(&data(3000), 1024);
        let start = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, start).unwrap();
        session.establish(&store, start).unwrap();

        session.dispatch(&chunks[0].chunk.hash, start).unwrap();
        session
            .dispatch(&chunks[1].chunk.hash, start + Duration::from_secs(50))
            .unwrap();

        let later = start + Duration::from_secs(61);
        let stalled = session.reclaim_stalled(later, Duration::from_secs(60));
        assert_eq!(stalled, vec![chunks[0].chunk.hash]);
    }

    #[test]
    fn test_idle_detection_includes_paused() {
        let (_dir, store) = store();
        let (plan, _) = plan_for(&data(100), 1024);
        let start = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, start).unwrap();
        session.establish(&store, start).unwrap();
        session.pause(start).unwrap();

        let window = Duration::from_secs(300);
        assert!(!session.is_idle(start + Duration::from_secs(10), window));
        assert!(session.is_idle(start + window, window));

        session.cancel().unwrap();
        assert!(!session.is_idle(start + window, window));
    }

    #[test]
    fn test_cancel_is_idempotent_but_final() {
        let (_dir, store) = store();
        let (plan, _) = plan_for(&data(100), 1024);
        let now = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan, 0, now).unwrap();
        session.establish(&store, now).unwrap();
        session.cancel().unwrap();
        session.cancel().unwrap();
        assert!(session.resume(now).is_err());
    }

    #[test]
    fn test_plan_validation() {
        let (mut plan, _) = plan_for(&data(3000), 1024);
        plan.total_size += 1;
        assert!(UploadPlan::validate(&plan).is_err());

        let (mut plan, _) = plan_for(&data(3000), 1024);
        plan.path = "  ".into();
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_restore_uses_store_state() {
        let (_dir, store) = store();
        let (plan, chunks) = plan_for(&data(3000), 1024);
        store.put(&chunks[0].chunk.hash, &chunks[0].data).unwrap();
        store.put(&chunks[2].chunk.hash, &chunks[2].data).unwrap();

        let session = UploadSession::restore(
            SessionId::new_v4(),
            plan,
            SessionStatus::Verifying,
            1024,
            0,
            &store,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(session.status(), SessionStatus::Transferring);
        assert_eq!(session.missing(), vec![chunks[1].chunk.hash]);
    }
}
