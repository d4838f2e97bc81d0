//! Durable upload session checkpoints using heed (LMDB) + rkyv
//!
//! A checkpoint records a session's plan and status so the session can be
//! re-derived after a restart. Which chunks are committed is never trusted
//! from here; the chunk store is asked again on restore.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env};
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use tracing::warn;

use crate::cas::open_env;
use crate::chunker::Chunk;
use crate::error::{Result, VaultError};
use crate::hash::ContentHash;
use crate::manifest::ChunkRecord;
use crate::session::{SessionId, SessionStatus, UploadPlan, UploadSession};

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
struct SessionRecord {
    id: [u8; 16],
    path: String,
    device: String,
    base_version: Option<u64>,
    file_hash: [u8; 32],
    total_size: u64,
    chunks: Vec<ChunkRecord>,
    bytes_transferred: u64,
    started_at_ms: i64,
    status: u8,
}

impl From<&UploadSession> for SessionRecord {
    fn from(session: &UploadSession) -> Self {
        let plan = session.plan();
        Self {
            id: *session.id().as_bytes(),
            path: plan.path.clone(),
            device: plan.device.clone(),
            base_version: plan.base_version,
            file_hash: *plan.file_hash.as_bytes(),
            total_size: plan.total_size,
            chunks: plan.chunks.iter().map(ChunkRecord::from).collect(),
            bytes_transferred: session.bytes_transferred(),
            started_at_ms: session.started_at_ms(),
            status: session.status().code(),
        }
    }
}

/// A checkpoint as read back from disk
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: SessionId,
    pub plan: UploadPlan,
    pub status: SessionStatus,
    pub bytes_transferred: u64,
    pub started_at_ms: i64,
}

impl From<SessionRecord> for Checkpoint {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: SessionId::from_bytes(record.id),
            plan: UploadPlan {
                path: record.path,
                chunks: record.chunks.iter().map(Chunk::from).collect(),
                file_hash: ContentHash::from_raw(record.file_hash),
                total_size: record.total_size,
                device: record.device,
                base_version: record.base_version,
            },
            status: SessionStatus::from_code(record.status).unwrap_or(SessionStatus::Failed),
            bytes_transferred: record.bytes_transferred,
            started_at_ms: record.started_at_ms,
        }
    }
}

pub struct CheckpointStore {
    env: Env,
    /// sessions database: session uuid -> rkyv `SessionRecord`
    sessions: Database<Bytes, Bytes>,
}

impl CheckpointStore {
    /// Open or create a checkpoint store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    pub fn open(path: &Path, map_size: usize) -> Result<Self> {
        let env = open_env(path, map_size, 1)?;

        let mut wtxn = env.write_txn()?;
        let sessions: Database<Bytes, Bytes> = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name("sessions")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, sessions })
    }

    /// Write the session's current state, replacing any earlier checkpoint.
    ///
    /// # Errors
    /// Returns an error if serialization or the write transaction fails.
    pub fn save(&self, session: &UploadSession) -> Result<()> {
        let record = SessionRecord::from(session);
        let bytes = rkyv::to_bytes::<RkyvError>(&record)
            .map_err(|e| VaultError::Serialization(format!("rkyv serialization failed: {e}")))?;

        let mut wtxn = self.env.write_txn()?;
        self.sessions
            .put(&mut wtxn, session.id().as_bytes(), &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn remove(&self, id: &SessionId) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.sessions.delete(&mut wtxn, id.as_bytes())?;
        wtxn.commit()?;
        Ok(())
    }

    /// Every readable checkpoint. Corrupt records are skipped with a warning.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn load_all(&self) -> Result<Vec<Checkpoint>> {
        let rtxn = self.env.read_txn()?;
        let mut checkpoints = Vec::new();

        for entry in self.sessions.iter(&rtxn)? {
            let (key, data) = entry?;
            let mut aligned = AlignedVec::<16>::new();
            aligned.extend_from_slice(data);
            match rkyv::from_bytes::<SessionRecord, RkyvError>(&aligned) {
                Ok(record) => checkpoints.push(Checkpoint::from(record)),
                Err(e) => warn!(key = %hex::encode(key), error = %e, "skipping corrupt checkpoint"),
            }
        }

        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::cas::ChunkStore;
    use crate::chunker::{ChunkConfig, chunk_bytes};

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::open(&dir.path().join("s"), 16 * 1024 * 1024).unwrap();
        let store = ChunkStore::open(&dir.path().join("c"), 16 * 1024 * 1024).unwrap();

        let data = vec![9u8; 5000];
        let chunks = chunk_bytes(&data, &ChunkConfig::fixed(2048)).unwrap();
        let plan = UploadPlan {
            path: "/x.bin".into(),
            chunks: chunks.iter().map(|c| c.chunk).collect(),
            file_hash: ContentHash::from_bytes(&data),
            total_size: 5000,
            device: "desk".into(),
            base_version: Some(3),
        };

        let now = Instant::now();
        let mut session = UploadSession::new(SessionId::new_v4(), plan.clone(), 77, now).unwrap();
        session.establish(&store, now).unwrap();
        session.pause(now).unwrap();
        checkpoints.save(&session).unwrap();

        let loaded = checkpoints.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, session.id());
        assert_eq!(loaded[0].plan, plan);
        assert_eq!(loaded[0].status, SessionStatus::Paused);
        assert_eq!(loaded[0].started_at_ms, 77);

        checkpoints.remove(&session.id()).unwrap();
        assert!(checkpoints.load_all().unwrap().is_empty());
    }
}
