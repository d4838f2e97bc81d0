//! File manifests: immutable, ordered chunk lists describing one file version
//!
//! Stored with heed (LMDB) + rkyv, keyed by the manifest's UUID.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::SystemTime;

use heed::types::Bytes;
use heed::{Database, Env};
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cas::open_env;
use crate::chunker::Chunk;
use crate::clock::millis_to_system_time;
use crate::error::{Result, VaultError};
use crate::hash::ContentHash;

/// Identity of one immutable file version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(Uuid);

impl ManifestId {
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

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ManifestId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VaultError::Serialization(format!("invalid manifest id {s:?}: {e}")))
    }
}

/// Check that `chunks` tile `[0, total_size)` without gaps or overlaps.
pub(crate) fn check_contiguous(chunks: &[Chunk], total_size: u64) -> std::result::Result<(), String> {
    let mut expected = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.offset != expected {
            return Err(format!(
                "chunk {i} starts at {} but previous chunks end at {expected}",
                chunk.offset
            ));
        }
        if chunk.length == 0 {
            return Err(format!("chunk {i} is empty"));
        }
        expected += u64::from(chunk.length);
    }
    if expected != total_size {
        return Err(format!(
            "chunks cover {expected} bytes but total size is {total_size}"
        ));
    }
    Ok(())
}

/// One version of one file.
///
/// Never edited after creation; a new version is a new manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub id: ManifestId,
    pub chunks: Vec<Chunk>,
    pub total_size: u64,
    pub file_hash: ContentHash,
    pub created_at_ms: i64,
    /// Device that produced this version
    pub device: String,
}

impl FileManifest {
    /// # Errors
    /// Returns [`VaultError::InvalidPlan`] if the chunks do not exactly cover `total_size`.
    pub fn new(
        chunks: Vec<Chunk>,
        total_size: u64,
        file_hash: ContentHash,
        created_at_ms: i64,
        device: impl Into<String>,
    ) -> Result<Self> {
        check_contiguous(&chunks, total_size).map_err(VaultError::InvalidPlan)?;
        Ok(Self {
            id: ManifestId::new_v4(),
            chunks,
            total_size,
            file_hash,
            created_at_ms,
            device: device.into(),
        })
    }

    /// Chunk hashes in order
    #[must_use]
    pub fn chunk_hashes(&self) -> Vec<ContentHash> {
        self.chunks.iter().map(|c| c.hash).collect()
    }

    /// Distinct chunk hashes in first-seen order
    #[must_use]
    pub fn unique_chunks(&self) -> Vec<ContentHash> {
        let mut seen = std::collections::HashSet::new();
        self.chunks
            .iter()
            .filter(|c| seen.insert(c.hash))
            .map(|c| c.hash)
            .collect()
    }

    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        millis_to_system_time(self.created_at_ms)
    }
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
struct ManifestRecord {
    id: [u8; 16],
    chunks: Vec<ChunkRecord>,
    total_size: u64,
    file_hash: [u8; 32],
    created_at_ms: i64,
    device: String,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone)]
pub(crate) struct ChunkRecord {
    offset: u64,
    length: u32,
    hash: [u8; 32],
}

impl From<&Chunk> for ChunkRecord {
    fn from(chunk: &Chunk) -> Self {
        Self {
            offset: chunk.offset,
            length: chunk.length,
            hash: *chunk.hash.as_bytes(),
        }
    }
}

impl From<&ChunkRecord> for Chunk {
    fn from(record: &ChunkRecord) -> Self {
        Self {
            offset: record.offset,
            length: record.length,
            hash: ContentHash::from_raw(record.hash),
        }
    }
}

impl From<&FileManifest> for ManifestRecord {
    fn from(manifest: &FileManifest) -> Self {
        Self {
            id: *manifest.id.as_bytes(),
            chunks: manifest.chunks.iter().map(ChunkRecord::from).collect(),
            total_size: manifest.total_size,
            file_hash: *manifest.file_hash.as_bytes(),
            created_at_ms: manifest.created_at_ms,
            device: manifest.device.clone(),
        }
    }
}

impl From<ManifestRecord> for FileManifest {
    fn from(record: ManifestRecord) -> Self {
        Self {
            id: ManifestId::from_bytes(record.id),
            chunks: record.chunks.iter().map(Chunk::from).collect(),
            total_size: record.total_size,
            file_hash: ContentHash::from_raw(record.file_hash),
            created_at_ms: record.created_at_ms,
            device: record.device,
        }
    }
}

/// Durable manifest storage.
pub struct ManifestStore {
    env: Env,
    /// manifests database: uuid -> rkyv `ManifestRecord`
    manifests: Database<Bytes, Bytes>,
}

impl ManifestStore {
    /// Open or create a manifest store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    pub fn open(path: &Path, map_size: usize) -> Result<Self> {
        let env = open_env(path, map_size, 1)?;

        let mut wtxn = env.write_txn()?;
        let manifests: Database<Bytes, Bytes> = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name("manifests")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, manifests })
    }

    /// Store a new manifest. Existing ids are never overwritten.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidPlan`] if the id is already taken.
    pub fn put(&self, manifest: &FileManifest) -> Result<()> {
        let record = ManifestRecord::from(manifest);
        let bytes = rkyv::to_bytes::<RkyvError>(&record)
            .map_err(|e| VaultError::Serialization(format!("rkyv serialization failed: {e}")))?;

        let mut wtxn = self.env.write_txn()?;
        if self.manifests.get(&wtxn, manifest.id.as_bytes())?.is_some() {
            return Err(VaultError::InvalidPlan(format!(
                "manifest {} already exists",
                manifest.id
            )));
        }
        self.manifests
            .put(&mut wtxn, manifest.id.as_bytes(), &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// # Errors
    /// Returns [`VaultError::ManifestNotFound`] if no manifest has this id.
    pub fn get(&self, id: &ManifestId) -> Result<FileManifest> {
        let rtxn = self.env.read_txn()?;
        let data = self
            .manifests
            .get(&rtxn, id.as_bytes())?
            .ok_or(VaultError::ManifestNotFound(*id))?;

        // LMDB gives no alignment guarantee for values.
        let mut aligned = AlignedVec::<16>::new();
        aligned.extend_from_slice(data);
        let record = rkyv::from_bytes::<ManifestRecord, RkyvError>(&aligned)
            .map_err(|e| VaultError::Serialization(format!("corrupt manifest {id}: {e}")))?;
        Ok(record.into())
    }

    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn contains(&self, id: &ManifestId) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.manifests.get(&rtxn, id.as_bytes())?.is_some())
    }

    /// Drop a manifest retired by retention or rolled back before it became current.
    pub(crate) fn remove(&self, id: &ManifestId) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.manifests.delete(&mut wtxn, id.as_bytes())?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// Number of stored manifests
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.manifests.len(&rtxn)?)
    }

    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
