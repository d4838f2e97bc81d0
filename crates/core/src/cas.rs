//! Content-Addressable Storage (CAS) for chunk deduplication
//!
//! Stores chunks by their BLAKE3 hash. Never stores the same content twice.
//! Every stored chunk carries a reference count: the number of manifests that
//! list it. Garbage collection only removes chunks nobody references.
//!
//! Chunks only old versions still use can be packed: moved to a second
//! database as zstd frames and unpacked again when they become current.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use bytes::Bytes;
use heed::types::Bytes as HeedBytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, VaultError};
use crate::hash::ContentHash;

/// Open (creating if needed) an LMDB environment directory.
#[allow(unsafe_code)]
pub(crate) fn open_env(path: &Path, map_size: usize, max_dbs: u32) -> Result<Env> {
    std::fs::create_dir_all(path)?;

    // SAFETY: heed requires unsafe for memory-mapped I/O. The only requirement
    // is that nothing outside this process rewrites the files while the Env is open.
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size)
            .max_dbs(max_dbs)
            .open(path)?
    };
    Ok(env)
}

/// Result of [`ChunkStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The bytes were written by this call
    Committed,
    /// Identical content was already stored; nothing was written
    AlreadyExists,
}

const PACK_LEVEL: i32 = 3;

/// A chunk as it sits in one of the two data databases
enum Stored<'t> {
    Raw(&'t [u8]),
    /// Big-endian u64 raw length, then a zstd frame
    Packed(&'t [u8]),
}

impl Stored<'_> {
    fn raw_len(&self, hash: &ContentHash) -> Result<u64> {
        match self {
            Self::Raw(data) => Ok(data.len() as u64),
            Self::Packed(value) => split_packed(hash, value).map(|(len, _)| len),
        }
    }

    fn decode(&self, hash: &ContentHash) -> Result<Bytes> {
        match self {
            Self::Raw(data) => Ok(Bytes::copy_from_slice(data)),
            Self::Packed(value) => unpack(hash, value).map(Bytes::from),
        }
    }
}

fn pack(data: &[u8]) -> Result<Vec<u8>> {
    let mut value = (data.len() as u64).to_be_bytes().to_vec();
    value.extend(zstd::encode_all(data, PACK_LEVEL)?);
    Ok(value)
}

fn split_packed<'v>(hash: &ContentHash, value: &'v [u8]) -> Result<(u64, &'v [u8])> {
    let corrupt = || VaultError::Serialization(format!("corrupt packed chunk {hash}"));
    let (len, frame) = value.split_first_chunk::<8>().ok_or_else(corrupt)?;
    Ok((u64::from_be_bytes(*len), frame))
}

fn unpack(hash: &ContentHash, value: &[u8]) -> Result<Vec<u8>> {
    let (len, frame) = split_packed(hash, value)?;
    let data = zstd::decode_all(frame)?;
    if data.len() as u64 != len {
        return Err(VaultError::Serialization(format!(
            "packed chunk {hash} unpacked to {} bytes, expected {len}",
            data.len()
        )));
    }
    Ok(data)
}

/// Content-addressable chunk store using LMDB.
///
/// Key: ContentHash (32 bytes)
/// Value: raw chunk bytes in `chunks`, or a packed frame in `packed`
///
/// A chunk lives in exactly one of the two. The `refs` database maps the same
/// key to a big-endian u64 count.
pub struct ChunkStore {
    env: Env,
    /// chunks database: hash -> data
    chunks: Database<HeedBytes, HeedBytes>,
    /// packed database: hash -> length-prefixed zstd frame
    packed: Database<HeedBytes, HeedBytes>,
    /// refs database: hash -> reference count
    refs: Database<HeedBytes, HeedBytes>,
}

impl ChunkStore {
    /// Open or create a chunk store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    pub fn open(path: &Path, map_size: usize) -> Result<Self> {
        let env = open_env(path, map_size, 3)?;

        let mut wtxn = env.write_txn()?;
        let chunks: Database<HeedBytes, HeedBytes> = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("chunks")
            .create(&mut wtxn)?;
        let refs: Database<HeedBytes, HeedBytes> = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("refs")
            .create(&mut wtxn)?;
        let packed: Database<HeedBytes, HeedBytes> = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("packed")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self {
            env,
            chunks,
            packed,
            refs,
        })
    }

    fn lookup<'t>(&self, txn: &'t RoTxn<'_>, hash: &ContentHash) -> Result<Option<Stored<'t>>> {
        if let Some(data) = self.chunks.get(txn, hash.as_bytes())? {
            return Ok(Some(Stored::Raw(data)));
        }
        Ok(self.packed.get(txn, hash.as_bytes())?.map(Stored::Packed))
    }

    /// Check if a chunk exists in the store.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn has(&self, hash: &ContentHash) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.lookup(&rtxn, hash)?.is_some())
    }

    /// Get a chunk by its hash.
    ///
    /// # Errors
    /// Returns [`VaultError::ChunkNotFound`] if nothing is stored under `hash`.
    pub fn get(&self, hash: &ContentHash) -> Result<Bytes> {
        let rtxn = self.env.read_txn()?;
        self.lookup(&rtxn, hash)?
            .ok_or(VaultError::ChunkNotFound(*hash))?
            .decode(hash)
    }

    /// Unpacked length of a chunk, if present
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn chunk_len(&self, hash: &ContentHash) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        self.lookup(&rtxn, hash)?
            .map(|stored| stored.raw_len(hash))
            .transpose()
    }

    /// Store a chunk.
    ///
    /// The hash is recomputed before anything is written. The existence check
    /// and the insert share one write transaction, so concurrent puts of the
    /// same content write it exactly once.
    ///
    /// # Errors
    /// Returns [`VaultError::HashMismatch`] if `data` does not hash to `hash`,
    /// or [`VaultError::LengthMismatch`] if the stored copy has another length.
    pub fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<PutOutcome> {
        let computed = ContentHash::from_bytes(data);
        if computed != *hash {
            return Err(VaultError::HashMismatch {
                expected: *hash,
                actual: computed,
            });
        }

        let mut wtxn = self.env.write_txn()?;

        if let Some(existing) = self.lookup(&wtxn, hash)? {
            let expected = existing.raw_len(hash)?;
            if expected != data.len() as u64 {
                return Err(VaultError::LengthMismatch {
                    hash: *hash,
                    expected,
                    actual: data.len() as u64,
                });
            }
            return Ok(PutOutcome::AlreadyExists);
        }

        self.chunks.put(&mut wtxn, hash.as_bytes(), data)?;
        wtxn.commit()?;
        debug!(hash = %hash, bytes = data.len(), "chunk committed");
        Ok(PutOutcome::Committed)
    }

    /// Check which hashes are missing from the store, preserving order.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn find_missing(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        let rtxn = self.env.read_txn()?;
        let mut missing = Vec::new();
        for hash in hashes {
            if self.lookup(&rtxn, hash)?.is_none() {
                missing.push(*hash);
            }
        }
        Ok(missing)
    }

    /// Increment the reference count of each distinct hash once.
    ///
    /// Either every count moves or none does.
    ///
    /// # Errors
    /// Returns [`VaultError::ChunkNotFound`] if any chunk is absent.
    pub fn retain(&self, hashes: &[ContentHash]) -> Result<()> {
        let distinct: BTreeSet<&ContentHash> = hashes.iter().collect();
        let mut wtxn = self.env.write_txn()?;

        for hash in distinct {
            if self.lookup(&wtxn, hash)?.is_none() {
                return Err(VaultError::ChunkNotFound(*hash));
            }
            let count = self.read_count(&wtxn, hash)?;
            self.refs
                .put(&mut wtxn, hash.as_bytes(), &(count + 1).to_be_bytes())?;
        }

        wtxn.commit()?;
        Ok(())
    }

    /// Decrement the reference count of each distinct hash once, stopping at zero.
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn release(&self, hashes: &[ContentHash]) -> Result<()> {
        let distinct: BTreeSet<&ContentHash> = hashes.iter().collect();
        let mut wtxn = self.env.write_txn()?;

        for hash in distinct {
            let count = self.read_count(&wtxn, hash)?;
            match count {
                0 => {}
                1 => {
                    self.refs.delete(&mut wtxn, hash.as_bytes())?;
                }
                n => {
                    self.refs
                        .put(&mut wtxn, hash.as_bytes(), &(n - 1).to_be_bytes())?;
                }
            }
        }

        wtxn.commit()?;
        Ok(())
    }

    /// Current reference count of a chunk (0 when unknown)
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn ref_count(&self, hash: &ContentHash) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        self.read_count(&rtxn, hash)
    }

    fn read_count(&self, txn: &RoTxn<'_>, hash: &ContentHash) -> Result<u64> {
        let Some(raw) = self.refs.get(txn, hash.as_bytes())? else {
            return Ok(0);
        };
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| VaultError::Serialization(format!("corrupt ref count for {hash}")))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Remove every chunk with a zero reference count that is not in `protected`.
    ///
    /// `protected` holds chunks that in-flight uploads still need.
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn collect_garbage(&self, protected: &HashSet<ContentHash>) -> Result<GcReport> {
        let mut wtxn = self.env.write_txn()?;

        let mut doomed = Vec::new();
        for db in [&self.chunks, &self.packed] {
            for entry in db.iter(&wtxn)? {
                let (key, data) = entry?;
                let Some(hash) = key_hash(key) else {
                    continue;
                };
                if protected.contains(&hash) {
                    continue;
                }
                if self.refs.get(&wtxn, key)?.is_none() {
                    doomed.push((hash, data.len() as u64));
                }
            }
        }

        let mut report = GcReport::default();
        for (hash, len) in doomed {
            self.delete(&mut wtxn, &hash)?;
            report.removed_chunks += 1;
            report.reclaimed_bytes += len;
        }

        wtxn.commit()?;
        if report.removed_chunks > 0 {
            info!(
                removed = report.removed_chunks,
                bytes = report.reclaimed_bytes,
                "garbage collected chunks"
            );
        }
        Ok(report)
    }

    fn delete(&self, wtxn: &mut heed::RwTxn<'_>, hash: &ContentHash) -> Result<()> {
        self.chunks.delete(wtxn, hash.as_bytes())?;
        self.packed.delete(wtxn, hash.as_bytes())?;
        self.refs.delete(wtxn, hash.as_bytes())?;
        Ok(())
    }

    /// Pack every raw chunk outside `hot` and unpack every packed chunk inside it.
    ///
    /// Chunks zstd cannot shrink stay raw.
    ///
    /// # Errors
    /// Returns an error if the write transaction fails or a packed chunk is corrupt.
    pub fn repack(&self, hot: &HashSet<ContentHash>) -> Result<GcReport> {
        let mut wtxn = self.env.write_txn()?;

        let mut cold = Vec::new();
        for entry in self.chunks.iter(&wtxn)? {
            let (key, _) = entry?;
            if let Some(hash) = key_hash(key).filter(|h| !hot.contains(h)) {
                cold.push(hash);
            }
        }
        let mut warm = Vec::new();
        for entry in self.packed.iter(&wtxn)? {
            let (key, _) = entry?;
            if let Some(hash) = key_hash(key).filter(|h| hot.contains(h)) {
                warm.push(hash);
            }
        }

        let mut report = GcReport::default();
        for hash in cold {
            let Some(data) = self.chunks.get(&wtxn, hash.as_bytes())? else {
                continue;
            };
            let raw_len = data.len() as u64;
            let value = pack(data)?;
            if value.len() as u64 >= raw_len {
                continue;
            }
            self.packed.put(&mut wtxn, hash.as_bytes(), &value)?;
            self.chunks.delete(&mut wtxn, hash.as_bytes())?;
            report.packed_chunks += 1;
            report.packed_savings += raw_len - value.len() as u64;
        }
        for hash in warm {
            let Some(value) = self.packed.get(&wtxn, hash.as_bytes())? else {
                continue;
            };
            let data = unpack(&hash, value)?;
            self.chunks.put(&mut wtxn, hash.as_bytes(), &data)?;
            self.packed.delete(&mut wtxn, hash.as_bytes())?;
            report.unpacked_chunks += 1;
        }

        wtxn.commit()?;
        if report.packed_chunks + report.unpacked_chunks > 0 {
            info!(
                packed = report.packed_chunks,
                unpacked = report.unpacked_chunks,
                saved = report.packed_savings,
                "repacked chunks"
            );
        }
        Ok(report)
    }

    /// Get statistics about the store.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = StoreStats::default();

        for entry in self.chunks.iter(&rtxn)? {
            let (_, data) = entry?;
            stats.count += 1;
            stats.total_bytes += data.len() as u64;
        }
        for entry in self.packed.iter(&rtxn)? {
            let (_, value) = entry?;
            stats.count += 1;
            stats.packed += 1;
            stats.total_bytes += value.len() as u64;
        }

        Ok(stats)
    }
}

fn key_hash(key: &[u8]) -> Option<ContentHash> {
    <[u8; 32]>::try_from(key).ok().map(ContentHash::from_raw)
}

/// Statistics about the chunk store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of unique chunks stored
    pub count: u64,
    /// Total bytes stored, packed chunks at their packed size
    pub total_bytes: u64,
    /// Chunks held as zstd frames
    pub packed: u64,
}

/// What a garbage collection pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub removed_chunks: u64,
    pub reclaimed_bytes: u64,
    /// Chunks of old versions compressed by this pass
    pub packed_chunks: u64,
    /// Packed chunks restored to raw because a current version uses them again
    pub unpacked_chunks: u64,
    /// Bytes saved by this pass's packing
    pub packed_savings: u64,
}
