//! Path -> manifest mapping with versions, history and conflict state
//!
//! Each entry carries a version token. A commit based on the current token
//! replaces the manifest; one based on a stale token marks the entry
//! conflicted. The check-and-swap runs under the entry's shard lock, so
//! commits to different paths never wait on each other.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::conflict::{ConflictChoice, ConflictPolicy, Resolution, decide, numbered_path};
use crate::error::{Result, VaultError};
use crate::manifest::{FileManifest, ManifestId, ManifestStore};

/// File name of the persisted index under the vault root
pub const INDEX_FILE: &str = "index.rkyv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryState {
    Synced,
    /// An upload targeting this path is in progress
    Pending,
    /// A stale-based commit is waiting for a decision
    Conflicted,
    /// Tombstone; the last manifest stays restorable until purged
    Deleted,
}

impl EntryState {
    fn code(self) -> u8 {
        match self {
            Self::Synced => 0,
            Self::Pending => 1,
            Self::Conflicted => 2,
            Self::Deleted => 3,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Pending,
            2 => Self::Conflicted,
            3 => Self::Deleted,
            _ => Self::Synced,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflicted => "conflicted",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// The incoming side of an unresolved conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub manifest_id: ManifestId,
    pub device: String,
    pub base_version: Option<u64>,
    pub detected_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub path: String,
    pub current_manifest_id: ManifestId,
    /// Optimistic concurrency token; bumps on every change of current content
    pub version: u64,
    /// Prior manifests, oldest first
    pub version_history: Vec<ManifestId>,
    pub device_origin: String,
    pub state: EntryState,
    pub conflict: Option<PendingConflict>,
    pub updated_at_ms: i64,
    #[serde(skip)]
    pending_uploads: u32,
}

impl SyncEntry {
    fn new(path: String, manifest_id: ManifestId, device: String, now_ms: i64) -> Self {
        Self {
            path,
            current_manifest_id: manifest_id,
            version: 1,
            version_history: Vec::new(),
            device_origin: device,
            state: EntryState::Synced,
            conflict: None,
            updated_at_ms: now_ms,
            pending_uploads: 0,
        }
    }

    /// Every manifest this entry keeps alive
    pub fn manifests(&self) -> impl Iterator<Item = ManifestId> + '_ {
        std::iter::once(self.current_manifest_id)
            .chain(self.version_history.iter().copied())
            .chain(self.conflict.iter().map(|c| c.manifest_id))
    }

    fn settled_state(&self) -> EntryState {
        if self.pending_uploads > 0 {
            EntryState::Pending
        } else {
            EntryState::Synced
        }
    }

    fn push_history(&mut self, id: ManifestId, retention: Retention) -> Vec<ManifestId> {
        self.version_history.push(id);
        retention.trim(&mut self.version_history)
    }
}

/// How many prior versions an entry keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Keep(usize),
    Unlimited,
}

impl Default for Retention {
    fn default() -> Self {
        Self::Keep(10)
    }
}

impl Retention {
    /// Drop the oldest entries beyond the limit, returning them.
    fn trim(self, history: &mut Vec<ManifestId>) -> Vec<ManifestId> {
        match self {
            Self::Unlimited => Vec::new(),
            Self::Keep(n) if history.len() > n => {
                let excess = history.len() - n;
                history.drain(..excess).collect()
            }
            Self::Keep(_) => Vec::new(),
        }
    }
}

impl Serialize for Retention {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Keep(n) => serializer.serialize_u64(*n as u64),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Retention {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(usize),
            Word(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(Self::Keep(n)),
            Repr::Word(w) if w.eq_ignore_ascii_case("unlimited") => Ok(Self::Unlimited),
            Repr::Word(w) => w
                .parse()
                .map(Self::Keep)
                .map_err(|_| serde::de::Error::custom(format!("invalid retention {w:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum CommitOutcome {
    Synced {
        version: u64,
        /// Manifests pushed out of history by retention
        retired: Vec<ManifestId>,
    },
    Conflicted {
        version: u64,
        /// Present when the configured policy resolved the conflict immediately
        resolution: Option<ResolveOutcome>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub choice: ConflictChoice,
    pub entry: SyncEntry,
    /// Sibling entry created by keep-both
    pub created: Option<SyncEntry>,
    pub retired: Vec<ManifestId>,
}

/// An entry after a maintenance operation, plus manifests it let go of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryUpdate {
    pub entry: SyncEntry,
    pub retired: Vec<ManifestId>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
struct IndexSnapshot {
    entries: Vec<EntryRecord>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
struct EntryRecord {
    path: String,
    current: [u8; 16],
    version: u64,
    history: Vec<[u8; 16]>,
    device: String,
    state: u8,
    conflict: Option<ConflictRecord>,
    updated_at_ms: i64,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
struct ConflictRecord {
    manifest: [u8; 16],
    device: String,
    base_version: Option<u64>,
    detected_at_ms: i64,
}

impl From<&SyncEntry> for EntryRecord {
    fn from(entry: &SyncEntry) -> Self {
        Self {
            path: entry.path.clone(),
            current: *entry.current_manifest_id.as_bytes(),
            version: entry.version,
            history: entry.version_history.iter().map(|id| *id.as_bytes()).collect(),
            device: entry.device_origin.clone(),
            state: entry.state.code(),
            conflict: entry.conflict.as_ref().map(|c| ConflictRecord {
                manifest: *c.manifest_id.as_bytes(),
                device: c.device.clone(),
                base_version: c.base_version,
                detected_at_ms: c.detected_at_ms,
            }),
            updated_at_ms: entry.updated_at_ms,
        }
    }
}

impl From<EntryRecord> for SyncEntry {
    fn from(record: EntryRecord) -> Self {
        // Upload counts are not persisted; restored sessions re-register.
        let state = match EntryState::from_code(record.state) {
            EntryState::Pending => EntryState::Synced,
            other => other,
        };
        Self {
            path: record.path,
            current_manifest_id: ManifestId::from_bytes(record.current),
            version: record.version,
            version_history: record
                .history
                .into_iter()
                .map(ManifestId::from_bytes)
                .collect(),
            device_origin: record.device,
            state,
            conflict: record.conflict.map(|c| PendingConflict {
                manifest_id: ManifestId::from_bytes(c.manifest),
                device: c.device,
                base_version: c.base_version,
                detected_at_ms: c.detected_at_ms,
            }),
            updated_at_ms: record.updated_at_ms,
            pending_uploads: 0,
        }
    }
}

pub struct SyncIndex {
    entries: DashMap<String, SyncEntry>,
    manifests: Arc<ManifestStore>,
    retention: Retention,
    policy: ConflictPolicy,
    clock: Arc<dyn Clock>,
    save_lock: Mutex<()>,
}

impl SyncIndex {
    #[must_use]
    pub fn new(
        manifests: Arc<ManifestStore>,
        retention: Retention,
        policy: ConflictPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            manifests,
            retention,
            policy,
            clock,
            save_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Make `manifest` the content of `path`, or record a conflict.
    ///
    /// `base_version` is the entry version the uploading device started from.
    /// The manifest must already be in the manifest store.
    ///
    /// # Errors
    /// - [`VaultError::Conflict`] if the entry is already conflicted
    /// - [`VaultError::ManifestNotFound`] if the manifest was never stored
    pub fn commit(
        &self,
        path: &str,
        manifest: &FileManifest,
        device: &str,
        base_version: Option<u64>,
    ) -> Result<CommitOutcome> {
        if !self.manifests.contains(&manifest.id)? {
            return Err(VaultError::ManifestNotFound(manifest.id));
        }
        let now = self.clock.now_millis();

        let conflicted_version = match self.entries.entry(path.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(SyncEntry::new(
                    path.to_string(),
                    manifest.id,
                    device.to_string(),
                    now,
                ));
                info!(path, manifest = %manifest.id, version = 1, "entry created");
                return Ok(CommitOutcome::Synced {
                    version: 1,
                    retired: Vec::new(),
                });
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.state == EntryState::Conflicted {
                    return Err(VaultError::Conflict {
                        path: path.to_string(),
                    });
                }

                let base_is_current = match base_version {
                    Some(base) => base == entry.version,
                    // Writing a fresh file over a tombstone needs no base.
                    None => entry.state == EntryState::Deleted,
                };

                if base_is_current {
                    let previous = entry.current_manifest_id;
                    let retired = entry.push_history(previous, self.retention);
                    entry.current_manifest_id = manifest.id;
                    entry.version += 1;
                    entry.device_origin = device.to_string();
                    entry.state = entry.settled_state();
                    entry.updated_at_ms = now;
                    info!(path, manifest = %manifest.id, version = entry.version, "entry updated");
                    return Ok(CommitOutcome::Synced {
                        version: entry.version,
                        retired,
                    });
                }

                warn!(
                    path,
                    current = entry.version,
                    base = ?base_version,
                    device,
                    "stale base version, entry conflicted"
                );
                entry.state = EntryState::Conflicted;
                entry.conflict = Some(PendingConflict {
                    manifest_id: manifest.id,
                    device: device.to_string(),
                    base_version,
                    detected_at_ms: now,
                });
                entry.updated_at_ms = now;
                entry.version
            }
        };

        // The shard guard is gone; resolving may touch other entries.
        let resolution = match self.policy.auto_choice() {
            None => None,
            Some(choice) => match self.resolve(path, choice) {
                Ok(outcome) => Some(outcome),
                Err(VaultError::NotConflicted(_)) => None,
                Err(e) => return Err(e),
            },
        };

        Ok(CommitOutcome::Conflicted {
            version: conflicted_version,
            resolution,
        })
    }

    /// Apply a decision to a conflicted entry.
    ///
    /// The losing manifest goes to history so it can still be restored.
    ///
    /// # Errors
    /// - [`VaultError::EntryNotFound`] if the path is unknown
    /// - [`VaultError::NotConflicted`] if there is nothing to resolve
    pub fn resolve(&self, path: &str, choice: ConflictChoice) -> Result<ResolveOutcome> {
        let now = self.clock.now_millis();

        let (entry, retired, keep_both) = {
            let mut guard = self
                .entries
                .get_mut(path)
                .ok_or_else(|| VaultError::EntryNotFound(path.to_string()))?;
            let entry = guard.value_mut();

            let Some(conflict) = entry.conflict.clone() else {
                return Err(VaultError::NotConflicted(path.to_string()));
            };
            if entry.state != EntryState::Conflicted {
                return Err(VaultError::NotConflicted(path.to_string()));
            }

            let current = self.manifests.get(&entry.current_manifest_id)?;
            let incoming = self.manifests.get(&conflict.manifest_id)?;
            let resolution = decide(choice, &current, &incoming);

            entry.conflict = None;
            entry.state = entry.settled_state();
            entry.updated_at_ms = now;

            let mut retired = Vec::new();
            let mut keep_both = None;
            match resolution {
                Resolution::UseIncoming => {
                    retired = entry.push_history(current.id, self.retention);
                    entry.current_manifest_id = incoming.id;
                    entry.device_origin.clone_from(&conflict.device);
                    entry.version += 1;
                }
                Resolution::UseCurrent => {
                    retired = entry.push_history(incoming.id, self.retention);
                }
                Resolution::KeepBoth => keep_both = Some(conflict),
            }

            info!(path, %choice, version = entry.version, "conflict resolved");
            (entry.clone(), retired, keep_both)
        };

        let created = keep_both.map(|conflict| self.insert_sibling(path, &conflict, now));

        Ok(ResolveOutcome {
            choice,
            entry,
            created,
            retired,
        })
    }

    /// Place a kept-both contender at the first free `name (N).ext`.
    fn insert_sibling(&self, path: &str, conflict: &PendingConflict, now: i64) -> SyncEntry {
        let mut attempt = 1;
        loop {
            let candidate = numbered_path(path, attempt);
            if let Entry::Vacant(slot) = self.entries.entry(candidate.clone()) {
                let entry = SyncEntry::new(
                    candidate.clone(),
                    conflict.manifest_id,
                    conflict.device.clone(),
                    now,
                );
                slot.insert(entry.clone());
                info!(path, copy = %candidate, "kept both versions");
                return entry;
            }
            attempt += 1;
        }
    }

    /// First `name (N).ext` not currently in the index
    #[must_use]
    pub fn free_sibling_path(&self, path: &str) -> String {
        let mut attempt = 1;
        loop {
            let candidate = numbered_path(path, attempt);
            if !self.entries.contains_key(&candidate) {
                return candidate;
            }
            attempt += 1;
        }
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<SyncEntry> {
        self.entries.get(path).map(|e| e.value().clone())
    }

    /// Live entries under `prefix`, sorted by path. Tombstones are left out.
    #[must_use]
    pub fn list(&self, prefix: &str) -> Vec<SyncEntry> {
        let mut entries: Vec<SyncEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.state != EntryState::Deleted)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Manifests some entry currently points at, tombstones included, plus the
    /// incoming side of open conflicts. Everything else is history.
    #[must_use]
    pub fn current_manifests(&self) -> HashSet<ManifestId> {
        self.entries
            .iter()
            .flat_map(|e| {
                std::iter::once(e.current_manifest_id)
                    .chain(e.conflict.as_ref().map(|c| c.manifest_id))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Tombstoned entries, sorted by path
    #[must_use]
    pub fn list_deleted(&self) -> Vec<SyncEntry> {
        let mut entries: Vec<SyncEntry> = self
            .entries
            .iter()
            .filter(|e| e.state == EntryState::Deleted)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    #[must_use]
    pub fn list_conflicts(&self) -> Vec<SyncEntry> {
        let mut entries: Vec<SyncEntry> = self
            .entries
            .iter()
            .filter(|e| e.state == EntryState::Conflicted)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Note that an upload now targets `path`.
    pub fn begin_pending(&self, path: &str) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.pending_uploads += 1;
            if entry.state == EntryState::Synced {
                entry.state = EntryState::Pending;
            }
        }
    }

    /// Note that an upload targeting `path` finished, however it ended.
    pub fn end_pending(&self, path: &str) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.pending_uploads = entry.pending_uploads.saturating_sub(1);
            if entry.pending_uploads == 0 && entry.state == EntryState::Pending {
                entry.state = EntryState::Synced;
            }
        }
    }

    /// Tombstone an entry. `base_version`, when given, must be current.
    ///
    /// # Errors
    /// - [`VaultError::EntryNotFound`] if the path is unknown or already deleted
    /// - [`VaultError::Conflict`] if the entry is conflicted or the base is stale
    pub fn mark_deleted(&self, path: &str, base_version: Option<u64>) -> Result<SyncEntry> {
        let mut entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| VaultError::EntryNotFound(path.to_string()))?;
        if entry.state == EntryState::Deleted {
            return Err(VaultError::EntryNotFound(path.to_string()));
        }
        let stale = base_version.is_some_and(|base| base != entry.version);
        if entry.state == EntryState::Conflicted || stale {
            return Err(VaultError::Conflict {
                path: path.to_string(),
            });
        }

        entry.state = EntryState::Deleted;
        entry.version += 1;
        entry.updated_at_ms = self.clock.now_millis();
        info!(path, version = entry.version, "entry deleted");
        Ok(entry.clone())
    }

    /// Make a manifest from the entry's history current again.
    ///
    /// Also revives tombstoned entries. Restoring the live current manifest
    /// changes nothing, the version included.
    ///
    /// # Errors
    /// - [`VaultError::EntryNotFound`] if the path is unknown
    /// - [`VaultError::ManifestNotFound`] if the manifest is not in this entry's history
    /// - [`VaultError::Conflict`] if the entry is conflicted
    pub fn restore_version(&self, path: &str, manifest_id: &ManifestId) -> Result<EntryUpdate> {
        let mut entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| VaultError::EntryNotFound(path.to_string()))?;
        if entry.state == EntryState::Conflicted {
            return Err(VaultError::Conflict {
                path: path.to_string(),
            });
        }

        if entry.current_manifest_id == *manifest_id && entry.state != EntryState::Deleted {
            return Ok(EntryUpdate {
                entry: entry.clone(),
                retired: Vec::new(),
            });
        }

        let mut retired = Vec::new();
        if entry.current_manifest_id != *manifest_id {
            let position = entry
                .version_history
                .iter()
                .position(|id| id == manifest_id)
                .ok_or(VaultError::ManifestNotFound(*manifest_id))?;
            entry.version_history.remove(position);
            let previous = entry.current_manifest_id;
            retired = entry.push_history(previous, self.retention);
            entry.current_manifest_id = *manifest_id;
        }

        entry.version += 1;
        entry.state = entry.settled_state();
        entry.updated_at_ms = self.clock.now_millis();
        info!(path, manifest = %manifest_id, version = entry.version, "version restored");
        Ok(EntryUpdate {
            entry: entry.clone(),
            retired,
        })
    }

    /// Move an entry, history included, to a new path.
    ///
    /// # Errors
    /// - [`VaultError::EntryNotFound`] if `from` is unknown
    /// - [`VaultError::Conflict`] if `from` is conflicted
    /// - [`VaultError::Busy`] while uploads still target `from`
    /// - [`VaultError::InvalidPlan`] if `to` is taken
    pub fn rename(&self, from: &str, to: &str) -> Result<SyncEntry> {
        let (_, entry) = self
            .entries
            .remove(from)
            .ok_or_else(|| VaultError::EntryNotFound(from.to_string()))?;
        let refused = if entry.state == EntryState::Conflicted {
            Some(VaultError::Conflict {
                path: from.to_string(),
            })
        } else if entry.pending_uploads > 0 {
            // their commits and pending bookkeeping are keyed by `from`
            Some(VaultError::Busy {
                path: from.to_string(),
            })
        } else {
            None
        };
        if let Some(e) = refused {
            self.entries.insert(from.to_string(), entry);
            return Err(e);
        }

        // Never hold a guard on `to` while touching `from`: both may share a shard.
        let placed = match self.entries.entry(to.to_string()) {
            Entry::Vacant(slot) => {
                let mut renamed = slot.insert(entry);
                renamed.path = to.to_string();
                renamed.version += 1;
                renamed.updated_at_ms = self.clock.now_millis();
                Ok(renamed.value().clone())
            }
            Entry::Occupied(_) => Err(entry),
        };

        match placed {
            Ok(renamed) => {
                info!(from, to, "entry renamed");
                Ok(renamed)
            }
            Err(entry) => {
                self.entries.insert(from.to_string(), entry);
                Err(VaultError::InvalidPlan(format!("{to} already exists")))
            }
        }
    }

    /// Drop tombstones older than `max_age`, returning the manifests they held.
    pub fn purge_deleted(&self, max_age: Duration) -> Vec<ManifestId> {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX));
        let mut released = Vec::new();
        self.entries.retain(|path, entry| {
            let expired = entry.state == EntryState::Deleted && entry.updated_at_ms <= cutoff;
            if expired {
                debug!(path, "purging tombstone");
                released.extend(entry.manifests());
            }
            !expired
        });
        released
    }

    /// Every manifest any entry still points at
    #[must_use]
    pub fn referenced_manifests(&self) -> HashSet<ManifestId> {
        self.entries
            .iter()
            .flat_map(|e| e.manifests().collect::<Vec<_>>())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the index to `<root>/index.rkyv` via a temp file and rename.
    ///
    /// # Errors
    /// Returns an error if serialization or any file operation fails.
    pub fn save(&self, root: &Path) -> Result<()> {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let snapshot = IndexSnapshot {
            entries: self
                .entries
                .iter()
                .map(|e| EntryRecord::from(e.value()))
                .collect(),
        };
        let bytes = rkyv::to_bytes::<RkyvError>(&snapshot)
            .map_err(|e| VaultError::Serialization(format!("failed to serialize index: {e}")))?;

        std::fs::create_dir_all(root)?;
        let target = root.join(INDEX_FILE);
        let tmp = root.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &target)?;
        debug!(entries = snapshot.entries.len(), "index saved");
        Ok(())
    }

    /// Load `<root>/index.rkyv`, or start empty if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(
        root: &Path,
        manifests: Arc<ManifestStore>,
        retention: Retention,
        policy: ConflictPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let index = Self::new(manifests, retention, policy, clock);
        let path = root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(index);
        }

        let bytes = std::fs::read(&path)?;
        let mut aligned = AlignedVec::<16>::new();
        aligned.extend_from_slice(&bytes);
        let snapshot = rkyv::from_bytes::<IndexSnapshot, RkyvError>(&aligned)
            .map_err(|e| VaultError::Serialization(format!("failed to load index: {e}")))?;

        for record in snapshot.entries {
            let entry = SyncEntry::from(record);
            index.entries.insert(entry.path.clone(), entry);
        }
        info!(entries = index.entries.len(), "index loaded");
        Ok(index)
    }
}
