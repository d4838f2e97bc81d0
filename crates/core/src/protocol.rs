//! Binary protocol between vault clients and the vault agent
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Chunk traffic is raw binary:
//! - `SEND_CHUNK`: session:16, hash:32, data
//! - `CHUNK_DATA`: data
//! - `MISSING`: count:4, hashes:[32]*count
//!
//! Session-scoped requests carry the 16-byte session id. Errors carry a
//! kind code (1 byte) and a UTF-8 message. Everything else is JSON.

use std::io::{Read, Write};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cas::GcReport;
use crate::conflict::ConflictChoice;
use crate::error::{ErrorKind, Result, VaultError};
use crate::hash::ContentHash;
use crate::manifest::{FileManifest, ManifestId};
use crate::session::{ChunkReceipt, SessionId, SessionProgress, UploadOutcome, UploadPlan};
use crate::sync_index::{ResolveOutcome, SyncEntry};
use crate::vault::{BeginOutcome, UsageReport};

/// Frame header: type byte plus payload length
pub const HEADER_LEN: usize = 5;

/// Largest accepted payload: one maximal chunk plus its addressing
pub const MAX_FRAME_LEN: u32 = crate::chunker::MAX_CHUNK_SIZE + 1024;

/// Message type identifiers
pub mod msg {
    // Upload requests
    pub const BEGIN_UPLOAD: u8 = 0x01;
    pub const SEND_CHUNK: u8 = 0x02;
    pub const COMPLETE_UPLOAD: u8 = 0x03;
    pub const CANCEL_UPLOAD: u8 = 0x04;
    pub const PAUSE_UPLOAD: u8 = 0x05;
    pub const RESUME_UPLOAD: u8 = 0x06;
    pub const MISSING_REQ: u8 = 0x07;
    pub const WAIT_ADMITTED: u8 = 0x08;
    pub const PROGRESS_REQ: u8 = 0x09;
    // Index requests
    pub const GET_ENTRY: u8 = 0x10;
    pub const LIST_ENTRIES: u8 = 0x11;
    pub const READ_MANIFEST: u8 = 0x12;
    pub const READ_CHUNK: u8 = 0x13;
    pub const LIST_CONFLICTS: u8 = 0x14;
    pub const RESOLVE: u8 = 0x15;
    pub const DELETE_ENTRY: u8 = 0x16;
    pub const RESTORE_VERSION: u8 = 0x17;
    pub const RENAME_ENTRY: u8 = 0x18;
    pub const LIST_VERSIONS: u8 = 0x19;
    pub const COLLECT_GARBAGE: u8 = 0x1A;
    pub const USAGE_REQ: u8 = 0x1B;
    pub const SHUTDOWN: u8 = 0x1F;
    // Responses
    pub const OK: u8 = 0x80;
    pub const ERROR: u8 = 0x81;
    pub const BEGAN: u8 = 0x82;
    pub const RECEIPT: u8 = 0x83;
    pub const UPLOAD_DONE: u8 = 0x84;
    pub const MISSING: u8 = 0x85;
    pub const ENTRY: u8 = 0x86;
    pub const ENTRIES: u8 = 0x87;
    pub const MANIFEST: u8 = 0x88;
    pub const CHUNK_DATA: u8 = 0x89;
    pub const RESOLVED: u8 = 0x8A;
    pub const PROGRESS: u8 = 0x8B;
    pub const MANIFESTS: u8 = 0x8C;
    pub const GC_REPORT: u8 = 0x8D;
    pub const USAGE: u8 = 0x8E;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    BeginUpload(UploadPlan),
    SendChunk {
        session: SessionId,
        hash: ContentHash,
        data: Bytes,
    },
    CompleteUpload(SessionId),
    CancelUpload(SessionId),
    PauseUpload(SessionId),
    ResumeUpload(SessionId),
    MissingChunks(SessionId),
    WaitAdmitted(SessionId),
    Progress(SessionId),
    GetEntry(String),
    /// Entries under a path prefix
    ListEntries(String),
    ReadManifest(ManifestId),
    ReadChunk(ContentHash),
    ListConflicts,
    Resolve {
        path: String,
        choice: ConflictChoice,
    },
    DeleteEntry {
        path: String,
        base_version: Option<u64>,
    },
    RestoreVersion {
        path: String,
        manifest_id: ManifestId,
    },
    RenameEntry {
        from: String,
        to: String,
    },
    ListVersions(String),
    CollectGarbage,
    Usage,
    Shutdown,

    Ok,
    Error {
        kind: ErrorKind,
        message: String,
    },
    Began(BeginOutcome),
    Receipt(ChunkReceipt),
    UploadDone(UploadOutcome),
    Missing(Vec<ContentHash>),
    SessionProgress(SessionProgress),
    Entry(SyncEntry),
    Entries(Vec<SyncEntry>),
    Manifest(FileManifest),
    Manifests(Vec<FileManifest>),
    ChunkData(Bytes),
    Resolved(ResolveOutcome),
    GcReport(GcReport),
    UsageReport(UsageReport),
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ResolveRequest {
    path: String,
    choice: ConflictChoice,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct DeleteRequest {
    path: String,
    base_version: Option<u64>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RestoreRequest {
    path: String,
    manifest_id: ManifestId,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RenameRequest {
    from: String,
    to: String,
}

fn json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| VaultError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| VaultError::Serialization(e.to_string()))
}

fn malformed(what: &str) -> VaultError {
    VaultError::Serialization(format!("malformed {what} frame"))
}

fn session_id(payload: &[u8]) -> Result<SessionId> {
    let bytes: [u8; 16] = payload.try_into().map_err(|_| malformed("session"))?;
    Ok(SessionId::from_bytes(bytes))
}

fn hash_at(payload: &[u8], at: usize) -> Result<ContentHash> {
    let bytes: [u8; 32] = payload
        .get(at..at + 32)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| malformed("hash"))?;
    Ok(ContentHash::from_raw(bytes))
}

fn utf8(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec()).map_err(|_| malformed("text"))
}

fn encode_hashes(hashes: &[ContentHash]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + hashes.len() * 32);
    buf.extend_from_slice(&(hashes.len() as u32).to_be_bytes());
    for hash in hashes {
        buf.extend_from_slice(hash.as_bytes());
    }
    buf
}

fn decode_hashes(payload: &[u8]) -> Result<Vec<ContentHash>> {
    let count_bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| malformed("missing"))?;
    let count = u32::from_be_bytes(count_bytes) as usize;
    if payload.len() != 4 + count * 32 {
        return Err(malformed("missing"));
    }
    (0..count).map(|i| hash_at(payload, 4 + i * 32)).collect()
}

impl Message {
    /// Response for a failed request, keeping the error's kind.
    #[must_use]
    pub fn from_error(error: &VaultError) -> Self {
        Self::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Type byte and payload
    ///
    /// # Errors
    /// Returns [`VaultError::Serialization`] if a JSON payload cannot be encoded.
    #[allow(clippy::too_many_lines)]
    pub fn encode(&self) -> Result<(u8, Vec<u8>)> {
        let frame = match self {
            Self::BeginUpload(plan) => (msg::BEGIN_UPLOAD, json(plan)?),
            Self::SendChunk {
                session,
                hash,
                data,
            } => {
                let mut buf = Vec::with_capacity(16 + 32 + data.len());
                buf.extend_from_slice(session.as_bytes());
                buf.extend_from_slice(hash.as_bytes());
                buf.extend_from_slice(data);
                (msg::SEND_CHUNK, buf)
            }
            Self::CompleteUpload(id) => (msg::COMPLETE_UPLOAD, id.as_bytes().to_vec()),
            Self::CancelUpload(id) => (msg::CANCEL_UPLOAD, id.as_bytes().to_vec()),
            Self::PauseUpload(id) => (msg::PAUSE_UPLOAD, id.as_bytes().to_vec()),
            Self::ResumeUpload(id) => (msg::RESUME_UPLOAD, id.as_bytes().to_vec()),
            Self::MissingChunks(id) => (msg::MISSING_REQ, id.as_bytes().to_vec()),
            Self::WaitAdmitted(id) => (msg::WAIT_ADMITTED, id.as_bytes().to_vec()),
            Self::Progress(id) => (msg::PROGRESS_REQ, id.as_bytes().to_vec()),
            Self::GetEntry(path) => (msg::GET_ENTRY, path.as_bytes().to_vec()),
            Self::ListEntries(prefix) => (msg::LIST_ENTRIES, prefix.as_bytes().to_vec()),
            Self::ReadManifest(id) => (msg::READ_MANIFEST, id.as_bytes().to_vec()),
            Self::ReadChunk(hash) => (msg::READ_CHUNK, hash.as_bytes().to_vec()),
            Self::ListConflicts => (msg::LIST_CONFLICTS, Vec::new()),
            Self::Resolve { path, choice } => (
                msg::RESOLVE,
                json(&ResolveRequest {
                    path: path.clone(),
                    choice: *choice,
                })?,
            ),
            Self::DeleteEntry { path, base_version } => (
                msg::DELETE_ENTRY,
                json(&DeleteRequest {
                    path: path.clone(),
                    base_version: *base_version,
                })?,
            ),
            Self::RestoreVersion { path, manifest_id } => (
                msg::RESTORE_VERSION,
                json(&RestoreRequest {
                    path: path.clone(),
                    manifest_id: *manifest_id,
                })?,
            ),
            Self::RenameEntry { from, to } => (
                msg::RENAME_ENTRY,
                json(&RenameRequest {
                    from: from.clone(),
                    to: to.clone(),
                })?,
            ),
            Self::ListVersions(path) => (msg::LIST_VERSIONS, path.as_bytes().to_vec()),
            Self::CollectGarbage => (msg::COLLECT_GARBAGE, Vec::new()),
            Self::Usage => (msg::USAGE_REQ, Vec::new()),
            Self::Shutdown => (msg::SHUTDOWN, Vec::new()),

            Self::Ok => (msg::OK, Vec::new()),
            Self::Error { kind, message } => {
                let mut buf = Vec::with_capacity(1 + message.len());
                buf.push(kind.code());
                buf.extend_from_slice(message.as_bytes());
                (msg::ERROR, buf)
            }
            Self::Began(outcome) => (msg::BEGAN, json(outcome)?),
            Self::Receipt(receipt) => (msg::RECEIPT, json(receipt)?),
            Self::UploadDone(outcome) => (msg::UPLOAD_DONE, json(outcome)?),
            Self::Missing(hashes) => (msg::MISSING, encode_hashes(hashes)),
            Self::SessionProgress(progress) => (msg::PROGRESS, json(progress)?),
            Self::Entry(entry) => (msg::ENTRY, json(entry)?),
            Self::Entries(entries) => (msg::ENTRIES, json(entries)?),
            Self::Manifest(manifest) => (msg::MANIFEST, json(manifest)?),
            Self::Manifests(manifests) => (msg::MANIFESTS, json(manifests)?),
            Self::ChunkData(data) => (msg::CHUNK_DATA, data.to_vec()),
            Self::Resolved(outcome) => (msg::RESOLVED, json(outcome)?),
            Self::GcReport(report) => (msg::GC_REPORT, json(report)?),
            Self::UsageReport(report) => (msg::USAGE, json(report)?),
        };
        Ok(frame)
    }

    /// Rebuild a message from its type byte and payload.
    ///
    /// # Errors
    /// Returns [`VaultError::Serialization`] for unknown types or malformed payloads.
    #[allow(clippy::too_many_lines)]
    pub fn decode(msg_type: u8, payload: Bytes) -> Result<Self> {
        let message = match msg_type {
            msg::BEGIN_UPLOAD => Self::BeginUpload(from_json(&payload)?),
            msg::SEND_CHUNK => {
                if payload.len() < 48 {
                    return Err(malformed("chunk"));
                }
                Self::SendChunk {
                    session: session_id(&payload[..16])?,
                    hash: hash_at(&payload, 16)?,
                    data: payload.slice(48..),
                }
            }
            msg::COMPLETE_UPLOAD => Self::CompleteUpload(session_id(&payload)?),
            msg::CANCEL_UPLOAD => Self::CancelUpload(session_id(&payload)?),
            msg::PAUSE_UPLOAD => Self::PauseUpload(session_id(&payload)?),
            msg::RESUME_UPLOAD => Self::ResumeUpload(session_id(&payload)?),
            msg::MISSING_REQ => Self::MissingChunks(session_id(&payload)?),
            msg::WAIT_ADMITTED => Self::WaitAdmitted(session_id(&payload)?),
            msg::PROGRESS_REQ => Self::Progress(session_id(&payload)?),
            msg::GET_ENTRY => Self::GetEntry(utf8(&payload)?),
            msg::LIST_ENTRIES => Self::ListEntries(utf8(&payload)?),
            msg::READ_MANIFEST => {
                let bytes: [u8; 16] = payload[..]
                    .try_into()
                    .map_err(|_| malformed("manifest id"))?;
                Self::ReadManifest(ManifestId::from_bytes(bytes))
            }
            msg::READ_CHUNK => {
                if payload.len() != 32 {
                    return Err(malformed("chunk request"));
                }
                Self::ReadChunk(hash_at(&payload, 0)?)
            }
            msg::LIST_CONFLICTS => Self::ListConflicts,
            msg::RESOLVE => {
                let req: ResolveRequest = from_json(&payload)?;
                Self::Resolve {
                    path: req.path,
                    choice: req.choice,
                }
            }
            msg::DELETE_ENTRY => {
                let req: DeleteRequest = from_json(&payload)?;
                Self::DeleteEntry {
                    path: req.path,
                    base_version: req.base_version,
                }
            }
            msg::RESTORE_VERSION => {
                let req: RestoreRequest = from_json(&payload)?;
                Self::RestoreVersion {
                    path: req.path,
                    manifest_id: req.manifest_id,
                }
            }
            msg::RENAME_ENTRY => {
                let req: RenameRequest = from_json(&payload)?;
                Self::RenameEntry {
                    from: req.from,
                    to: req.to,
                }
            }
            msg::LIST_VERSIONS => Self::ListVersions(utf8(&payload)?),
            msg::COLLECT_GARBAGE => Self::CollectGarbage,
            msg::USAGE_REQ => Self::Usage,
            msg::SHUTDOWN => Self::Shutdown,

            msg::OK => Self::Ok,
            msg::ERROR => {
                let (&code, text) = payload.split_first().ok_or_else(|| malformed("error"))?;
                Self::Error {
                    kind: ErrorKind::from_code(code),
                    message: String::from_utf8_lossy(text).into_owned(),
                }
            }
            msg::BEGAN => Self::Began(from_json(&payload)?),
            msg::RECEIPT => Self::Receipt(from_json(&payload)?),
            msg::UPLOAD_DONE => Self::UploadDone(from_json(&payload)?),
            msg::MISSING => Self::Missing(decode_hashes(&payload)?),
            msg::PROGRESS => Self::SessionProgress(from_json(&payload)?),
            msg::ENTRY => Self::Entry(from_json(&payload)?),
            msg::ENTRIES => Self::Entries(from_json(&payload)?),
            msg::MANIFEST => Self::Manifest(from_json(&payload)?),
            msg::MANIFESTS => Self::Manifests(from_json(&payload)?),
            msg::CHUNK_DATA => Self::ChunkData(payload),
            msg::RESOLVED => Self::Resolved(from_json(&payload)?),
            msg::GC_REPORT => Self::GcReport(from_json(&payload)?),
            msg::USAGE => Self::UsageReport(from_json(&payload)?),
            other => {
                return Err(VaultError::Serialization(format!(
                    "unknown message type: {other:#04x}"
                )));
            }
        };
        Ok(message)
    }

    /// Header and payload in one buffer, ready for the wire.
    ///
    /// # Errors
    /// Returns an error if the payload cannot be encoded or exceeds [`MAX_FRAME_LEN`].
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let (msg_type, payload) = self.encode()?;
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&encode_header(msg_type, payload.len())?);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// # Errors
/// Returns [`VaultError::Serialization`] if `len` exceeds [`MAX_FRAME_LEN`].
pub fn encode_header(msg_type: u8, len: usize) -> Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| VaultError::Serialization(format!("frame of {len} bytes too large")))?;
    let mut header = [0u8; HEADER_LEN];
    header[0] = msg_type;
    header[1..].copy_from_slice(&len.to_be_bytes());
    Ok(header)
}

/// Returns (type, payload length).
///
/// # Errors
/// Returns [`VaultError::Serialization`] if the announced length exceeds [`MAX_FRAME_LEN`].
pub fn decode_header(header: [u8; HEADER_LEN]) -> Result<(u8, usize)> {
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        return Err(VaultError::Serialization(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    Ok((header[0], len as usize))
}

/// Protocol writer for sending messages
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one message and flush.
    ///
    /// # Errors
    /// Returns an error if encoding or the underlying write fails.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.inner.write_all(&message.to_frame()?)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Protocol reader for receiving messages
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read next message. Returns `None` on a clean end of stream.
    ///
    /// # Errors
    /// Returns an error on truncated frames, unknown types or bad payloads.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; HEADER_LEN];
        match self.inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let (msg_type, len) = decode_header(header)?;

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        Message::decode(msg_type, Bytes::from(payload)).map(Some)
    }

    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}
