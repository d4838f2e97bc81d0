//! Error taxonomy shared by every vault component

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::ContentHash;
use crate::manifest::ManifestId;
use crate::session::{SessionId, SessionStatus};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("failed to read source stream at offset {offset}: {source}")]
    StreamRead {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("chunk {hash} length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        hash: ContentHash,
        expected: u64,
        actual: u64,
    },

    #[error("integrity check failed for {path}: declared {expected}, reassembled {actual}")]
    Integrity {
        path: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("upload session {0} timed out")]
    SessionTimeout(SessionId),

    #[error("{path} has an unresolved conflict")]
    Conflict { path: String },

    #[error("{path} has uploads in progress")]
    Busy { path: String },

    #[error("chunk {0} not found")]
    ChunkNotFound(ContentHash),

    #[error("manifest {0} not found")]
    ManifestNotFound(ManifestId),

    #[error("no entry for {0}")]
    EntryNotFound(String),

    #[error("upload session {0} not found")]
    SessionNotFound(SessionId),

    #[error("chunk {hash} is not part of session {session}")]
    UnexpectedChunk {
        session: SessionId,
        hash: ContentHash,
    },

    #[error("session {session} cannot move from {from} to {to}")]
    InvalidTransition {
        session: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session {session} is {status} and not accepting chunks")]
    SessionNotAccepting {
        session: SessionId,
        status: SessionStatus,
    },

    #[error("session {0} is still waiting for admission")]
    NotAdmitted(SessionId),

    #[error("session {session} still misses {missing} chunks")]
    UploadIncomplete { session: SessionId, missing: usize },

    #[error("transfer queue is full ({depth} waiting)")]
    QueueFull { depth: usize },

    #[error("{0} is not conflicted")]
    NotConflicted(String),

    #[error("invalid upload plan: {0}")]
    InvalidPlan(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("directory scan failed: {0}")]
    Scan(#[from] ignore::Error),

    #[error("remote {kind} error: {message}")]
    Remote { kind: ErrorKind, message: String },
}

/// Coarse classification that survives the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    StreamRead,
    HashMismatch,
    Integrity,
    SessionTimeout,
    Conflict,
    NotFound,
    InvalidRequest,
    Backpressure,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::StreamRead => 1,
            Self::HashMismatch => 2,
            Self::Integrity => 3,
            Self::SessionTimeout => 4,
            Self::Conflict => 5,
            Self::NotFound => 6,
            Self::InvalidRequest => 7,
            Self::Backpressure => 8,
            Self::Internal => 9,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::StreamRead,
            2 => Self::HashMismatch,
            3 => Self::Integrity,
            4 => Self::SessionTimeout,
            5 => Self::Conflict,
            6 => Self::NotFound,
            7 => Self::InvalidRequest,
            8 => Self::Backpressure,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StreamRead => "stream-read",
            Self::HashMismatch => "hash-mismatch",
            Self::Integrity => "integrity",
            Self::SessionTimeout => "session-timeout",
            Self::Conflict => "conflict",
            Self::NotFound => "not-found",
            Self::InvalidRequest => "invalid-request",
            Self::Backpressure => "backpressure",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl VaultError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StreamRead { .. } => ErrorKind::StreamRead,
            Self::HashMismatch { .. } | Self::LengthMismatch { .. } => ErrorKind::HashMismatch,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::SessionTimeout(_) => ErrorKind::SessionTimeout,
            Self::Conflict { .. } | Self::Busy { .. } => ErrorKind::Conflict,
            Self::ChunkNotFound(_)
            | Self::ManifestNotFound(_)
            | Self::EntryNotFound(_)
            | Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::UnexpectedChunk { .. }
            | Self::InvalidTransition { .. }
            | Self::SessionNotAccepting { .. }
            | Self::UploadIncomplete { .. }
            | Self::NotConflicted(_)
            | Self::InvalidPlan(_)
            | Self::Config(_) => ErrorKind::InvalidRequest,
            Self::QueueFull { .. } | Self::NotAdmitted(_) => ErrorKind::Backpressure,
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) | Self::Scan(_) => {
                ErrorKind::Internal
            }
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Whether the caller can retry the same operation and expect progress.
    ///
    /// A hash mismatch means the chunk got corrupted in transit: resend it.
    /// Backpressure clears once other sessions finish.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::HashMismatch | ErrorKind::Backpressure | ErrorKind::StreamRead
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
