//! vault-core: chunked, resumable upload and sync engine
//!
//! Splits files into content-addressed chunks, stores each unique chunk once,
//! drives resumable upload sessions under a shared scheduler and tracks the
//! versioned state of every logical path.

pub mod cas;
pub mod checkpoint;
pub mod chunker;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod protocol;
pub mod scan;
pub mod schedule;
pub mod scheduler;
pub mod session;
pub mod sync_index;
pub mod vault;

pub use cas::{ChunkStore, GcReport, PutOutcome, StoreStats};
pub use chunker::{Chunk, ChunkConfig, ChunkData, ContentAddressor, FilePlan, plan_file, plan_reader};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BandwidthLimit, DuplicatePolicy, VaultConfig};
pub use conflict::{ConflictChoice, ConflictPolicy};
pub use error::{ErrorKind, Result, VaultError};
pub use hash::{ContentHash, FileHasher};
pub use manifest::{FileManifest, ManifestId, ManifestStore};
pub use protocol::{Message, ProtocolReader, ProtocolWriter};
pub use scan::{LocalFile, Scanner, vault_path};
pub use schedule::{BackupFrequency, ScheduleConfig, ThrottleWindow, TimeOfDay, UtcOffset};
pub use scheduler::{Admission, TransferScheduler};
pub use session::{
    ChunkReceipt, ReceiptStatus, SessionId, SessionProgress, SessionStatus, UploadOutcome,
    UploadPlan, UploadSession,
};
pub use sync_index::{CommitOutcome, EntryState, ResolveOutcome, Retention, SyncEntry, SyncIndex};
pub use vault::{BeginOutcome, UploadTicket, UsageReport, Vault};
