//! Vault configuration file parsing (.vault.toml)

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::chunker::ChunkConfig;
use crate::conflict::ConflictPolicy;
use crate::error::{Result, VaultError};
use crate::schedule::{ScheduleConfig, ThrottleWindow};
use crate::sync_index::Retention;

/// Config file name
pub const CONFIG_FILE: &str = ".vault.toml";

const MIB: u64 = 1024 * 1024;

/// Vault configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Files to back up even if gitignored
    pub include: Vec<String>,
    pub chunking: ChunkConfig,
    pub transfer: TransferConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub max_concurrent_sessions: usize,
    /// Waiting admissions beyond this are rejected
    pub max_queue_depth: usize,
    pub bandwidth_limit: BandwidthLimit,
    /// Bytes handed to one session per round-robin turn
    pub bandwidth_quantum: u64,
    /// Local hours (in `schedule.timezone`) when `bandwidth_limit` applies;
    /// unlimited outside them. Always applies when unset.
    pub bandwidth_window: Option<ThrottleWindow>,
    /// Sessions without chunk activity for this long are failed
    pub idle_timeout_secs: u64,
    /// In-flight chunks without progress for this long are re-requested
    pub chunk_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            max_queue_depth: 64,
            bandwidth_limit: BandwidthLimit::Unlimited,
            bandwidth_quantum: 64 * 1024,
            bandwidth_window: None,
            idle_timeout_secs: 300,
            chunk_timeout_secs: 60,
        }
    }
}

impl TransferConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// Aggregate upload rate across all sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BandwidthLimit {
    #[default]
    Unlimited,
    BytesPerSec(u64),
}

impl BandwidthLimit {
    /// 1 MiB/s
    pub const LOW: Self = Self::BytesPerSec(MIB);
    /// 5 MiB/s
    pub const MEDIUM: Self = Self::BytesPerSec(5 * MIB);
    /// 10 MiB/s
    pub const HIGH: Self = Self::BytesPerSec(10 * MIB);

    #[must_use]
    pub fn bytes_per_sec(self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::BytesPerSec(rate) => Some(rate),
        }
    }
}

impl std::str::FromStr for BandwidthLimit {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unlimited" | "none" => Ok(Self::Unlimited),
            "low" => Ok(Self::LOW),
            "medium" => Ok(Self::MEDIUM),
            "high" => Ok(Self::HIGH),
            other => other
                .parse::<u64>()
                .map(Self::BytesPerSec)
                .map_err(|_| VaultError::Config(format!("invalid bandwidth limit {s:?}"))),
        }
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::BytesPerSec(rate) => write!(f, "{rate} B/s"),
        }
    }
}

impl Serialize for BandwidthLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Unlimited => serializer.serialize_str("unlimited"),
            Self::BytesPerSec(rate) => serializer.serialize_u64(*rate),
        }
    }
}

impl<'de> Deserialize<'de> for BandwidthLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Rate(u64),
            Word(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Rate(rate) => Ok(Self::BytesPerSec(rate)),
            Repr::Word(word) => word.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// What `begin_upload` does when the target path already has content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Commit on top of the current version
    #[default]
    Replace,
    /// Upload to a numbered sibling path instead
    KeepBoth,
    /// Leave the existing entry alone
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub conflict_policy: ConflictPolicy,
    pub version_retention: Retention,
    pub on_duplicate: DuplicatePolicy,
    /// Deleted entries older than this are purged by garbage collection
    pub tombstone_retention_secs: u64,
    /// Garbage collection compresses chunks only old versions use
    pub compress_versions: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::Ask,
            version_retention: Retention::Keep(10),
            on_duplicate: DuplicatePolicy::Replace,
            tombstone_retention_secs: 30 * 24 * 60 * 60,
            compress_versions: true,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }
}

/// LMDB map sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub chunk_map_size: usize,
    pub meta_map_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_map_size: 4 * 1024 * 1024 * 1024,
            meta_map_size: 256 * 1024 * 1024,
        }
    }
}

impl VaultConfig {
    /// Load config from the vault root.
    ///
    /// Returns default config if .vault.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed or fails validation.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| VaultError::Config(format!("{}: {e}", config_path.display())))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`VaultError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.transfer.max_concurrent_sessions == 0 {
            return Err(VaultError::Config(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.transfer.bandwidth_quantum == 0 {
            return Err(VaultError::Config("bandwidth_quantum must be positive".into()));
        }
        if self.transfer.bandwidth_limit == BandwidthLimit::BytesPerSec(0) {
            return Err(VaultError::Config(
                "bandwidth_limit must be positive or \"unlimited\"".into(),
            ));
        }
        if self.transfer.idle_timeout_secs == 0 || self.transfer.chunk_timeout_secs == 0 {
            return Err(VaultError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::BackupFrequency;

    #[test]
    fn test_parse_empty_config() {
        let config: VaultConfig = toml::from_str("").unwrap();
        assert_eq!(config, VaultConfig::default());
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::Ask);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
include = [".env.local"]

[chunking]
strategy = "content-defined"
min_size = 65536
avg_size = 262144
max_size = 1048576

[transfer]
max_concurrent_sessions = 2
bandwidth_limit = "medium"
idle_timeout_secs = 30

[sync]
conflict_policy = "keep-newer"
version_retention = "unlimited"
on_duplicate = "keep-both"
compress_versions = false

[schedule]
frequency = "daily"
time = "01:30"
timezone = "UTC-8"
"#;

        let config: VaultConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.include, vec![".env.local"]);
        assert_eq!(
            config.chunking,
            ChunkConfig::ContentDefined {
                min_size: 65536,
                avg_size: 262_144,
                max_size: 1_048_576
            }
        );
        assert_eq!(config.transfer.max_concurrent_sessions, 2);
        assert_eq!(config.transfer.max_queue_depth, 64);
        assert_eq!(config.transfer.bandwidth_limit, BandwidthLimit::MEDIUM);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::KeepNewer);
        assert_eq!(config.sync.version_retention, Retention::Unlimited);
        assert_eq!(config.sync.on_duplicate, DuplicatePolicy::KeepBoth);
        assert!(!config.sync.compress_versions);
        assert_eq!(config.schedule.frequency, BackupFrequency::Daily);
        assert_eq!(config.schedule.time.to_string(), "01:30");
        assert_eq!(config.schedule.timezone.minutes(), -480);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bandwidth_window() {
        let toml = r#"
[transfer]
bandwidth_limit = "low"
bandwidth_window = { start = "09:00", end = "18:00" }
"#;
        let config: VaultConfig = toml::from_str(toml).unwrap();
        let window = config.transfer.bandwidth_window.unwrap();
        assert!(window.contains(12 * 60));
        assert!(!window.contains(20 * 60));
        assert_eq!(config.schedule, ScheduleConfig::default());

        let bad = "[transfer]\nbandwidth_window = { start = \"9am\", end = \"18:00\" }\n";
        assert!(toml::from_str::<VaultConfig>(bad).is_err());
    }

    #[test]
    fn test_bandwidth_numeric() {
        let toml = "[transfer]\nbandwidth_limit = 2048\n";
        let config: VaultConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.transfer.bandwidth_limit,
            BandwidthLimit::BytesPerSec(2048)
        );
        assert!("fast".parse::<BandwidthLimit>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = VaultConfig::default();
        config.transfer.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(VaultConfig::load(dir.path()).unwrap(), VaultConfig::default());
    }

    #[test]
    fn test_load_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[transfer]\nmax_queue_depth = \"x\"").unwrap();
        assert!(matches!(
            VaultConfig::load(dir.path()),
            Err(VaultError::Config(_))
        ));
    }
}
