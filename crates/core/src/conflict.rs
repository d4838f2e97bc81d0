//! Conflict policies and resolution rules
//!
//! A conflict pits the entry's current manifest against an incoming one that
//! was based on a stale version. "Local" is the incoming side (the device
//! that just uploaded); "remote" is what the vault already held.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::manifest::FileManifest;

/// What to do automatically when a conflict is detected.
///
/// `Ask` leaves the entry conflicted until a caller resolves it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    Ask,
    KeepNewer,
    KeepBoth,
    KeepLarger,
    PreferLocal,
    PreferRemote,
}

impl ConflictPolicy {
    /// The choice this policy applies without asking, if any
    #[must_use]
    pub fn auto_choice(self) -> Option<ConflictChoice> {
        match self {
            Self::Ask => None,
            Self::KeepNewer => Some(ConflictChoice::KeepNewer),
            Self::KeepBoth => Some(ConflictChoice::KeepBoth),
            Self::KeepLarger => Some(ConflictChoice::KeepLarger),
            Self::PreferLocal => Some(ConflictChoice::KeepLocal),
            Self::PreferRemote => Some(ConflictChoice::KeepRemote),
        }
    }
}

/// An explicit decision for one conflicted entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictChoice {
    /// Later `created_at` wins; the incoming version wins ties
    KeepNewer,
    /// Keep current at its path and move incoming to a numbered sibling
    KeepBoth,
    /// Larger `total_size` wins; the incoming version wins ties
    KeepLarger,
    KeepLocal,
    KeepRemote,
}

impl fmt::Display for ConflictChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KeepNewer => "keep-newer",
            Self::KeepBoth => "keep-both",
            Self::KeepLarger => "keep-larger",
            Self::KeepLocal => "keep-local",
            Self::KeepRemote => "keep-remote",
        };
        f.write_str(name)
    }
}

impl FromStr for ConflictChoice {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "keep-newer" | "newer" => Ok(Self::KeepNewer),
            "keep-both" | "both" | "backup" => Ok(Self::KeepBoth),
            "keep-larger" | "larger" => Ok(Self::KeepLarger),
            "keep-local" | "local" => Ok(Self::KeepLocal),
            "keep-remote" | "remote" => Ok(Self::KeepRemote),
            other => Err(VaultError::InvalidPlan(format!(
                "unknown conflict choice {other:?}"
            ))),
        }
    }
}

/// Outcome of applying a choice to a pair of manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The incoming manifest becomes current
    UseIncoming,
    /// The current manifest stays
    UseCurrent,
    /// Both survive under different paths
    KeepBoth,
}

/// Decide between the current and incoming manifests.
#[must_use]
pub fn decide(choice: ConflictChoice, current: &FileManifest, incoming: &FileManifest) -> Resolution {
    match choice {
        ConflictChoice::KeepNewer => {
            if incoming.created_at_ms >= current.created_at_ms {
                Resolution::UseIncoming
            } else {
                Resolution::UseCurrent
            }
        }
        ConflictChoice::KeepLarger => {
            if incoming.total_size >= current.total_size {
                Resolution::UseIncoming
            } else {
                Resolution::UseCurrent
            }
        }
        ConflictChoice::KeepBoth => Resolution::KeepBoth,
        ConflictChoice::KeepLocal => Resolution::UseIncoming,
        ConflictChoice::KeepRemote => Resolution::UseCurrent,
    }
}

/// Sibling path for the `attempt`-th copy: `dir/name (N).ext`
#[must_use]
pub fn numbered_path(path: &str, attempt: u32) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path),
    };
    // Dotfiles like ".env" have no extension.
    match file.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = file.split_at(dot);
            format!("{dir}{stem} ({attempt}){ext}")
        }
        _ => format!("{dir}{file} ({attempt})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;

    fn manifest(size: u64, created_at_ms: i64) -> FileManifest {
        FileManifest::new(Vec::new(), 0, ContentHash::from_bytes(b""), created_at_ms, "dev")
            .map(|mut m| {
                m.total_size = size;
                m
            })
            .unwrap()
    }

    #[test]
    fn test_keep_newer() {
        let current = manifest(10, 1000);
        let incoming = manifest(10, 2000);
        assert_eq!(
            decide(ConflictChoice::KeepNewer, &current, &incoming),
            Resolution::UseIncoming
        );
        assert_eq!(
            decide(ConflictChoice::KeepNewer, &incoming, &current),
            Resolution::UseCurrent
        );
    }

    #[test]
    fn test_keep_newer_tie_goes_to_incoming() {
        let current = manifest(10, 1000);
        let incoming = manifest(5, 1000);
        assert_eq!(
            decide(ConflictChoice::KeepNewer, &current, &incoming),
            Resolution::UseIncoming
        );
    }

    #[test]
    fn test_keep_larger() {
        let current = manifest(100, 2000);
        let incoming = manifest(50, 1000);
        assert_eq!(
            decide(ConflictChoice::KeepLarger, &current, &incoming),
            Resolution::UseCurrent
        );
    }

    #[test]
    fn test_local_and_remote() {
        let current = manifest(1, 1);
        let incoming = manifest(1, 1);
        assert_eq!(
            decide(ConflictChoice::KeepLocal, &current, &incoming),
            Resolution::UseIncoming
        );
        assert_eq!(
            decide(ConflictChoice::KeepRemote, &current, &incoming),
            Resolution::UseCurrent
        );
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("newer".parse::<ConflictChoice>().unwrap(), ConflictChoice::KeepNewer);
        assert_eq!("keep_both".parse::<ConflictChoice>().unwrap(), ConflictChoice::KeepBoth);
        assert_eq!("Remote".parse::<ConflictChoice>().unwrap(), ConflictChoice::KeepRemote);
        assert!("ask".parse::<ConflictChoice>().is_err());
    }

    #[test]
    fn test_policy_auto_choice() {
        assert_eq!(ConflictPolicy::default().auto_choice(), None);
        assert_eq!(
            ConflictPolicy::PreferLocal.auto_choice(),
            Some(ConflictChoice::KeepLocal)
        );
    }

    #[test]
    fn test_numbered_path() {
        assert_eq!(numbered_path("/docs/report.pdf", 1), "/docs/report (1).pdf");
        assert_eq!(numbered_path("/notes", 2), "/notes (2)");
        assert_eq!(numbered_path("/cfg/.env", 1), "/cfg/.env (1)");
        assert_eq!(numbered_path("a.tar.gz", 3), "a.tar (3).gz");
    }
}
