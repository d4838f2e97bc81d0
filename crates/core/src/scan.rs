//! Local file discovery with gitignore support via the `ignore` crate
//!
//! Honors `.gitignore`, `.vaultignore` and force-includes from `.vaultinclude`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Filename for extra ignore patterns (same syntax as .gitignore)
pub const VAULT_IGNORE_FILE: &str = ".vaultignore";

/// Filename for include patterns (like .gitignore but for force-including)
pub const VAULT_INCLUDE_FILE: &str = ".vaultinclude";

/// A file found on disk, not yet chunked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    /// Relative path from scan root
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl LocalFile {
    #[must_use]
    pub fn vault_path(&self, prefix: &str) -> String {
        vault_path(&self.path, prefix)
    }
}

/// Logical vault path: `prefix` joined with a relative path using `/`
#[must_use]
pub fn vault_path(relative: &Path, prefix: &str) -> String {
    let mut out = prefix.trim_end_matches('/').to_string();
    for component in relative.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Scanner for directory trees with gitignore support
pub struct Scanner {
    root: PathBuf,
    /// Additional ignore patterns beyond .gitignore
    extra_ignores: Vec<PathBuf>,
    /// Patterns to force-include even if gitignored (e.g., ".env")
    includes: Vec<String>,
}

impl Scanner {
    /// Create a new scanner for the given root directory
    ///
    /// Automatically loads patterns from `.vaultinclude` if present.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut includes = Vec::new();

        if let Ok(contents) = std::fs::read_to_string(root.join(VAULT_INCLUDE_FILE)) {
            for line in contents.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    includes.push(line.to_string());
                }
            }
        }

        Self {
            root,
            extra_ignores: Vec::new(),
            includes,
        }
    }

    /// Add an ignore file to honor on top of .gitignore
    #[must_use]
    pub fn ignore_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_ignores.push(path.into());
        self
    }

    /// Force-include a pattern even if it matches .gitignore
    #[must_use]
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    fn walk_builder(&self, respect_ignores: bool) -> WalkBuilder {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(respect_ignores)
            .git_global(respect_ignores)
            .git_exclude(respect_ignores)
            .ignore(respect_ignores)
            .require_git(false)
            .filter_entry(|e| e.file_name() != ".git");

        if respect_ignores {
            builder.add_custom_ignore_filename(VAULT_IGNORE_FILE);
            for path in &self.extra_ignores {
                // A missing extra ignore file is not fatal.
                let _ = builder.add_ignore(path);
            }
        }
        builder
    }

    fn include_matcher(&self) -> Result<Option<Override>> {
        if self.includes.is_empty() {
            return Ok(None);
        }

        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.includes {
            overrides.add(pattern)?;
        }
        Ok(Some(overrides.build()?))
    }

    fn relative(&self, path: &Path) -> Result<PathBuf> {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))
    }

    fn local_file(&self, path: &Path) -> Result<LocalFile> {
        let metadata = std::fs::metadata(path)?;
        Ok(LocalFile {
            path: self.relative(path)?,
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }

    /// Scan the directory and return every file to back up, sorted by path
    ///
    /// # Errors
    /// Returns an error if directory traversal or metadata reads fail
    pub fn scan(&self) -> Result<Vec<LocalFile>> {
        let mut files = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for result in self.walk_builder(true).build() {
            let entry = result?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file = self.local_file(path)?;
            seen.insert(file.path.clone());
            files.push(file);
        }

        // Force-included files bypass every ignore rule.
        if let Some(matcher) = self.include_matcher()? {
            for result in self.walk_builder(false).build() {
                let entry = result?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let relative = self.relative(path)?;
                if seen.contains(&relative) || !matcher.matched(&relative, false).is_whitelist() {
                    continue;
                }
                files.push(self.local_file(path)?);
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(files: &[LocalFile]) -> Vec<PathBuf> {
        files.iter().map(|f| f.path.clone()).collect()
    }

    #[test]
    fn test_scan_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let files = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].path, PathBuf::from("root.txt"));
        assert_eq!(files[0].size, 4);
    }

    #[test]
    fn test_scan_respects_gitignore_and_vaultignore() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join(VAULT_IGNORE_FILE), "*.tmp\n").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("ignore.log"), "ignore").unwrap();
        fs::write(dir.path().join("scratch.tmp"), "scratch").unwrap();

        let found = paths(&Scanner::new(dir.path()).scan().unwrap());
        assert!(found.contains(&PathBuf::from("keep.txt")), "{found:?}");
        assert!(!found.contains(&PathBuf::from("ignore.log")), "{found:?}");
        assert!(!found.contains(&PathBuf::from("scratch.tmp")), "{found:?}");
    }

    #[test]
    fn test_vaultinclude_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), ".env\nsecrets/\n").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=123").unwrap();
        fs::create_dir(dir.path().join("secrets")).unwrap();
        fs::write(dir.path().join("secrets/key.pem"), "private").unwrap();
        fs::write(
            dir.path().join(VAULT_INCLUDE_FILE),
            "# Force include these files\n.env\nsecrets/key.pem\n",
        )
        .unwrap();

        let found = paths(&Scanner::new(dir.path()).scan().unwrap());
        assert!(found.contains(&PathBuf::from(".env")), "{found:?}");
        assert!(found.contains(&PathBuf::from("secrets/key.pem")), "{found:?}");
    }

    #[test]
    fn test_include_builder() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), ".env\n").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=123").unwrap();

        let without = paths(&Scanner::new(dir.path()).scan().unwrap());
        assert!(!without.contains(&PathBuf::from(".env")));

        let with = paths(&Scanner::new(dir.path()).include(".env").scan().unwrap());
        assert!(with.contains(&PathBuf::from(".env")));
    }

    #[test]
    fn test_vault_path() {
        let file = LocalFile {
            path: PathBuf::from("sub/report.pdf"),
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(file.vault_path("/backup/"), "/backup/sub/report.pdf");
        assert_eq!(file.vault_path(""), "/sub/report.pdf");
    }
}
