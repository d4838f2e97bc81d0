//! One-shot directory backup

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::Result;
use color_eyre::eyre::eyre;

use vault_core::{LocalFile, Scanner};
use vault_transport::{BackupReport, UploadOptions, Uploader, VaultSession};

use crate::progress::BackupProgress;

/// A local directory backed up under a vault prefix
pub struct BackupTarget {
    /// Canonical source directory
    pub source: PathBuf,
    pub prefix: String,
    /// Never backed up, even when it lives inside `source`
    pub vault_root: PathBuf,
    /// Patterns force-included on top of `.vaultinclude`
    pub includes: Vec<String>,
}

impl BackupTarget {
    pub fn new(source: &Path, prefix: &str, vault_root: &Path, includes: Vec<String>) -> Self {
        Self {
            source: source
                .canonicalize()
                .unwrap_or_else(|_| source.to_path_buf()),
            prefix: prefix.to_string(),
            vault_root: vault_root
                .canonicalize()
                .unwrap_or_else(|_| vault_root.to_path_buf()),
            includes,
        }
    }

    /// Files a backup would upload right now.
    pub async fn scan(&self) -> Result<Vec<LocalFile>> {
        let source = self.source.clone();
        let includes = self.includes.clone();
        let mut files = tokio::task::spawn_blocking(move || {
            includes
                .into_iter()
                .fold(Scanner::new(source), Scanner::include)
                .scan()
        })
        .await??;
        files.retain(|f| !self.is_vault_path(&self.source.join(&f.path)));
        Ok(files)
    }

    pub fn is_vault_path(&self, path: &Path) -> bool {
        path.starts_with(&self.vault_root)
    }

    /// Upload `files` with a fresh progress display.
    pub async fn upload(
        &self,
        session: Arc<dyn VaultSession>,
        options: UploadOptions,
        files: Vec<LocalFile>,
    ) -> BackupReport {
        let progress = Arc::new(BackupProgress::new());
        progress.scanning(files.len(), files.iter().map(|f| f.size).sum());
        let uploader = Uploader::new(session, options).with_observer(progress.clone());
        let report = uploader.backup_files(&self.source, files, &self.prefix).await;
        progress.finish(&report);
        report
    }
}

pub async fn backup_command(
    target: &BackupTarget,
    session: Arc<dyn VaultSession>,
    options: UploadOptions,
) -> Result<()> {
    let files = target.scan().await?;
    let report = target.upload(session, options, files).await;

    for (path, error) in &report.failed {
        eprintln!("  {path}: {error}");
    }
    if !report.failed.is_empty() {
        return Err(eyre!("{} files failed to upload", report.failed.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_leaves_out_vault_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        std::fs::create_dir_all(dir.path().join(".vault/chunks")).unwrap();
        std::fs::write(dir.path().join(".vault/chunks/data.mdb"), "store").unwrap();

        let target = BackupTarget::new(dir.path(), "/", &dir.path().join(".vault"), Vec::new());
        let files = target.scan().await.unwrap();

        let paths: Vec<_> = files.iter().map(|f| f.vault_path("/")).collect();
        assert_eq!(paths, vec!["/notes.txt"]);
    }
}
