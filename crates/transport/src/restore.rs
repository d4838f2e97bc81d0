//! Download a vault entry back to disk

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::info;

use vault_core::{ContentHash, FileHasher, ManifestId, Result, VaultError};

use crate::VaultSession;

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".vault-partial");
    dest.with_file_name(name)
}

/// Write `vault_path` (or one specific version of it) to `dest`.
///
/// Every chunk and the whole file are checked against their hashes. The file
/// appears at `dest` only once it is complete.
///
/// # Errors
/// - [`VaultError::HashMismatch`] if a chunk arrives corrupted
/// - [`VaultError::Integrity`] if the assembled file does not match its manifest
pub async fn restore_file(
    session: &dyn VaultSession,
    vault_path: &str,
    version: Option<ManifestId>,
    dest: &Path,
) -> Result<u64> {
    let manifest_id = match version {
        Some(id) => id,
        None => session.get_entry(vault_path).await?.current_manifest_id,
    };
    let manifest = session.read_manifest(manifest_id).await?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(dest);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut hasher = FileHasher::new();
    let mut written = 0u64;

    for chunk in &manifest.chunks {
        let data = session.read_chunk(chunk.hash).await?;
        let actual = ContentHash::from_bytes(&data);
        if actual != chunk.hash {
            drop(file);
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(VaultError::HashMismatch {
                expected: chunk.hash,
                actual,
            });
        }
        hasher.update(&data);
        file.write_all(&data).await?;
        written += data.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let actual = hasher.finalize();
    if actual != manifest.file_hash {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(VaultError::Integrity {
            path: vault_path.to_string(),
            expected: manifest.file_hash,
            actual,
        });
    }

    tokio::fs::rename(&partial, dest).await?;
    info!(path = vault_path, dest = %dest.display(), bytes = written, "restored");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::{LocalTransport, UploadOptions, Uploader};
    use vault_core::ChunkConfig;

    #[tokio::test]
    async fn test_restore_current_and_previous_version() {
        let vault_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::open(vault_dir.path()).unwrap());
        let uploader = Uploader::new(
            transport.clone(),
            UploadOptions {
                chunking: ChunkConfig::fixed(64),
                device: "desk".into(),
                chunk_timeout: std::time::Duration::from_secs(5),
                max_retries: 1,
                parallel_files: 1,
            },
        );

        let source = work.path().join("notes.txt");
        std::fs::write(&source, "first draft of the notes, long enough for a few chunks").unwrap();
        uploader.upload_file(&source, "/notes.txt").await.unwrap();
        std::fs::write(&source, "second draft").unwrap();
        uploader.upload_file(&source, "/notes.txt").await.unwrap();

        let out = work.path().join("out/notes.txt");
        let written = restore_file(transport.as_ref(), "/notes.txt", None, &out)
            .await
            .unwrap();
        assert_eq!(written, 12);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "second draft");

        let entry = transport.get_entry("/notes.txt").await.unwrap();
        let previous = entry.version_history[0];
        restore_file(transport.as_ref(), "/notes.txt", Some(previous), &out)
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&out).unwrap().starts_with("first draft"));
        assert!(!partial_path(&out).exists());
    }
}
