//! Transport to a `vault-agent` child process
//!
//! Requests and responses are framed with the vault protocol over the
//! child's stdin/stdout. The protocol has no request ids, so one request is
//! in flight at a time.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vault_core::cas::GcReport;
use vault_core::protocol::{HEADER_LEN, decode_header};
use vault_core::{
    BeginOutcome, ChunkReceipt, ConflictChoice, ContentHash, ErrorKind, FileManifest, ManifestId,
    Message, ResolveOutcome, Result, SessionId, SessionProgress, SyncEntry, UploadOutcome,
    UploadPlan, UsageReport, VaultError,
};

use crate::VaultSession;

const ADMISSION_POLL: Duration = Duration::from_millis(100);

struct Pipes {
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

pub struct AgentTransport {
    pipes: Arc<Mutex<Option<Pipes>>>,
    child: Mutex<Child>,
}

fn closed() -> VaultError {
    VaultError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "agent session closed",
    ))
}

fn unexpected(request: &str) -> VaultError {
    VaultError::Serialization(format!("unexpected reply to {request}"))
}

async fn exchange(pipes: &mut Pipes, frame: &[u8]) -> Result<(u8, Vec<u8>)> {
    pipes.stdin.write_all(frame).await?;
    pipes.stdin.flush().await?;

    let mut header = [0u8; HEADER_LEN];
    pipes.stdout.read_exact(&mut header).await?;
    let (msg_type, len) = decode_header(header)?;
    let mut payload = vec![0u8; len];
    pipes.stdout.read_exact(&mut payload).await?;
    Ok((msg_type, payload))
}

impl AgentTransport {
    /// Start `program daemon --root <root>` as a child process.
    ///
    /// # Errors
    /// Returns an error if the process cannot be spawned.
    pub fn launch(program: &Path, root: &Path) -> Result<Self> {
        let mut command = Command::new(program);
        command.arg("daemon").arg("--root").arg(root);
        Self::spawn(command)
    }

    /// Spawn an agent from a prepared command. Stdin and stdout are taken over
    /// for the protocol; stderr is inherited for the agent's logs.
    ///
    /// # Errors
    /// Returns an error if the process cannot be spawned.
    pub fn spawn(mut command: Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(closed)?;
        let stdout = child.stdout.take().ok_or_else(closed)?;
        info!(pid = child.id(), "vault agent started");

        Ok(Self {
            pipes: Arc::new(Mutex::new(Some(Pipes {
                stdin: BufWriter::new(stdin),
                stdout: BufReader::new(stdout),
            }))),
            child: Mutex::new(child),
        })
    }

    /// Send one request and read its reply. Error replies become
    /// [`VaultError::Remote`] with the agent's error kind.
    ///
    /// The exchange runs in its own task holding the pipes, so a caller that
    /// gives up (a chunk timeout) leaves it to finish and discard the reply.
    /// Later requests queue behind it and stay in step with the agent. An
    /// I/O failure mid-exchange closes the session.
    async fn request(&self, message: &Message) -> Result<Message> {
        let frame = message.to_frame()?;
        let pipes = self.pipes.clone();
        let in_flight = tokio::spawn(async move {
            let mut guard = pipes.lock_owned().await;
            let mut taken = guard.take().ok_or_else(closed)?;
            let reply = exchange(&mut taken, &frame).await?;
            *guard = Some(taken);
            Ok::<_, VaultError>(reply)
        });
        let (msg_type, payload) = in_flight
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))??;

        match Message::decode(msg_type, Bytes::from(payload))? {
            Message::Error { kind, message } => {
                debug!(%kind, %message, "agent returned error");
                Err(VaultError::Remote { kind, message })
            }
            reply => Ok(reply),
        }
    }
}

#[async_trait]
impl VaultSession for AgentTransport {
    async fn begin_upload(&self, plan: UploadPlan) -> Result<BeginOutcome> {
        match self.request(&Message::BeginUpload(plan)).await? {
            Message::Began(outcome) => Ok(outcome),
            _ => Err(unexpected("begin_upload")),
        }
    }

    /// The agent only waits a short while per request, so other sessions
    /// sharing this pipe keep moving while one is queued.
    async fn wait_admitted(&self, session: SessionId) -> Result<()> {
        loop {
            match self.request(&Message::WaitAdmitted(session)).await {
                Ok(Message::Ok) => return Ok(()),
                Ok(_) => return Err(unexpected("wait_admitted")),
                Err(e) if e.kind() == ErrorKind::Backpressure => {
                    tokio::time::sleep(ADMISSION_POLL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_chunk(
        &self,
        session: SessionId,
        hash: ContentHash,
        data: Bytes,
    ) -> Result<ChunkReceipt> {
        let request = Message::SendChunk {
            session,
            hash,
            data,
        };
        match self.request(&request).await? {
            Message::Receipt(receipt) => Ok(receipt),
            _ => Err(unexpected("send_chunk")),
        }
    }

    async fn complete_upload(&self, session: SessionId) -> Result<UploadOutcome> {
        match self.request(&Message::CompleteUpload(session)).await? {
            Message::UploadDone(outcome) => Ok(outcome),
            _ => Err(unexpected("complete_upload")),
        }
    }

    async fn cancel_upload(&self, session: SessionId) -> Result<()> {
        match self.request(&Message::CancelUpload(session)).await? {
            Message::Ok => Ok(()),
            _ => Err(unexpected("cancel_upload")),
        }
    }

    async fn pause_upload(&self, session: SessionId) -> Result<()> {
        match self.request(&Message::PauseUpload(session)).await? {
            Message::Ok => Ok(()),
            _ => Err(unexpected("pause_upload")),
        }
    }

    async fn resume_upload(&self, session: SessionId) -> Result<Vec<ContentHash>> {
        match self.request(&Message::ResumeUpload(session)).await? {
            Message::Missing(hashes) => Ok(hashes),
            _ => Err(unexpected("resume_upload")),
        }
    }

    async fn missing_chunks(&self, session: SessionId) -> Result<Vec<ContentHash>> {
        match self.request(&Message::MissingChunks(session)).await? {
            Message::Missing(hashes) => Ok(hashes),
            _ => Err(unexpected("missing_chunks")),
        }
    }

    async fn session_progress(&self, session: SessionId) -> Result<SessionProgress> {
        match self.request(&Message::Progress(session)).await? {
            Message::SessionProgress(progress) => Ok(progress),
            _ => Err(unexpected("session_progress")),
        }
    }

    async fn get_entry(&self, path: &str) -> Result<SyncEntry> {
        match self.request(&Message::GetEntry(path.to_string())).await? {
            Message::Entry(entry) => Ok(entry),
            _ => Err(unexpected("get_entry")),
        }
    }

    async fn list_entries(&self, prefix: &str) -> Result<Vec<SyncEntry>> {
        match self.request(&Message::ListEntries(prefix.to_string())).await? {
            Message::Entries(entries) => Ok(entries),
            _ => Err(unexpected("list_entries")),
        }
    }

    async fn list_versions(&self, path: &str) -> Result<Vec<FileManifest>> {
        match self.request(&Message::ListVersions(path.to_string())).await? {
            Message::Manifests(manifests) => Ok(manifests),
            _ => Err(unexpected("list_versions")),
        }
    }

    async fn read_manifest(&self, id: ManifestId) -> Result<FileManifest> {
        match self.request(&Message::ReadManifest(id)).await? {
            Message::Manifest(manifest) => Ok(manifest),
            _ => Err(unexpected("read_manifest")),
        }
    }

    async fn read_chunk(&self, hash: ContentHash) -> Result<Bytes> {
        match self.request(&Message::ReadChunk(hash)).await? {
            Message::ChunkData(data) => Ok(data),
            _ => Err(unexpected("read_chunk")),
        }
    }

    async fn list_conflicts(&self) -> Result<Vec<SyncEntry>> {
        match self.request(&Message::ListConflicts).await? {
            Message::Entries(entries) => Ok(entries),
            _ => Err(unexpected("list_conflicts")),
        }
    }

    async fn resolve_conflict(
        &self,
        path: &str,
        choice: ConflictChoice,
    ) -> Result<ResolveOutcome> {
        let request = Message::Resolve {
            path: path.to_string(),
            choice,
        };
        match self.request(&request).await? {
            Message::Resolved(outcome) => Ok(outcome),
            _ => Err(unexpected("resolve_conflict")),
        }
    }

    async fn delete_entry(&self, path: &str, base_version: Option<u64>) -> Result<SyncEntry> {
        let request = Message::DeleteEntry {
            path: path.to_string(),
            base_version,
        };
        match self.request(&request).await? {
            Message::Entry(entry) => Ok(entry),
            _ => Err(unexpected("delete_entry")),
        }
    }

    async fn restore_version(&self, path: &str, manifest_id: ManifestId) -> Result<SyncEntry> {
        let request = Message::RestoreVersion {
            path: path.to_string(),
            manifest_id,
        };
        match self.request(&request).await? {
            Message::Entry(entry) => Ok(entry),
            _ => Err(unexpected("restore_version")),
        }
    }

    async fn rename_entry(&self, from: &str, to: &str) -> Result<SyncEntry> {
        let request = Message::RenameEntry {
            from: from.to_string(),
            to: to.to_string(),
        };
        match self.request(&request).await? {
            Message::Entry(entry) => Ok(entry),
            _ => Err(unexpected("rename_entry")),
        }
    }

    async fn collect_garbage(&self) -> Result<GcReport> {
        match self.request(&Message::CollectGarbage).await? {
            Message::GcReport(report) => Ok(report),
            _ => Err(unexpected("collect_garbage")),
        }
    }

    async fn usage(&self) -> Result<UsageReport> {
        match self.request(&Message::Usage).await? {
            Message::UsageReport(report) => Ok(report),
            _ => Err(unexpected("usage")),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(mut pipes) = self.pipes.lock().await.take() else {
            return Ok(());
        };
        let frame = Message::Shutdown.to_frame()?;
        if let Err(e) = pipes.stdin.write_all(&frame).await {
            warn!(error = %e, "failed to send shutdown to agent");
        }
        let _ = pipes.stdin.flush().await;
        drop(pipes);

        let status = self.child.lock().await.wait().await?;
        info!(%status, "vault agent exited");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A child that echoes every frame back after a delay.
    fn slow_echo() -> AgentTransport {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 0.5; exec cat");
        AgentTransport::spawn(command).unwrap()
    }

    #[tokio::test]
    async fn test_abandoned_request_keeps_pipe_in_step() {
        let transport = slow_echo();

        let first = Message::GetEntry("/first".into());
        let gave_up = tokio::time::timeout(Duration::from_millis(50), transport.request(&first)).await;
        assert!(gave_up.is_err());

        let second = Message::GetEntry("/second".into());
        let reply = transport.request(&second).await.unwrap();
        assert_eq!(reply, second);

        transport.shutdown().await.unwrap();
    }
}
