//! vault-agent: storage agent for CloudVault
//!
//! Owns one vault root and serves it over stdin/stdout using the
//! length-prefixed vault protocol. Logs go to stderr.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use vault_core::{Message, ProtocolReader, ProtocolWriter, Vault, VaultError};

/// How long one `WAIT_ADMITTED` request may hold the pipe
const ADMISSION_SLICE: Duration = Duration::from_millis(200);

const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "vault-agent")]
#[command(about = "Storage agent for CloudVault")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a vault on stdin/stdout
    Daemon {
        /// Vault root directory
        #[arg(short, long)]
        root: PathBuf,
    },
    /// Print version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            eprintln!("vault-agent {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Daemon { root } => {
            init_logging();
            run_daemon(root).await?;
        }
    }

    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

async fn run_daemon(root: PathBuf) -> Result<()> {
    info!(root = %root.display(), "vault agent starting");
    let vault = Arc::new(Vault::open(&root)?);

    // stdin is read on its own thread so a slow client never stalls the runtime
    let (tx, mut rx) = mpsc::channel::<vault_core::Result<Message>>(16);
    std::thread::spawn(move || {
        let mut reader = ProtocolReader::new(BufReader::new(std::io::stdin().lock()));
        loop {
            match reader.read_message() {
                Ok(Some(message)) => {
                    if tx.blocking_send(Ok(message)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    let reaper = {
        let vault = vault.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let reaped = vault.reap_idle();
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "reaped idle sessions");
                }
            }
        })
    };

    let mut writer = ProtocolWriter::new(BufWriter::new(std::io::stdout().lock()));
    while let Some(next) = rx.recv().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "failed to read request");
                let _ = writer.send(&Message::from_error(&e));
                break;
            }
        };

        let shutdown = matches!(message, Message::Shutdown);
        let reply = handle_message(&vault, message).await;
        if let Err(e) = writer.send(&reply) {
            error!(error = %e, "failed to write reply");
            break;
        }
        if shutdown {
            break;
        }
    }

    reaper.abort();
    info!("vault agent shutting down");
    Ok(())
}

/// Serve one request. Failures become `ERROR` replies.
async fn handle_message(vault: &Vault, message: Message) -> Message {
    match dispatch(vault, message).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, kind = %e.kind(), "request failed");
            Message::from_error(&e)
        }
    }
}

async fn dispatch(vault: &Vault, message: Message) -> vault_core::Result<Message> {
    let reply = match message {
        Message::BeginUpload(plan) => Message::Began(vault.begin_upload(plan).await?),
        Message::WaitAdmitted(id) => {
            match tokio::time::timeout(ADMISSION_SLICE, vault.wait_admitted(id)).await {
                Ok(result) => {
                    result?;
                    Message::Ok
                }
                Err(_) => return Err(VaultError::NotAdmitted(id)),
            }
        }
        Message::SendChunk {
            session,
            hash,
            data,
        } => Message::Receipt(vault.send_chunk(session, hash, data).await?),
        Message::CompleteUpload(id) => Message::UploadDone(vault.complete_upload(id).await?),
        Message::CancelUpload(id) => {
            vault.cancel_upload(id).await?;
            Message::Ok
        }
        Message::PauseUpload(id) => {
            vault.pause_upload(id).await?;
            Message::Ok
        }
        Message::ResumeUpload(id) => Message::Missing(vault.resume_upload(id).await?),
        Message::MissingChunks(id) => Message::Missing(vault.missing_chunks(id).await?),
        Message::Progress(id) => Message::SessionProgress(vault.session_progress(id).await?),
        Message::GetEntry(path) => Message::Entry(vault.get_entry(&path)?),
        Message::ListEntries(prefix) => Message::Entries(vault.list_entries(&prefix)),
        Message::ListVersions(path) => Message::Manifests(vault.list_versions(&path)?),
        Message::ReadManifest(id) => Message::Manifest(vault.read_manifest(&id)?),
        Message::ReadChunk(hash) => Message::ChunkData(vault.read_chunk(&hash)?),
        Message::ListConflicts => Message::Entries(vault.list_conflicts()),
        Message::Resolve { path, choice } => {
            Message::Resolved(vault.resolve_conflict(&path, choice)?)
        }
        Message::DeleteEntry { path, base_version } => {
            Message::Entry(vault.delete_entry(&path, base_version)?)
        }
        Message::RestoreVersion { path, manifest_id } => {
            Message::Entry(vault.restore_version(&path, &manifest_id)?)
        }
        Message::RenameEntry { from, to } => Message::Entry(vault.rename_entry(&from, &to)?),
        Message::CollectGarbage => Message::GcReport(vault.collect_garbage().await?),
        Message::Usage => Message::UsageReport(vault.usage()?),
        Message::Shutdown => Message::Ok,
        other => {
            warn!(?other, "response received as request");
            return Err(VaultError::Serialization(
                "expected a request message".to_string(),
            ));
        }
    };
    Ok(reply)
}
