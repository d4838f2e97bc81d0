//! vault: command-line client for CloudVault
//!
//! - Chunked, resumable, deduplicated backups of local directories
//! - Version history with restore
//! - Conflict listing and resolution across devices
//! - Runs the vault in-process or through a `vault-agent` child

mod backup;
mod debug_log;
mod progress;
mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{debug, info};

use vault_core::{
    BackupFrequency, ConflictChoice, EntryState, ManifestId, Scanner, SyncEntry, VaultConfig,
};
use vault_transport::{AgentTransport, LocalTransport, UploadOptions, VaultSession, restore_file};

use crate::backup::BackupTarget;
use crate::progress::{format_bytes, print_status};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "vault")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Chunked, resumable, deduplicated file vault")]
#[command(long_about = r#"
vault backs up directories into a content-addressed store.

Features:
  • Deduplication  - identical chunks are stored once
  • Resumable      - interrupted uploads pick up where they stopped
  • Versioned      - earlier versions stay restorable
  • Conflict aware - concurrent edits are detected, never lost

Examples:
  vault --vault ~/vault backup ./project --prefix /project
  vault --vault ~/vault watch ./project --prefix /project
  vault --vault ~/vault ls /project
  vault --vault ~/vault restore /project/notes.txt ./notes.txt
  vault --vault ~/vault resolve /project/notes.txt keep-newer
"#)]
struct Cli {
    /// Vault root directory
    #[arg(long, global = true, default_value = ".vault")]
    vault: PathBuf,

    /// Serve the vault through this `vault-agent` binary instead of in-process
    #[arg(long, global = true)]
    agent: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a local directory
    Backup {
        /// Directory to back up
        path: PathBuf,

        /// Vault path prefix for the uploaded files
        #[arg(short, long, default_value = "/")]
        prefix: String,

        /// Device name recorded on new versions
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Keep a directory backed up as it changes
    Watch {
        /// Directory to watch
        path: PathBuf,

        /// Vault path prefix for the uploaded files
        #[arg(short, long, default_value = "/")]
        prefix: String,

        /// Device name recorded on new versions
        #[arg(short, long)]
        device: Option<String>,

        /// Quiet period before a burst of changes is uploaded (ms)
        #[arg(long, default_value = "500")]
        debounce: u64,

        /// continuous, hourly, daily or weekly [default: from .vault.toml]
        #[arg(short, long)]
        frequency: Option<BackupFrequency>,
    },

    /// List entries under a prefix
    Ls {
        #[arg(default_value = "/")]
        prefix: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the versions of one entry, newest first
    Versions { path: String },

    /// List entries waiting for a conflict decision
    Conflicts,

    /// Resolve a conflicted entry
    Resolve {
        path: String,

        /// keep-newer, keep-both, keep-larger, keep-local or keep-remote
        choice: ConflictChoice,
    },

    /// Write an entry back to disk
    Restore {
        path: String,

        /// Local file to write
        dest: Option<PathBuf>,

        /// Manifest id of an earlier version (see `vault versions`)
        #[arg(long)]
        version: Option<ManifestId>,

        /// Make this earlier version current again instead of writing a file
        #[arg(long, requires = "version")]
        in_place: bool,
    },

    /// Delete an entry (restorable until garbage collected)
    Delete {
        path: String,

        /// Fail if the entry moved past this version
        #[arg(long)]
        base_version: Option<u64>,
    },

    /// Move an entry to a new path
    Rename { from: String, to: String },

    /// Remove expired tombstones and unreferenced chunks
    Gc,

    /// Show storage usage
    Usage {
        #[arg(long)]
        json: bool,
    },

    /// Scan a local directory and print what a backup would include
    Scan {
        path: PathBuf,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Show version and build info
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session_info = debug_log::init(cli.verbose);
    debug!(log = %session_info.log_path.display(), "debug log");

    match &cli.command {
        Commands::Version => {
            eprintln!("vault {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
            return Ok(());
        }
        Commands::Scan { path, format } => {
            return scan_command(path, format);
        }
        _ => {}
    }

    let session = connect(&cli.vault, cli.agent.as_deref())?;
    let result = run(&cli.vault, session.clone(), cli.command).await;
    session.shutdown().await?;
    if result.is_err() {
        eprintln!("debug log: {}", session_info.log_path.display());
    }
    result
}

fn connect(root: &Path, agent: Option<&Path>) -> Result<Arc<dyn VaultSession>> {
    let session: Arc<dyn VaultSession> = match agent {
        Some(program) => {
            info!(agent = %program.display(), root = %root.display(), "starting agent");
            Arc::new(AgentTransport::launch(program, root)?)
        }
        None => Arc::new(LocalTransport::open(root)?),
    };
    Ok(session)
}

async fn run(root: &Path, session: Arc<dyn VaultSession>, command: Commands) -> Result<()> {
    match command {
        Commands::Backup {
            path,
            prefix,
            device,
        } => {
            let config = VaultConfig::load(root)?;
            let (target, options) = prepare_backup(root, &config, &path, &prefix, device);
            backup::backup_command(&target, session, options).await
        }
        Commands::Watch {
            path,
            prefix,
            device,
            debounce,
            frequency,
        } => {
            let config = VaultConfig::load(root)?;
            let (target, options) = prepare_backup(root, &config, &path, &prefix, device);
            let mut schedule = config.schedule;
            if let Some(frequency) = frequency {
                schedule.frequency = frequency;
            }
            if schedule.frequency == BackupFrequency::Continuous {
                let debounce = Duration::from_millis(debounce);
                watch::watch_command(&target, session, options, debounce).await
            } else {
                watch::scheduled_command(&target, session, options, &schedule).await
            }
        }
        Commands::Ls { prefix, json } => ls_command(session.as_ref(), &prefix, json).await,
        Commands::Versions { path } => versions_command(session.as_ref(), &path).await,
        Commands::Conflicts => conflicts_command(session.as_ref()).await,
        Commands::Resolve { path, choice } => {
            let outcome = session.resolve_conflict(&path, choice).await?;
            print_status(
                "Resolved",
                &format!("{path} with {choice}, now v{}", outcome.entry.version),
            );
            if let Some(created) = outcome.created {
                print_status("Kept", &format!("incoming copy at {}", created.path));
            }
            Ok(())
        }
        Commands::Restore {
            path,
            dest,
            version,
            in_place,
        } => {
            if in_place {
                let id = version.ok_or_else(|| eyre!("--in-place needs --version"))?;
                let entry = session.restore_version(&path, id).await?;
                print_status("Restored", &format!("{path} as v{}", entry.version));
            } else {
                let dest = dest.ok_or_else(|| eyre!("a destination file is required"))?;
                let bytes = restore_file(session.as_ref(), &path, version, &dest).await?;
                print_status(
                    "Restored",
                    &format!("{path} -> {} ({})", dest.display(), format_bytes(bytes)),
                );
            }
            Ok(())
        }
        Commands::Delete { path, base_version } => {
            let entry = session.delete_entry(&path, base_version).await?;
            print_status("Deleted", &format!("{path} (v{})", entry.version));
            Ok(())
        }
        Commands::Rename { from, to } => {
            let entry = session.rename_entry(&from, &to).await?;
            print_status("Renamed", &format!("{from} -> {}", entry.path));
            Ok(())
        }
        Commands::Gc => {
            let report = session.collect_garbage().await?;
            print_status(
                "Collected",
                &format!(
                    "{} chunks, {} reclaimed",
                    report.removed_chunks,
                    format_bytes(report.reclaimed_bytes)
                ),
            );
            if report.packed_chunks + report.unpacked_chunks > 0 {
                print_status(
                    "Packed",
                    &format!(
                        "{} old-version chunks, {} saved ({} unpacked)",
                        report.packed_chunks,
                        format_bytes(report.packed_savings),
                        report.unpacked_chunks
                    ),
                );
            }
            Ok(())
        }
        Commands::Usage { json } => usage_command(session.as_ref(), json).await,
        Commands::Scan { .. } | Commands::Version => Ok(()),
    }
}

fn default_device() -> String {
    std::env::var("VAULT_DEVICE")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "local".to_string())
}

fn prepare_backup(
    root: &Path,
    config: &VaultConfig,
    path: &Path,
    prefix: &str,
    device: Option<String>,
) -> (BackupTarget, UploadOptions) {
    let options = UploadOptions::from_config(config, device.unwrap_or_else(default_device));
    let target = BackupTarget::new(path, prefix, root, config.include.clone());
    (target, options)
}

fn state_label(entry: &SyncEntry) -> &'static str {
    match entry.state {
        EntryState::Synced => "synced",
        EntryState::Pending => "pending",
        EntryState::Conflicted => "conflicted",
        EntryState::Deleted => "deleted",
    }
}

async fn ls_command(session: &dyn VaultSession, prefix: &str, json: bool) -> Result<()> {
    let entries = session.list_entries(prefix).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{:>4}  {:<10}  {:<12}  {}",
            format!("v{}", entry.version),
            state_label(entry),
            entry.device_origin,
            entry.path
        );
    }
    eprintln!("{} entries", entries.len());
    Ok(())
}

async fn versions_command(session: &dyn VaultSession, path: &str) -> Result<()> {
    let versions = session.list_versions(path).await?;
    for (i, manifest) in versions.iter().enumerate() {
        let marker = if i == 0 { "*" } else { " " };
        println!(
            "{marker} {}  {:>10}  {:<12}  {}",
            manifest.id,
            format_bytes(manifest.total_size),
            manifest.device,
            manifest.created_at_ms
        );
    }
    Ok(())
}

async fn conflicts_command(session: &dyn VaultSession) -> Result<()> {
    let conflicts = session.list_conflicts().await?;
    if conflicts.is_empty() {
        print_status("Clean", "no conflicts");
        return Ok(());
    }
    for entry in &conflicts {
        let Some(conflict) = &entry.conflict else {
            continue;
        };
        println!(
            "{}  current v{} from {}, incoming from {} (based on {})",
            entry.path,
            entry.version,
            entry.device_origin,
            conflict.device,
            conflict
                .base_version
                .map_or_else(|| "nothing".to_string(), |v| format!("v{v}"))
        );
    }
    eprintln!(
        "resolve with: vault resolve <path> <keep-newer|keep-both|keep-larger|keep-local|keep-remote>"
    );
    Ok(())
}

async fn usage_command(session: &dyn VaultSession, json: bool) -> Result<()> {
    let usage = session.usage().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&usage)?);
        return Ok(());
    }

    println!(
        "Entries:   {} ({} deleted, {} conflicted)",
        usage.entries, usage.deleted_entries, usage.conflicted_entries
    );
    println!("Versions:  {}", usage.versions);
    println!("Logical:   {}", format_bytes(usage.logical_bytes));
    println!(
        "Stored:    {} in {} chunks ({} packed)",
        format_bytes(usage.stored_bytes),
        usage.stored_chunks,
        usage.packed_chunks
    );
    println!(
        "Sessions:  {} active, {} queued, {} paused",
        usage.sessions.active, usage.sessions.queued, usage.sessions.paused
    );
    Ok(())
}

fn scan_command(path: &Path, format: &str) -> Result<()> {
    info!("Scanning {}...", path.display());

    let files = Scanner::new(path).scan()?;

    match format {
        "json" => {
            let listing: Vec<_> = files
                .iter()
                .map(|f| serde_json::json!({ "path": f.vault_path("/"), "size": f.size }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        _ => {
            let total_size: u64 = files.iter().map(|f| f.size).sum();
            eprintln!("Files: {}", files.len());
            eprintln!("Total size: {}", format_bytes(total_size));

            if files.len() <= 20 {
                eprintln!("\nFiles:");
                for file in &files {
                    eprintln!("  {} ({} bytes)", file.path.display(), file.size);
                }
            }
        }
    }

    Ok(())
}
