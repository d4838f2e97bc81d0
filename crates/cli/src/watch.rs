//! Continuous backup: upload files as they change, tombstone what disappears.
//! Scheduled backup: rescan and upload at hourly, daily or weekly runs.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use vault_core::{Clock, EntryState, ErrorKind, ScheduleConfig, SystemClock, vault_path};
use vault_transport::{UploadOptions, VaultSession};

use crate::backup::BackupTarget;
use crate::progress::print_status;

pub async fn watch_command(
    target: &BackupTarget,
    session: Arc<dyn VaultSession>,
    options: UploadOptions,
    debounce: Duration,
) -> Result<()> {
    info!(source = %target.source.display(), prefix = %target.prefix, "initial backup");
    let files = target.scan().await?;
    target.upload(session.clone(), options.clone(), files).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
    let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let paths = events.into_iter().flat_map(|e| e.event.paths).collect();
                let _ = tx.send(paths);
            }
            Err(errors) => {
                for e in errors {
                    warn!(error = %e, "watch error");
                }
            }
        }
    })?;
    debouncer.watch(&target.source, RecursiveMode::Recursive)?;

    print_status(
        "Watching",
        &format!("{} (Ctrl+C to stop)", target.source.display()),
    );

    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(paths) = batch else { break };
                let mut changed: HashSet<PathBuf> = paths.into_iter().collect();
                while let Ok(more) = rx.try_recv() {
                    changed.extend(more);
                }
                changed.retain(|p| !target.is_vault_path(p));
                if changed.is_empty() {
                    continue;
                }

                debug!(paths = changed.len(), "changes detected");
                if let Err(e) = sync_changes(target, &session, &options, &changed).await {
                    error!(error = %e, "sync after change failed");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(debouncer);
    info!("watch stopped");
    Ok(())
}

/// Back up `target` now and then at every run `schedule` names, until Ctrl+C.
pub async fn scheduled_command(
    target: &BackupTarget,
    session: Arc<dyn VaultSession>,
    options: UploadOptions,
    schedule: &ScheduleConfig,
) -> Result<()> {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    run_schedule(target, &session, &options, schedule, &SystemClock, ctrl_c).await;
    info!("scheduled backup stopped");
    Ok(())
}

/// Runs are additive: a file missing from the source keeps its entry, since
/// only the change watcher knows a deletion happened under this target.
async fn run_schedule(
    target: &BackupTarget,
    session: &Arc<dyn VaultSession>,
    options: &UploadOptions,
    schedule: &ScheduleConfig,
    clock: &dyn Clock,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        info!(source = %target.source.display(), frequency = %schedule.frequency, "scheduled backup");
        match target.scan().await {
            Ok(files) => {
                let report = target.upload(session.clone(), options.clone(), files).await;
                for (path, error) in &report.failed {
                    warn!(path = %path, error = %error, "scheduled upload failed");
                }
            }
            Err(e) => error!(error = %e, "scan failed"),
        }

        let Some(wait) = until_next(schedule, clock.now_millis()) else {
            break;
        };
        print_status(
            "Waiting",
            &format!(
                "next {} backup in {}m (Ctrl+C to stop)",
                schedule.frequency,
                wait.as_secs().div_ceil(60)
            ),
        );
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = &mut shutdown => break,
        }
    }
}

fn until_next(schedule: &ScheduleConfig, now_ms: i64) -> Option<Duration> {
    let next = schedule.next_run(now_ms)?;
    Some(Duration::from_millis(
        u64::try_from(next - now_ms).unwrap_or(0),
    ))
}

/// Upload changed files that still exist and tombstone the ones that don't.
async fn sync_changes(
    target: &BackupTarget,
    session: &Arc<dyn VaultSession>,
    options: &UploadOptions,
    changed: &HashSet<PathBuf>,
) -> Result<()> {
    let relative: HashSet<&Path> = changed
        .iter()
        .filter_map(|p| p.strip_prefix(&target.source).ok())
        .filter(|p| !p.as_os_str().is_empty())
        .collect();

    let files: Vec<_> = target
        .scan()
        .await?
        .into_iter()
        .filter(|f| relative.contains(f.path.as_path()))
        .collect();
    if !files.is_empty() {
        target.upload(session.clone(), options.clone(), files).await;
    }

    for rel in relative {
        if target.source.join(rel).exists() {
            continue;
        }
        let path = vault_path(rel, &target.prefix);
        remove_entry(session.as_ref(), &path).await?;
        // a removed directory takes its entries with it
        for entry in session.list_entries(&format!("{path}/")).await? {
            remove_entry(session.as_ref(), &entry.path).await?;
        }
    }
    Ok(())
}

async fn remove_entry(session: &dyn VaultSession, path: &str) -> Result<()> {
    let entry = match session.get_entry(path).await {
        Ok(entry) => entry,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if entry.state == EntryState::Deleted {
        return Ok(());
    }
    session.delete_entry(path, Some(entry.version)).await?;
    print_status("Deleted", path);
    Ok(())
}
