//! Cargo-style progress output for vault
//!
//! ```text
//!    Scanning 952 files (67.44 MiB)
//!   Uploading [======>                  ] 31.02 MiB/67.44 MiB
//!   Backed up 952 files in 3.2s (12.10 MiB sent)
//! ```

use std::io::Write as _;
use std::sync::LazyLock;
use std::time::Instant;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::fmt::MakeWriter;

use vault_core::{CommitOutcome, VaultError};
use vault_transport::{BackupReport, FileResult, UploadObserver};

static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SCANNING: &str = "Scanning";
    const UPLOADING: &str = "Uploading";
    const BACKED_UP: &str = "Backed up";
    const CONFLICT: &str = "Conflict";
    const FAILED: &str = "Failed";
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    print_styled(&console::Style::new().green().bold(), status, message);
}

pub fn print_warning(status: &str, message: &str) {
    print_styled(&console::Style::new().yellow().bold(), status, message);
}

fn print_styled(style: &console::Style, status: &str, message: &str) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

pub fn format_bytes(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Tracing writer that prints above any active progress bars
pub struct ProgressWriter;

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = ProgressLine;

    fn make_writer(&'a self) -> Self::Writer {
        ProgressLine(Vec::new())
    }
}

/// One buffered log event, flushed when dropped
pub struct ProgressLine(Vec<u8>);

impl std::io::Write for ProgressLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for ProgressLine {
    fn drop(&mut self) {
        if self.0.is_empty() {
            return;
        }
        MULTI.suspend(|| {
            let _ = std::io::stderr().write_all(&self.0);
        });
    }
}

/// Progress for one backup run
pub struct BackupProgress {
    start: Instant,
    bar: ProgressBar,
}

impl BackupProgress {
    pub fn new() -> Self {
        let bar = MULTI.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg:>12.green.bold} [{bar:25.cyan/dim}] {bytes}/{total_bytes} {prefix:.dim}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(Status::UPLOADING);
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        Self {
            start: Instant::now(),
            bar,
        }
    }

    pub fn scanning(&self, files: usize, bytes: u64) {
        print_status(
            Status::SCANNING,
            &format!("{files} files ({})", format_bytes(bytes)),
        );
    }

    /// Show final summary
    pub fn finish(&self, report: &BackupReport) {
        self.bar.finish_and_clear();
        let elapsed = self.start.elapsed();
        let elapsed_str = if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        };

        let files = report.uploaded + report.unchanged + report.skipped;
        let summary = format!(
            "{files} files in {elapsed_str} ({} sent, {} unchanged)",
            format_bytes(report.bytes_sent),
            report.unchanged
        );
        if report.failed.is_empty() && report.conflicted.is_empty() {
            print_status(Status::BACKED_UP, &summary);
        } else {
            print_warning(
                "Finished",
                &format!(
                    "{summary}, {} conflicted, {} failed",
                    report.conflicted.len(),
                    report.failed.len()
                ),
            );
        }
    }
}

impl Default for BackupProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadObserver for BackupProgress {
    fn file_started(&self, path: &str, total_bytes: u64) {
        self.bar.inc_length(total_bytes);
        self.bar.set_prefix(path.to_string());
    }

    fn bytes_sent(&self, _path: &str, bytes: u64) {
        self.bar.inc(bytes);
    }

    fn file_finished(&self, path: &str, result: &FileResult) {
        match result {
            FileResult::Uploaded {
                outcome,
                sent_bytes,
                total_bytes,
            } => {
                // deduplicated bytes still count toward the bar
                self.bar.inc(total_bytes.saturating_sub(*sent_bytes));
                if let CommitOutcome::Conflicted { version, .. } = &outcome.commit {
                    print_warning(
                        Status::CONFLICT,
                        &format!("{path} (remote at v{version}, run `vault conflicts`)"),
                    );
                }
            }
            FileResult::Unchanged { .. } | FileResult::Skipped { .. } => {}
        }
    }

    fn file_failed(&self, path: &str, error: &VaultError) {
        print_warning(Status::FAILED, &format!("{path}: {error}"));
    }
}
