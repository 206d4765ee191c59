//! Drop-folder sweep.
//!
//! Uploads every regular file of a source directory and moves each one that
//! made it into a done directory. Failed files stay where they are so the
//! next sweep picks them up again.

use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::coordinator::UploadCoordinator;
use crate::error::UploadError;

/// Result of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// New locations of the uploaded files.
    pub uploaded: Vec<PathBuf>,
    /// Files left behind, with the reason.
    pub failed: Vec<(PathBuf, String)>,
    /// The sweep stopped early on cancellation.
    pub cancelled: bool,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Uploads the files of `source` in name order, moving successes to `done`.
///
/// Both directories are created when missing. Only directory-level I/O
/// errors abort the sweep; a failing file is recorded and skipped.
pub async fn sweep_directory(
    coordinator: &UploadCoordinator,
    source: &Path,
    done: &Path,
) -> Result<SweepReport, UploadError> {
    for dir in [source, done] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| UploadError::local_io(dir, e))?;
    }

    let files = list_files(source).await?;
    info!(source = %source.display(), files = files.len(), "sweeping directory");

    let mut report = SweepReport::default();
    for path in files {
        match coordinator.upload(&path).await {
            Ok(_) => match move_into(&path, done).await {
                Ok(dest) => {
                    info!(file = %path.display(), dest = %dest.display(), "moved uploaded file");
                    report.uploaded.push(dest);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "uploaded but could not move");
                    report.failed.push((path, format!("move failed: {e}")));
                }
            },
            Err(UploadError::Cancelled) => {
                report.cancelled = true;
                break;
            }
            Err(e) => report.failed.push((path, e.to_string())),
        }
    }

    info!(
        uploaded = report.uploaded.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled,
        "sweep finished"
    );
    Ok(report)
}

/// Regular files directly inside `dir`, sorted by path.
async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, UploadError> {
    let io_err = |e| UploadError::local_io(dir, e);
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        if entry.file_type().await.map_err(io_err)?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Moves `path` into `dir`, copying when a rename crosses filesystems.
async fn move_into(path: &Path, dir: &Path) -> std::io::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "path has no file name"))?;
    let dest = dir.join(name);
    if tokio::fs::rename(path, &dest).await.is_err() {
        tokio::fs::copy(path, &dest).await?;
        tokio::fs::remove_file(path).await?;
    }
    Ok(dest)
}
