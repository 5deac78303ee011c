//! Atomic output writing.
//!
//! Readers of a target path see either the pre-existing file or the
//! complete new file, never a partial write: bytes go to a temp file in
//! the same directory, get validated, and are renamed over the target.
//! A failed validation or rename unlinks the temp file and leaves the
//! original untouched.

use crate::analyzer::ImageKind;
use crate::common::{ensure_parent_dir, path_safe_name};
use crate::errors::OptimiseError;
use crate::paths::temp_file_name;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Minimum byte size for a valid encoder output. No real image in the
/// supported formats fits under this; anything smaller is a truncated
/// or corrupt write and must never reach the target.
pub const MIN_OUTPUT_SIZE: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub original_path: PathBuf,
    /// None for records that only mark a created file for removal.
    pub backup_path: Option<PathBuf>,
    /// Restore must delete `original_path` instead of copying over it
    /// (the replace-with-WebP path created a file that did not exist
    /// before the run).
    #[serde(default)]
    pub remove_on_restore: bool,
}

#[derive(Debug)]
pub struct WriteRequest<'a> {
    pub target: &'a Path,
    pub bytes: &'a [u8],
    /// When set, the temp file is decoded and its container must match.
    pub expected_format: Option<ImageKind>,
    /// Capture the pre-existing target into this directory before the
    /// rename.
    pub backup_dir: Option<&'a Path>,
}

/// Write atomically, returning the backup record when a pre-existing
/// target was captured.
pub fn write_atomic(req: &WriteRequest) -> Result<Option<BackupRecord>, OptimiseError> {
    ensure_parent_dir(req.target).map_err(|e| OptimiseError::from_io(req.target, e))?;

    let parent = req.target.parent().unwrap_or(Path::new("."));
    let now_ms = chrono::Utc::now().timestamp_millis();
    let rand = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
        ^ std::process::id();
    let temp_path = parent.join(temp_file_name(req.target, now_ms, rand));

    if let Err(e) = std::fs::write(&temp_path, req.bytes) {
        return Err(OptimiseError::Write {
            path: req.target.to_path_buf(),
            detail: format!("temp write failed: {e}"),
        });
    }

    if let Err(e) = validate_temp(&temp_path, req) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    let backup = match capture_backup(req) {
        Ok(record) => record,
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    };

    if let Err(e) = std::fs::rename(&temp_path, req.target) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(OptimiseError::Write {
            path: req.target.to_path_buf(),
            detail: format!("rename failed: {e}"),
        });
    }

    Ok(backup)
}

fn validate_temp(temp_path: &Path, req: &WriteRequest) -> Result<(), OptimiseError> {
    let meta = std::fs::metadata(temp_path).map_err(|e| OptimiseError::Validation {
        path: req.target.to_path_buf(),
        detail: format!("temp file vanished: {e}"),
    })?;
    if meta.len() < MIN_OUTPUT_SIZE {
        return Err(OptimiseError::Validation {
            path: req.target.to_path_buf(),
            detail: format!(
                "output is {} bytes, below the {} byte validity floor",
                meta.len(),
                MIN_OUTPUT_SIZE
            ),
        });
    }

    if let Some(expected) = req.expected_format {
        let bytes = std::fs::read(temp_path).map_err(|e| OptimiseError::Validation {
            path: req.target.to_path_buf(),
            detail: format!("temp readback failed: {e}"),
        })?;
        let guessed = image::guess_format(&bytes).map_err(|e| OptimiseError::Validation {
            path: req.target.to_path_buf(),
            detail: format!("output is not a decodable image: {e}"),
        })?;
        if ImageKind::from_image_format(guessed) != Some(expected) {
            return Err(OptimiseError::Validation {
                path: req.target.to_path_buf(),
                detail: format!(
                    "output container {:?} does not match expected {}",
                    guessed,
                    expected.name()
                ),
            });
        }
    }

    Ok(())
}

fn capture_backup(req: &WriteRequest) -> Result<Option<BackupRecord>, OptimiseError> {
    let Some(backup_dir) = req.backup_dir else {
        return Ok(None);
    };
    if !req.target.exists() {
        return Ok(None);
    }

    std::fs::create_dir_all(backup_dir).map_err(|e| OptimiseError::from_io(backup_dir, e))?;
    let backup_path = backup_dir.join(path_safe_name(req.target));
    std::fs::copy(req.target, &backup_path).map_err(|e| OptimiseError::Write {
        path: req.target.to_path_buf(),
        detail: format!("backup copy failed: {e}"),
    })?;

    Ok(Some(BackupRecord {
        original_path: req.target.to_path_buf(),
        backup_path: Some(backup_path),
        remove_on_restore: false,
    }))
}

/// Atomic write without validation or backup, for the engine's own
/// JSON state files.
pub fn write_file_atomic(target: &Path, bytes: &[u8]) -> Result<(), OptimiseError> {
    ensure_parent_dir(target).map_err(|e| OptimiseError::from_io(target, e))?;
    let parent = target.parent().unwrap_or(Path::new("."));
    let temp_path = parent.join(temp_file_name(
        target,
        chrono::Utc::now().timestamp_millis(),
        std::process::id(),
    ));
    std::fs::write(&temp_path, bytes).map_err(|e| OptimiseError::Write {
        path: target.to_path_buf(),
        detail: format!("temp write failed: {e}"),
    })?;
    std::fs::rename(&temp_path, target).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        OptimiseError::Write {
            path: target.to_path_buf(),
            detail: format!("rename failed: {e}"),
        }
    })
}
