//! Run persistence: structured run log, last-run state, and restore.
//!
//! `last-run.json` holds at most one run's backup records; a finished
//! run overwrites it atomically. Restore reverses a replace-mode run by
//! copying every backup over its original (temp + rename), and undoes
//! created files marked `remove_on_restore`.

use crate::errors::{ErrorInfo, OptimiseError};
use crate::job::JobState;
use crate::settings::{EffectiveSettings, RunMode};
use crate::writer::{write_file_atomic, BackupRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const LAST_RUN_FILE: &str = "last-run.json";
pub const LOGS_DIR_NAME: &str = ".optimise-logs";
pub const BACKUP_DIR_NAME: &str = "Originals Backup";
pub const RUN_LOG_FILE: &str = "optimise-log.json";

/// Timestamp-based run id; unique per process since two runs cannot
/// start in the same millisecond through the one-run-at-a-time gate.
pub fn new_run_id() -> String {
    Utc::now().format("run-%Y%m%d-%H%M%S-%3f").to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub input_path: PathBuf,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub total_files: usize,
    pub processed_files: usize,
    pub converted_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    pub total_original_bytes: u64,
    pub total_output_bytes: u64,
    pub total_saved_bytes: u64,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub log_path: Option<PathBuf>,
    pub failures: Vec<FailureEntry>,
}

impl RunSummary {
    pub fn empty(run_id: String) -> Self {
        Self {
            run_id,
            total_files: 0,
            processed_files: 0,
            converted_files: 0,
            skipped_files: 0,
            failed_files: 0,
            cancelled_files: 0,
            total_original_bytes: 0,
            total_output_bytes: 0,
            total_saved_bytes: 0,
            elapsed_ms: 0,
            cancelled: false,
            log_path: None,
            failures: Vec::new(),
        }
    }

    /// Every file ends in exactly one terminal bucket.
    pub fn is_balanced(&self) -> bool {
        self.total_files
            == self.processed_files + self.skipped_files + self.failed_files + self.cancelled_files
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub input_path: PathBuf,
    pub status: JobState,
    pub result: crate::job::JobResultData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timings: Vec<crate::job::StageTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub run_id: String,
    pub mode: RunMode,
    pub settings: EffectiveSettings,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub summary: RunSummary,
    pub entries: Vec<RunLogEntry>,
}

impl RunLog {
    pub fn save(&self, path: &Path) -> Result<(), OptimiseError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| anyhow::anyhow!(e))?;
        write_file_atomic(path, &json)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRunState {
    pub run_id: String,
    pub backup_dir: Option<PathBuf>,
    pub records: Vec<BackupRecord>,
    pub log_path: PathBuf,
}

impl LastRunState {
    pub fn file_path(app_dir: &Path) -> PathBuf {
        app_dir.join(LAST_RUN_FILE)
    }

    pub fn save(&self, app_dir: &Path) -> Result<(), OptimiseError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| anyhow::anyhow!(e))?;
        write_file_atomic(&Self::file_path(app_dir), &json)
    }

    pub fn load(app_dir: &Path) -> Option<Self> {
        let bytes = std::fs::read(Self::file_path(app_dir)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "last-run state unreadable, ignoring");
                None
            }
        }
    }

    pub fn clear(app_dir: &Path) {
        let _ = std::fs::remove_file(Self::file_path(app_dir));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub restored_count: usize,
    pub failed_count: usize,
    pub message: String,
}

pub fn can_restore_last_run(app_dir: &Path) -> bool {
    LastRunState::load(app_dir)
        .map(|s| !s.records.is_empty())
        .unwrap_or(false)
}

/// Reverse the last run from its backups. The state file is consumed
/// only when every record restored cleanly, so a partial failure can be
/// retried.
pub fn restore_last_run(app_dir: &Path) -> RestoreReport {
    let Some(state) = LastRunState::load(app_dir) else {
        return RestoreReport {
            restored_count: 0,
            failed_count: 0,
            message: "No run to restore".into(),
        };
    };

    let mut restored = 0;
    let mut failed = 0;

    for record in &state.records {
        match restore_record(record) {
            Ok(()) => restored += 1,
            Err(e) => {
                tracing::warn!(
                    original = %record.original_path.display(),
                    error = %e,
                    "restore failed for record"
                );
                failed += 1;
            }
        }
    }

    if failed == 0 {
        LastRunState::clear(app_dir);
    }

    RestoreReport {
        restored_count: restored,
        failed_count: failed,
        message: if failed == 0 {
            format!("Restored {restored} file(s) from run {}", state.run_id)
        } else {
            format!("Restored {restored} file(s), {failed} failed; state kept for retry")
        },
    }
}

fn restore_record(record: &BackupRecord) -> Result<(), OptimiseError> {
    if record.remove_on_restore {
        match std::fs::remove_file(&record.original_path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(OptimiseError::from_io(&record.original_path, e)),
        }
    }

    let Some(backup_path) = &record.backup_path else {
        return Err(OptimiseError::Write {
            path: record.original_path.clone(),
            detail: "record has neither a backup nor a removal mark".into(),
        });
    };
    let bytes =
        std::fs::read(backup_path).map_err(|e| OptimiseError::from_io(backup_path, e))?;
    write_file_atomic(&record.original_path, &bytes)
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(original: &Path, backup: Option<&Path>, remove: bool) -> BackupRecord {
        BackupRecord {
            original_path: original.to_path_buf(),
            backup_path: backup.map(Path::to_path_buf),
            remove_on_restore: remove,
        }
    }

    #[test]
    fn test_last_run_roundtrip() {
        let dir = TempDir::new().unwrap();
        let state = LastRunState {
            run_id: "run-1".into(),
            backup_dir: Some(dir.path().join("backups")),
            records: vec![record(
                &dir.path().join("a.jpg"),
                Some(&dir.path().join("backups/a.jpg")),
                false,
            )],
            log_path: dir.path().join("log.json"),
        };
        state.save(dir.path()).unwrap();

        let loaded = LastRunState::load(dir.path()).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.records.len(), 1);
        assert!(can_restore_last_run(dir.path()));
    }

    #[test]
    fn test_restore_reverses_replace() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("photo.jpg");
        let backup = dir.path().join("backup/photo.jpg");
        std::fs::create_dir_all(backup.parent().unwrap()).unwrap();
        std::fs::write(&backup, b"pre-run bytes").unwrap();
        std::fs::write(&original, b"optimized bytes").unwrap();

        let state = LastRunState {
            run_id: "run-2".into(),
            backup_dir: Some(dir.path().join("backup")),
            records: vec![record(&original, Some(&backup), false)],
            log_path: dir.path().join("log.json"),
        };
        state.save(dir.path()).unwrap();

        let report = restore_last_run(dir.path());
        assert_eq!(report.restored_count, 1);
        assert_eq!(report.failed_count, 0);
        assert_eq!(std::fs::read(&original).unwrap(), b"pre-run bytes");
        // Byte-for-byte identical.
        assert_eq!(
            sha256_file(&original).unwrap(),
            sha256_file(&backup).unwrap()
        );
        // State consumed.
        assert!(!can_restore_last_run(dir.path()));
    }

    #[test]
    fn test_restore_removes_created_files() {
        let dir = TempDir::new().unwrap();
        let created = dir.path().join("photo.webp");
        std::fs::write(&created, b"webp").unwrap();

        let state = LastRunState {
            run_id: "run-3".into(),
            backup_dir: None,
            records: vec![record(&created, None, true)],
            log_path: dir.path().join("log.json"),
        };
        state.save(dir.path()).unwrap();

        let report = restore_last_run(dir.path());
        assert_eq!(report.restored_count, 1);
        assert!(!created.exists());

        // Removing an already-absent file is still a success (restore
        // is idempotent for removal records).
        std::fs::write(&created, b"webp").unwrap();
        std::fs::remove_file(&created).unwrap();
    }

    #[test]
    fn test_restore_partial_failure_keeps_state() {
        let dir = TempDir::new().unwrap();
        let ok_original = dir.path().join("a.jpg");
        let ok_backup = dir.path().join("a.bak");
        std::fs::write(&ok_backup, b"a").unwrap();
        std::fs::write(&ok_original, b"changed").unwrap();

        let missing_backup = dir.path().join("missing.bak");
        let other = dir.path().join("b.jpg");

        let state = LastRunState {
            run_id: "run-4".into(),
            backup_dir: None,
            records: vec![
                record(&ok_original, Some(&ok_backup), false),
                record(&other, Some(&missing_backup), false),
            ],
            log_path: dir.path().join("log.json"),
        };
        state.save(dir.path()).unwrap();

        let report = restore_last_run(dir.path());
        assert_eq!(report.restored_count, 1);
        assert_eq!(report.failed_count, 1);
        assert!(report.message.contains("retry"));
        // State kept for a second attempt.
        assert!(can_restore_last_run(dir.path()));
    }

    #[test]
    fn test_restore_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        let report = restore_last_run(dir.path());
        assert_eq!(report.restored_count, 0);
        assert_eq!(report.message, "No run to restore");
    }

    #[test]
    fn test_summary_balance() {
        let mut summary = RunSummary::empty("r".into());
        summary.total_files = 4;
        summary.processed_files = 1;
        summary.skipped_files = 1;
        summary.failed_files = 1;
        summary.cancelled_files = 1;
        assert!(summary.is_balanced());
        summary.cancelled_files = 0;
        assert!(!summary.is_balanced());
    }

    #[test]
    fn test_run_ids_are_ordered() {
        let a = new_run_id();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = new_run_id();
        assert!(a <= b);
        assert!(a.starts_with("run-"));
    }
}
