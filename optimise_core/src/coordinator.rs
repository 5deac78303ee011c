//! Run orchestration: input resolution, job dispatch, aggregation, and
//! run-state persistence.
//!
//! One run at a time per process. The coordinator resolves inputs,
//! allocates the run's backup and log locations under the common root,
//! feeds file jobs to the worker pool, folds job outcomes into the
//! summary, and persists the run log plus `last-run.json` when all jobs
//! reach a terminal state.

use crate::common::{self, is_inside_ignored_dir, is_junk_file, is_supported_input};
use crate::errors::{ErrorInfo, OptimiseError};
use crate::job::{FileJob, JobResultData, JobState};
use crate::pool::{CancelToken, WorkerPool};
use crate::progress::{EngineEvent, ProgressBus};
use crate::settings::{OutputMode, RunRequest};
use crate::state::{
    new_run_id, FailureEntry, LastRunState, RunLog, RunLogEntry, RunSummary, BACKUP_DIR_NAME,
    LOGS_DIR_NAME, RUN_LOG_FILE,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use walkdir::WalkDir;

/// Directories a destructive (replace-mode) run refuses to touch.
pub fn check_dangerous_directory(path: &Path) -> Result<(), OptimiseError> {
    let dangerous = |p: &Path| -> bool {
        if p.parent().is_none() {
            return true;
        }
        if let Some(home) = std::env::var_os("HOME") {
            if p == Path::new(&home) {
                return true;
            }
        }
        matches!(
            p.to_string_lossy().as_ref(),
            "/usr" | "/etc" | "/bin" | "/sbin" | "/var" | "/System" | "/Library" | "C:\\Windows"
        )
    };
    if dangerous(path) {
        return Err(OptimiseError::DangerousDirectory {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Expand the request's paths into the concrete input list.
///
/// Directories are walked recursively with the ignore rules applied and
/// only supported extensions kept. Explicitly named files are kept even
/// when unsupported, so the job can report `skipped(unsupported)`.
pub fn resolve_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut resolved = BTreeSet::new();

    for path in paths {
        if path.is_dir() {
            let walker = WalkDir::new(path).follow_links(false).into_iter();
            for entry in walker.filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !(e.file_type().is_dir() && common::IGNORED_DIR_NAMES.contains(&name.as_ref()))
                    && !(e.file_type().is_dir() && name.starts_with('.') && e.depth() > 0)
            }) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let p = entry.path();
                if is_junk_file(p) || is_inside_ignored_dir(p) || !is_supported_input(p) {
                    continue;
                }
                resolved.insert(p.to_path_buf());
            }
        } else {
            resolved.insert(path.clone());
        }
    }

    resolved.into_iter().collect()
}

struct ActiveRun {
    run_id: String,
    cancel: CancelToken,
}

pub struct RunCoordinator {
    app_dir: PathBuf,
    bus: Arc<ProgressBus>,
    active: Mutex<Option<ActiveRun>>,
}

impl RunCoordinator {
    pub fn new(app_dir: PathBuf, bus: Arc<ProgressBus>) -> Self {
        Self {
            app_dir,
            bus,
            active: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    pub fn active_run_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|a| a.run_id.clone())
    }

    /// Best-effort cooperative cancel of the named run.
    pub fn cancel_run(&self, run_id: &str) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = active.as_ref() {
            if active.run_id == run_id {
                tracing::info!(run_id, "cancel requested");
                active.cancel.cancel();
            }
        }
    }

    /// Start a run on a background thread and return its id.
    pub fn start_run(self: &Arc<Self>, request: RunRequest) -> Result<String, OptimiseError> {
        let (run_id, cancel) = self.claim_run()?;
        let this = Arc::clone(self);
        let id_for_thread = run_id.clone();
        std::thread::Builder::new()
            .name("optimise-run".into())
            .spawn(move || {
                let _ = this.execute_run(&id_for_thread, request, &cancel);
                this.release_run();
            })
            .map_err(|e| OptimiseError::Other(anyhow::anyhow!("run thread spawn failed: {e}")))?;
        Ok(run_id)
    }

    /// Run synchronously and return the summary.
    pub fn run_blocking(&self, request: RunRequest) -> Result<RunSummary, OptimiseError> {
        let (run_id, cancel) = self.claim_run()?;
        let result = self.execute_run(&run_id, request, &cancel);
        self.release_run();
        result
    }

    fn claim_run(&self) -> Result<(String, CancelToken), OptimiseError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.is_some() {
            return Err(OptimiseError::RunInProgress);
        }
        let run_id = new_run_id();
        let cancel = CancelToken::new();
        *active = Some(ActiveRun {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
        });
        Ok((run_id, cancel))
    }

    fn release_run(&self) {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn execute_run(
        &self,
        run_id: &str,
        request: RunRequest,
        cancel: &CancelToken,
    ) -> Result<RunSummary, OptimiseError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let settings = Arc::new(request.settings.clone().normalized());

        let inputs = resolve_inputs(&request.paths);
        tracing::info!(run_id, files = inputs.len(), mode = ?request.mode, "run starting");

        self.bus.emit(EngineEvent::RunStarted {
            run_id: run_id.to_string(),
            total_files: inputs.len(),
        });

        if inputs.is_empty() {
            let mut summary = RunSummary::empty(run_id.to_string());
            summary.elapsed_ms = started.elapsed().as_millis() as u64;
            self.bus
                .emit(EngineEvent::RunCompleted(Box::new(summary.clone())));
            return Ok(summary);
        }

        let common_root = common::common_root(&inputs);

        let replace_mode = settings.output_mode == OutputMode::Replace;
        if replace_mode {
            check_dangerous_directory(&common_root)?;
        }

        let backup_dir = if replace_mode {
            let dir = common_root.join(BACKUP_DIR_NAME).join(run_id);
            std::fs::create_dir_all(&dir).map_err(|e| OptimiseError::from_io(&dir, e))?;
            Some(dir)
        } else {
            None
        };

        let log_dir = common_root.join(LOGS_DIR_NAME).join(run_id);
        std::fs::create_dir_all(&log_dir).map_err(|e| OptimiseError::from_io(&log_dir, e))?;
        let log_path = log_dir.join(RUN_LOG_FILE);

        // Dispatch.
        let workers = settings.concurrency.resolve();
        let pool = WorkerPool::new(workers);
        let claims = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let bus = Arc::clone(&self.bus);

        let handles: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(idx, input)| {
                let job = FileJob {
                    id: idx as u64 + 1,
                    input: input.clone(),
                    common_root: common_root.clone(),
                    backup_dir: backup_dir.clone(),
                    mode: request.mode,
                    settings: Arc::clone(&settings),
                    claims: Arc::clone(&claims),
                };
                let cancel = cancel.clone();
                let bus = Arc::clone(&bus);
                let input = input.clone();
                (
                    input,
                    pool.submit(move || {
                        job.execute(&cancel, &|event| bus.emit(EngineEvent::Job(event)))
                    }),
                )
            })
            .collect();

        // Aggregate.
        let mut summary = RunSummary::empty(run_id.to_string());
        summary.total_files = inputs.len();
        summary.log_path = Some(log_path.clone());
        let mut entries = Vec::with_capacity(inputs.len());
        let mut backup_records = Vec::new();

        for (input, handle) in handles {
            let outcome = match handle.wait() {
                Ok(outcome) => outcome,
                Err(panic) => {
                    // A crashed worker task still yields one terminal
                    // entry for its file.
                    let error = OptimiseError::Other(anyhow::anyhow!(panic.detail.clone()));
                    let result = JobResultData {
                        error: Some(ErrorInfo::from_error(&error)),
                        ..JobResultData::default()
                    };
                    crate::job::JobOutcome {
                        state: JobState::Failed,
                        result,
                        backups: Vec::new(),
                        timings: Vec::new(),
                    }
                }
            };

            match outcome.state {
                JobState::Success => {
                    summary.processed_files += 1;
                    summary.total_original_bytes += outcome.result.original_bytes;
                    summary.total_output_bytes += outcome.result.output_bytes;
                    if outcome.result.converted {
                        summary.converted_files += 1;
                    }
                }
                JobState::Skipped => summary.skipped_files += 1,
                JobState::Cancelled => summary.cancelled_files += 1,
                JobState::Failed => {
                    summary.failed_files += 1;
                    if let Some(error) = &outcome.result.error {
                        summary.failures.push(FailureEntry {
                            input_path: input.clone(),
                            error: error.clone(),
                        });
                    }
                }
                JobState::Queued | JobState::Running => unreachable!("non-terminal outcome"),
            }

            backup_records.extend(outcome.backups);
            entries.push(RunLogEntry {
                input_path: input,
                status: outcome.state,
                result: outcome.result,
                timings: outcome.timings,
            });
        }

        pool.shutdown();

        // A run that captured nothing leaves no backup directory behind.
        let backup_dir = match backup_dir {
            Some(dir) if backup_records.is_empty() => {
                let _ = std::fs::remove_dir(&dir);
                None
            }
            other => other,
        };

        summary.total_saved_bytes = summary
            .total_original_bytes
            .saturating_sub(summary.total_output_bytes);
        summary.cancelled = cancel.is_cancelled();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        let log = RunLog {
            run_id: run_id.to_string(),
            mode: request.mode,
            settings: (*settings).clone(),
            started_at,
            finished_at: Utc::now(),
            cancelled: summary.cancelled,
            summary: summary.clone(),
            entries,
        };
        if let Err(e) = log.save(&log_path) {
            tracing::warn!(error = %e, "run log write failed");
        }

        let last_run = LastRunState {
            run_id: run_id.to_string(),
            backup_dir,
            records: backup_records,
            log_path,
        };
        if let Err(e) = last_run.save(&self.app_dir) {
            tracing::warn!(error = %e, "last-run state write failed");
        }

        tracing::info!(
            run_id,
            processed = summary.processed_files,
            skipped = summary.skipped_files,
            failed = summary.failed_files,
            cancelled = summary.cancelled_files,
            saved_bytes = summary.total_saved_bytes,
            "run complete"
        );

        self.bus
            .emit(EngineEvent::RunCompleted(Box::new(summary.clone())));
        Ok(summary)
    }
}
