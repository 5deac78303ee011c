//! A single image's lifecycle through the pipeline.
//!
//! States move strictly forward (`queued → running → terminal`); while
//! running, the job walks a fixed stage sequence and checks the run's
//! cancel flag at every stage boundary. Cancellation observed before
//! the writing stage discards all produced candidates, so no partial
//! output ever lands.

use crate::analyzer::{self, ImageKind};
use crate::candidates::{self, CandidateContext, Selection};
use crate::common;
use crate::errors::{ErrorInfo, OptimiseError, SkipReason};
use crate::metadata::{self, MetadataReport};
use crate::paths::{short_hash, OutputPlanner};
use crate::pool::CancelToken;
use crate::responsive::{self, ResponsiveJob};
use crate::settings::{EffectiveSettings, OutputMode, RunMode};
use crate::writer::{write_atomic, BackupRecord, WriteRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzing,
    Decoding,
    Transforming,
    Encoding,
    Writing,
    Verifying,
    Cleaning,
}

impl Stage {
    /// Progress percent reported when the stage begins; monotonic over
    /// the stage sequence.
    pub fn percent(&self) -> u8 {
        match self {
            Stage::Analyzing => 5,
            Stage::Decoding => 15,
            Stage::Transforming => 30,
            Stage::Encoding => 45,
            Stage::Writing => 80,
            Stage::Verifying => 90,
            Stage::Cleaning => 95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub stage: Stage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultData {
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_outputs: Vec<PathBuf>,
    pub original_bytes: u64,
    pub output_bytes: u64,
    pub bytes_saved: u64,
    pub ssim: Option<f64>,
    pub quality_label: Option<String>,
    pub converted: bool,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<ErrorInfo>,
    pub metadata: Option<MetadataReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub ms: u64,
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: u64,
    pub input_path: PathBuf,
    pub status: JobState,
    pub progress: Option<JobProgress>,
    pub result: Option<JobResultData>,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub state: JobState,
    pub result: JobResultData,
    pub backups: Vec<BackupRecord>,
    pub timings: Vec<StageTiming>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid job transition {:?} -> {:?}", self.from, self.to)
    }
}

/// Enforces forward-only transitions.
#[derive(Debug)]
pub struct JobStateMachine {
    state: JobState,
}

impl JobStateMachine {
    pub fn new() -> Self {
        Self {
            state: JobState::Queued,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn transition(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        let valid = match (self.state, to) {
            (JobState::Queued, JobState::Running) => true,
            // Pre-processed dedup and cancel-before-start skip the
            // running state entirely.
            (JobState::Queued, JobState::Skipped) => true,
            (JobState::Queued, JobState::Cancelled) => true,
            (JobState::Running, s) if s.is_terminal() => true,
            _ => false,
        };
        if !valid {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl Default for JobStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FileJob {
    pub id: u64,
    pub input: PathBuf,
    pub common_root: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub mode: RunMode,
    pub settings: Arc<EffectiveSettings>,
    /// Output paths already claimed in this run, for collision suffixes.
    pub claims: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Output format an input transcodes to when keeping "its own" format.
pub fn normalized_target(kind: ImageKind) -> ImageKind {
    match kind {
        ImageKind::Tiff => ImageKind::Jpeg,
        other => other,
    }
}

enum PipelineEnd {
    Skip(SkipReason),
    Cancelled,
    Failed(OptimiseError),
}

impl From<OptimiseError> for PipelineEnd {
    fn from(e: OptimiseError) -> Self {
        PipelineEnd::Failed(e)
    }
}

struct PipelineSuccess {
    output_path: PathBuf,
    extra_outputs: Vec<PathBuf>,
    original_bytes: u64,
    output_bytes: u64,
    ssim: Option<f64>,
    quality_label: Option<String>,
    converted: bool,
    backups: Vec<BackupRecord>,
    metadata: Option<MetadataReport>,
}

impl FileJob {
    pub fn execute(&self, cancel: &CancelToken, emit: &(dyn Fn(JobEvent) + Sync)) -> JobOutcome {
        let mut sm = JobStateMachine::new();
        let mut timings = Vec::new();

        if cancel.is_cancelled() {
            sm.transition(JobState::Cancelled).ok();
            let result = JobResultData::default();
            self.emit_terminal(emit, sm.state(), &result);
            return JobOutcome {
                state: sm.state(),
                result,
                backups: Vec::new(),
                timings,
            };
        }

        sm.transition(JobState::Running).ok();
        let started = Instant::now();
        tracing::info!(job_id = self.id, input = %self.input.display(), "job started");

        let outcome = self.run_pipeline(cancel, emit, &mut timings);

        let (state, result, backups) = match outcome {
            Ok(success) => {
                let bytes_saved = success.original_bytes.saturating_sub(success.output_bytes);
                let result = JobResultData {
                    output_path: Some(success.output_path),
                    extra_outputs: success.extra_outputs,
                    original_bytes: success.original_bytes,
                    output_bytes: success.output_bytes,
                    bytes_saved,
                    ssim: success.ssim,
                    quality_label: success.quality_label,
                    converted: success.converted,
                    skip_reason: None,
                    error: None,
                    metadata: success.metadata,
                };
                (JobState::Success, result, success.backups)
            }
            Err(PipelineEnd::Skip(reason)) => {
                let result = JobResultData {
                    original_bytes: std::fs::metadata(&self.input).map(|m| m.len()).unwrap_or(0),
                    skip_reason: Some(reason),
                    ..JobResultData::default()
                };
                (JobState::Skipped, result, Vec::new())
            }
            Err(PipelineEnd::Cancelled) => (JobState::Cancelled, JobResultData::default(), Vec::new()),
            Err(PipelineEnd::Failed(error)) => {
                tracing::warn!(
                    job_id = self.id,
                    input = %self.input.display(),
                    error = %error,
                    "job failed"
                );
                let result = JobResultData {
                    original_bytes: std::fs::metadata(&self.input).map(|m| m.len()).unwrap_or(0),
                    error: Some(ErrorInfo::from_error(&error)),
                    ..JobResultData::default()
                };
                (JobState::Failed, result, Vec::new())
            }
        };

        sm.transition(state).ok();
        tracing::info!(
            job_id = self.id,
            state = ?state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        self.emit_terminal(emit, state, &result);

        JobOutcome {
            state,
            result,
            backups,
            timings,
        }
    }

    fn emit_terminal(&self, emit: &(dyn Fn(JobEvent) + Sync), state: JobState, result: &JobResultData) {
        emit(JobEvent {
            job_id: self.id,
            input_path: self.input.clone(),
            status: state,
            progress: None,
            result: Some(result.clone()),
        });
    }

    fn stage<'t>(
        &self,
        stage: Stage,
        cancel: &CancelToken,
        emit: &(dyn Fn(JobEvent) + Sync),
        timings: &'t mut Vec<StageTiming>,
    ) -> Result<StageGuard<'t>, PipelineEnd> {
        if cancel.is_cancelled() {
            return Err(PipelineEnd::Cancelled);
        }
        emit(JobEvent {
            job_id: self.id,
            input_path: self.input.clone(),
            status: JobState::Running,
            progress: Some(JobProgress {
                percent: stage.percent(),
                stage,
            }),
            result: None,
        });
        Ok(StageGuard {
            stage,
            started: Instant::now(),
            timings,
        })
    }

    fn run_pipeline(
        &self,
        cancel: &CancelToken,
        emit: &(dyn Fn(JobEvent) + Sync),
        timings: &mut Vec<StageTiming>,
    ) -> Result<PipelineSuccess, PipelineEnd> {
        let settings: &EffectiveSettings = &self.settings;

        // -- analyzing ---------------------------------------------------
        let guard = self.stage(Stage::Analyzing, cancel, emit, timings)?;
        let Some(kind) = ImageKind::from_extension(&self.input) else {
            return Err(PipelineEnd::Skip(SkipReason::Unsupported));
        };
        if kind == ImageKind::Tiff && settings.output_mode == OutputMode::Replace {
            return Err(PipelineEnd::Skip(SkipReason::ReplaceTiff));
        }
        let original_bytes = std::fs::read(&self.input)
            .map_err(|e| PipelineEnd::Failed(OptimiseError::from_io(&self.input, e)))?;
        let original_size = original_bytes.len() as u64;
        drop(guard);

        // -- decoding ----------------------------------------------------
        let guard = self.stage(Stage::Decoding, cancel, emit, timings)?;
        let (image, info) = analyzer::decode_image(&self.input, &original_bytes)?;
        let features = analyzer::analyze_content(&image);
        drop(guard);

        // -- transforming ------------------------------------------------
        let guard = self.stage(Stage::Transforming, cancel, emit, timings)?;
        let (processed, meta_report) = metadata::prepare(image, &self.input, &settings.metadata);
        let workdir = tempfile::TempDir::new().map_err(OptimiseError::Io)?;
        let scratch_png = workdir.path().join("source.png");
        processed
            .save_with_format(&scratch_png, image::ImageFormat::Png)
            .map_err(|e| {
                PipelineEnd::Failed(OptimiseError::Encode {
                    tool: "png".into(),
                    exit_code: None,
                    detail: format!("scratch frame write failed: {e}"),
                })
            })?;
        let keep_metadata =
            meta_report.exif_kept || meta_report.xmp_kept || meta_report.iptc_kept;
        drop(guard);

        if self.mode == RunMode::Responsive {
            return self.run_responsive(cancel, emit, timings, &processed, kind, original_size, meta_report);
        }

        // -- encoding ----------------------------------------------------
        let guard = self.stage(Stage::Encoding, cancel, emit, timings)?;
        let ctx = CandidateContext {
            image: &processed,
            scratch_png: &scratch_png,
            original_size,
            features: &features,
            settings,
            workdir: workdir.path(),
            keep_metadata,
        };

        let primary_format = match self.mode {
            RunMode::ConvertWebp => ImageKind::Webp,
            _ => normalized_target(kind),
        };

        if primary_format == ImageKind::Webp
            && kind != ImageKind::Webp
            && settings.output_mode == OutputMode::Replace
            && !settings.confirm_dangerous_replace
        {
            return Err(PipelineEnd::Failed(OptimiseError::Unsupported {
                path: self.input.clone(),
                detail: "replace-mode WebP conversion requires explicit confirmation".into(),
            }));
        }

        let primary = self.build_primary(&ctx, primary_format)?;
        let primary = match primary {
            Selection::Selected(candidate) => candidate,
            Selection::NoneAccepted => return Err(PipelineEnd::Skip(SkipReason::NoCandidate)),
            Selection::AllLarger => return Err(PipelineEnd::Skip(SkipReason::Larger)),
        };

        // Companion WebP for optimizeAndWebp; its class failures only
        // cost the companion.
        let companion = if self.mode == RunMode::OptimizeAndWebp
            && primary_format != ImageKind::Webp
        {
            match candidates::build_ladder(&ctx, ImageKind::Webp) {
                Ok(list) => match candidates::select_smallest(list, original_size, true) {
                    Selection::Selected(c) => Some(c),
                    _ => None,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "companion WebP class unavailable");
                    None
                }
            }
        } else {
            None
        };
        drop(guard);

        // -- writing -----------------------------------------------------
        let guard = self.stage(Stage::Writing, cancel, emit, timings)?;
        let planner = OutputPlanner {
            common_root: &self.common_root,
            output_mode: settings.output_mode,
            naming_template: &settings.naming_template,
        };
        let content_hash = short_hash(&original_bytes);
        let dims = (info.width, info.height);

        let mut backups = Vec::new();
        let replacing_with_webp = settings.output_mode == OutputMode::Replace
            && primary.format == ImageKind::Webp
            && kind != ImageKind::Webp;

        let output_path = {
            let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
            planner.plan(&self.input, primary.format, dims, &content_hash, &mut claims)
        };

        if replacing_with_webp {
            // The original is not overwritten, it is superseded; capture
            // it before anything else so restore can reverse the whole
            // operation.
            let backup_dir = self.backup_dir.as_deref().ok_or_else(|| {
                OptimiseError::Write {
                    path: self.input.clone(),
                    detail: "replace-mode conversion requires a backup directory".into(),
                }
            })?;
            std::fs::create_dir_all(backup_dir)
                .map_err(|e| OptimiseError::from_io(backup_dir, e))?;
            let backup_path = backup_dir.join(common::path_safe_name(&self.input));
            std::fs::copy(&self.input, &backup_path).map_err(|e| OptimiseError::Write {
                path: self.input.clone(),
                detail: format!("backup copy failed: {e}"),
            })?;
            backups.push(BackupRecord {
                original_path: self.input.clone(),
                backup_path: Some(backup_path),
                remove_on_restore: false,
            });
        }

        let write_backup_dir = if settings.output_mode == OutputMode::Replace {
            self.backup_dir.as_deref()
        } else {
            None
        };
        if let Some(record) = write_atomic(&WriteRequest {
            target: &output_path,
            bytes: &primary.bytes,
            expected_format: Some(primary.format),
            backup_dir: write_backup_dir,
        })? {
            backups.push(record);
        } else if replacing_with_webp {
            // Fresh WebP beside the original: restore must delete it.
            backups.push(BackupRecord {
                original_path: output_path.clone(),
                backup_path: None,
                remove_on_restore: true,
            });
        }

        if replacing_with_webp && settings.delete_original_on_webp_replace {
            std::fs::remove_file(&self.input)
                .map_err(|e| OptimiseError::from_io(&self.input, e))?;
        }

        let mut extra_outputs = Vec::new();
        let mut converted = primary.format == ImageKind::Webp && kind != ImageKind::Webp;
        if let Some(companion) = &companion {
            let companion_path = {
                let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
                planner.plan(&self.input, companion.format, dims, &content_hash, &mut claims)
            };
            match write_atomic(&WriteRequest {
                target: &companion_path,
                bytes: &companion.bytes,
                expected_format: Some(companion.format),
                backup_dir: write_backup_dir,
            }) {
                Ok(record) => {
                    match record {
                        Some(record) => backups.push(record),
                        None if settings.output_mode == OutputMode::Replace => {
                            backups.push(BackupRecord {
                                original_path: companion_path.clone(),
                                backup_path: None,
                                remove_on_restore: true,
                            });
                        }
                        None => {}
                    }
                    extra_outputs.push(companion_path);
                    converted = true;
                }
                Err(e) => tracing::warn!(error = %e, "companion WebP write failed"),
            }
        }
        drop(guard);

        // -- verifying ---------------------------------------------------
        let guard = self.stage(Stage::Verifying, cancel, emit, timings)?;
        let written = std::fs::metadata(&output_path)
            .map_err(|e| OptimiseError::from_io(&output_path, e))?;
        if written.len() != primary.size() {
            return Err(PipelineEnd::Failed(OptimiseError::Validation {
                path: output_path.clone(),
                detail: format!(
                    "written size {} does not match candidate size {}",
                    written.len(),
                    primary.size()
                ),
            }));
        }
        drop(guard);

        // -- cleaning ----------------------------------------------------
        let guard = self.stage(Stage::Cleaning, cancel, emit, timings)?;
        if keep_metadata || meta_report.icc_kept {
            if let Err(e) = metadata::apply_kept_tags(&self.input, &output_path, &meta_report) {
                tracing::warn!(error = %e, "kept-tag copy failed; output stays stripped");
            }
        }
        drop(guard);

        Ok(PipelineSuccess {
            output_path,
            extra_outputs,
            original_bytes: original_size,
            output_bytes: primary.size(),
            ssim: primary.ssim.map(|s| s.value()),
            quality_label: Some(primary.quality_label.clone()),
            converted,
            backups,
            metadata: Some(meta_report),
        })
    }

    fn build_primary(
        &self,
        ctx: &CandidateContext,
        format: ImageKind,
    ) -> Result<Selection, PipelineEnd> {
        let use_smart = self.mode == RunMode::Smart
            && matches!(format, ImageKind::Jpeg | ImageKind::Webp);

        if use_smart {
            let found = candidates::smart_search(ctx, format)?;
            return Ok(match found {
                Some(candidate) => {
                    if !ctx.settings.allow_larger_output && candidate.size() >= ctx.original_size {
                        Selection::AllLarger
                    } else {
                        Selection::Selected(candidate)
                    }
                }
                None => Selection::NoneAccepted,
            });
        }

        let list = candidates::build_ladder(ctx, format)?;
        Ok(candidates::select_smallest(
            list,
            ctx.original_size,
            ctx.settings.allow_larger_output,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_responsive(
        &self,
        cancel: &CancelToken,
        emit: &(dyn Fn(JobEvent) + Sync),
        timings: &mut Vec<StageTiming>,
        processed: &image::DynamicImage,
        kind: ImageKind,
        original_size: u64,
        meta_report: MetadataReport,
    ) -> Result<PipelineSuccess, PipelineEnd> {
        let guard = self.stage(Stage::Encoding, cancel, emit, timings)?;
        let stem = self
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image");
        let output_dir = self
            .common_root
            .join(crate::paths::OPTIMIZED_DIR_NAME)
            .join(responsive::slugify(stem));

        let output = responsive::generate(&ResponsiveJob {
            input: &self.input,
            image: processed,
            input_kind: kind,
            output_dir: &output_dir,
            settings: &self.settings.responsive,
            webp_effort: self.settings.webp_effort,
        })?;
        drop(guard);

        let guard = self.stage(Stage::Cleaning, cancel, emit, timings)?;
        drop(guard);

        let extra_outputs = output.derivatives.iter().map(|d| d.path.clone()).collect();
        Ok(PipelineSuccess {
            output_path: output.manifest_path,
            extra_outputs,
            original_bytes: original_size,
            output_bytes: output.total_bytes,
            ssim: None,
            quality_label: None,
            converted: output
                .derivatives
                .iter()
                .any(|d| d.format == ImageKind::Webp),
            backups: Vec::new(),
            metadata: Some(meta_report),
        })
    }
}

/// Records the stage duration when dropped.
struct StageGuard<'t> {
    stage: Stage,
    started: Instant,
    timings: &'t mut Vec<StageTiming>,
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        self.timings.push(StageTiming {
            stage: self.stage,
            ms: self.started.elapsed().as_millis() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_happy_path() {
        let mut sm = JobStateMachine::new();
        assert_eq!(sm.state(), JobState::Queued);
        sm.transition(JobState::Running).unwrap();
        sm.transition(JobState::Success).unwrap();
        assert!(sm.state().is_terminal());
    }

    #[test]
    fn test_state_machine_rejects_backward() {
        let mut sm = JobStateMachine::new();
        sm.transition(JobState::Running).unwrap();
        sm.transition(JobState::Failed).unwrap();
        let err = sm.transition(JobState::Running).unwrap_err();
        assert_eq!(err.from, JobState::Failed);
    }

    #[test]
    fn test_state_machine_skip_from_queued() {
        let mut sm = JobStateMachine::new();
        sm.transition(JobState::Skipped).unwrap();
        assert_eq!(sm.state(), JobState::Skipped);
    }

    #[test]
    fn test_state_machine_cancel_from_queued() {
        let mut sm = JobStateMachine::new();
        sm.transition(JobState::Cancelled).unwrap();
        assert!(sm.transition(JobState::Running).is_err());
    }

    #[test]
    fn test_state_machine_no_success_from_queued() {
        let mut sm = JobStateMachine::new();
        assert!(sm.transition(JobState::Success).is_err());
    }

    #[test]
    fn test_stage_percent_monotonic() {
        let stages = [
            Stage::Analyzing,
            Stage::Decoding,
            Stage::Transforming,
            Stage::Encoding,
            Stage::Writing,
            Stage::Verifying,
            Stage::Cleaning,
        ];
        for pair in stages.windows(2) {
            assert!(
                pair[0].percent() < pair[1].percent(),
                "{:?} -> {:?} must increase",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_normalized_target() {
        assert_eq!(normalized_target(ImageKind::Tiff), ImageKind::Jpeg);
        assert_eq!(normalized_target(ImageKind::Png), ImageKind::Png);
    }

    fn job_for(input: &Path, root: &Path, mode: RunMode, settings: EffectiveSettings) -> FileJob {
        FileJob {
            id: 1,
            input: input.to_path_buf(),
            common_root: root.to_path_buf(),
            backup_dir: None,
            mode,
            settings: Arc::new(settings.normalized()),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn collect_events() -> (Arc<Mutex<Vec<JobEvent>>>, impl Fn(JobEvent) + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |e| sink.lock().unwrap().push(e))
    }

    #[test]
    fn test_unsupported_extension_skips() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("clip.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let job = job_for(&input, dir.path(), RunMode::Optimize, EffectiveSettings::default());
        let (events, emit) = collect_events();
        let outcome = job.execute(&CancelToken::new(), &emit);

        assert_eq!(outcome.state, JobState::Skipped);
        assert_eq!(outcome.result.skip_reason, Some(SkipReason::Unsupported));
        let events = events.lock().unwrap();
        assert_eq!(events.last().unwrap().status, JobState::Skipped);
    }

    #[test]
    fn test_tiff_replace_mode_skips() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("scan.tiff");
        std::fs::write(&input, b"II*\0").unwrap();

        let mut settings = EffectiveSettings::default();
        settings.output_mode = OutputMode::Replace;
        let job = job_for(&input, dir.path(), RunMode::Optimize, settings);
        let (_events, emit) = collect_events();
        let outcome = job.execute(&CancelToken::new(), &emit);

        assert_eq!(outcome.state, JobState::Skipped);
        assert_eq!(outcome.result.skip_reason, Some(SkipReason::ReplaceTiff));
    }

    #[test]
    fn test_corrupt_input_fails_with_decode_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("broken.jpg");
        std::fs::write(&input, b"definitely not a jpeg").unwrap();

        let job = job_for(&input, dir.path(), RunMode::Optimize, EffectiveSettings::default());
        let (_events, emit) = collect_events();
        let outcome = job.execute(&CancelToken::new(), &emit);

        assert_eq!(outcome.state, JobState::Failed);
        let error = outcome.result.error.unwrap();
        assert_eq!(error.code, crate::errors::ErrorCode::Decode);
    }

    #[test]
    fn test_cancel_before_start_synthesizes_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("photo.jpg");
        std::fs::write(&input, b"x").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let job = job_for(&input, dir.path(), RunMode::Optimize, EffectiveSettings::default());
        let (events, emit) = collect_events();
        let outcome = job.execute(&cancel, &emit);

        assert_eq!(outcome.state, JobState::Cancelled);
        // No stage events before the terminal one.
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, JobState::Cancelled);
        // No partial outputs anywhere.
        assert!(!dir.path().join(crate::paths::OPTIMIZED_DIR_NAME).exists());
    }

    #[test]
    fn test_webp_replace_without_confirmation_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("photo.png");
        // A real decodable PNG so the pipeline reaches the encoding gate.
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            16,
            16,
            image::Rgb([1, 2, 3]),
        ));
        img.save_with_format(&input, image::ImageFormat::Png).unwrap();

        let mut settings = EffectiveSettings::default();
        settings.output_mode = OutputMode::Replace;
        settings.confirm_dangerous_replace = false;
        let job = job_for(&input, dir.path(), RunMode::ConvertWebp, settings);
        let (_events, emit) = collect_events();
        let outcome = job.execute(&CancelToken::new(), &emit);

        assert_eq!(outcome.state, JobState::Failed);
        let error = outcome.result.error.unwrap();
        assert_eq!(error.code, crate::errors::ErrorCode::Unsupported);
    }

    #[test]
    fn test_progress_events_are_monotonic() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("broken.jpg");
        std::fs::write(&input, b"garbage").unwrap();

        let job = job_for(&input, dir.path(), RunMode::Optimize, EffectiveSettings::default());
        let (events, emit) = collect_events();
        let _ = job.execute(&CancelToken::new(), &emit);

        let events = events.lock().unwrap();
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| e.progress.map(|p| p.percent))
            .collect();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }
}
