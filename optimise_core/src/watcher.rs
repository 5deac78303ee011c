//! Folder-watch ingestion.
//!
//! A polling scanner thread snapshots each enabled folder and turns
//! filesystem deltas into add/change events. Each event passes the
//! ignore rules, a per-path de-duplicator, the stability gate (a file
//! still being copied keeps changing size), the size cap, and the
//! processed-index check before the standard pipeline runs. Transient
//! failures requeue with linear backoff before being reported failed.

use crate::common::{self, is_junk_file, is_supported_input};
use crate::errors::{ErrorInfo, OptimiseError, SkipReason};
use crate::index::{fingerprint, ProcessedIndex, INDEX_FILE};
use crate::job::{FileJob, JobState};
use crate::pool::{CancelToken, WorkerPool};
use crate::progress::{EngineEvent, ProgressBus};
use crate::settings::{EffectiveSettings, RunMode};
use crate::writer::write_file_atomic;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

pub const WATCH_CONFIG_FILE: &str = "watch-config.json";

const SCAN_INTERVAL: Duration = Duration::from_secs(1);
const WATCH_WORKERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerBehavior {
    /// Only newly appearing files are dispatched.
    Added,
    /// Modifications to known files are dispatched too.
    Modified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedFolder {
    pub path: PathBuf,
    pub enabled: bool,
    /// Per-folder override; None uses the global settings.
    pub settings: Option<EffectiveSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalWatchSettings {
    pub settings: EffectiveSettings,
    pub mode: RunMode,
    pub trigger_behavior: TriggerBehavior,
    pub max_file_size_mb: u64,
}

impl Default for GlobalWatchSettings {
    fn default() -> Self {
        Self {
            settings: EffectiveSettings::default(),
            mode: RunMode::Optimize,
            trigger_behavior: TriggerBehavior::Added,
            max_file_size_mb: 512,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    pub folders: Vec<WatchedFolder>,
    pub global: GlobalWatchSettings,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Detected {
        path: PathBuf,
    },
    Skipped {
        path: PathBuf,
        reason: SkipReason,
    },
    Completed {
        path: PathBuf,
        output_path: Option<PathBuf>,
        bytes_saved: u64,
    },
    Failed {
        path: PathBuf,
        error: ErrorInfo,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StabilityConfig {
    pub probe_interval: Duration,
    pub required_stable: u32,
    pub timeout: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(500),
            required_stable: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StabilityError {
    Timeout,
    Vanished,
}

/// Poll `(size, mtime)` until it holds still for the required number of
/// consecutive readings.
pub fn wait_for_stability(path: &Path, config: &StabilityConfig) -> Result<(), StabilityError> {
    let deadline = Instant::now() + config.timeout;
    let mut previous: Option<(u64, Option<std::time::SystemTime>)> = None;
    let mut streak = 0u32;

    loop {
        let Ok(meta) = std::fs::metadata(path) else {
            return Err(StabilityError::Vanished);
        };
        let reading = (meta.len(), meta.modified().ok());

        if previous == Some(reading) {
            streak += 1;
        } else {
            streak = 1;
            previous = Some(reading);
        }

        if streak >= config.required_stable {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StabilityError::Timeout);
        }
        std::thread::sleep(config.probe_interval);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            max_attempts: 2,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: base × attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Is this path eligible for watch dispatch at all?
pub fn accepts_path(path: &Path) -> bool {
    is_supported_input(path) && !is_junk_file(path) && !common::is_inside_ignored_dir(path)
}

pub struct WatchService {
    app_dir: PathBuf,
    config: Arc<Mutex<WatchConfig>>,
    index: Arc<ProcessedIndex>,
    bus: Arc<ProgressBus>,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
    stop: Arc<AtomicBool>,
    cancel: CancelToken,
    stability: StabilityConfig,
    retry: RetryPolicy,
    pool: Arc<WorkerPool>,
    scanner: Option<std::thread::JoinHandle<()>>,
}

impl WatchService {
    pub fn new(app_dir: PathBuf, bus: Arc<ProgressBus>) -> Self {
        let config = load_config(&app_dir);
        let index = Arc::new(ProcessedIndex::load(app_dir.join(INDEX_FILE)));
        Self {
            app_dir,
            config: Arc::new(Mutex::new(config)),
            index,
            bus,
            pending: Arc::new(Mutex::new(HashSet::new())),
            stop: Arc::new(AtomicBool::new(false)),
            cancel: CancelToken::new(),
            stability: StabilityConfig::default(),
            retry: RetryPolicy::default(),
            pool: Arc::new(WorkerPool::new(WATCH_WORKERS)),
            scanner: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_timings(mut self, stability: StabilityConfig, retry: RetryPolicy) -> Self {
        self.stability = stability;
        self.retry = retry;
        self
    }

    /// Start the polling scanner. Files already present when the
    /// scanner starts form the baseline and are not dispatched.
    pub fn start(&mut self) {
        if self.scanner.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let config = Arc::clone(&self.config);
        let stop = Arc::clone(&self.stop);
        let dispatcher = self.dispatcher();

        let scanner = std::thread::Builder::new()
            .name("optimise-watch-scanner".into())
            .spawn(move || {
                let mut snapshots: HashMap<PathBuf, (u64, i64)> = HashMap::new();
                let mut baseline_done: HashSet<PathBuf> = HashSet::new();

                while !stop.load(Ordering::SeqCst) {
                    let folders: Vec<WatchedFolder> = {
                        let config = config.lock().unwrap_or_else(|e| e.into_inner());
                        config.folders.iter().filter(|f| f.enabled).cloned().collect()
                    };
                    let trigger = {
                        let config = config.lock().unwrap_or_else(|e| e.into_inner());
                        config.global.trigger_behavior
                    };

                    for folder in &folders {
                        let first_scan = !baseline_done.contains(&folder.path);
                        scan_folder(
                            folder,
                            trigger,
                            first_scan,
                            &mut snapshots,
                            &dispatcher,
                        );
                        baseline_done.insert(folder.path.clone());
                    }

                    std::thread::sleep(SCAN_INTERVAL);
                }
            })
            .ok();

        self.scanner = scanner;
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(handle) = self.scanner.take() {
            let _ = handle.join();
        }
        let _ = self.index.flush_now();
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            config: Arc::clone(&self.config),
            index: Arc::clone(&self.index),
            bus: Arc::clone(&self.bus),
            pending: Arc::clone(&self.pending),
            cancel: self.cancel.clone(),
            stability: self.stability,
            retry: self.retry,
            pool: Arc::clone(&self.pool),
        }
    }

    /// Feed one path through the full gate chain synchronously. The
    /// scanner uses the pooled variant; this is the direct entry used
    /// by tests and by callers that already have an event in hand.
    pub fn process_path(&self, path: &Path) {
        self.dispatcher().process(path.to_path_buf());
    }

    // -- watch-folder CRUD ----------------------------------------------

    pub fn add_folder(&self, path: PathBuf) -> Result<(), OptimiseError> {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        if config.folders.iter().any(|f| f.path == path) {
            return Ok(());
        }
        config.folders.push(WatchedFolder {
            path,
            enabled: true,
            settings: None,
        });
        persist_config(&self.app_dir, &config)
    }

    pub fn remove_folder(&self, path: &Path) -> Result<(), OptimiseError> {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.folders.retain(|f| f.path != path);
        persist_config(&self.app_dir, &config)
    }

    pub fn list_folders(&self) -> Vec<WatchedFolder> {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .folders
            .clone()
    }

    pub fn toggle_folder(&self, path: &Path, enabled: bool) -> Result<(), OptimiseError> {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        for folder in &mut config.folders {
            if folder.path == path {
                folder.enabled = enabled;
            }
        }
        persist_config(&self.app_dir, &config)
    }

    pub fn update_folder_settings(
        &self,
        path: &Path,
        settings: Option<EffectiveSettings>,
    ) -> Result<(), OptimiseError> {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        for folder in &mut config.folders {
            if folder.path == path {
                folder.settings = settings.clone().map(EffectiveSettings::normalized);
            }
        }
        persist_config(&self.app_dir, &config)
    }

    pub fn global_settings(&self) -> GlobalWatchSettings {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .global
            .clone()
    }

    pub fn update_global_settings(
        &self,
        global: GlobalWatchSettings,
    ) -> Result<(), OptimiseError> {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.global = GlobalWatchSettings {
            settings: global.settings.clone().normalized(),
            ..global
        };
        persist_config(&self.app_dir, &config)
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

fn load_config(app_dir: &Path) -> WatchConfig {
    let path = app_dir.join(WATCH_CONFIG_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "watch config unreadable, starting fresh");
            WatchConfig::default()
        }),
        Err(_) => WatchConfig::default(),
    }
}

fn persist_config(app_dir: &Path, config: &WatchConfig) -> Result<(), OptimiseError> {
    let json = serde_json::to_vec_pretty(config).map_err(|e| anyhow::anyhow!(e))?;
    write_file_atomic(&app_dir.join(WATCH_CONFIG_FILE), &json)
}

fn scan_folder(
    folder: &WatchedFolder,
    trigger: TriggerBehavior,
    first_scan: bool,
    snapshots: &mut HashMap<PathBuf, (u64, i64)>,
    dispatcher: &Dispatcher,
) {
    for entry in WalkDir::new(&folder.path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !accepts_path(path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let reading = (meta.len(), mtime);

        match snapshots.get(path) {
            None => {
                snapshots.insert(path.to_path_buf(), reading);
                // Pre-existing files are baseline, not events.
                if !first_scan {
                    dispatcher.spawn(path.to_path_buf());
                }
            }
            Some(&prev) if prev != reading => {
                snapshots.insert(path.to_path_buf(), reading);
                if trigger == TriggerBehavior::Modified {
                    dispatcher.spawn(path.to_path_buf());
                }
            }
            Some(_) => {}
        }
    }
}

/// Shared state an event needs to travel the gate chain.
#[derive(Clone)]
struct Dispatcher {
    config: Arc<Mutex<WatchConfig>>,
    index: Arc<ProcessedIndex>,
    bus: Arc<ProgressBus>,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
    cancel: CancelToken,
    stability: StabilityConfig,
    retry: RetryPolicy,
    pool: Arc<WorkerPool>,
}

impl Dispatcher {
    fn spawn(&self, path: PathBuf) {
        let this = self.clone();
        let _ = self.pool.submit(move || this.process(path));
    }

    fn process(&self, path: PathBuf) {
        // Per-path de-dup across pending and in-flight events.
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.insert(path.clone()) {
                return;
            }
        }
        self.bus
            .emit(EngineEvent::Watch(WatchEvent::Detected { path: path.clone() }));

        let outcome = self.run_gates(&path);
        if let Some(event) = outcome {
            self.bus.emit(EngineEvent::Watch(event));
        }

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);
    }

    fn run_gates(&self, path: &Path) -> Option<WatchEvent> {
        match wait_for_stability(path, &self.stability) {
            Ok(()) => {}
            Err(StabilityError::Vanished) => return None,
            Err(StabilityError::Timeout) => {
                tracing::warn!(path = %path.display(), "stability gate timed out");
                return Some(WatchEvent::Failed {
                    path: path.to_path_buf(),
                    error: ErrorInfo {
                        code: crate::errors::ErrorCode::Unknown,
                        message: "file never stabilized".into(),
                    },
                });
            }
        }

        let (mode, settings, max_mb, folder_root) = self.effective_for(path);

        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if size > max_mb.saturating_mul(1024 * 1024) {
            return Some(WatchEvent::Skipped {
                path: path.to_path_buf(),
                reason: SkipReason::TooLarge,
            });
        }

        let fp = match fingerprint(path) {
            Ok(fp) => fp,
            Err(_) => return None,
        };
        if self.index.is_processed(path, &fp) {
            return Some(WatchEvent::Skipped {
                path: path.to_path_buf(),
                reason: SkipReason::AlreadyProcessed,
            });
        }

        let mut attempt = 0u32;
        loop {
            let outcome = self.run_pipeline(path, mode, &settings, &folder_root);
            match outcome {
                PipelineOutcome::Success {
                    output_path,
                    bytes_saved,
                } => {
                    // Processed means "this exact content was handled";
                    // re-fingerprint in case the pipeline replaced the
                    // file in place.
                    let final_fp = fingerprint(path).ok().unwrap_or(fp);
                    self.index.mark_processed(path, final_fp);
                    return Some(WatchEvent::Completed {
                        path: path.to_path_buf(),
                        output_path,
                        bytes_saved,
                    });
                }
                PipelineOutcome::Skipped(reason) => {
                    self.index.mark_processed(path, fp);
                    return Some(WatchEvent::Skipped {
                        path: path.to_path_buf(),
                        reason,
                    });
                }
                PipelineOutcome::Cancelled => return None,
                PipelineOutcome::Failed { error, retryable } => {
                    attempt += 1;
                    if retryable && attempt <= self.retry.max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        tracing::info!(
                            path = %path.display(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, requeueing"
                        );
                        std::thread::sleep(delay);
                        continue;
                    }
                    return Some(WatchEvent::Failed {
                        path: path.to_path_buf(),
                        error,
                    });
                }
            }
        }
    }

    fn effective_for(&self, path: &Path) -> (RunMode, Arc<EffectiveSettings>, u64, PathBuf) {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        let folder = config
            .folders
            .iter()
            .filter(|f| path.starts_with(&f.path))
            .max_by_key(|f| f.path.components().count());
        let settings = folder
            .and_then(|f| f.settings.clone())
            .unwrap_or_else(|| config.global.settings.clone());
        let root = folder
            .map(|f| f.path.clone())
            .unwrap_or_else(|| path.parent().map(Path::to_path_buf).unwrap_or_default());
        (
            config.global.mode,
            Arc::new(settings.normalized()),
            config.global.max_file_size_mb,
            root,
        )
    }

    fn run_pipeline(
        &self,
        path: &Path,
        mode: RunMode,
        settings: &Arc<EffectiveSettings>,
        folder_root: &Path,
    ) -> PipelineOutcome {
        let backup_dir = if settings.output_mode == crate::settings::OutputMode::Replace {
            let dir = folder_root
                .join(crate::state::BACKUP_DIR_NAME)
                .join("watch");
            if std::fs::create_dir_all(&dir).is_err() {
                return PipelineOutcome::Failed {
                    error: ErrorInfo {
                        code: crate::errors::ErrorCode::Write,
                        message: "backup directory creation failed".into(),
                    },
                    retryable: true,
                };
            }
            Some(dir)
        } else {
            None
        };

        let job = FileJob {
            id: 0,
            input: path.to_path_buf(),
            common_root: folder_root.to_path_buf(),
            backup_dir,
            mode,
            settings: Arc::clone(settings),
            claims: Arc::new(Mutex::new(HashSet::new())),
        };

        let bus = Arc::clone(&self.bus);
        let outcome = job.execute(&self.cancel, &move |event| {
            bus.emit(EngineEvent::Job(event));
        });

        match outcome.state {
            JobState::Success => PipelineOutcome::Success {
                output_path: outcome.result.output_path,
                bytes_saved: outcome.result.bytes_saved,
            },
            JobState::Skipped => PipelineOutcome::Skipped(
                outcome
                    .result
                    .skip_reason
                    .unwrap_or(SkipReason::NoCandidate),
            ),
            JobState::Cancelled => PipelineOutcome::Cancelled,
            _ => {
                let error = outcome.result.error.unwrap_or(ErrorInfo {
                    code: crate::errors::ErrorCode::Unknown,
                    message: "job failed without detail".into(),
                });
                let retryable = matches!(
                    error.code,
                    crate::errors::ErrorCode::Unknown | crate::errors::ErrorCode::Locked
                );
                PipelineOutcome::Failed { error, retryable }
            }
        }
    }
}

enum PipelineOutcome {
    Success {
        output_path: Option<PathBuf>,
        bytes_saved: u64,
    },
    Skipped(SkipReason),
    Cancelled,
    Failed {
        error: ErrorInfo,
        retryable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_stability() -> StabilityConfig {
        StabilityConfig {
            probe_interval: Duration::from_millis(10),
            required_stable: 3,
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_accepts_path_rules() {
        assert!(accepts_path(Path::new("/w/photo.jpg")));
        assert!(!accepts_path(Path::new("/w/notes.txt")));
        assert!(!accepts_path(Path::new("/w/.hidden.jpg")));
        assert!(!accepts_path(Path::new("/w/photo.jpg.part")));
        assert!(!accepts_path(Path::new("/w/photo.jpg.crdownload")));
        assert!(!accepts_path(Path::new("/w/Optimized/photo.jpg")));
        assert!(!accepts_path(Path::new("/w/~photo.jpg")));
    }

    #[test]
    fn test_stability_gate_waits_for_quiet_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("copy.jpg");
        std::fs::write(&path, b"start").unwrap();

        // Writer thread grows the file for a while.
        let grow_path = path.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..5 {
                std::thread::sleep(Duration::from_millis(15));
                std::fs::write(&grow_path, vec![0u8; 100 * (i + 1)]).unwrap();
            }
        });

        let config = StabilityConfig {
            probe_interval: Duration::from_millis(10),
            required_stable: 3,
            timeout: Duration::from_secs(5),
        };
        let started = Instant::now();
        wait_for_stability(&path, &config).unwrap();
        writer.join().unwrap();

        // The gate cannot have passed before the writer stopped
        // touching the file.
        assert!(started.elapsed() >= Duration::from_millis(70));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 500);
    }

    #[test]
    fn test_stability_gate_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("busy.jpg");
        std::fs::write(&path, b"x").unwrap();

        let grow_path = path.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let writer = std::thread::spawn(move || {
            let mut n = 0usize;
            while !stop_flag.load(Ordering::SeqCst) {
                n += 1;
                let _ = std::fs::write(&grow_path, vec![0u8; n % 97 + 1]);
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let config = StabilityConfig {
            probe_interval: Duration::from_millis(10),
            required_stable: 3,
            timeout: Duration::from_millis(150),
        };
        let result = wait_for_stability(&path, &config);
        stop.store(true, Ordering::SeqCst);
        writer.join().unwrap();
        assert_eq!(result, Err(StabilityError::Timeout));
    }

    #[test]
    fn test_stability_gate_vanished_file() {
        let result = wait_for_stability(Path::new("/nope/missing.jpg"), &fast_stability());
        assert_eq!(result, Err(StabilityError::Vanished));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(2), Duration::from_secs(6));
        assert_eq!(policy.max_attempts, 2);
    }

    #[test]
    fn test_config_crud_persists() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(ProgressBus::new());
        let service = WatchService::new(dir.path().to_path_buf(), bus);

        let folder = dir.path().join("watched");
        service.add_folder(folder.clone()).unwrap();
        // Adding twice is idempotent.
        service.add_folder(folder.clone()).unwrap();
        assert_eq!(service.list_folders().len(), 1);
        assert!(service.list_folders()[0].enabled);

        service.toggle_folder(&folder, false).unwrap();
        assert!(!service.list_folders()[0].enabled);

        // A fresh service reloads the persisted config.
        let bus2 = Arc::new(ProgressBus::new());
        let service2 = WatchService::new(dir.path().to_path_buf(), bus2);
        assert_eq!(service2.list_folders().len(), 1);
        assert!(!service2.list_folders()[0].enabled);

        service2.remove_folder(&folder).unwrap();
        assert!(service2.list_folders().is_empty());
    }

    #[test]
    fn test_global_settings_roundtrip() {
        let dir = TempDir::new().unwrap();
        let service = WatchService::new(dir.path().to_path_buf(), Arc::new(ProgressBus::new()));
        let mut global = service.global_settings();
        assert_eq!(global.trigger_behavior, TriggerBehavior::Added);

        global.trigger_behavior = TriggerBehavior::Modified;
        global.max_file_size_mb = 64;
        service.update_global_settings(global).unwrap();

        let service2 = WatchService::new(dir.path().to_path_buf(), Arc::new(ProgressBus::new()));
        let reloaded = service2.global_settings();
        assert_eq!(reloaded.trigger_behavior, TriggerBehavior::Modified);
        assert_eq!(reloaded.max_file_size_mb, 64);
    }

    #[test]
    fn test_process_path_emits_failed_for_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        let watched = dir.path().join("watched");
        std::fs::create_dir_all(&watched).unwrap();

        let bus = Arc::new(ProgressBus::new());
        let (_token, rx) = bus.subscribe();
        let service = WatchService::new(app, Arc::clone(&bus)).with_timings(
            fast_stability(),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_attempts: 2,
            },
        );
        service.add_folder(watched.clone()).unwrap();

        let file = watched.join("broken.jpg");
        std::fs::write(&file, b"not a jpeg").unwrap();
        service.process_path(&file);

        let mut saw_detected = false;
        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::Watch(WatchEvent::Detected { path }) => {
                    saw_detected = path == file;
                }
                EngineEvent::Watch(WatchEvent::Failed { path, error }) => {
                    saw_failed = path == file;
                    assert_eq!(error.code, crate::errors::ErrorCode::Decode);
                }
                _ => {}
            }
        }
        assert!(saw_detected && saw_failed);
    }

    #[test]
    fn test_replaying_skip_marks_index() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        let watched = dir.path().join("watched");
        std::fs::create_dir_all(&watched).unwrap();

        let bus = Arc::new(ProgressBus::new());
        let (_token, rx) = bus.subscribe();
        let service = WatchService::new(app, Arc::clone(&bus))
            .with_timings(fast_stability(), RetryPolicy::default());
        service.add_folder(watched.clone()).unwrap();

        // Unsupported-but-matching extension cannot happen (gate checks
        // extension first); use a tiny corrupt png that the job skips?
        // A decode failure is a fail, so exercise idempotence with the
        // skip path instead: a real png whose job skips because no
        // encoder exists would depend on tools. Mark directly.
        let file = watched.join("done.png");
        std::fs::write(&file, b"some png bytes").unwrap();
        let fp = fingerprint(&file).unwrap();
        service.index.mark_processed(&file, fp);

        service.process_path(&file);
        let mut saw_already = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Watch(WatchEvent::Skipped { reason, .. }) = event {
                saw_already = reason == SkipReason::AlreadyProcessed;
            }
        }
        assert!(saw_already, "unchanged fingerprint must short-circuit");
    }

    #[test]
    fn test_size_cap_skips() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        let watched = dir.path().join("watched");
        std::fs::create_dir_all(&watched).unwrap();

        let bus = Arc::new(ProgressBus::new());
        let (_token, rx) = bus.subscribe();
        let service = WatchService::new(app, Arc::clone(&bus))
            .with_timings(fast_stability(), RetryPolicy::default());
        service.add_folder(watched.clone()).unwrap();
        let mut global = service.global_settings();
        global.max_file_size_mb = 0;
        service.update_global_settings(global).unwrap();

        let file = watched.join("huge.jpg");
        std::fs::write(&file, vec![0u8; 4096]).unwrap();
        service.process_path(&file);

        let mut saw_too_large = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Watch(WatchEvent::Skipped { reason, .. }) = event {
                saw_too_large = reason == SkipReason::TooLarge;
            }
        }
        assert!(saw_too_large);
    }
}
