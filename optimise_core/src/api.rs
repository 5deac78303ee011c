//! Engine facade: the operation surface collaborators (CLI, shells,
//! watch UIs) talk to.

use crate::analyzer::{self, ImageKind};
use crate::candidates::{self, CandidateContext, Selection};
use crate::common;
use crate::coordinator::{resolve_inputs, RunCoordinator};
use crate::errors::OptimiseError;
use crate::job::normalized_target;
use crate::metadata;
use crate::progress::{EngineEvent, ProgressBus, SubscriptionToken};
use crate::settings::{EffectiveSettings, RunRequest};
use crate::state::{self, RestoreReport, RunSummary};
use crate::watcher::{GlobalWatchSettings, WatchService, WatchedFolder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub ext: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PreviewResult {
    pub buffer: Vec<u8>,
    pub size: u64,
    pub quality_label: String,
    pub ssim: Option<f64>,
}

pub struct Engine {
    app_dir: PathBuf,
    bus: Arc<ProgressBus>,
    coordinator: Arc<RunCoordinator>,
    watch: Mutex<WatchService>,
}

impl Engine {
    pub fn new(app_dir: PathBuf) -> Result<Self, OptimiseError> {
        std::fs::create_dir_all(&app_dir).map_err(|e| OptimiseError::from_io(&app_dir, e))?;
        let bus = Arc::new(ProgressBus::new());
        let coordinator = Arc::new(RunCoordinator::new(app_dir.clone(), Arc::clone(&bus)));
        let watch = Mutex::new(WatchService::new(app_dir.clone(), Arc::clone(&bus)));
        Ok(Self {
            app_dir,
            bus,
            coordinator,
            watch,
        })
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn subscribe(&self) -> (SubscriptionToken, Receiver<EngineEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.bus.unsubscribe(token)
    }

    /// Start a run in the background; progress arrives on the bus.
    pub fn start_run(&self, request: RunRequest) -> Result<String, OptimiseError> {
        self.coordinator.start_run(request)
    }

    /// Run to completion on the calling thread.
    pub fn run_blocking(&self, request: RunRequest) -> Result<RunSummary, OptimiseError> {
        self.coordinator.run_blocking(request)
    }

    pub fn cancel_run(&self, run_id: &str) {
        self.coordinator.cancel_run(run_id)
    }

    pub fn restore_last_run(&self) -> RestoreReport {
        state::restore_last_run(&self.app_dir)
    }

    pub fn can_restore_last_run(&self) -> bool {
        state::can_restore_last_run(&self.app_dir)
    }

    /// Resolve paths and report basic facts about each input.
    pub fn scan_paths(&self, paths: &[PathBuf]) -> Vec<ScanEntry> {
        resolve_inputs(paths)
            .into_iter()
            .filter(|p| common::is_supported_input(p))
            .filter_map(|path| {
                let meta = std::fs::metadata(&path).ok()?;
                let dims = analyzer::probe_dimensions(&path);
                Some(ScanEntry {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    ext: common::extension_lowercase(&path).unwrap_or_default(),
                    size: meta.len(),
                    width: dims.map(|d| d.0),
                    height: dims.map(|d| d.1),
                    path,
                })
            })
            .collect()
    }

    /// Smart-mode encode of a single file for UI preview; nothing is
    /// written.
    pub fn preview(
        &self,
        path: &Path,
        settings: &EffectiveSettings,
    ) -> Result<PreviewResult, OptimiseError> {
        let settings = settings.clone().normalized();
        let bytes = std::fs::read(path).map_err(|e| OptimiseError::from_io(path, e))?;
        let (image, info) = analyzer::decode_image(path, &bytes)?;
        let features = analyzer::analyze_content(&image);
        let (processed, report) = metadata::prepare(image, path, &settings.metadata);

        let workdir = tempfile::TempDir::new().map_err(OptimiseError::Io)?;
        let scratch_png = workdir.path().join("source.png");
        processed
            .save_with_format(&scratch_png, image::ImageFormat::Png)
            .map_err(|e| OptimiseError::Encode {
                tool: "png".into(),
                exit_code: None,
                detail: e.to_string(),
            })?;

        let ctx = CandidateContext {
            image: &processed,
            scratch_png: &scratch_png,
            original_size: bytes.len() as u64,
            features: &features,
            settings: &settings,
            workdir: workdir.path(),
            keep_metadata: report.exif_kept || report.xmp_kept || report.iptc_kept,
        };

        let target = normalized_target(info.kind);
        let candidate = match target {
            ImageKind::Jpeg | ImageKind::Webp => candidates::smart_search(&ctx, target)?,
            _ => {
                let list = candidates::build_ladder(&ctx, target)?;
                match candidates::select_smallest(list, ctx.original_size, true) {
                    Selection::Selected(c) => Some(c),
                    _ => None,
                }
            }
        };

        let candidate = candidate.ok_or_else(|| OptimiseError::Encode {
            tool: "preview".into(),
            exit_code: None,
            detail: "no candidate met the target threshold".into(),
        })?;

        Ok(PreviewResult {
            size: candidate.size(),
            quality_label: candidate.quality_label.clone(),
            ssim: candidate.ssim.map(|s| s.value()),
            buffer: candidate.bytes,
        })
    }

    // -- watch surface --------------------------------------------------

    pub fn watch_start(&self) {
        self.watch.lock().unwrap_or_else(|e| e.into_inner()).start()
    }

    pub fn watch_shutdown(&self) {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown()
    }

    pub fn watch_add_folder(&self, path: PathBuf) -> Result<(), OptimiseError> {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_folder(path)
    }

    pub fn watch_remove_folder(&self, path: &Path) -> Result<(), OptimiseError> {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove_folder(path)
    }

    pub fn watch_list(&self) -> Vec<WatchedFolder> {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .list_folders()
    }

    pub fn watch_toggle(&self, path: &Path, enabled: bool) -> Result<(), OptimiseError> {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .toggle_folder(path, enabled)
    }

    pub fn watch_update_settings(
        &self,
        path: &Path,
        settings: Option<EffectiveSettings>,
    ) -> Result<(), OptimiseError> {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_folder_settings(path, settings)
    }

    pub fn get_global_watch_settings(&self) -> GlobalWatchSettings {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .global_settings()
    }

    pub fn update_global_watch_settings(
        &self,
        global: GlobalWatchSettings,
    ) -> Result<(), OptimiseError> {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_global_settings(global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RunMode;
    use tempfile::TempDir;

    #[test]
    fn test_engine_scan_paths() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("app");
        let engine = Engine::new(app).unwrap();

        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            20,
            10,
            image::Rgb([9, 9, 9]),
        ));
        let photo = dir.path().join("photo.png");
        img.save_with_format(&photo, image::ImageFormat::Png).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let entries = engine.scan_paths(&[dir.path().to_path_buf()]);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.name, "photo.png");
        assert_eq!(entry.ext, "png");
        assert_eq!(entry.width, Some(20));
        assert_eq!(entry.height, Some(10));
        assert!(entry.size > 0);
    }

    #[test]
    fn test_engine_run_and_restore_cycle() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(dir.path().join("app")).unwrap();
        assert!(!engine.can_restore_last_run());

        let report = engine.restore_last_run();
        assert_eq!(report.restored_count, 0);

        // An empty run still completes with a summary.
        let summary = engine
            .run_blocking(RunRequest {
                paths: vec![],
                mode: RunMode::Optimize,
                settings: EffectiveSettings::default(),
            })
            .unwrap();
        assert_eq!(summary.total_files, 0);
    }

    #[test]
    fn test_engine_preview_decode_error() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(dir.path().join("app")).unwrap();
        let broken = dir.path().join("x.jpg");
        std::fs::write(&broken, b"nope").unwrap();
        let err = engine
            .preview(&broken, &EffectiveSettings::default())
            .unwrap_err();
        assert!(matches!(err, OptimiseError::Decode { .. }));
    }

    #[test]
    fn test_engine_watch_surface() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(dir.path().join("app")).unwrap();
        let folder = dir.path().join("inbox");
        engine.watch_add_folder(folder.clone()).unwrap();
        assert_eq!(engine.watch_list().len(), 1);
        engine.watch_toggle(&folder, false).unwrap();
        assert!(!engine.watch_list()[0].enabled);

        let mut global = engine.get_global_watch_settings();
        global.max_file_size_mb = 42;
        engine.update_global_watch_settings(global).unwrap();
        assert_eq!(engine.get_global_watch_settings().max_file_size_mb, 42);

        engine.watch_remove_folder(&folder).unwrap();
        assert!(engine.watch_list().is_empty());
    }
}
