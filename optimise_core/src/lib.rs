//! Batch image optimization engine.
//!
//! This crate provides the pipeline and execution machinery behind the
//! optimise tool:
//! - Per-file multi-candidate encode/select pipeline (ladder and smart
//!   binary-search strategies, SSIM-guarded)
//! - Multi-scale SSIM metric engine with a banding-risk veto
//! - External encoder runners (cjpeg, pngquant, oxipng, cwebp)
//! - Atomic, non-destructive output writing with backup capture
//! - Parallel worker pool and run coordination with restore support
//! - Folder-watch ingestion with stability gating and a processed index

pub mod analyzer;
pub mod api;
pub mod candidates;
pub mod common;
pub mod coordinator;
pub mod errors;
pub mod index;
pub mod job;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod paths;
pub mod pool;
pub mod progress;
pub mod responsive;
pub mod settings;
pub mod state;
pub mod tools;
pub mod types;
pub mod watcher;
pub mod writer;

pub use analyzer::{analyze_content, decode_image, ContentFeatures, ImageInfo, ImageKind};
pub use api::{Engine, PreviewResult, ScanEntry};
pub use candidates::{Candidate, Selection};
pub use coordinator::{check_dangerous_directory, resolve_inputs, RunCoordinator};
pub use errors::{ErrorCode, ErrorInfo, OptimiseError, SkipReason};
pub use index::{fingerprint, Fingerprint, ProcessedIndex};
pub use job::{FileJob, JobEvent, JobProgress, JobResultData, JobState, Stage};
pub use logging::{init_logging, LogConfig};
pub use metrics::{compare_buffers, compare_frames, MetricResult};
pub use pool::{default_workers, CancelToken, WorkerPool};
pub use progress::{EngineEvent, ProgressBus, SubscriptionToken};
pub use settings::{
    Concurrency, EffectiveSettings, ExportPreset, MetadataPreset, MetadataSettings, OutputMode,
    ResponsiveSettings, RunMode, RunRequest, SmartTarget, SpeedPreset,
};
pub use state::{
    can_restore_last_run, restore_last_run, LastRunState, RestoreReport, RunLog, RunSummary,
};
pub use types::{Quality, Ssim};
pub use watcher::{GlobalWatchSettings, WatchConfig, WatchEvent, WatchService, WatchedFolder};
pub use writer::{write_atomic, BackupRecord, WriteRequest, MIN_OUTPUT_SIZE};
