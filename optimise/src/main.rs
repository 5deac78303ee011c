use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use optimise_core::{
    common, init_logging, Concurrency, EffectiveSettings, Engine, EngineEvent, ExportPreset,
    JobState, LogConfig, OutputMode, Quality, RunMode, RunRequest, RunSummary, SmartTarget,
    SpeedPreset, WatchEvent,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "optimise")]
#[command(version, about = "Batch image optimizer with SSIM-guarded quality search", long_about = None)]
struct Cli {
    /// Application data directory (last-run state, watch config,
    /// processed index). Defaults to a per-user location.
    #[arg(long, global = true)]
    app_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize images or convert them to WebP
    Run {
        /// Input files or directories
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<PathBuf>,

        /// Pipeline mode
        #[arg(short, long, value_enum, default_value = "optimize")]
        mode: ModeArg,

        /// Overwrite originals in place (backups are taken; restore
        /// with `optimise restore`)
        #[arg(long)]
        replace: bool,

        /// Confirm the destructive replace-with-WebP conversion
        #[arg(long)]
        confirm_replace: bool,

        /// Delete the original after a confirmed replace-with-WebP
        #[arg(long)]
        delete_original: bool,

        /// Export preset controlling the metadata policy
        #[arg(long, value_enum, default_value = "web")]
        preset: PresetArg,

        /// Expanded pngquant ranges and a relaxed SSIM floor
        #[arg(long)]
        aggressive_png: bool,

        /// Keep outputs even when they are larger than the input
        #[arg(long)]
        allow_larger: bool,

        /// Disable the SSIM acceptance guard on ladder candidates
        #[arg(long)]
        no_ssim_guard: bool,

        /// Fixed JPEG quality instead of the automatic ladder
        #[arg(long, value_name = "Q")]
        jpeg_quality: Option<u8>,

        /// Fixed WebP quality instead of the automatic ladder
        #[arg(long, value_name = "Q")]
        webp_quality: Option<u8>,

        /// WebP compression effort (4-6)
        #[arg(long, default_value_t = 5)]
        webp_effort: u8,

        /// Use cwebp near-lossless mode
        #[arg(long)]
        near_lossless: bool,

        /// Smart-mode quality target
        #[arg(long, value_enum, default_value = "high")]
        target: TargetArg,

        /// Custom guardrail (0-100) when --target custom
        #[arg(long, default_value_t = 99)]
        guardrail: u8,

        /// Smart-search speed/iteration budget
        #[arg(long, value_enum, default_value = "balanced")]
        speed: SpeedArg,

        /// Worker count (defaults to an automatic per-machine value)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// List resolvable inputs with their dimensions
    Scan {
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        output: OutputFormat,
    },

    /// Smart-encode one file and report the result without writing
    Preview {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[arg(long, value_enum, default_value = "high")]
        target: TargetArg,
    },

    /// Restore the originals of the most recent replace-mode run
    Restore,

    /// Watched-folder management and the watch loop
    Watch {
        #[command(subcommand)]
        command: WatchCommands,
    },
}

#[derive(Subcommand)]
enum WatchCommands {
    /// Add a folder to the watch list
    Add { path: PathBuf },
    /// Remove a folder from the watch list
    Remove { path: PathBuf },
    /// List watched folders
    List,
    /// Enable or disable a folder
    Toggle {
        path: PathBuf,
        #[arg(long)]
        off: bool,
    },
    /// Run the watch service until interrupted
    Run,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Optimize,
    ConvertWebp,
    OptimizeAndWebp,
    Smart,
    Responsive,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Optimize => RunMode::Optimize,
            ModeArg::ConvertWebp => RunMode::ConvertWebp,
            ModeArg::OptimizeAndWebp => RunMode::OptimizeAndWebp,
            ModeArg::Smart => RunMode::Smart,
            ModeArg::Responsive => RunMode::Responsive,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PresetArg {
    Original,
    Web,
    Design,
}

impl From<PresetArg> for ExportPreset {
    fn from(preset: PresetArg) -> Self {
        match preset {
            PresetArg::Original => ExportPreset::Original,
            PresetArg::Web => ExportPreset::Web,
            PresetArg::Design => ExportPreset::Design,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum TargetArg {
    VisuallyLossless,
    High,
    Balanced,
    Small,
    Custom,
}

impl From<TargetArg> for SmartTarget {
    fn from(target: TargetArg) -> Self {
        match target {
            TargetArg::VisuallyLossless => SmartTarget::VisuallyLossless,
            TargetArg::High => SmartTarget::High,
            TargetArg::Balanced => SmartTarget::Balanced,
            TargetArg::Small => SmartTarget::Small,
            TargetArg::Custom => SmartTarget::Custom,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum SpeedArg {
    Fast,
    Balanced,
    Thorough,
}

impl From<SpeedArg> for SpeedPreset {
    fn from(speed: SpeedArg) -> Self {
        match speed {
            SpeedArg::Fast => SpeedPreset::Fast,
            SpeedArg::Balanced => SpeedPreset::Balanced,
            SpeedArg::Thorough => SpeedPreset::Thorough,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output (for scripting)
    Json,
}

fn default_app_dir() -> PathBuf {
    std::env::var_os("OPTIMISE_APP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|h| PathBuf::from(h).join(".optimise"))
                .unwrap_or_else(|| PathBuf::from(".optimise"))
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let app_dir = cli.app_dir.clone().unwrap_or_else(default_app_dir);
    init_logging(
        "optimise",
        LogConfig::default().with_log_dir(app_dir.join("logs")),
    )
    .context("logging init failed")?;

    let engine = Engine::new(app_dir)?;

    match cli.command {
        Commands::Run {
            inputs,
            mode,
            replace,
            confirm_replace,
            delete_original,
            preset,
            aggressive_png,
            allow_larger,
            no_ssim_guard,
            jpeg_quality,
            webp_quality,
            webp_effort,
            near_lossless,
            target,
            guardrail,
            speed,
            concurrency,
        } => {
            let mut settings = EffectiveSettings::default();
            settings.output_mode = if replace {
                OutputMode::Replace
            } else {
                OutputMode::Subfolder
            };
            let export_preset: ExportPreset = preset.into();
            settings.export_preset = export_preset;
            settings.metadata.preset = export_preset.metadata_preset();
            settings.aggressive_png = aggressive_png;
            settings.allow_larger_output = allow_larger;
            settings.ssim_guard = !no_ssim_guard;
            settings.webp_effort = webp_effort;
            settings.webp_near_lossless = near_lossless;
            settings.smart_target = target.into();
            settings.custom_guardrail = guardrail;
            settings.speed = speed.into();
            settings.confirm_dangerous_replace = confirm_replace;
            settings.delete_original_on_webp_replace = delete_original;
            if let Some(q) = jpeg_quality {
                settings.jpeg_quality =
                    optimise_core::settings::QualitySetting::manual(Quality::clamped(q as i64));
            }
            if let Some(q) = webp_quality {
                settings.webp_quality =
                    optimise_core::settings::QualitySetting::manual(Quality::clamped(q as i64));
            }
            if let Some(n) = concurrency {
                settings.concurrency = Concurrency::Fixed(n);
            }

            let summary = run_with_progress(
                &engine,
                RunRequest {
                    paths: inputs,
                    mode: mode.into(),
                    settings,
                },
            )?;
            print_summary(&summary);
            if summary.failed_files > 0 {
                std::process::exit(1);
            }
        }

        Commands::Scan { inputs, output } => {
            let entries = engine.scan_paths(&inputs);
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                }
                OutputFormat::Human => {
                    for entry in &entries {
                        let dims = match (entry.width, entry.height) {
                            (Some(w), Some(h)) => format!("{w}x{h}"),
                            _ => "?".to_string(),
                        };
                        println!(
                            "{:>10}  {:>11}  {}",
                            common::format_bytes(entry.size),
                            dims,
                            entry.path.display()
                        );
                    }
                    println!("{} file(s)", entries.len());
                }
            }
        }

        Commands::Preview { input, target } => {
            let mut settings = EffectiveSettings::default();
            settings.smart_target = target.into();
            let preview = engine.preview(&input, &settings)?;
            let original = std::fs::metadata(&input).map(|m| m.len()).unwrap_or(0);
            println!("Input:   {} ({})", input.display(), common::format_bytes(original));
            println!(
                "Preview: {} at {} ({:.1}% of original)",
                common::format_bytes(preview.size),
                preview.quality_label,
                preview.size as f64 / original.max(1) as f64 * 100.0
            );
            if let Some(ssim) = preview.ssim {
                println!("MSSIM:   {ssim:.6}");
            }
        }

        Commands::Restore => {
            if !engine.can_restore_last_run() {
                println!("Nothing to restore.");
                return Ok(());
            }
            let report = engine.restore_last_run();
            println!("{}", report.message);
            if report.failed_count > 0 {
                std::process::exit(1);
            }
        }

        Commands::Watch { command } => match command {
            WatchCommands::Add { path } => {
                engine.watch_add_folder(path.clone())?;
                println!("Watching {}", path.display());
            }
            WatchCommands::Remove { path } => {
                engine.watch_remove_folder(&path)?;
                println!("Removed {}", path.display());
            }
            WatchCommands::List => {
                let folders = engine.watch_list();
                if folders.is_empty() {
                    println!("No watched folders.");
                }
                for folder in folders {
                    println!(
                        "{} {}",
                        if folder.enabled { "[on] " } else { "[off]" },
                        folder.path.display()
                    );
                }
            }
            WatchCommands::Toggle { path, off } => {
                engine.watch_toggle(&path, !off)?;
                println!(
                    "{} {}",
                    if off { "Disabled" } else { "Enabled" },
                    path.display()
                );
            }
            WatchCommands::Run => watch_loop(&engine)?,
        },
    }

    Ok(())
}

fn run_with_progress(engine: &Engine, request: RunRequest) -> Result<RunSummary> {
    let (token, rx) = engine.subscribe();
    let run_id = engine.start_run(request)?;
    tracing::info!(run_id = %run_id, "run dispatched");

    let bar = ProgressBar::hidden();
    bar.set_style(
        ProgressStyle::with_template("{bar:40.green} {pos}/{len} {msg}")
            .expect("static progress template"),
    );

    let summary = loop {
        match rx.recv() {
            Ok(EngineEvent::RunStarted { total_files, .. }) => {
                bar.set_length(total_files as u64);
                bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            }
            Ok(EngineEvent::Job(event)) => {
                if event.status.is_terminal() {
                    bar.inc(1);
                    let name = event
                        .input_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    match event.status {
                        JobState::Success => bar.set_message(name),
                        JobState::Failed => bar.set_message(format!("{name} failed")),
                        JobState::Skipped => bar.set_message(format!("{name} skipped")),
                        _ => {}
                    }
                }
            }
            Ok(EngineEvent::RunCompleted(summary)) => break *summary,
            Ok(EngineEvent::Watch(_)) => {}
            Err(_) => anyhow::bail!("engine event channel closed before the run completed"),
        }
    };

    bar.finish_and_clear();
    engine.unsubscribe(token);
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", style("Run summary").bold());
    println!(
        "  files: {} total, {} optimized, {} converted, {} skipped, {} failed{}",
        summary.total_files,
        style(summary.processed_files).green(),
        summary.converted_files,
        summary.skipped_files,
        if summary.failed_files > 0 {
            style(summary.failed_files).red()
        } else {
            style(summary.failed_files)
        },
        if summary.cancelled {
            format!(", {} cancelled", summary.cancelled_files)
        } else {
            String::new()
        }
    );
    if summary.total_original_bytes > 0 {
        println!(
            "  bytes: {} -> {} (saved {}, {:.1}%)",
            common::format_bytes(summary.total_original_bytes),
            common::format_bytes(summary.total_output_bytes),
            common::format_bytes(summary.total_saved_bytes),
            common::size_change_percent(summary.total_original_bytes, summary.total_output_bytes)
        );
    }
    println!("  elapsed: {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    if let Some(log_path) = &summary.log_path {
        println!("  log: {}", log_path.display());
    }
    for failure in &summary.failures {
        println!(
            "  {} {}: [{}] {}",
            style("failed").red(),
            failure.input_path.display(),
            failure.error.code,
            failure.error.message
        );
    }
}

fn watch_loop(engine: &Engine) -> Result<()> {
    let folders = engine.watch_list();
    if folders.iter().filter(|f| f.enabled).count() == 0 {
        anyhow::bail!("no enabled watch folders; add one with `optimise watch add <path>`");
    }

    let (_token, rx) = engine.subscribe();
    engine.watch_start();
    println!("Watching {} folder(s); Ctrl-C to stop.", folders.len());

    loop {
        match rx.recv() {
            Ok(EngineEvent::Watch(event)) => match event {
                WatchEvent::Detected { path } => {
                    println!("{} {}", style("detected").dim(), path.display());
                }
                WatchEvent::Completed {
                    path, bytes_saved, ..
                } => {
                    println!(
                        "{} {} (saved {})",
                        style("done").green(),
                        path.display(),
                        common::format_bytes(bytes_saved)
                    );
                }
                WatchEvent::Skipped { path, reason } => {
                    println!("{} {} ({})", style("skip").yellow(), path.display(), reason);
                }
                WatchEvent::Failed { path, error } => {
                    println!(
                        "{} {} [{}] {}",
                        style("fail").red(),
                        path.display(),
                        error.code,
                        error.message
                    );
                }
            },
            Ok(_) => {}
            Err(_) => break,
        }
    }

    engine.watch_shutdown();
    Ok(())
}
