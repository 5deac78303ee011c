//! Run settings: typed variants with explicit defaults and a
//! normalization step applied once at entry.
//!
//! Everything here is serde-serializable so run logs can embed the
//! exact settings a run used and the watch config can carry per-folder
//! overrides.

use crate::pool;
use crate::types::Quality;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    Optimize,
    ConvertWebp,
    OptimizeAndWebp,
    Smart,
    Responsive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Subfolder,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPreset {
    Original,
    Web,
    Design,
}

impl ExportPreset {
    /// Metadata policy the export preset implies: originals keep camera
    /// info, web exports strip everything, design exports keep
    /// copyright and the colour profile.
    pub fn metadata_preset(&self) -> MetadataPreset {
        match self {
            ExportPreset::Original => MetadataPreset::KeepCameraInfo,
            ExportPreset::Web => MetadataPreset::WebSafe,
            ExportPreset::Design => MetadataPreset::KeepCopyright,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    Auto,
    Manual,
}

/// Per-format quality knob: auto lets the ladder/search pick, manual
/// pins a single quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySetting {
    pub mode: QualityMode,
    pub value: Quality,
}

impl QualitySetting {
    pub fn auto() -> Self {
        Self {
            mode: QualityMode::Auto,
            value: Quality::clamped(80),
        }
    }

    pub fn manual(value: Quality) -> Self {
        Self {
            mode: QualityMode::Manual,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    Auto,
    Fixed(usize),
}

impl Concurrency {
    /// Number of workers this setting resolves to on this machine.
    pub fn resolve(&self) -> usize {
        match self {
            Concurrency::Auto => pool::default_workers(),
            Concurrency::Fixed(n) => (*n).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SmartTarget {
    VisuallyLossless,
    High,
    Balanced,
    Small,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedPreset {
    Fast,
    Balanced,
    Thorough,
}

impl SpeedPreset {
    /// Binary-search iteration budget.
    pub fn iterations(&self) -> u32 {
        match self {
            SpeedPreset::Fast => 4,
            SpeedPreset::Balanced => 6,
            SpeedPreset::Thorough => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataPreset {
    WebSafe,
    MaxCompression,
    KeepCopyright,
    KeepCameraInfo,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IccMode {
    Srgb,
    Keep,
    Strip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSettings {
    pub enabled: bool,
    pub preset: MetadataPreset,
    pub strip_exif: bool,
    pub strip_xmp: bool,
    pub strip_iptc: bool,
    pub gps_clean: bool,
    pub icc_mode: IccMode,
}

impl MetadataSettings {
    /// Expand a preset into its flag bundle. Custom keeps the flags
    /// already present.
    pub fn with_preset(preset: MetadataPreset) -> Self {
        match preset {
            MetadataPreset::WebSafe => Self {
                enabled: true,
                preset,
                strip_exif: true,
                strip_xmp: true,
                strip_iptc: true,
                gps_clean: true,
                icc_mode: IccMode::Srgb,
            },
            MetadataPreset::MaxCompression => Self {
                enabled: true,
                preset,
                strip_exif: true,
                strip_xmp: true,
                strip_iptc: true,
                gps_clean: true,
                icc_mode: IccMode::Strip,
            },
            MetadataPreset::KeepCopyright => Self {
                enabled: true,
                preset,
                strip_exif: true,
                strip_xmp: false,
                strip_iptc: false,
                gps_clean: true,
                icc_mode: IccMode::Keep,
            },
            MetadataPreset::KeepCameraInfo => Self {
                enabled: true,
                preset,
                strip_exif: false,
                strip_xmp: true,
                strip_iptc: true,
                gps_clean: true,
                icc_mode: IccMode::Keep,
            },
            MetadataPreset::Custom => Self::default(),
        }
    }

    /// Camera info kept while GPS must go: the targeted GPS wipe needs
    /// exiftool; without it the processor escalates to a full EXIF strip.
    pub fn wants_targeted_gps_clean(&self) -> bool {
        self.enabled && self.gps_clean && !self.strip_exif
    }
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            preset: MetadataPreset::WebSafe,
            strip_exif: true,
            strip_xmp: true,
            strip_iptc: true,
            gps_clean: true,
            icc_mode: IccMode::Srgb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsiveMode {
    Width,
    Dpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatPolicy {
    Keep,
    WebpFallback,
    WebpOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizesTemplate {
    FullWidth,
    Content,
    Half,
    Custom,
}

impl SizesTemplate {
    pub fn css(&self) -> &'static str {
        match self {
            SizesTemplate::FullWidth => "100vw",
            SizesTemplate::Content => "(max-width: 768px) 100vw, 768px",
            SizesTemplate::Half => "(max-width: 768px) 100vw, 50vw",
            SizesTemplate::Custom => "",
        }
    }
}

/// Quality tier applied to responsive derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativePreset {
    Quality,
    Balanced,
    Compact,
}

impl DerivativePreset {
    pub fn jpeg_quality(&self) -> Quality {
        Quality::clamped(match self {
            DerivativePreset::Quality => 85,
            DerivativePreset::Balanced => 80,
            DerivativePreset::Compact => 72,
        })
    }

    pub fn webp_quality(&self) -> Quality {
        Quality::clamped(match self {
            DerivativePreset::Quality => 82,
            DerivativePreset::Balanced => 76,
            DerivativePreset::Compact => 68,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponsiveSettings {
    pub mode: ResponsiveMode,
    pub widths: Vec<u32>,
    pub dpr_base_width: u32,
    pub format_policy: FormatPolicy,
    pub allow_upscale: bool,
    pub include_original: bool,
    pub optimization_preset: DerivativePreset,
    pub sizes_template: SizesTemplate,
    pub custom_sizes: Option<String>,
}

impl ResponsiveSettings {
    /// The `sizes` attribute value for emitted snippets.
    pub fn sizes_attribute(&self) -> String {
        match self.sizes_template {
            SizesTemplate::Custom => self.custom_sizes.clone().unwrap_or_default(),
            t => t.css().to_string(),
        }
    }
}

impl Default for ResponsiveSettings {
    fn default() -> Self {
        Self {
            mode: ResponsiveMode::Width,
            widths: vec![480, 768, 1280, 1920],
            dpr_base_width: 640,
            format_policy: FormatPolicy::WebpFallback,
            allow_upscale: false,
            include_original: true,
            optimization_preset: DerivativePreset::Balanced,
            sizes_template: SizesTemplate::FullWidth,
            custom_sizes: None,
        }
    }
}

pub const WEBP_EFFORT_MIN: u8 = 4;
pub const WEBP_EFFORT_MAX: u8 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EffectiveSettings {
    pub output_mode: OutputMode,
    pub export_preset: ExportPreset,
    pub naming_template: String,
    pub jpeg_quality: QualitySetting,
    pub webp_quality: QualitySetting,
    pub webp_effort: u8,
    pub webp_near_lossless: bool,
    pub aggressive_png: bool,
    pub concurrency: Concurrency,
    pub allow_larger_output: bool,
    pub ssim_guard: bool,
    pub smart_target: SmartTarget,
    pub custom_guardrail: u8,
    pub speed: SpeedPreset,
    pub metadata: MetadataSettings,
    pub responsive: ResponsiveSettings,
    /// Replace-with-WebP drops the original format; the caller must
    /// opt in explicitly before the coordinator accepts such a run.
    pub confirm_dangerous_replace: bool,
    pub delete_original_on_webp_replace: bool,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::Subfolder,
            export_preset: ExportPreset::Web,
            naming_template: "{name}.{ext}".to_string(),
            jpeg_quality: QualitySetting::auto(),
            webp_quality: QualitySetting::auto(),
            webp_effort: 5,
            webp_near_lossless: false,
            aggressive_png: false,
            concurrency: Concurrency::Auto,
            allow_larger_output: false,
            ssim_guard: true,
            smart_target: SmartTarget::High,
            custom_guardrail: 99,
            speed: SpeedPreset::Balanced,
            metadata: MetadataSettings::default(),
            responsive: ResponsiveSettings::default(),
            confirm_dangerous_replace: false,
            delete_original_on_webp_replace: false,
        }
    }
}

impl EffectiveSettings {
    /// Clamp every bounded field into its documented range. Applied
    /// once when a run request enters the coordinator; the settings are
    /// immutable afterwards.
    pub fn normalized(mut self) -> Self {
        self.webp_effort = self.webp_effort.clamp(WEBP_EFFORT_MIN, WEBP_EFFORT_MAX);
        self.custom_guardrail = self.custom_guardrail.min(100);
        self.jpeg_quality.value = Quality::clamped(self.jpeg_quality.value.get() as i64);
        self.webp_quality.value = Quality::clamped(self.webp_quality.value.get() as i64);
        if self.naming_template.trim().is_empty() {
            self.naming_template = "{name}.{ext}".to_string();
        }
        // Named metadata presets are authoritative bundles; only Custom
        // keeps hand-set flags.
        if self.metadata.preset != MetadataPreset::Custom {
            let enabled = self.metadata.enabled;
            self.metadata = MetadataSettings::with_preset(self.metadata.preset);
            self.metadata.enabled = enabled;
        }
        self
    }

    /// MSSIM floor for ladder candidates when the SSIM guard is on.
    pub fn ladder_threshold(&self) -> f64 {
        if self.aggressive_png {
            0.99
        } else {
            0.995
        }
    }

    /// MSSIM target driving the smart binary search.
    pub fn smart_threshold(&self) -> f64 {
        match self.smart_target {
            SmartTarget::VisuallyLossless => 0.999,
            SmartTarget::High => 0.995,
            SmartTarget::Balanced => 0.99,
            SmartTarget::Small => 0.98,
            SmartTarget::Custom => self.custom_guardrail as f64 / 100.0,
        }
    }
}

/// One invocation of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub paths: Vec<std::path::PathBuf>,
    pub mode: RunMode,
    pub settings: EffectiveSettings,
}
