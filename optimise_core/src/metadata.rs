//! Metadata processing around the encode step.
//!
//! The pipeline re-encodes from decoded pixels, so the encoders
//! inherently drop embedded metadata; this module handles the two
//! directions around that fact. Before encoding it bakes the EXIF
//! orientation into the pixel data. After the output is written it
//! copies back whatever the policy wants kept, using exiftool the same
//! way every other external tool is wrapped.
//!
//! When the policy keeps camera EXIF but demands GPS removal and
//! exiftool is unavailable, the processor escalates to a full EXIF
//! strip: GPS removal is a guarantee, camera info is best-effort.
//!
//! ICC handling in sRGB mode converts pixels from the two wide-gamut
//! profiles seen in practice (Display P3, Adobe RGB) before the profile
//! is dropped. A profile this module cannot convert is kept on the
//! output instead, so wide-gamut pixel values are never reinterpreted
//! as sRGB. Untagged inputs are assumed sRGB already.

use crate::errors::OptimiseError;
use crate::settings::{IccMode, MetadataSettings};
use crate::tools::{resolve_binary, run_tool};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TOOL: &str = "exiftool";

static BIN: OnceLock<Option<PathBuf>> = OnceLock::new();

pub fn exiftool_available() -> bool {
    resolve_binary(TOOL, &BIN).is_ok()
}

/// What the processor did to one file, recorded in the run log entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataReport {
    pub orientation: u16,
    pub orientation_baked: bool,
    pub exif_kept: bool,
    pub xmp_kept: bool,
    pub iptc_kept: bool,
    pub icc_kept: bool,
    /// Pixels were converted from a wide-gamut profile to sRGB.
    #[serde(default)]
    pub icc_converted: bool,
    pub gps_cleaned: bool,
    /// True when keep-camera-info was overridden to guarantee GPS
    /// removal without exiftool.
    pub escalated_exif_strip: bool,
}

/// Colour space of the source, as far as the embedded profile tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceColorSpace {
    Srgb,
    DisplayP3,
    AdobeRgb,
    /// Tagged with a profile this module cannot convert.
    Unknown,
}

/// Classify the embedded ICC profile by its description. Untagged files
/// (and files we cannot inspect) are assumed sRGB, matching how the
/// decoder treats their pixel values.
pub fn read_color_space(path: &Path) -> SourceColorSpace {
    let Ok(bin) = resolve_binary(TOOL, &BIN) else {
        return SourceColorSpace::Srgb;
    };
    let Ok(output) = std::process::Command::new(bin.as_path())
        .args(["-s3", "-ICC_Profile:ProfileDescription"])
        .arg(path)
        .output()
    else {
        return SourceColorSpace::Srgb;
    };
    if !output.status.success() {
        return SourceColorSpace::Srgb;
    }
    let description = String::from_utf8_lossy(&output.stdout).trim().to_string();
    classify_profile_description(&description)
}

fn classify_profile_description(description: &str) -> SourceColorSpace {
    if description.is_empty() {
        return SourceColorSpace::Srgb;
    }
    let lower = description.to_lowercase();
    if lower.contains("srgb") {
        SourceColorSpace::Srgb
    } else if lower.contains("display p3") || lower.contains("p3") {
        SourceColorSpace::DisplayP3
    } else if lower.contains("adobe rgb") {
        SourceColorSpace::AdobeRgb
    } else {
        SourceColorSpace::Unknown
    }
}

// Linear-light primaries conversion matrices, composed through XYZ D65.
const P3_TO_SRGB: [[f32; 3]; 3] = [
    [1.224_940_2, -0.224_940_4, 0.0],
    [-0.042_056_9, 1.042_057_1, 0.0],
    [-0.019_637_6, -0.078_636_1, 1.098_273_5],
];

const ADOBE_TO_SRGB: [[f32; 3]; 3] = [
    [1.398_35, -0.398_35, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, -0.042_93, 1.042_93],
];

const ADOBE_GAMMA: f32 = 2.199_218_75;

fn srgb_decode(u: f32) -> f32 {
    if u <= 0.04045 {
        u / 12.92
    } else {
        ((u + 0.055) / 1.055).powf(2.4)
    }
}

fn srgb_encode(l: f32) -> f32 {
    if l <= 0.003_130_8 {
        12.92 * l
    } else {
        1.055 * l.powf(1.0 / 2.4) - 0.055
    }
}

fn adobe_decode(u: f32) -> f32 {
    u.powf(ADOBE_GAMMA)
}

/// Convert pixels into sRGB. Returns None when the space needs no
/// conversion (already sRGB) or cannot be converted (Unknown); alpha
/// passes through untouched and out-of-gamut values clip.
pub fn convert_to_srgb(image: &DynamicImage, space: SourceColorSpace) -> Option<DynamicImage> {
    let (matrix, decode): (&[[f32; 3]; 3], fn(f32) -> f32) = match space {
        SourceColorSpace::DisplayP3 => (&P3_TO_SRGB, srgb_decode),
        SourceColorSpace::AdobeRgb => (&ADOBE_TO_SRGB, adobe_decode),
        SourceColorSpace::Srgb | SourceColorSpace::Unknown => return None,
    };

    let mut rgba = image.to_rgba8();
    for px in rgba.pixels_mut() {
        let linear = [
            decode(px[0] as f32 / 255.0),
            decode(px[1] as f32 / 255.0),
            decode(px[2] as f32 / 255.0),
        ];
        for (channel, row) in matrix.iter().enumerate() {
            let mixed = row[0] * linear[0] + row[1] * linear[1] + row[2] * linear[2];
            let encoded = srgb_encode(mixed.clamp(0.0, 1.0));
            px[channel] = (encoded * 255.0 + 0.5) as u8;
        }
    }

    let converted = DynamicImage::ImageRgba8(rgba);
    if image.color().has_alpha() {
        Some(converted)
    } else {
        Some(DynamicImage::ImageRgb8(converted.to_rgb8()))
    }
}

/// Read the EXIF orientation tag (1..=8); 1 when absent or unreadable.
pub fn read_orientation(path: &Path) -> u16 {
    let Ok(bin) = resolve_binary(TOOL, &BIN) else {
        return 1;
    };
    read_orientation_value(&bin, path).unwrap_or(1)
}

fn read_orientation_value(bin: &Path, path: &Path) -> Option<u16> {
    let output = std::process::Command::new(bin)
        .args(["-n", "-s3", "-Orientation"])
        .arg(path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value: u16 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    (1..=8).contains(&value).then_some(value)
}

/// Bake an EXIF orientation into the pixel data so the re-encoded
/// output needs no orientation tag.
pub fn bake_orientation(image: DynamicImage, orientation: u16) -> (DynamicImage, bool) {
    match orientation {
        2 => (image.fliph(), true),
        3 => (image.rotate180(), true),
        4 => (image.flipv(), true),
        5 => (image.rotate90().fliph(), true),
        6 => (image.rotate90(), true),
        7 => (image.rotate270().fliph(), true),
        8 => (image.rotate270(), true),
        _ => (image, false),
    }
}

/// Prepare the decoded frame and decide the post-write tag plan.
pub fn prepare(
    image: DynamicImage,
    input_path: &Path,
    settings: &MetadataSettings,
) -> (DynamicImage, MetadataReport) {
    let orientation = if settings.enabled {
        read_orientation(input_path)
    } else {
        1
    };
    let (image, baked) = bake_orientation(image, orientation);

    let mut report = MetadataReport {
        orientation,
        orientation_baked: baked,
        ..MetadataReport::default()
    };

    if !settings.enabled {
        // Cleanup disabled still re-encodes, so everything the encoder
        // drops is gone; the post-write phase copies all of it back.
        report.exif_kept = true;
        report.xmp_kept = true;
        report.iptc_kept = true;
        report.icc_kept = true;
        return (image, report);
    }

    report.exif_kept = !settings.strip_exif;
    report.xmp_kept = !settings.strip_xmp;
    report.iptc_kept = !settings.strip_iptc;
    report.icc_kept = settings.icc_mode == IccMode::Keep;
    report.gps_cleaned = settings.gps_clean;

    if settings.wants_targeted_gps_clean() && !exiftool_available() {
        report.exif_kept = false;
        report.escalated_exif_strip = true;
    }

    let image = if settings.icc_mode == IccMode::Srgb {
        match read_color_space(input_path) {
            space @ (SourceColorSpace::DisplayP3 | SourceColorSpace::AdobeRgb) => {
                match convert_to_srgb(&image, space) {
                    Some(converted) => {
                        report.icc_converted = true;
                        converted
                    }
                    None => image,
                }
            }
            SourceColorSpace::Unknown => {
                // No conversion available; keep the profile so the
                // pixel values stay correctly tagged.
                report.icc_kept = true;
                image
            }
            SourceColorSpace::Srgb => image,
        }
    } else {
        image
    };

    (image, report)
}

/// Copy the kept tag groups from the original onto the written output.
/// No-op when nothing is kept; orientation is never copied since it was
/// baked into the pixels.
pub fn apply_kept_tags(
    source: &Path,
    output: &Path,
    report: &MetadataReport,
) -> Result<(), OptimiseError> {
    if !report.exif_kept && !report.xmp_kept && !report.iptc_kept && !report.icc_kept {
        return Ok(());
    }

    let bin = resolve_binary(TOOL, &BIN)?;

    let mut args = vec![
        "-overwrite_original".to_string(),
        "-TagsFromFile".to_string(),
        source.to_string_lossy().into_owned(),
    ];
    if report.exif_kept {
        args.push("-exif:all".to_string());
    }
    if report.xmp_kept {
        args.push("-xmp:all".to_string());
    }
    if report.iptc_kept {
        args.push("-iptc:all".to_string());
    }
    if report.icc_kept {
        args.push("-icc_profile:all".to_string());
    }
    // Orientation lives in the pixels now.
    args.push("-Orientation=".to_string());
    if report.gps_cleaned {
        args.push("-gps:all=".to_string());
        args.push("-xmp:geotag=".to_string());
    }
    args.push(output.to_string_lossy().into_owned());

    let out = run_tool(TOOL, &bin, &args)?;
    if out.exit_code != Some(0) {
        tracing::warn!(
            output = %output.display(),
            stderr = %out.stderr,
            "exiftool tag copy failed; output keeps encoder-stripped metadata"
        );
    }
    Ok(())
}
