//! Responsive derivative generation.
//!
//! Plans a width- or DPR-based derivative matrix, renders each entry
//! with a Lanczos resampler, encodes it per the format policy, and
//! emits HTML snippets plus a JSON manifest describing the set.

use crate::analyzer::ImageKind;
use crate::common::ensure_parent_dir;
use crate::errors::OptimiseError;
use crate::settings::{FormatPolicy, ResponsiveMode, ResponsiveSettings};
use crate::tools::{cwebp, mozjpeg, oxipng};
use crate::writer::{write_atomic, WriteRequest};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DPR_LEVELS: &[u32] = &[1, 2, 3];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeSpec {
    pub width: u32,
    pub height: u32,
    pub format: ImageKind,
    /// `-{w}w` or `@{dpr}x`, appended to the slug.
    pub suffix: String,
    /// Descriptor used in `srcset` (`480w` or `2x`).
    pub descriptor: String,
}

/// The fallback format a source derives when the policy is not
/// webp-only: TIFF transcodes to JPEG, everything else keeps its kind.
pub fn fallback_format(input: ImageKind) -> ImageKind {
    match input {
        ImageKind::Tiff => ImageKind::Jpeg,
        other => other,
    }
}

fn format_set(policy: FormatPolicy, input: ImageKind) -> Vec<ImageKind> {
    match policy {
        FormatPolicy::WebpOnly => vec![ImageKind::Webp],
        FormatPolicy::WebpFallback => {
            let fallback = fallback_format(input);
            if fallback == ImageKind::Webp {
                vec![ImageKind::Webp]
            } else {
                vec![ImageKind::Webp, fallback]
            }
        }
        FormatPolicy::Keep => vec![fallback_format(input)],
    }
}

/// Compute the derivative matrix for a source image.
pub fn plan(
    source_width: u32,
    source_height: u32,
    input: ImageKind,
    settings: &ResponsiveSettings,
) -> Vec<DerivativeSpec> {
    let formats = format_set(settings.format_policy, input);
    let aspect = source_height as f64 / source_width.max(1) as f64;
    let mut specs = Vec::new();

    let mut push = |width: u32, suffix: String, descriptor: String| {
        if width == 0 {
            return;
        }
        if width > source_width && !settings.allow_upscale {
            return;
        }
        let height = ((width as f64 * aspect).round() as u32).max(1);
        for &format in &formats {
            specs.push(DerivativeSpec {
                width,
                height,
                format,
                suffix: suffix.clone(),
                descriptor: descriptor.clone(),
            });
        }
    };

    match settings.mode {
        ResponsiveMode::Width => {
            let mut widths = settings.widths.clone();
            if settings.include_original && !widths.contains(&source_width) {
                widths.push(source_width);
            }
            widths.sort_unstable();
            widths.dedup();
            for w in widths {
                push(w, format!("-{w}w"), format!("{w}w"));
            }
        }
        ResponsiveMode::Dpr => {
            for &dpr in DPR_LEVELS {
                let w = settings.dpr_base_width * dpr;
                push(w, format!("@{dpr}x"), format!("{dpr}x"));
            }
        }
    }

    specs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivativeRecord {
    pub file: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: ImageKind,
    pub bytes: u64,
    pub descriptor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsiveManifest {
    pub source: PathBuf,
    pub sizes: String,
    pub derivatives: Vec<DerivativeRecord>,
}

#[derive(Debug, Clone)]
pub struct ResponsiveOutput {
    pub derivatives: Vec<DerivativeRecord>,
    pub img_snippet: String,
    pub picture_snippet: String,
    pub manifest_path: PathBuf,
    pub total_bytes: u64,
}

/// Slug for output file names: lowercase stem, runs of non-alphanumerics
/// collapsed to single dashes.
pub fn slugify(stem: &str) -> String {
    let mut slug = String::with_capacity(stem.len());
    let mut dash_pending = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            if dash_pending && !slug.is_empty() {
                slug.push('-');
            }
            dash_pending = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            dash_pending = true;
        }
    }
    if slug.is_empty() {
        "image".into()
    } else {
        slug
    }
}

pub struct ResponsiveJob<'a> {
    pub input: &'a Path,
    pub image: &'a DynamicImage,
    pub input_kind: ImageKind,
    pub output_dir: &'a Path,
    pub settings: &'a ResponsiveSettings,
    pub webp_effort: u8,
}

/// Render, encode and write the derivative set plus snippets/manifest.
pub fn generate(job: &ResponsiveJob) -> Result<ResponsiveOutput, OptimiseError> {
    let (source_w, source_h) = job.image.dimensions();
    let specs = plan(source_w, source_h, job.input_kind, job.settings);
    if specs.is_empty() {
        return Err(OptimiseError::Unsupported {
            path: job.input.to_path_buf(),
            detail: "responsive plan is empty (all widths would upscale?)".into(),
        });
    }

    let stem = job
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let slug = slugify(stem);

    let workdir = tempfile::TempDir::new().map_err(OptimiseError::Io)?;
    let mut derivatives = Vec::new();
    let mut last_error = None;

    for spec in &specs {
        match render_one(job, &slug, spec, workdir.path()) {
            Ok(record) => derivatives.push(record),
            Err(e @ OptimiseError::ToolMissing { .. }) => {
                // Without the encoder the whole format column is gone.
                tracing::warn!(error = %e, "derivative encoder missing");
                last_error = Some(e);
            }
            Err(e) => {
                tracing::warn!(
                    width = spec.width,
                    format = spec.format.name(),
                    error = %e,
                    "derivative failed"
                );
                last_error = Some(e);
            }
        }
    }

    if derivatives.is_empty() {
        return Err(last_error.unwrap_or_else(|| OptimiseError::Encode {
            tool: "responsive".into(),
            exit_code: None,
            detail: "no derivative could be produced".into(),
        }));
    }

    let sizes = job.settings.sizes_attribute();
    let img_snippet = img_snippet(&derivatives, &sizes);
    let picture_snippet = picture_snippet(&derivatives, &sizes);

    let manifest = ResponsiveManifest {
        source: job.input.to_path_buf(),
        sizes,
        derivatives: derivatives.clone(),
    };
    let manifest_path = job.output_dir.join(format!("{slug}.manifest.json"));
    ensure_parent_dir(&manifest_path).map_err(|e| OptimiseError::from_io(&manifest_path, e))?;
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).map_err(|e| anyhow::anyhow!(e))?;
    crate::writer::write_file_atomic(&manifest_path, &manifest_json)?;

    let total_bytes = derivatives.iter().map(|d| d.bytes).sum();
    Ok(ResponsiveOutput {
        derivatives,
        img_snippet,
        picture_snippet,
        manifest_path,
        total_bytes,
    })
}

fn render_one(
    job: &ResponsiveJob,
    slug: &str,
    spec: &DerivativeSpec,
    workdir: &Path,
) -> Result<DerivativeRecord, OptimiseError> {
    let resized = if (spec.width, spec.height) == job.image.dimensions() {
        job.image.clone()
    } else {
        job.image
            .resize_exact(spec.width, spec.height, FilterType::Lanczos3)
    };

    let preset = job.settings.optimization_preset;
    let bytes = match spec.format {
        ImageKind::Jpeg | ImageKind::Tiff => {
            mozjpeg::encode(&resized, preset.jpeg_quality(), workdir)?
        }
        ImageKind::Webp => {
            let scratch = workdir.join(format!("{slug}{}.png", spec.suffix));
            encode_png(&resized, &scratch)?;
            cwebp::encode(
                &scratch,
                cwebp::CwebpOptions {
                    quality: preset.webp_quality(),
                    effort: job.webp_effort,
                    near_lossless: false,
                    keep_metadata: false,
                },
                workdir,
            )?
        }
        ImageKind::Png => {
            let scratch = workdir.join(format!("{slug}{}.png", spec.suffix));
            encode_png(&resized, &scratch)?;
            // oxipng shrinks it when present; the plain encode already
            // is a valid derivative otherwise.
            match oxipng::optimize(&scratch, true, workdir) {
                Ok(optimized) => optimized,
                Err(_) => std::fs::read(&scratch).map_err(|e| OptimiseError::from_io(&scratch, e))?,
            }
        }
    };

    let file = format!(
        "{slug}{}.{}",
        spec.suffix,
        output_extension_for(spec.format)
    );
    let path = job.output_dir.join(&file);
    write_atomic(&WriteRequest {
        target: &path,
        bytes: &bytes,
        expected_format: Some(normalized_kind(spec.format)),
        backup_dir: None,
    })?;

    Ok(DerivativeRecord {
        file,
        path,
        width: spec.width,
        height: spec.height,
        format: normalized_kind(spec.format),
        bytes: bytes.len() as u64,
        descriptor: spec.descriptor.clone(),
    })
}

fn normalized_kind(format: ImageKind) -> ImageKind {
    match format {
        ImageKind::Tiff => ImageKind::Jpeg,
        other => other,
    }
}

fn output_extension_for(format: ImageKind) -> &'static str {
    normalized_kind(format).output_extension()
}

fn encode_png(image: &DynamicImage, path: &Path) -> Result<(), OptimiseError> {
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| OptimiseError::Encode {
            tool: "png".into(),
            exit_code: None,
            detail: e.to_string(),
        })
}

fn img_snippet(derivatives: &[DerivativeRecord], sizes: &str) -> String {
    let fallback: Vec<&DerivativeRecord> = derivatives
        .iter()
        .filter(|d| d.format != ImageKind::Webp)
        .collect();
    let set: Vec<&DerivativeRecord> = if fallback.is_empty() {
        derivatives.iter().collect()
    } else {
        fallback
    };

    let srcset = srcset(&set);
    let largest = set.iter().max_by_key(|d| d.width).expect("non-empty set");
    format!(
        "<img src=\"{}\" srcset=\"{}\" sizes=\"{}\" width=\"{}\" height=\"{}\" alt=\"\">",
        largest.file, srcset, sizes, largest.width, largest.height
    )
}

fn picture_snippet(derivatives: &[DerivativeRecord], sizes: &str) -> String {
    let webp: Vec<&DerivativeRecord> = derivatives
        .iter()
        .filter(|d| d.format == ImageKind::Webp)
        .collect();
    let fallback: Vec<&DerivativeRecord> = derivatives
        .iter()
        .filter(|d| d.format != ImageKind::Webp)
        .collect();

    let mut out = String::from("<picture>\n");
    if !webp.is_empty() {
        out.push_str(&format!(
            "  <source type=\"image/webp\" srcset=\"{}\" sizes=\"{}\">\n",
            srcset(&webp),
            sizes
        ));
    }
    let body = if fallback.is_empty() { &webp } else { &fallback };
    let largest = body.iter().max_by_key(|d| d.width).expect("non-empty set");
    out.push_str(&format!(
        "  <img src=\"{}\" srcset=\"{}\" sizes=\"{}\" width=\"{}\" height=\"{}\" alt=\"\">\n",
        largest.file,
        srcset(body),
        sizes,
        largest.width,
        largest.height
    ));
    out.push_str("</picture>");
    out
}

fn srcset(derivatives: &[&DerivativeRecord]) -> String {
    derivatives
        .iter()
        .map(|d| format!("{} {}", d.file, d.descriptor))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DerivativePreset, SizesTemplate};

    fn settings() -> ResponsiveSettings {
        ResponsiveSettings {
            mode: ResponsiveMode::Width,
            widths: vec![480, 768, 1280],
            dpr_base_width: 640,
            format_policy: FormatPolicy::WebpFallback,
            allow_upscale: false,
            include_original: false,
            optimization_preset: DerivativePreset::Balanced,
            sizes_template: SizesTemplate::FullWidth,
            custom_sizes: None,
        }
    }

    #[test]
    fn test_plan_width_mode_skips_upscales() {
        let specs = plan(800, 600, ImageKind::Jpeg, &settings());
        // 480 and 768 survive, 1280 would upscale; two formats each.
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().all(|s| s.width <= 800));
        assert!(specs.iter().any(|s| s.format == ImageKind::Webp));
        assert!(specs.iter().any(|s| s.format == ImageKind::Jpeg));
    }

    #[test]
    fn test_plan_allows_upscale_when_enabled() {
        let mut s = settings();
        s.allow_upscale = true;
        let specs = plan(800, 600, ImageKind::Jpeg, &s);
        assert!(specs.iter().any(|spec| spec.width == 1280));
    }

    #[test]
    fn test_plan_include_original_width() {
        let mut s = settings();
        s.include_original = true;
        let specs = plan(800, 600, ImageKind::Jpeg, &s);
        assert!(specs.iter().any(|spec| spec.width == 800));
    }

    #[test]
    fn test_plan_preserves_aspect() {
        let specs = plan(1600, 900, ImageKind::Jpeg, &settings());
        let spec = specs.iter().find(|s| s.width == 480).unwrap();
        assert_eq!(spec.height, 270);
    }

    #[test]
    fn test_plan_dpr_mode() {
        let mut s = settings();
        s.mode = ResponsiveMode::Dpr;
        s.format_policy = FormatPolicy::WebpOnly;
        let specs = plan(4000, 2000, ImageKind::Png, &s);
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].suffix, "@1x");
        assert_eq!(specs[1].descriptor, "2x");
        assert_eq!(specs[2].width, 1920);
    }

    #[test]
    fn test_plan_webp_source_collapses_fallback() {
        let specs = plan(800, 600, ImageKind::Webp, &settings());
        // webp-fallback with a webp source yields only webp.
        assert!(specs.iter().all(|s| s.format == ImageKind::Webp));
    }

    #[test]
    fn test_plan_keep_policy_tiff_derives_jpeg() {
        let mut s = settings();
        s.format_policy = FormatPolicy::Keep;
        let specs = plan(800, 600, ImageKind::Tiff, &s);
        assert!(specs.iter().all(|spec| spec.format == ImageKind::Jpeg));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hero Image (final) v2"), "hero-image-final-v2");
        assert_eq!(slugify("photo"), "photo");
        assert_eq!(slugify("___"), "image");
    }

    #[test]
    fn test_snippets_shape() {
        let derivatives = vec![
            DerivativeRecord {
                file: "hero-480w.webp".into(),
                path: PathBuf::from("/o/hero-480w.webp"),
                width: 480,
                height: 270,
                format: ImageKind::Webp,
                bytes: 100,
                descriptor: "480w".into(),
            },
            DerivativeRecord {
                file: "hero-480w.jpg".into(),
                path: PathBuf::from("/o/hero-480w.jpg"),
                width: 480,
                height: 270,
                format: ImageKind::Jpeg,
                bytes: 120,
                descriptor: "480w".into(),
            },
            DerivativeRecord {
                file: "hero-768w.jpg".into(),
                path: PathBuf::from("/o/hero-768w.jpg"),
                width: 768,
                height: 432,
                format: ImageKind::Jpeg,
                bytes: 200,
                descriptor: "768w".into(),
            },
        ];

        let img = img_snippet(&derivatives, "100vw");
        assert!(img.starts_with("<img "));
        assert!(img.contains("src=\"hero-768w.jpg\""));
        assert!(img.contains("hero-480w.jpg 480w, hero-768w.jpg 768w"));
        assert!(!img.contains("webp"));

        let picture = picture_snippet(&derivatives, "100vw");
        assert!(picture.contains("<source type=\"image/webp\" srcset=\"hero-480w.webp 480w\""));
        assert!(picture.contains("<img src=\"hero-768w.jpg\""));
        assert!(picture.ends_with("</picture>"));
    }
}
