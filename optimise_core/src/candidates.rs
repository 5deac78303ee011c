//! Candidate production and selection.
//!
//! Two strategies produce encoded candidates for a file: the ladder
//! enumerates a fixed set of qualities per format, the smart strategy
//! binary-searches quality against a target MSSIM with a banding veto.
//! Selection is always smallest-accepted-bytes; a candidate that fails
//! to encode is dropped and the pipeline keeps going, but a missing
//! encoder binary aborts that whole candidate class.

use crate::analyzer::{ContentFeatures, ImageKind};
use crate::errors::OptimiseError;
use crate::metrics::{self, MetricResult};
use crate::settings::{EffectiveSettings, QualityMode};
use crate::tools::{cwebp, mozjpeg, oxipng, pngquant, EncodeOutcome};
use crate::types::{Quality, Ssim};
use image::DynamicImage;
use std::path::Path;

pub const JPEG_LADDER: &[u8] = &[88, 84, 80, 76, 72];
pub const WEBP_LADDER: &[u8] = &[82, 78, 74, 70];
pub const PNG_QUANT_RANGES: &[(u8, u8)] = &[(80, 95)];
pub const PNG_QUANT_RANGES_AGGRESSIVE: &[(u8, u8)] = &[(80, 95), (65, 90)];

/// Candidates with banding risk at or above this are vetoed in smart
/// mode regardless of their MSSIM.
pub const BANDING_VETO: f64 = 0.05;

const SMART_BOUNDS: (u8, u8) = (10, 95);
/// Graphics get a raised JPEG floor to avoid ringing around hard edges.
const SMART_BOUNDS_GRAPHIC_JPEG: (u8, u8) = (70, 95);

#[derive(Debug, Clone)]
pub struct Candidate {
    pub bytes: Vec<u8>,
    pub format: ImageKind,
    pub quality_label: String,
    pub ssim: Option<Ssim>,
    pub banding_risk: Option<f64>,
}

impl Candidate {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Everything a strategy needs for one file.
pub struct CandidateContext<'a> {
    /// Metadata-processed frame; the comparison base for all metrics.
    pub image: &'a DynamicImage,
    /// Processed frame serialized as PNG, input for path-based tools.
    pub scratch_png: &'a Path,
    pub original_size: u64,
    pub features: &'a ContentFeatures,
    pub settings: &'a EffectiveSettings,
    pub workdir: &'a Path,
    /// False when the metadata policy strips everything anyway.
    pub keep_metadata: bool,
}

#[derive(Debug)]
pub enum Selection {
    Selected(Candidate),
    /// No candidate met the acceptance criteria.
    NoneAccepted,
    /// Candidates were produced but none beat the original's size.
    AllLarger,
}

/// Pick the smallest accepted candidate; reject the pick when it is not
/// smaller than the original and growth is not allowed.
pub fn select_smallest(
    mut candidates: Vec<Candidate>,
    original_size: u64,
    allow_larger: bool,
) -> Selection {
    if candidates.is_empty() {
        return Selection::NoneAccepted;
    }
    candidates.sort_by_key(Candidate::size);
    let best = candidates.swap_remove(0);
    if !allow_larger && best.size() >= original_size {
        return Selection::AllLarger;
    }
    Selection::Selected(best)
}

/// Measure a candidate against the processed frame.
fn measure(ctx: &CandidateContext, bytes: &[u8]) -> Result<MetricResult, OptimiseError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| OptimiseError::Encode {
        tool: "metric".into(),
        exit_code: None,
        detail: format!("candidate decode failed: {e}"),
    })?;
    metrics::compare_frames(ctx.image, &decoded).map_err(OptimiseError::Other)
}

fn guarded_accept(ctx: &CandidateContext, metric: &MetricResult) -> bool {
    !ctx.settings.ssim_guard || metric.mssim.meets_threshold(ctx.settings.ladder_threshold())
}

/// Ladder strategy for one target format.
pub fn build_ladder(
    ctx: &CandidateContext,
    format: ImageKind,
) -> Result<Vec<Candidate>, OptimiseError> {
    match format {
        ImageKind::Jpeg => ladder_jpeg(ctx),
        ImageKind::Png => ladder_png(ctx),
        ImageKind::Webp => ladder_webp(ctx),
        ImageKind::Tiff => ladder_jpeg(ctx),
    }
}

fn ladder_jpeg(ctx: &CandidateContext) -> Result<Vec<Candidate>, OptimiseError> {
    let qualities: Vec<u8> = match ctx.settings.jpeg_quality.mode {
        QualityMode::Auto => JPEG_LADDER.to_vec(),
        QualityMode::Manual => vec![ctx.settings.jpeg_quality.value.get()],
    };

    let mut accepted = Vec::new();
    for q in qualities {
        let quality = Quality::clamped(q as i64);
        let bytes = match mozjpeg::encode(ctx.image, quality, ctx.workdir) {
            Ok(bytes) => bytes,
            Err(e @ OptimiseError::ToolMissing { .. }) => return Err(e),
            Err(e) => {
                tracing::debug!(quality = q, error = %e, "JPEG candidate failed, continuing");
                continue;
            }
        };
        if let Some(candidate) = judge_lossy(ctx, bytes, ImageKind::Jpeg, format!("q{q}"))? {
            accepted.push(candidate);
        }
    }
    Ok(accepted)
}

fn ladder_webp(ctx: &CandidateContext) -> Result<Vec<Candidate>, OptimiseError> {
    let settings = ctx.settings;
    let configs: Vec<(u8, bool)> = if settings.webp_near_lossless {
        vec![(settings.webp_quality.value.get(), true)]
    } else {
        match settings.webp_quality.mode {
            QualityMode::Auto => WEBP_LADDER.iter().map(|&q| (q, false)).collect(),
            QualityMode::Manual => vec![(settings.webp_quality.value.get(), false)],
        }
    };

    let mut accepted = Vec::new();
    for (q, near_lossless) in configs {
        let options = cwebp::CwebpOptions {
            quality: Quality::clamped(q as i64),
            effort: settings.webp_effort,
            near_lossless,
            keep_metadata: ctx.keep_metadata,
        };
        let bytes = match cwebp::encode(ctx.scratch_png, options, ctx.workdir) {
            Ok(bytes) => bytes,
            Err(e @ OptimiseError::ToolMissing { .. }) => return Err(e),
            Err(e) => {
                tracing::debug!(quality = q, error = %e, "WebP candidate failed, continuing");
                continue;
            }
        };
        let label = if near_lossless {
            format!("nl{q}")
        } else {
            format!("q{q}")
        };
        if let Some(candidate) = judge_lossy(ctx, bytes, ImageKind::Webp, label)? {
            accepted.push(candidate);
        }
    }
    Ok(accepted)
}

fn ladder_png(ctx: &CandidateContext) -> Result<Vec<Candidate>, OptimiseError> {
    let strip = !ctx.keep_metadata;
    let mut accepted = Vec::new();

    // Lossless candidate: no SSIM gate needed.
    match oxipng::optimize(ctx.scratch_png, strip, ctx.workdir) {
        Ok(bytes) => accepted.push(Candidate {
            bytes,
            format: ImageKind::Png,
            quality_label: "lossless".into(),
            ssim: Some(Ssim::PERFECT),
            banding_risk: Some(0.0),
        }),
        Err(e @ OptimiseError::ToolMissing { .. }) => return Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "oxipng lossless candidate failed, continuing");
        }
    }

    let ranges = if ctx.settings.aggressive_png {
        PNG_QUANT_RANGES_AGGRESSIVE
    } else {
        PNG_QUANT_RANGES
    };

    for &(min, max) in ranges {
        let quantized = match pngquant::quantize(ctx.scratch_png, min, max, strip, ctx.workdir) {
            Ok(EncodeOutcome::Encoded(bytes)) => bytes,
            Ok(EncodeOutcome::WouldGrow) => {
                tracing::debug!(min, max, "pngquant declined: output would be larger");
                continue;
            }
            // A missing pngquant only loses the lossy class; the
            // lossless candidate above still stands.
            Err(OptimiseError::ToolMissing { tool }) => {
                tracing::debug!(tool, "pngquant unavailable, lossy PNG class skipped");
                break;
            }
            Err(e) => {
                tracing::debug!(min, max, error = %e, "pngquant candidate failed, continuing");
                continue;
            }
        };

        // Chain oxipng on the quantized output when available.
        let polished = {
            let quant_path = ctx.workdir.join(format!("quant-{min}-{max}.png"));
            match std::fs::write(&quant_path, &quantized) {
                Ok(()) => oxipng::optimize(&quant_path, strip, ctx.workdir).unwrap_or(quantized),
                Err(_) => quantized,
            }
        };

        if let Some(candidate) =
            judge_lossy(ctx, polished, ImageKind::Png, format!("q{min}-{max}"))?
        {
            accepted.push(candidate);
        }
    }

    Ok(accepted)
}

/// Apply the SSIM guard to a lossy candidate; None when rejected.
fn judge_lossy(
    ctx: &CandidateContext,
    bytes: Vec<u8>,
    format: ImageKind,
    label: String,
) -> Result<Option<Candidate>, OptimiseError> {
    if !ctx.settings.ssim_guard {
        return Ok(Some(Candidate {
            bytes,
            format,
            quality_label: label,
            ssim: None,
            banding_risk: None,
        }));
    }

    let metric = match measure(ctx, &bytes) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(label, error = %e, "candidate unmeasurable, dropped");
            return Ok(None);
        }
    };

    if !guarded_accept(ctx, &metric) {
        tracing::debug!(
            label,
            mssim = metric.mssim.value(),
            "candidate below SSIM guard, dropped"
        );
        return Ok(None);
    }

    Ok(Some(Candidate {
        bytes,
        format,
        quality_label: label,
        ssim: Some(metric.mssim),
        banding_risk: Some(metric.banding_risk),
    }))
}

/// Smart strategy: binary search on quality for JPEG/WebP.
pub fn smart_search(
    ctx: &CandidateContext,
    format: ImageKind,
) -> Result<Option<Candidate>, OptimiseError> {
    debug_assert!(matches!(format, ImageKind::Jpeg | ImageKind::Webp));

    let threshold = ctx.settings.smart_threshold();
    let bounds = if format == ImageKind::Jpeg && !ctx.features.is_photo {
        SMART_BOUNDS_GRAPHIC_JPEG
    } else {
        SMART_BOUNDS
    };
    let iterations = ctx.settings.speed.iterations();

    let result = binary_search_quality(bounds, iterations, |q| {
        let quality = Quality::clamped(q as i64);
        let bytes = match format {
            ImageKind::Jpeg => mozjpeg::encode(ctx.image, quality, ctx.workdir)?,
            _ => cwebp::encode(
                ctx.scratch_png,
                cwebp::CwebpOptions {
                    quality,
                    effort: ctx.settings.webp_effort,
                    near_lossless: false,
                    keep_metadata: ctx.keep_metadata,
                },
                ctx.workdir,
            )?,
        };
        let metric = measure(ctx, &bytes)?;
        let passed =
            metric.mssim.meets_threshold(threshold) && metric.banding_risk < BANDING_VETO;
        Ok((bytes, metric, passed))
    })?;

    Ok(result.map(|(q, bytes, metric)| Candidate {
        bytes,
        format,
        quality_label: format!("q{q}"),
        ssim: Some(metric.mssim),
        banding_risk: Some(metric.banding_risk),
    }))
}

/// Bounded binary search over quality. The probe returns the encoded
/// bytes, their metrics, and whether they pass the target. Passing
/// moves the upper bound down (a smaller file may still pass); failing
/// moves the lower bound up. Probe errors other than a missing binary
/// count as a failed step.
fn binary_search_quality<E>(
    (mut lo, mut hi): (u8, u8),
    iterations: u32,
    mut probe: E,
) -> Result<Option<(u8, Vec<u8>, MetricResult)>, OptimiseError>
where
    E: FnMut(u8) -> Result<(Vec<u8>, MetricResult, bool), OptimiseError>,
{
    let mut best: Option<(u8, Vec<u8>, MetricResult)> = None;

    for _ in 0..iterations {
        if lo > hi {
            break;
        }
        let q = (lo as u16 + hi as u16) as u8 / 2;

        match probe(q) {
            Ok((bytes, metric, true)) => {
                let better = best
                    .as_ref()
                    .map(|(_, b, _)| bytes.len() < b.len())
                    .unwrap_or(true);
                if better {
                    best = Some((q, bytes, metric));
                }
                if q == 0 {
                    break;
                }
                hi = q - 1;
            }
            Ok((_, _, false)) => {
                if q == u8::MAX {
                    break;
                }
                lo = q + 1;
            }
            Err(e @ OptimiseError::ToolMissing { .. }) => return Err(e),
            Err(e) => {
                tracing::debug!(quality = q, error = %e, "search step failed, treated as miss");
                if q == u8::MAX {
                    break;
                }
                lo = q + 1;
            }
        }
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ssim;

    fn fake_metric(mssim: f64) -> MetricResult {
        MetricResult {
            mssim: Ssim::clamped(mssim),
            edge_ssim: Ssim::clamped(mssim),
            banding_risk: 0.0,
        }
    }

    fn candidate(size: usize, label: &str) -> Candidate {
        Candidate {
            bytes: vec![0u8; size],
            format: ImageKind::Jpeg,
            quality_label: label.to_string(),
            ssim: None,
            banding_risk: None,
        }
    }

    #[test]
    fn test_select_smallest_wins() {
        let selection = select_smallest(
            vec![candidate(500, "q88"), candidate(300, "q76"), candidate(400, "q80")],
            1000,
            false,
        );
        match selection {
            Selection::Selected(c) => assert_eq!(c.quality_label, "q76"),
            other => panic!("expected selection, got {:?}", other),
        }
    }

    #[test]
    fn test_select_rejects_larger_output() {
        let selection = select_smallest(vec![candidate(1200, "q88")], 1000, false);
        assert!(matches!(selection, Selection::AllLarger));

        let selection = select_smallest(vec![candidate(1200, "q88")], 1000, true);
        assert!(matches!(selection, Selection::Selected(_)));
    }

    #[test]
    fn test_select_empty_is_none_accepted() {
        assert!(matches!(
            select_smallest(vec![], 1000, false),
            Selection::NoneAccepted
        ));
    }

    #[test]
    fn test_search_converges_to_lowest_passing_quality() {
        // Pass iff q >= 60; sizes shrink with quality.
        let mut probed = Vec::new();
        let best = binary_search_quality((10, 95), 6, |q| {
            probed.push(q);
            Ok((vec![0u8; q as usize * 10], fake_metric(0.999), q >= 60))
        })
        .unwrap()
        .expect("a passing quality exists");

        assert!(probed.len() <= 6);
        // Every probed quality below 60 failed, so the best passing one
        // is the smallest passing probe.
        let expected = *probed.iter().filter(|&&q| q >= 60).min().unwrap();
        assert_eq!(best.0, expected);
        assert!(best.0 >= 60);
        // Converged reasonably close to the true boundary.
        assert!(best.0 <= 64, "expected near-60, got {}", best.0);
    }

    #[test]
    fn test_search_none_when_nothing_passes() {
        let mut max_seen = 0;
        let best = binary_search_quality((10, 95), 8, |q| {
            max_seen = max_seen.max(q);
            Ok((vec![0u8; 10], fake_metric(0.5), false))
        })
        .unwrap();
        assert!(best.is_none());
        assert!(max_seen <= 95, "search must stay inside its bounds");
    }

    #[test]
    fn test_search_tool_missing_bubbles() {
        let err = binary_search_quality((10, 95), 4, |_| {
            Err::<(Vec<u8>, MetricResult, bool), _>(OptimiseError::ToolMissing {
                tool: "cjpeg".into(),
            })
        })
        .unwrap_err();
        assert!(matches!(err, OptimiseError::ToolMissing { .. }));
    }

    #[test]
    fn test_search_step_error_treated_as_miss() {
        // First probe errors, later probes pass; the search recovers.
        let mut calls = 0;
        let best = binary_search_quality((10, 95), 6, |q| {
            calls += 1;
            if calls == 1 {
                Err(OptimiseError::Encode {
                    tool: "cjpeg".into(),
                    exit_code: Some(2),
                    detail: "boom".into(),
                })
            } else {
                Ok((vec![0u8; q as usize], fake_metric(0.999), true))
            }
        })
        .unwrap();
        assert!(best.is_some());
    }

    #[test]
    fn test_search_iteration_budget_respected() {
        let mut calls = 0;
        let _ = binary_search_quality((10, 95), 4, |q| {
            calls += 1;
            Ok((vec![0u8; q as usize], fake_metric(0.999), false))
        })
        .unwrap();
        assert!(calls <= 4);
    }
}
