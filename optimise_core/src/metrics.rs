//! Perceptual comparison of an original frame against an encoded
//! candidate.
//!
//! MSSIM (multi-scale SSIM, 11x11 Gaussian window per Wang et al. 2004)
//! is the decision variable for candidate acceptance. Edge-SSIM reports
//! structural fidelity of edges specifically. Banding risk is a
//! block-sampled heuristic that vetoes candidates which collapse colour
//! gradation in flat regions; the block sampler is seeded so repeated
//! runs measure identical blocks.

use crate::types::Ssim;
use anyhow::{anyhow, Result};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage};
use rayon::prelude::*;

const K1: f64 = 0.01;
const K2: f64 = 0.03;
const L: f64 = 255.0;
const C1: f64 = (K1 * L) * (K1 * L);
const C2: f64 = (K2 * L) * (K2 * L);

const WINDOW_SIZE: usize = 11;

const BANDING_BLOCK_SIZE: u32 = 32;
const BANDING_BLOCK_SAMPLES: u32 = 10;
/// Horizontal neighbour delta below which a block counts as flat.
const BANDING_FLAT_DELTA: i32 = 5;
const BANDING_DEFAULT_SEED: u32 = 0x0511_ca7e;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricResult {
    pub mssim: Ssim,
    pub edge_ssim: Ssim,
    pub banding_risk: f64,
}

/// Decode two encoded buffers and compare them. The candidate frame is
/// resized to the base frame's dimensions so comparison is always
/// pixel-aligned.
pub fn compare_buffers(base: &[u8], candidate: &[u8]) -> Result<MetricResult> {
    let base_img =
        image::load_from_memory(base).map_err(|e| anyhow!("base frame decode failed: {e}"))?;
    let cand_img = image::load_from_memory(candidate)
        .map_err(|e| anyhow!("candidate frame decode failed: {e}"))?;
    compare_frames(&base_img, &cand_img)
}

pub fn compare_frames(base: &DynamicImage, candidate: &DynamicImage) -> Result<MetricResult> {
    let base_rgb = flatten_alpha(base);
    let mut cand_rgb = flatten_alpha(candidate);

    if cand_rgb.dimensions() != base_rgb.dimensions() {
        let (w, h) = base_rgb.dimensions();
        cand_rgb = image::imageops::resize(&cand_rgb, w, h, FilterType::Lanczos3);
    }

    let base_gray = image::imageops::grayscale(&base_rgb);
    let cand_gray = image::imageops::grayscale(&cand_rgb);

    let mssim = ms_ssim(&base_gray, &cand_gray)
        .ok_or_else(|| anyhow!("frames too small for multi-scale SSIM"))?;

    let edge_ssim = ssim(&sobel_magnitude(&base_gray), &sobel_magnitude(&cand_gray))
        .unwrap_or(1.0);

    let banding_risk = banding_risk(&base_rgb, &cand_rgb, BANDING_DEFAULT_SEED);

    Ok(MetricResult {
        mssim: Ssim::clamped(mssim),
        edge_ssim: Ssim::clamped(edge_ssim),
        banding_risk,
    })
}

/// Composite any alpha channel over white so transparent regions do not
/// read as structural differences.
fn flatten_alpha(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let a = src[3] as u32;
        for c in 0..3 {
            dst[c] = ((src[c] as u32 * a + 255 * (255 - a)) / 255) as u8;
        }
    }
    out
}

fn gaussian_window() -> [[f64; WINDOW_SIZE]; WINDOW_SIZE] {
    let sigma = 1.5;
    let center = (WINDOW_SIZE / 2) as f64;
    let mut window = [[0.0f64; WINDOW_SIZE]; WINDOW_SIZE];
    let mut sum = 0.0;
    for (i, row) in window.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            let x = i as f64 - center;
            let y = j as f64 - center;
            let g = (-((x * x + y * y) / (2.0 * sigma * sigma))).exp();
            *cell = g;
            sum += g;
        }
    }
    for row in &mut window {
        for cell in row.iter_mut() {
            *cell /= sum;
        }
    }
    window
}

pub fn ssim(a: &GrayImage, b: &GrayImage) -> Option<f64> {
    if a.dimensions() != b.dimensions() {
        return None;
    }
    let width = a.width() as usize;
    let height = a.height() as usize;

    if width < WINDOW_SIZE || height < WINDOW_SIZE {
        return ssim_global(a, b);
    }

    let window = gaussian_window();
    let valid_w = width - WINDOW_SIZE + 1;
    let valid_h = height - WINDOW_SIZE + 1;

    let rows: Vec<usize> = (0..valid_h).collect();
    let sum: f64 = rows
        .par_iter()
        .map(|&y| {
            let mut row_sum = 0.0;
            for x in 0..valid_w {
                row_sum += window_ssim(a, b, x, y, &window);
            }
            row_sum
        })
        .sum();

    Some(sum / (valid_w * valid_h) as f64)
}

fn window_ssim(
    a: &GrayImage,
    b: &GrayImage,
    x: usize,
    y: usize,
    window: &[[f64; WINDOW_SIZE]; WINDOW_SIZE],
) -> f64 {
    let mut mean_x = 0.0;
    let mut mean_y = 0.0;
    let mut buf_x = [[0.0f64; WINDOW_SIZE]; WINDOW_SIZE];
    let mut buf_y = [[0.0f64; WINDOW_SIZE]; WINDOW_SIZE];

    for (i, row) in window.iter().enumerate() {
        for (j, &w) in row.iter().enumerate() {
            let vx = a.get_pixel((x + j) as u32, (y + i) as u32)[0] as f64;
            let vy = b.get_pixel((x + j) as u32, (y + i) as u32)[0] as f64;
            buf_x[i][j] = vx;
            buf_y[i][j] = vy;
            mean_x += w * vx;
            mean_y += w * vy;
        }
    }

    let mut var_x = 0.0;
    let mut var_y = 0.0;
    let mut cov = 0.0;
    for (i, row) in window.iter().enumerate() {
        for (j, &w) in row.iter().enumerate() {
            let dx = buf_x[i][j] - mean_x;
            let dy = buf_y[i][j] - mean_y;
            var_x += w * dx * dx;
            var_y += w * dy * dy;
            cov += w * dx * dy;
        }
    }

    ((2.0 * mean_x * mean_y + C1) * (2.0 * cov + C2))
        / ((mean_x * mean_x + mean_y * mean_y + C1) * (var_x + var_y + C2))
}

/// Single-window fallback for frames smaller than the Gaussian window.
fn ssim_global(a: &GrayImage, b: &GrayImage) -> Option<f64> {
    let n = (a.width() * a.height()) as f64;
    if n < 2.0 {
        return None;
    }

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xx = 0.0;
    let mut sum_yy = 0.0;
    let mut sum_xy = 0.0;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let x = pa[0] as f64;
        let y = pb[0] as f64;
        sum_x += x;
        sum_y += y;
        sum_xx += x * x;
        sum_yy += y * y;
        sum_xy += x * y;
    }

    let mean_x = sum_x / n;
    let mean_y = sum_y / n;
    let n1 = n - 1.0;
    let var_x = (sum_xx - n * mean_x * mean_x) / n1;
    let var_y = (sum_yy - n * mean_y * mean_y) / n1;
    let cov = (sum_xy - n * mean_x * mean_y) / n1;

    let numerator = (2.0 * mean_x * mean_y + C1) * (2.0 * cov + C2);
    let denominator = (mean_x * mean_x + mean_y * mean_y + C1) * (var_x + var_y + C2);
    if denominator < 1e-10 {
        return Some(1.0);
    }
    Some(numerator / denominator)
}

/// Multi-scale SSIM, five dyadic scales with the standard weights.
pub fn ms_ssim(a: &GrayImage, b: &GrayImage) -> Option<f64> {
    const WEIGHTS: [f64; 5] = [0.0448, 0.2856, 0.3001, 0.2363, 0.1333];

    let mut cur_a = a.clone();
    let mut cur_b = b.clone();
    let mut product = 1.0;
    let mut used_weight = 0.0;

    for (i, &weight) in WEIGHTS.iter().enumerate() {
        if (cur_a.width() as usize) < WINDOW_SIZE || (cur_a.height() as usize) < WINDOW_SIZE {
            break;
        }
        if let Some(s) = ssim(&cur_a, &cur_b) {
            // Negative window means can produce slightly negative SSIM;
            // clamp before the fractional power.
            product *= s.max(0.0).powf(weight);
            used_weight += weight;
        }
        if i < WEIGHTS.len() - 1 {
            let (w, h) = (cur_a.width() / 2, cur_a.height() / 2);
            if w == 0 || h == 0 {
                break;
            }
            cur_a = image::imageops::resize(&cur_a, w, h, FilterType::Lanczos3);
            cur_b = image::imageops::resize(&cur_b, w, h, FilterType::Lanczos3);
        }
    }

    if used_weight < 1e-10 {
        // Frames smaller than one window at every scale: fall back to
        // the global estimator so tiny icons still get a score.
        return ssim_global(a, b);
    }
    Some(product.powf(1.0 / used_weight))
}

fn sobel_magnitude(gray: &GrayImage) -> GrayImage {
    let w = gray.width() as i64;
    let h = gray.height() as i64;
    let mut out = GrayImage::new(gray.width(), gray.height());
    if w < 3 || h < 3 {
        return out;
    }
    let px = |x: i64, y: i64| -> f64 { gray.get_pixel(x as u32, y as u32)[0] as f64 };
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
            let mag = (gx * gx + gy * gy).sqrt().min(255.0);
            out.put_pixel(x as u32, y as u32, image::Luma([mag as u8]));
        }
    }
    out
}

/// Deterministic block sampler. Same generator family as the analyzer's
/// synthetic-noise tests, so block positions are stable across runs.
struct Lcg(u32);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        self.0 >> 16
    }
}

/// Estimate loss of colour gradation: sample flat blocks of the base
/// frame and accrue risk where the candidate holds substantially fewer
/// distinct colours.
pub fn banding_risk(base: &RgbImage, candidate: &RgbImage, seed: u32) -> f64 {
    let (w, h) = base.dimensions();
    if w < BANDING_BLOCK_SIZE || h < BANDING_BLOCK_SIZE {
        return 0.0;
    }
    if candidate.dimensions() != (w, h) {
        return 0.0;
    }

    let mut rng = Lcg(seed);
    let mut risk = 0.0;

    for _ in 0..BANDING_BLOCK_SAMPLES {
        let bx = rng.next() % (w - BANDING_BLOCK_SIZE + 1);
        let by = rng.next() % (h - BANDING_BLOCK_SIZE + 1);

        if !block_is_flat(base, bx, by) {
            continue;
        }

        let base_colors = distinct_colors(base, bx, by);
        let cand_colors = distinct_colors(candidate, bx, by);

        if base_colors > 1 && (cand_colors as f64) < base_colors as f64 * 0.75 {
            let deficit = 1.0 - cand_colors as f64 / base_colors as f64;
            risk += deficit / BANDING_BLOCK_SAMPLES as f64;
        }
    }

    risk.clamp(0.0, 1.0)
}

fn block_is_flat(img: &RgbImage, bx: u32, by: u32) -> bool {
    for y in by..by + BANDING_BLOCK_SIZE {
        for x in bx..bx + BANDING_BLOCK_SIZE - 1 {
            let a = img.get_pixel(x, y);
            let b = img.get_pixel(x + 1, y);
            for c in 0..3 {
                if (a[c] as i32 - b[c] as i32).abs() > BANDING_FLAT_DELTA {
                    return false;
                }
            }
        }
    }
    true
}

fn distinct_colors(img: &RgbImage, bx: u32, by: u32) -> usize {
    let mut colors = std::collections::HashSet::new();
    for y in by..by + BANDING_BLOCK_SIZE {
        for x in bx..bx + BANDING_BLOCK_SIZE {
            let p = img.get_pixel(x, y);
            colors.insert((p[0], p[1], p[2]));
        }
    }
    colors.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                ((x * 255) / w.max(1)) as u8,
                ((y * 255) / h.max(1)) as u8,
                128,
            ])
        }))
    }

    #[test]
    fn test_identical_frames_perfect_score() {
        let img = gradient(64, 64);
        let result = compare_frames(&img, &img).unwrap();
        assert!(
            result.mssim.value() > 0.999,
            "identical frames should score ~1.0, got {}",
            result.mssim
        );
        assert!(result.banding_risk < 1e-9);
    }

    #[test]
    fn test_different_frames_low_score() {
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([255, 255, 255])));
        let black = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([0, 0, 0])));
        let result = compare_frames(&white, &black).unwrap();
        assert!(result.mssim.value() < 0.1);
    }

    #[test]
    fn test_dimension_mismatch_is_aligned() {
        let big = gradient(128, 128);
        let small = gradient(64, 64);
        // The candidate gets resized up to the base dimensions; the
        // gradient survives resampling, so the score stays high.
        let result = compare_frames(&big, &small).unwrap();
        assert!(result.mssim.value() > 0.8, "got {}", result.mssim);
    }

    #[test]
    fn test_alpha_flattened_over_white() {
        let transparent = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            32,
            32,
            image::Rgba([0, 0, 0, 0]),
        ));
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([255, 255, 255])));
        let result = compare_frames(&transparent, &white).unwrap();
        assert!(result.mssim.value() > 0.999);
    }

    #[test]
    fn test_banding_detects_posterized_flat_gradient() {
        // Subtle horizontal ramp: flat by the ≤5-delta rule but rich in
        // distinct colours.
        let base = RgbImage::from_fn(64, 64, |x, _| {
            let v = 100 + (x / 2) as u8;
            Rgb([v, v, v])
        });
        // Posterized candidate: collapses to a handful of levels.
        let cand = RgbImage::from_fn(64, 64, |x, _| {
            let v = 100 + ((x / 16) * 8) as u8;
            Rgb([v, v, v])
        });
        let risk = banding_risk(&base, &cand, 42);
        assert!(risk > 0.05, "posterization should accrue risk, got {risk}");
    }

    #[test]
    fn test_banding_deterministic() {
        let base = RgbImage::from_fn(64, 64, |x, _| Rgb([(100 + x / 2) as u8; 3]));
        let cand = RgbImage::from_fn(64, 64, |_, _| Rgb([110; 3]));
        assert_eq!(banding_risk(&base, &cand, 7), banding_risk(&base, &cand, 7));
    }

    #[test]
    fn test_banding_small_frame_zero() {
        let img = RgbImage::new(16, 16);
        assert_eq!(banding_risk(&img, &img, 1), 0.0);
    }

    #[test]
    fn test_ssim_small_image_global_path() {
        let a = image::GrayImage::from_pixel(8, 8, image::Luma([100]));
        let b = image::GrayImage::from_pixel(8, 8, image::Luma([100]));
        let s = ssim(&a, &b).unwrap();
        assert!((s - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_compare_buffers_decodes() {
        let img = gradient(48, 48);
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let result = compare_buffers(&png, &png).unwrap();
        assert!(result.mssim.value() > 0.999);
    }

    #[test]
    fn test_compare_buffers_rejects_garbage() {
        assert!(compare_buffers(b"junk", b"junk").is_err());
    }
}
