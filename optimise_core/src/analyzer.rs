//! Image loading, format detection and content analysis.
//!
//! Content features are extracted from a downscaled luminance plane (at
//! most 1024 px on the longest edge) and drive the smart search bias:
//! graphics get a raised quality floor to avoid ringing artifacts.

use crate::common;
use crate::errors::OptimiseError;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::path::Path;

/// Formats the pipeline decodes and encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
    Tiff,
}

impl ImageKind {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match common::extension_lowercase(path)?.as_str() {
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "png" => Some(ImageKind::Png),
            "webp" => Some(ImageKind::Webp),
            "tif" | "tiff" => Some(ImageKind::Tiff),
            _ => None,
        }
    }

    /// Extension used for produced outputs. JPEG writes `.jpg`.
    pub fn output_extension(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Webp => "webp",
            ImageKind::Tiff => "tiff",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpeg",
            ImageKind::Png => "png",
            ImageKind::Webp => "webp",
            ImageKind::Tiff => "tiff",
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            ImageKind::Jpeg => ImageFormat::Jpeg,
            ImageKind::Png => ImageFormat::Png,
            ImageKind::Webp => ImageFormat::WebP,
            ImageKind::Tiff => ImageFormat::Tiff,
        }
    }

    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(ImageKind::Jpeg),
            ImageFormat::Png => Some(ImageKind::Png),
            ImageFormat::WebP => Some(ImageKind::Webp),
            ImageFormat::Tiff => Some(ImageKind::Tiff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub has_alpha: bool,
    pub kind: ImageKind,
}

/// Decode original bytes, rejecting formats outside the supported set.
pub fn decode_image(path: &Path, bytes: &[u8]) -> Result<(DynamicImage, ImageInfo), OptimiseError> {
    let reader = ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| OptimiseError::Decode {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

    let format = reader.format().ok_or_else(|| OptimiseError::Decode {
        path: path.to_path_buf(),
        detail: "unrecognized image container".to_string(),
    })?;

    let kind = ImageKind::from_image_format(format).ok_or_else(|| OptimiseError::Unsupported {
        path: path.to_path_buf(),
        detail: format!("{:?} is not a supported input format", format),
    })?;

    let img = reader.decode().map_err(|e| OptimiseError::Decode {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let (width, height) = img.dimensions();
    let color = img.color();

    Ok((
        img,
        ImageInfo {
            width,
            height,
            channels: color.channel_count(),
            has_alpha: color.has_alpha(),
            kind,
        },
    ))
}

/// Width/height without a full decode, for directory scans.
pub fn probe_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::image_dimensions(path).ok()
}

/// Content classification extracted from a downscaled luminance plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentFeatures {
    /// Mean Sobel-X gradient magnitude.
    pub edge_density: f64,
    /// Mean absolute Laplacian response.
    pub texture_level: f64,
    /// Fraction of pixels whose gradient magnitude is below 10.
    pub flat_ratio: f64,
    pub grayscale: bool,
    pub is_photo: bool,
}

const ANALYSIS_MAX_EDGE: u32 = 1024;
const FLAT_GRADIENT_LIMIT: f64 = 10.0;

pub fn analyze_content(img: &DynamicImage) -> ContentFeatures {
    let (w, h) = img.dimensions();
    let sample = if w.max(h) > ANALYSIS_MAX_EDGE {
        let scale = ANALYSIS_MAX_EDGE as f64 / w.max(h) as f64;
        let nw = ((w as f64 * scale) as u32).max(1);
        let nh = ((h as f64 * scale) as u32).max(1);
        img.resize_exact(nw, nh, image::imageops::FilterType::Triangle)
    } else {
        img.clone()
    };

    let grayscale = detect_grayscale(&sample);
    let luma = sample.to_luma8();
    let (sw, sh) = (luma.width() as usize, luma.height() as usize);

    if sw < 3 || sh < 3 {
        return ContentFeatures {
            edge_density: 0.0,
            texture_level: 0.0,
            flat_ratio: 1.0,
            grayscale,
            is_photo: false,
        };
    }

    let px = |x: usize, y: usize| -> f64 { luma.get_pixel(x as u32, y as u32)[0] as f64 };

    let mut sobel_sum = 0.0;
    let mut laplacian_sum = 0.0;
    let mut flat_count = 0usize;
    let mut samples = 0usize;

    for y in 1..sh - 1 {
        for x in 1..sw - 1 {
            // Sobel X kernel on the 3x3 neighbourhood.
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
            let gradient = (gx * gx + gy * gy).sqrt();

            sobel_sum += gx.abs();
            if gradient < FLAT_GRADIENT_LIMIT {
                flat_count += 1;
            }

            let laplacian =
                4.0 * px(x, y) - px(x - 1, y) - px(x + 1, y) - px(x, y - 1) - px(x, y + 1);
            laplacian_sum += laplacian.abs();

            samples += 1;
        }
    }

    let n = samples.max(1) as f64;
    let edge_density = sobel_sum / n;
    let texture_level = laplacian_sum / n;
    let flat_ratio = flat_count as f64 / n;
    let is_photo = texture_level > 5.0 && flat_ratio < 0.8;

    ContentFeatures {
        edge_density,
        texture_level,
        flat_ratio,
        grayscale,
        is_photo,
    }
}

fn detect_grayscale(img: &DynamicImage) -> bool {
    let rgb = img.to_rgb8();
    // Stride over the sample; exact equality across channels.
    for p in rgb.pixels().step_by(97) {
        if p[0] != p[1] || p[1] != p[2] {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(w: u32, h: u32, c: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |_, _| Rgb(c)))
    }

    fn noisy(w: u32, h: u32, seed: u32) -> DynamicImage {
        let mut rng = seed;
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |_, _| {
            rng = rng.wrapping_mul(1103515245).wrapping_add(12345);
            let v = ((rng >> 16) & 0xFF) as u8;
            rng = rng.wrapping_mul(1103515245).wrapping_add(12345);
            let g = ((rng >> 16) & 0xFF) as u8;
            Rgb([v, g, v.wrapping_add(g)])
        }))
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(
            ImageKind::from_extension(Path::new("a.JPG")),
            Some(ImageKind::Jpeg)
        );
        assert_eq!(
            ImageKind::from_extension(Path::new("a.tif")),
            Some(ImageKind::Tiff)
        );
        assert_eq!(ImageKind::from_extension(Path::new("a.gif")), None);
    }

    #[test]
    fn test_output_extension() {
        assert_eq!(ImageKind::Jpeg.output_extension(), "jpg");
        assert_eq!(ImageKind::Webp.output_extension(), "webp");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_image(Path::new("/x.jpg"), b"not an image").unwrap_err();
        assert!(matches!(err, OptimiseError::Decode { .. }));
    }

    #[test]
    fn test_decode_png_roundtrip() {
        let img = solid(32, 16, [10, 20, 30]);
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let (decoded, info) = decode_image(Path::new("/x.png"), &buf).unwrap();
        assert_eq!(info.kind, ImageKind::Png);
        assert_eq!(info.width, 32);
        assert_eq!(info.height, 16);
        assert_eq!(decoded.dimensions(), (32, 16));
    }

    #[test]
    fn test_flat_image_is_graphic() {
        let features = analyze_content(&solid(128, 128, [200, 200, 200]));
        assert!(features.flat_ratio > 0.95);
        assert!(features.texture_level < 1.0);
        assert!(!features.is_photo);
        assert!(features.grayscale);
    }

    #[test]
    fn test_noisy_image_is_photo() {
        let features = analyze_content(&noisy(128, 128, 7));
        assert!(
            features.texture_level > 5.0,
            "noise should produce texture, got {}",
            features.texture_level
        );
        assert!(features.flat_ratio < 0.8);
        assert!(features.is_photo);
        assert!(!features.grayscale);
    }

    #[test]
    fn test_tiny_image_features() {
        let features = analyze_content(&solid(2, 2, [0, 0, 0]));
        assert_eq!(features.flat_ratio, 1.0);
        assert!(!features.is_photo);
    }
}
