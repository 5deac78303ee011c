//! MozJPEG (`cjpeg`) runner.
//!
//! cjpeg refuses JPEG input, so the source frame is materialized as a
//! binary P6 PPM in the scratch directory first.

use super::{encode_failure, read_output, resolve_binary, run_tool};
use crate::errors::OptimiseError;
use crate::types::Quality;
use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use image::{DynamicImage, ImageEncoder};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TOOL: &str = "cjpeg";

static BIN: OnceLock<Option<PathBuf>> = OnceLock::new();

pub fn is_available() -> bool {
    resolve_binary(TOOL, &BIN).is_ok()
}

pub fn encode(
    image: &DynamicImage,
    quality: Quality,
    workdir: &Path,
) -> Result<Vec<u8>, OptimiseError> {
    let bin = resolve_binary(TOOL, &BIN)?;

    let input = workdir.join("source.ppm");
    write_ppm(image, &input)?;

    let output = workdir.join(format!("cjpeg-q{}.jpg", quality.get()));
    let args = vec![
        "-quality".to_string(),
        quality.get().to_string(),
        "-progressive".to_string(),
        "-optimize".to_string(),
        "-outfile".to_string(),
        output.to_string_lossy().into_owned(),
        input.to_string_lossy().into_owned(),
    ];

    let out = run_tool(TOOL, &bin, &args)?;
    if out.exit_code != Some(0) {
        return Err(encode_failure(TOOL, &out));
    }

    read_output(TOOL, &output)
}

fn write_ppm(image: &DynamicImage, path: &Path) -> Result<(), OptimiseError> {
    let rgb = image.to_rgb8();
    let file = std::fs::File::create(path).map_err(|e| OptimiseError::from_io(path, e))?;
    let writer = std::io::BufWriter::new(file);
    PnmEncoder::new(writer)
        .with_subtype(PnmSubtype::Pixmap(SampleEncoding::Binary))
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| OptimiseError::Encode {
            tool: TOOL.into(),
            exit_code: None,
            detail: format!("failed to write PPM scratch frame: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ppm_scratch_is_p6() {
        let dir = TempDir::new().unwrap();
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            4,
            4,
            image::Rgb([255, 0, 0]),
        ));
        let path = dir.path().join("frame.ppm");
        write_ppm(&img, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P6"), "binary pixmap magic expected");
        // Header + 4*4*3 raw samples.
        assert!(bytes.len() > 48);
    }

    #[test]
    fn test_missing_binary_aborts_candidate_class() {
        if is_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(4, 4));
        let err = encode(&img, Quality::clamped(80), dir.path()).unwrap_err();
        assert!(matches!(err, OptimiseError::ToolMissing { .. }));
    }
}
