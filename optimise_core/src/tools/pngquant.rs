//! pngquant runner (lossy PNG palette quantization).

use super::{encode_failure, read_output, resolve_binary, run_tool, EncodeOutcome};
use crate::errors::OptimiseError;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TOOL: &str = "pngquant";

/// 99: the quality floor was unreachable; 98: `--skip-if-larger`
/// triggered. Either way the original must be kept.
const EXIT_QUALITY_UNREACHABLE: i32 = 99;
const EXIT_SKIP_IF_LARGER: i32 = 98;

static BIN: OnceLock<Option<PathBuf>> = OnceLock::new();

pub fn is_available() -> bool {
    resolve_binary(TOOL, &BIN).is_ok()
}

pub fn quantize(
    input: &Path,
    quality_min: u8,
    quality_max: u8,
    strip: bool,
    workdir: &Path,
) -> Result<EncodeOutcome, OptimiseError> {
    let bin = resolve_binary(TOOL, &BIN)?;

    let output = workdir.join(format!("pngquant-{quality_min}-{quality_max}.png"));
    let mut args = vec![
        "--quality".to_string(),
        format!("{quality_min}-{quality_max}"),
        "--speed".to_string(),
        "1".to_string(),
        "--skip-if-larger".to_string(),
        "--force".to_string(),
    ];
    if strip {
        args.push("--strip".to_string());
    }
    args.push("--output".to_string());
    args.push(output.to_string_lossy().into_owned());
    args.push(input.to_string_lossy().into_owned());

    let out = run_tool(TOOL, &bin, &args)?;
    match out.exit_code {
        Some(0) => Ok(EncodeOutcome::Encoded(read_output(TOOL, &output)?)),
        Some(EXIT_QUALITY_UNREACHABLE) | Some(EXIT_SKIP_IF_LARGER) => Ok(EncodeOutcome::WouldGrow),
        _ => Err(encode_failure(TOOL, &out)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_tool_missing() {
        if is_available() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("in.png");
        std::fs::write(&input, b"png").unwrap();
        let err = quantize(&input, 80, 95, true, dir.path()).unwrap_err();
        assert!(matches!(err, OptimiseError::ToolMissing { .. }));
    }
}
