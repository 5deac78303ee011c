//! cwebp runner (WebP encoding).

use super::{encode_failure, read_output, resolve_binary, run_tool};
use crate::errors::OptimiseError;
use crate::types::Quality;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TOOL: &str = "cwebp";

static BIN: OnceLock<Option<PathBuf>> = OnceLock::new();

pub fn is_available() -> bool {
    resolve_binary(TOOL, &BIN).is_ok()
}

#[derive(Debug, Clone, Copy)]
pub struct CwebpOptions {
    pub quality: Quality,
    /// Compression effort, clamped to [4, 6] at settings entry.
    pub effort: u8,
    pub near_lossless: bool,
    pub keep_metadata: bool,
}

pub fn encode(
    input: &Path,
    options: CwebpOptions,
    workdir: &Path,
) -> Result<Vec<u8>, OptimiseError> {
    let bin = resolve_binary(TOOL, &BIN)?;

    let output = workdir.join(format!(
        "cwebp-{}q{}.webp",
        if options.near_lossless { "nl" } else { "" },
        options.quality.get()
    ));

    let mut args = vec![
        "-m".to_string(),
        options.effort.to_string(),
        "-metadata".to_string(),
        (if options.keep_metadata { "all" } else { "none" }).to_string(),
    ];
    if options.near_lossless {
        args.push("-near_lossless".to_string());
        args.push(options.quality.get().to_string());
        args.push("-q".to_string());
        args.push("100".to_string());
    } else {
        args.push("-q".to_string());
        args.push(options.quality.get().to_string());
    }
    args.push("-o".to_string());
    args.push(output.to_string_lossy().into_owned());
    args.push(input.to_string_lossy().into_owned());

    let out = run_tool(TOOL, &bin, &args)?;
    if out.exit_code != Some(0) {
        return Err(encode_failure(TOOL, &out));
    }

    read_output(TOOL, &output)
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
        let err = encode(
            &input,
            CwebpOptions {
                quality: Quality::clamped(80),
                effort: 5,
                near_lossless: false,
                keep_metadata: false,
            },
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, OptimiseError::ToolMissing { .. }));
    }
}
