//! oxipng runner (lossless PNG recompression).

use super::{encode_failure, read_output, resolve_binary, run_tool};
use crate::errors::OptimiseError;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TOOL: &str = "oxipng";

static BIN: OnceLock<Option<PathBuf>> = OnceLock::new();

pub fn is_available() -> bool {
    resolve_binary(TOOL, &BIN).is_ok()
}

pub fn optimize(input: &Path, strip: bool, workdir: &Path) -> Result<Vec<u8>, OptimiseError> {
    let bin = resolve_binary(TOOL, &BIN)?;

    let output = workdir.join(format!(
        "oxipng-{}.png",
        input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".into())
    ));

    let mut args = vec!["-o".to_string(), "4".to_string()];
    if strip {
        args.push("--strip".to_string());
        args.push("all".to_string());
    }
    args.push("--out".to_string());
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
        let err = optimize(&input, true, dir.path()).unwrap_err();
        assert!(matches!(err, OptimiseError::ToolMissing { .. }));
    }
}
