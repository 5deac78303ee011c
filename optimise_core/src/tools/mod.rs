//! External encoder runners.
//!
//! Every encoder is an external binary invoked with captured output.
//! The per-call contract is `(input_path, output_path, options) -> Ok
//! bytes | error`; a missing binary aborts that candidate class but not
//! the whole job. Captured output is capped at 8 MiB.

pub mod cwebp;
pub mod mozjpeg;
pub mod oxipng;
pub mod pngquant;

use crate::errors::OptimiseError;
use crate::logging::log_external_tool;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Instant;

pub const MAX_CAPTURED_OUTPUT: usize = 8 * 1024 * 1024;

/// Result of one encoder invocation.
#[derive(Debug)]
pub enum EncodeOutcome {
    Encoded(Vec<u8>),
    /// The encoder declined because the result would not be smaller.
    WouldGrow,
}

#[derive(Debug)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Locations checked before falling back to PATH: next to the current
/// working directory, a packaged `resources` directory beside the
/// executable, and the executable's parent directory.
fn candidate_paths(tool: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let file = binary_file_name(tool);
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(&file));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("resources").join(&file));
            candidates.push(dir.join(&file));
            if let Some(parent) = dir.parent() {
                candidates.push(parent.join(&file));
            }
        }
    }
    candidates
}

fn binary_file_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    }
}

/// Resolve a tool binary, memoizing the lookup in the caller's cell.
pub fn resolve_binary(
    tool: &'static str,
    cell: &OnceLock<Option<PathBuf>>,
) -> Result<PathBuf, OptimiseError> {
    let resolved = cell.get_or_init(|| {
        for candidate in candidate_paths(tool) {
            if candidate.is_file() {
                tracing::debug!(tool, path = ?candidate, "Resolved encoder from candidate list");
                return Some(candidate);
            }
        }
        which::which(tool).ok()
    });

    resolved
        .clone()
        .ok_or(OptimiseError::ToolMissing { tool: tool.into() })
}

/// Spawn the tool and wait for it, capturing stderr for diagnostics.
pub fn run_tool(
    tool: &'static str,
    bin: &Path,
    args: &[String],
) -> Result<ToolOutput, OptimiseError> {
    let start = Instant::now();
    let output = Command::new(bin)
        .args(args)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OptimiseError::ToolMissing { tool: tool.into() },
            _ => OptimiseError::Encode {
                tool: tool.into(),
                exit_code: None,
                detail: format!("failed to spawn: {e}"),
            },
        })?;

    let mut stderr_bytes = output.stderr;
    stderr_bytes.truncate(MAX_CAPTURED_OUTPUT);
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
    let exit_code = output.status.code();

    log_external_tool(tool, args, &stderr, exit_code, start.elapsed());

    Ok(ToolOutput { exit_code, stderr })
}

/// Read the encoder's output file, treating an empty or missing file as
/// an encode failure.
pub fn read_output(tool: &'static str, path: &Path) -> Result<Vec<u8>, OptimiseError> {
    let bytes = std::fs::read(path).map_err(|e| OptimiseError::Encode {
        tool: tool.into(),
        exit_code: None,
        detail: format!("output missing at {}: {e}", path.display()),
    })?;
    if bytes.is_empty() {
        return Err(OptimiseError::Encode {
            tool: tool.into(),
            exit_code: None,
            detail: "encoder produced an empty file".into(),
        });
    }
    Ok(bytes)
}

pub(crate) fn encode_failure(tool: &'static str, out: &ToolOutput) -> OptimiseError {
    OptimiseError::Encode {
        tool: tool.into(),
        exit_code: out.exit_code,
        detail: if out.stderr.trim().is_empty() {
            "no diagnostic output".into()
        } else {
            out.stderr.trim().to_string()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_missing_binary_is_tool_missing() {
        static CELL: OnceLock<Option<PathBuf>> = OnceLock::new();
        let err = resolve_binary("definitely-not-an-encoder-xyz", &CELL).unwrap_err();
        assert!(matches!(err, OptimiseError::ToolMissing { .. }));
        // Second lookup hits the cache and stays consistent.
        let err = resolve_binary("definitely-not-an-encoder-xyz", &CELL).unwrap_err();
        assert!(matches!(err, OptimiseError::ToolMissing { .. }));
    }

    #[test]
    fn test_run_tool_captures_exit_code() {
        static CELL: OnceLock<Option<PathBuf>> = OnceLock::new();
        if let Ok(bin) = resolve_binary("false", &CELL) {
            let out = run_tool("false", &bin, &[]).unwrap();
            assert_eq!(out.exit_code, Some(1));
        }
    }

    #[test]
    fn test_read_output_empty_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.png");
        std::fs::write(&path, b"").unwrap();
        assert!(read_output("oxipng", &path).is_err());
        assert!(read_output("oxipng", &dir.path().join("absent.png")).is_err());
    }
}
