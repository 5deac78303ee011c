//! Output path planning.
//!
//! Subfolder mode mirrors the input's path relative to the common root
//! under `<common_root>/Optimized/`; replace mode targets the original
//! location. The produced extension always follows the produced format,
//! so TIFF inputs transcoded to JPEG land as `.jpg`.

use crate::analyzer::ImageKind;
use crate::settings::OutputMode;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const OPTIMIZED_DIR_NAME: &str = "Optimized";

/// Longest stem kept when composing temp-file names, so the final name
/// stays inside 255-byte limits with the timestamp/rand suffix added.
const TEMP_STEM_MAX: usize = 80;

#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub name: &'a str,
    pub ext: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: &'a str,
    pub scale: &'a str,
    pub hash: &'a str,
}

pub fn apply_template(template: &str, vars: &TemplateVars) -> String {
    template
        .replace("{name}", vars.name)
        .replace("{ext}", vars.ext)
        .replace("{width}", &vars.width.to_string())
        .replace("{height}", &vars.height.to_string())
        .replace("{format}", vars.format)
        .replace("{scale}", vars.scale)
        .replace("{hash}", vars.hash)
}

/// Best-effort retina detection: an explicit `@2x` in the file name, or
/// even dimensions on both axes.
pub fn scale_suffix(file_name: &str, width: u32, height: u32) -> &'static str {
    if file_name.contains("@2x.") || (width % 2 == 0 && height % 2 == 0 && width > 0) {
        "@2x"
    } else {
        ""
    }
}

/// First eight hex digits of the content's SHA-256.
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct OutputPlanner<'a> {
    pub common_root: &'a Path,
    pub output_mode: OutputMode,
    pub naming_template: &'a str,
}

impl<'a> OutputPlanner<'a> {
    /// Plan the output path for one input. `claimed` is the set of
    /// paths already allocated in this run; colliding plans get `-2`,
    /// `-3`, ... appended to the stem.
    pub fn plan(
        &self,
        input: &Path,
        output_format: ImageKind,
        dimensions: (u32, u32),
        content_hash: &str,
        claimed: &mut HashSet<PathBuf>,
    ) -> PathBuf {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let file_name = input
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let ext = output_format.output_extension();

        let path = match self.output_mode {
            OutputMode::Replace => {
                // Same format overwrites in place, keeping the exact
                // original name (a `.jpeg` stays `.jpeg`); a format
                // change (the WebP conversion path) lands next to the
                // original.
                if ImageKind::from_extension(input) == Some(output_format) {
                    input.to_path_buf()
                } else {
                    input.with_extension(ext)
                }
            }
            OutputMode::Subfolder => {
                let vars = TemplateVars {
                    name: stem,
                    ext,
                    width: dimensions.0,
                    height: dimensions.1,
                    format: output_format.name(),
                    scale: scale_suffix(file_name, dimensions.0, dimensions.1),
                    hash: content_hash,
                };
                let rendered = apply_template(self.naming_template, &vars);

                let relative_dir = input
                    .strip_prefix(self.common_root)
                    .ok()
                    .and_then(|rel| rel.parent())
                    .unwrap_or(Path::new(""));

                self.common_root
                    .join(OPTIMIZED_DIR_NAME)
                    .join(relative_dir)
                    .join(rendered)
            }
        };

        let resolved = resolve_collision(path, claimed);
        claimed.insert(resolved.clone());
        resolved
    }
}

fn resolve_collision(path: PathBuf, claimed: &HashSet<PathBuf>) -> PathBuf {
    if !claimed.contains(&path) {
        return path;
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();
    for n in 2.. {
        let candidate = path.with_file_name(if ext.is_empty() {
            format!("{stem}-{n}")
        } else {
            format!("{stem}-{n}.{ext}")
        });
        if !claimed.contains(&candidate) {
            return candidate;
        }
    }
    unreachable!("collision counter exhausted");
}

/// Temp-file name next to `target`: truncated stem, timestamp and a
/// random component, `.tmp` suffix.
pub fn temp_file_name(target: &Path, timestamp_ms: i64, rand: u32) -> String {
    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let truncated: String = stem.chars().take(TEMP_STEM_MAX).collect();
    format!("{truncated}.{timestamp_ms}.{rand:08x}.tmp")
}
