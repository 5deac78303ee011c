//! Small filesystem and formatting helpers used across the engine.

use std::path::{Path, PathBuf};

/// Extensions the pipeline accepts as input, lowercase without the dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "tif", "tiff"];

/// Directory names the input walk never descends into.
pub const IGNORED_DIR_NAMES: &[&str] = &[
    "node_modules",
    ".git",
    ".optimise-backup",
    ".optimise-tmp",
    "Optimized",
    "Originals Backup",
    ".optimise-logs",
];

/// File names dropped regardless of extension.
pub const IGNORED_FILE_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "Desktop.ini"];

/// Suffixes marking partially-downloaded files.
pub const PARTIAL_SUFFIXES: &[&str] = &[".tmp", ".part", ".crdownload", ".download"];

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_lowercase();
            extensions.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

pub fn is_supported_input(path: &Path) -> bool {
    has_extension(path, SUPPORTED_EXTENSIONS)
}

pub fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase())
}

pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('~') || name.starts_with("._")
}

/// True for files that should never be picked up: hidden files, system
/// junk, and partial downloads.
pub fn is_junk_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    if is_hidden_name(name) || IGNORED_FILE_NAMES.contains(&name) {
        return true;
    }
    let lower = name.to_lowercase();
    PARTIAL_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// True when any component of `path` is one of the engine's own output
/// or bookkeeping directories.
pub fn is_inside_ignored_dir(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| IGNORED_DIR_NAMES.contains(&s))
            .unwrap_or(false)
    })
}

pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Encode a full path into a single flat file name, for backup files.
/// Separators and drive colons become underscores.
pub fn path_safe_name(path: &Path) -> String {
    let s = path.to_string_lossy();
    let encoded: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();
    encoded.trim_start_matches('_').to_string()
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.2} GB", b / GIB)
    } else if b >= MIB {
        format!("{:.2} MB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KB", b / KIB)
    } else {
        format!("{} B", bytes)
    }
}

pub fn size_change_percent(input_size: u64, output_size: u64) -> f64 {
    if input_size == 0 {
        return 0.0;
    }
    (1.0 - (output_size as f64 / input_size as f64)) * 100.0
}

/// Longest directory prefix shared by all paths. Files contribute their
/// parent directory. Empty input yields an empty path.
pub fn common_root(paths: &[PathBuf]) -> PathBuf {
    let mut iter = paths.iter().map(|p| {
        if p.is_file() || p.extension().is_some() {
            p.parent().map(Path::to_path_buf).unwrap_or_else(|| p.clone())
        } else {
            p.clone()
        }
    });
    let Some(mut root) = iter.next() else {
        return PathBuf::new();
    };
    for p in iter {
        while !p.starts_with(&root) {
            if !root.pop() {
                return PathBuf::new();
            }
        }
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_extension_case_insensitive() {
        assert!(is_supported_input(Path::new("/a/photo.JPG")));
        assert!(is_supported_input(Path::new("/a/photo.jpeg")));
        assert!(is_supported_input(Path::new("/a/scan.TIFF")));
        assert!(!is_supported_input(Path::new("/a/clip.gif")));
        assert!(!is_supported_input(Path::new("/a/noext")));
    }

    #[test]
    fn test_junk_files() {
        assert!(is_junk_file(Path::new("/a/.DS_Store")));
        assert!(is_junk_file(Path::new("/a/Thumbs.db")));
        assert!(is_junk_file(Path::new("/a/~photo.jpg")));
        assert!(is_junk_file(Path::new("/a/._resource.jpg")));
        assert!(is_junk_file(Path::new("/a/photo.jpg.crdownload")));
        assert!(is_junk_file(Path::new("/a/photo.jpg.part")));
        assert!(!is_junk_file(Path::new("/a/photo.jpg")));
    }

    #[test]
    fn test_ignored_dirs() {
        assert!(is_inside_ignored_dir(Path::new("/p/Optimized/a.jpg")));
        assert!(is_inside_ignored_dir(Path::new(
            "/p/Originals Backup/run/a.jpg"
        )));
        assert!(is_inside_ignored_dir(Path::new("/p/.optimise-logs/x.json")));
        assert!(!is_inside_ignored_dir(Path::new("/p/photos/a.jpg")));
    }

    #[test]
    fn test_path_safe_name() {
        assert_eq!(
            path_safe_name(Path::new("/home/u/pics/a.jpg")),
            "home_u_pics_a.jpg"
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_size_change_percent() {
        assert!((size_change_percent(1000, 500) - 50.0).abs() < 1e-9);
        assert!((size_change_percent(1000, 1500) + 50.0).abs() < 1e-9);
        assert_eq!(size_change_percent(0, 100), 0.0);
    }

    #[test]
    fn test_common_root() {
        let paths = vec![
            PathBuf::from("/data/pics/2024/a.jpg"),
            PathBuf::from("/data/pics/2025/b.png"),
        ];
        assert_eq!(common_root(&paths), PathBuf::from("/data/pics"));

        let single = vec![PathBuf::from("/data/pics/a.jpg")];
        assert_eq!(common_root(&single), PathBuf::from("/data/pics"));

        assert_eq!(common_root(&[]), PathBuf::new());
    }

    #[test]
    fn test_common_root_disjoint() {
        let paths = vec![PathBuf::from("/a/x.jpg"), PathBuf::from("/b/y.jpg")];
        assert_eq!(common_root(&paths), PathBuf::from("/"));
    }
}
