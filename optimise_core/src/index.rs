//! Processed-file index for the watch service.
//!
//! Maps absolute paths to fingerprints; an unchanged fingerprint means
//! the file was already optimized and a watch event for it is skipped.
//! The in-memory map is mutex-guarded; persistence runs on a background
//! flusher with a dirty flag so marking a file never blocks ingestion.

use crate::errors::OptimiseError;
use crate::writer::write_file_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INDEX_FILE: &str = "processed-index.json";
const INDEX_VERSION: u32 = 1;

/// Leading/trailing window hashed for large files.
const PARTIAL_CHUNK: u64 = 1024 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: i64,
    pub hash: String,
}

/// Fingerprint a file: size, mtime, and a hash of the first and last
/// MiB (the whole file when it is small).
pub fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let meta = std::fs::metadata(path)?;
    let size = meta.len();
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(Fingerprint {
        size,
        mtime,
        hash: partial_content_hash(path, size)?,
    })
}

pub fn partial_content_hash(path: &Path, size: u64) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();

    if size <= PARTIAL_CHUNK * 2 {
        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf)?;
        hasher.update(&buf);
    } else {
        let mut head = vec![0u8; PARTIAL_CHUNK as usize];
        file.read_exact(&mut head)?;
        hasher.update(&head);

        file.seek(SeekFrom::End(-(PARTIAL_CHUNK as i64)))?;
        let mut tail = vec![0u8; PARTIAL_CHUNK as usize];
        file.read_exact(&mut tail)?;
        hasher.update(&tail);
    }

    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    index: HashMap<String, Fingerprint>,
}

struct Inner {
    path: PathBuf,
    map: Mutex<HashMap<String, Fingerprint>>,
    dirty: AtomicBool,
    stop: AtomicBool,
}

impl Inner {
    fn flush(&self) -> Result<(), OptimiseError> {
        let snapshot = {
            let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
            IndexFile {
                version: INDEX_VERSION,
                index: map.clone(),
            }
        };
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| anyhow::anyhow!(e))?;
        write_file_atomic(&self.path, &json)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ProcessedIndex {
    inner: Arc<Inner>,
    flusher: Option<std::thread::JoinHandle<()>>,
}

impl ProcessedIndex {
    /// Load (or start empty) and begin the background flusher.
    pub fn load(path: PathBuf) -> Self {
        let map = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
                Ok(file) if file.version == INDEX_VERSION => file.index,
                Ok(file) => {
                    tracing::warn!(version = file.version, "processed index version mismatch, starting fresh");
                    HashMap::new()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "processed index unreadable, starting fresh");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        let inner = Arc::new(Inner {
            path,
            map: Mutex::new(map),
            dirty: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let flusher_inner = Arc::clone(&inner);
        let flusher = std::thread::Builder::new()
            .name("optimise-index-flusher".into())
            .spawn(move || loop {
                std::thread::sleep(FLUSH_INTERVAL);
                if flusher_inner.stop.load(Ordering::SeqCst) {
                    break;
                }
                if flusher_inner.dirty.load(Ordering::SeqCst) {
                    if let Err(e) = flusher_inner.flush() {
                        tracing::warn!(error = %e, "processed index flush failed");
                    }
                }
            })
            .ok();

        Self { inner, flusher }
    }

    pub fn len(&self) -> usize {
        self.inner
            .map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identical fingerprint means the file was processed before.
    pub fn is_processed(&self, path: &Path, current: &Fingerprint) -> bool {
        let key = path.to_string_lossy().into_owned();
        let map = self.inner.map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&key) == Some(current)
    }

    pub fn mark_processed(&self, path: &Path, fp: Fingerprint) {
        let key = path.to_string_lossy().into_owned();
        self.inner
            .map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, fp);
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    pub fn forget(&self, path: &Path) {
        let key = path.to_string_lossy().into_owned();
        let removed = self
            .inner
            .map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
            .is_some();
        if removed {
            self.inner.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Synchronous flush, for shutdown and tests.
    pub fn flush_now(&self) -> Result<(), OptimiseError> {
        self.inner.flush()
    }
}

impl Drop for ProcessedIndex {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if self.inner.dirty.load(Ordering::SeqCst) {
            let _ = self.inner.flush();
        }
        // The flusher wakes at most one interval later and exits; not
        // worth blocking drop on the join.
        if let Some(handle) = self.flusher.take() {
            drop(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"hello").unwrap();
        let fp1 = fingerprint(&path).unwrap();
        assert_eq!(fp1.size, 5);

        std::fs::write(&path, b"world!").unwrap();
        let fp2 = fingerprint(&path).unwrap();
        assert_ne!(fp1, fp2);
        assert_ne!(fp1.hash, fp2.hash);
    }

    #[test]
    fn test_partial_hash_covers_head_and_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let size = (PARTIAL_CHUNK * 3) as usize;
        let mut data = vec![0u8; size];
        std::fs::write(&path, &data).unwrap();
        let h1 = partial_content_hash(&path, size as u64).unwrap();

        // A change in the first MiB is seen...
        data[10] = 1;
        std::fs::write(&path, &data).unwrap();
        let h2 = partial_content_hash(&path, size as u64).unwrap();
        assert_ne!(h1, h2);

        // ...and a change in the last MiB is seen.
        data[10] = 0;
        data[size - 10] = 1;
        std::fs::write(&path, &data).unwrap();
        let h3 = partial_content_hash(&path, size as u64).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_index_roundtrip() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join(INDEX_FILE);
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"content").unwrap();
        let fp = fingerprint(&file).unwrap();

        {
            let index = ProcessedIndex::load(index_path.clone());
            assert!(!index.is_processed(&file, &fp));
            index.mark_processed(&file, fp.clone());
            assert!(index.is_processed(&file, &fp));
            index.flush_now().unwrap();
        }

        let reloaded = ProcessedIndex::load(index_path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.is_processed(&file, &fp));
    }

    #[test]
    fn test_changed_fingerprint_not_processed() {
        let dir = TempDir::new().unwrap();
        let index = ProcessedIndex::load(dir.path().join(INDEX_FILE));
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"v1").unwrap();
        let fp1 = fingerprint(&file).unwrap();
        index.mark_processed(&file, fp1);

        std::fs::write(&file, b"v2-longer").unwrap();
        let fp2 = fingerprint(&file).unwrap();
        assert!(!index.is_processed(&file, &fp2));
    }

    #[test]
    fn test_forget() {
        let dir = TempDir::new().unwrap();
        let index = ProcessedIndex::load(dir.path().join(INDEX_FILE));
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"x").unwrap();
        let fp = fingerprint(&file).unwrap();
        index.mark_processed(&file, fp.clone());
        index.forget(&file);
        assert!(!index.is_processed(&file, &fp));
        assert!(index.is_empty());
    }

    #[test]
    fn test_index_file_format() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join(INDEX_FILE);
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"x").unwrap();
        let index = ProcessedIndex::load(index_path.clone());
        index.mark_processed(&file, fingerprint(&file).unwrap());
        index.flush_now().unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&index_path).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["index"].is_object());
        let entry = &value["index"][file.to_string_lossy().as_ref()];
        assert!(entry["size"].is_u64());
        assert!(entry["mtime"].is_i64());
        assert!(entry["hash"].is_string());
    }
}
