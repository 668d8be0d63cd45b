//! Disk tier: a byte-budgeted LRU over files under `<root>/videos`.
//!
//! Access order is tracked in-process rather than via filesystem mtime
//! (spec 4.B: mtime is unreliable as an eviction signal). On cold start the
//! tier walks `<root>/videos` and seeds its index in directory-walk order.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::key::SegmentKey;
use crate::error::{ProxyError, Result};

#[derive(Clone, Debug)]
struct DiskEntry {
    path: PathBuf,
    size: u64,
}

pub struct DiskTier {
    root: PathBuf,
    budget: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    lru: LruCache<SegmentKey, DiskEntry>,
    current_bytes: u64,
}

impl DiskTier {
    /// Open (and cold-start scan) the disk tier rooted at `root`.
    pub fn new(root: PathBuf, budget: u64) -> Self {
        let videos_dir = root.join("videos");
        let mut lru = LruCache::new(NonZeroUsize::new(usize::MAX).unwrap());
        let mut current_bytes = 0u64;

        if let Ok(entries) = std::fs::read_dir(&videos_dir) {
            for fingerprint_entry in entries.flatten() {
                let fingerprint_path = fingerprint_entry.path();
                if !fingerprint_path.is_dir() {
                    continue;
                }
                let Some(fingerprint) = fingerprint_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Ok(file_entries) = std::fs::read_dir(&fingerprint_path) else {
                    continue;
                };
                for file_entry in file_entries.flatten() {
                    let path = file_entry.path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let Some((key, size)) = parse_file_name(fingerprint, name, &path) else {
                        continue;
                    };
                    current_bytes += size;
                    lru.put(key, DiskEntry { path, size });
                }
            }
        }

        debug!(root = %root.display(), entries = lru.len(), current_bytes, "disk tier cold start scan");

        Self {
            root,
            budget,
            inner: Mutex::new(Inner { lru, current_bytes }),
        }
    }

    fn path_for(&self, key: &SegmentKey) -> PathBuf {
        self.root
            .join("videos")
            .join(&key.fingerprint)
            .join(key.file_name())
    }

    /// Promote-on-access: returns the file path if present, bumping its
    /// recency.
    pub fn get_file(&self, key: &SegmentKey) -> Option<PathBuf> {
        self.inner.lock().lru.get(key).map(|e| e.path.clone())
    }

    /// Write `bytes` to disk and register the resulting file, evicting
    /// least-recently-used entries (deleting their files) until the budget
    /// is respected. The write itself runs off the lock; only index
    /// mutation is serialized.
    pub async fn write_and_register(&self, key: SegmentKey, bytes: bytes::Bytes) -> Result<PathBuf> {
        let path = self.path_for(&key);
        let parent = path.clone();
        let parent_dir = parent.parent().map(Path::to_path_buf);
        let write_path = path.clone();
        let size = bytes.len() as u64;

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(dir) = &parent_dir {
                std::fs::create_dir_all(dir).map_err(|source| ProxyError::CacheIoFailure {
                    path: dir.clone(),
                    source,
                })?;
            }
            std::fs::write(&write_path, &bytes).map_err(|source| ProxyError::CacheIoFailure {
                path: write_path.clone(),
                source,
            })
        })
        .await
        .map_err(|e| ProxyError::origin_protocol(format!("disk write task panicked: {e}")))??;

        let evicted = {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.lru.peek(&key) {
                inner.current_bytes = inner.current_bytes.saturating_sub(old.size);
            }
            inner.lru.put(key.clone(), DiskEntry { path: path.clone(), size });
            inner.current_bytes += size;

            let mut evicted = Vec::new();
            while inner.current_bytes > self.budget {
                match inner.lru.pop_lru() {
                    Some((_, entry)) => {
                        inner.current_bytes = inner.current_bytes.saturating_sub(entry.size);
                        evicted.push(entry);
                    }
                    None => break,
                }
            }
            evicted
        };

        for entry in evicted {
            remove_file_and_empty_parent(&entry.path).await;
        }

        Ok(path)
    }

    pub async fn remove(&self, key: &SegmentKey) {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.lru.pop(key);
            if let Some(e) = &entry {
                inner.current_bytes = inner.current_bytes.saturating_sub(e.size);
            }
            entry
        };
        if let Some(entry) = entry {
            remove_file_and_empty_parent(&entry.path).await;
        }
    }

    /// A consistent snapshot of `key -> path`, as required so the registry
    /// can compute on-disk cached bytes without observing concurrent
    /// mutation.
    pub fn storage_map(&self) -> HashMap<SegmentKey, PathBuf> {
        let inner = self.inner.lock();
        inner
            .lru
            .iter()
            .map(|(k, e)| (k.clone(), e.path.clone()))
            .collect()
    }

    pub fn current_bytes(&self) -> u64 {
        self.inner.lock().current_bytes
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, entry) in inner.lru.iter() {
            let _ = std::fs::remove_file(&entry.path);
        }
        inner.lru.clear();
        inner.current_bytes = 0;
    }
}

async fn remove_file_and_empty_parent(path: &Path) {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        if std::fs::remove_file(&path).is_ok() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::remove_dir(parent);
            }
        }
    })
    .await;
    if let Err(e) = result {
        warn!(error = %e, "disk tier eviction cleanup task panicked");
    }
}

fn parse_file_name(fingerprint: &str, file_name: &str, path: &Path) -> Option<(SegmentKey, u64)> {
    let (start_str, end_str) = file_name.split_once('-')?;
    let start_range: u64 = start_str.parse().ok()?;
    let end_range = if end_str.is_empty() {
        None
    } else {
        end_str.parse().ok()
    };
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    Some((
        SegmentKey::new(fingerprint.to_string(), start_range, end_range),
        size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn write_then_get_round_trips() {
        let dir = std::env::temp_dir().join(format!("mediarelay-disk-test-{}", std::process::id()));
        let tier = DiskTier::new(dir.clone(), 1_000);
        let key = SegmentKey::new("fp", 0, Some(9));
        let path = tier.write_and_register(key.clone(), Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(tier.get_file(&key), Some(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn eviction_deletes_file_and_respects_budget() {
        let dir = std::env::temp_dir().join(format!("mediarelay-disk-test-{}", std::process::id() as u64 + 1));
        let tier = DiskTier::new(dir.clone(), 12);
        let a = SegmentKey::new("fp", 0, Some(9));
        let b = SegmentKey::new("fp", 10, Some(19));
        let path_a = tier.write_and_register(a.clone(), Bytes::from_static(b"0123456789")).await.unwrap();
        tier.write_and_register(b.clone(), Bytes::from_static(b"0123456789")).await.unwrap();
        assert!(tier.get_file(&a).is_none());
        assert!(!path_a.exists());
        assert!(tier.current_bytes() <= 12);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cold_start_reconstructs_index_from_filenames() {
        let dir = std::env::temp_dir().join(format!("mediarelay-disk-coldstart-{}", std::process::id()));
        let fp_dir = dir.join("videos").join("abc123");
        std::fs::create_dir_all(&fp_dir).unwrap();
        std::fs::write(fp_dir.join("0-9"), b"0123456789").unwrap();
        std::fs::write(fp_dir.join("10-"), b"tail").unwrap();

        let tier = DiskTier::new(dir.clone(), 1_000_000);
        assert!(tier.get_file(&SegmentKey::new("abc123", 0, Some(9))).is_some());
        assert!(tier.get_file(&SegmentKey::new("abc123", 10, None)).is_some());
        assert_eq!(tier.current_bytes(), 14);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
