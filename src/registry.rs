//! Process-wide pre-cache deduplication and cached-video snapshotting
//! (spec §3 "Registry").

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::cache::{CacheStore, SegmentKey};
use crate::task::{DownloadTask, TaskRegistry};

/// One cached (or partially cached) byte range, merged from live task
/// state and a one-shot walk of the disk tier.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CachedVideoInfo {
    pub key: SegmentKey,
    pub url: String,
    pub start_range: u64,
    pub end_range: Option<u64>,
    pub cached_bytes: u64,
    pub total_bytes: u64,
    pub cache_dir: Option<PathBuf>,
}

/// Indexes active pre-cache keys so `precache`/`precacheByte` calls for a
/// key already in flight return `None` instead of starting a duplicate
/// run (spec §8 scenario 3: "Second call returns null (deduped)").
pub struct DownloadCacheRegistry {
    active: Mutex<HashSet<SegmentKey>>,
}

impl DownloadCacheRegistry {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Returns `true` if `key` was not already active and is now marked
    /// so, `false` if a pre-cache run for it is already in flight.
    pub fn try_begin_precache(&self, key: SegmentKey) -> bool {
        self.active.lock().insert(key)
    }

    pub fn end_precache(&self, key: &SegmentKey) {
        self.active.lock().remove(key);
    }

    pub fn is_active(&self, key: &SegmentKey) -> bool {
        self.active.lock().contains(key)
    }

    /// Merge live `TaskRegistry` entries with the disk tier's storage map.
    /// A key present in both takes its URL and progress from the live
    /// task; a disk-only key (no in-memory task, e.g. after a process
    /// restart) has no recoverable URL, per spec §3's "no sidecar
    /// metadata files".
    pub fn snapshot(&self, tasks: &TaskRegistry, cache: &CacheStore) -> Vec<CachedVideoInfo> {
        let mut by_key: HashMap<SegmentKey, CachedVideoInfo> = HashMap::new();

        for task in tasks.all_tasks() {
            by_key.insert(task.segment_key(), info_from_task(&task));
        }

        for (key, path) in cache.storage_map() {
            by_key.entry(key.clone()).or_insert_with(|| CachedVideoInfo {
                start_range: key.start_range,
                end_range: key.end_range,
                url: String::new(),
                cached_bytes: 0,
                total_bytes: 0,
                cache_dir: Some(path.clone()),
                key,
            });
        }

        let mut snapshot: Vec<_> = by_key.into_values().collect();
        snapshot.sort_by(|a, b| (a.key.fingerprint.clone(), a.start_range).cmp(&(b.key.fingerprint.clone(), b.start_range)));
        snapshot
    }
}

impl Default for DownloadCacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn info_from_task(task: &std::sync::Arc<DownloadTask>) -> CachedVideoInfo {
    CachedVideoInfo {
        key: task.segment_key(),
        url: task.uri.clone(),
        start_range: task.start_range,
        end_range: task.end_range,
        cached_bytes: task.downloaded_bytes(),
        total_bytes: task.total_bytes(),
        cache_dir: None,
    }
}
