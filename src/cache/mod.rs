//! Two-tier (memory → disk) LRU byte cache (component 4.B).

mod disk;
mod key;
mod memory;

pub use disk::DiskTier;
pub use key::SegmentKey;
pub use memory::CachedSegment;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use memory::MemoryTier;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::Result;

/// Facade over the memory and disk tiers presenting the operations spec
/// §4.B enumerates: `get`, `put`, `getFile`, `putFile`, `remove`,
/// `storageMap`, `clear`.
pub struct CacheStore {
    memory: MemoryTier,
    disk: DiskTier,
}

impl CacheStore {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            memory: MemoryTier::new(config.memory_cache_size),
            disk: DiskTier::new(config.resolved_cache_root(), config.storage_cache_size),
        }
    }

    /// Memory hit returns immediately; a disk hit is promoted into memory
    /// (demoting further LRU entries to disk as needed) before returning.
    pub async fn get(&self, key: &SegmentKey) -> Option<Bytes> {
        if let Some(segment) = self.memory.get(key) {
            return Some(segment.bytes);
        }

        let path = self.disk.get_file(key)?;
        let bytes = tokio::fs::read(&path).await.ok()?;
        let bytes = Bytes::from(bytes);
        let total_bytes = bytes.len() as u64;
        if self.memory.fits(total_bytes) {
            self.demote_all(self.memory.put(
                key.clone(),
                CachedSegment {
                    bytes: bytes.clone(),
                    total_bytes,
                },
            ))
            .await;
        }
        Some(bytes)
    }

    /// Memory-first insertion with demotion: entries evicted from memory
    /// to make room are written to the disk tier. A value too large for
    /// the memory budget bypasses memory and is written to disk directly.
    pub async fn put(&self, key: SegmentKey, bytes: Bytes, total_bytes: u64) -> Result<()> {
        if self.memory.fits(bytes.len() as u64) {
            let evicted = self.memory.put(key, CachedSegment { bytes, total_bytes });
            self.demote_all(evicted).await;
            Ok(())
        } else {
            self.disk.write_and_register(key, bytes).await.map(|_| ())
        }
    }

    async fn demote_all(&self, evicted: Vec<memory::Demoted>) {
        for demoted in evicted {
            if let Err(err) = self
                .disk
                .write_and_register(demoted.key.clone(), demoted.segment.bytes)
                .await
            {
                debug!(key = %demoted.key, error = %err, "failed to demote evicted segment to disk");
            }
        }
    }

    /// Query the disk tier for an existing file without forcing a memory
    /// promotion.
    pub fn get_file(&self, key: &SegmentKey) -> Option<PathBuf> {
        self.disk.get_file(key)
    }

    /// Whether `key` is present in either tier, without reading its bytes.
    pub fn contains(&self, key: &SegmentKey) -> bool {
        self.memory.get(key).is_some() || self.disk.get_file(key).is_some()
    }

    /// The full-resource length recorded alongside a memory-tier hit, if
    /// known. The disk tier carries no such metadata (spec 4.B: "no
    /// sidecar metadata files"), so a disk-only hit yields `None` here.
    pub fn memory_total_bytes(&self, key: &SegmentKey) -> Option<u64> {
        self.memory.get(key).map(|s| s.total_bytes)
    }

    /// Register externally-produced bytes directly into the disk tier,
    /// for pipelines that stream straight to disk without an in-memory
    /// accumulator.
    pub async fn put_file(&self, key: SegmentKey, bytes: Bytes) -> Result<PathBuf> {
        self.disk.write_and_register(key, bytes).await
    }

    pub async fn remove(&self, key: &SegmentKey) {
        self.memory.remove(key);
        self.disk.remove(key).await;
    }

    /// Consistent snapshot of the disk tier's `key -> file` mapping.
    pub fn storage_map(&self) -> HashMap<SegmentKey, PathBuf> {
        self.disk.storage_map()
    }

    pub fn clear(&self) {
        self.memory.clear();
        self.disk.clear();
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory.current_bytes()
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk.current_bytes()
    }
}

pub type SharedCacheStore = Arc<CacheStore>;
