//! Memory tier: a byte-budgeted LRU of [`CachedSegment`] values.
//!
//! `lru::LruCache` bounds by entry *count*; this tier needs a byte budget
//! instead, so capacity is set to `usize::MAX` and eviction is driven
//! manually off a running byte total, the same trick `mesio-engine`'s
//! `BufferPool` uses for its own size-tracked pool (`crates/mesio/src/hls/buffer_pool.rs`).

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::key::SegmentKey;

/// Bytes held in the memory tier for one segment, plus the full resource
/// length when known.
#[derive(Clone, Debug)]
pub struct CachedSegment {
    pub bytes: Bytes,
    pub total_bytes: u64,
}

pub struct MemoryTier {
    budget: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    lru: LruCache<SegmentKey, CachedSegment>,
    current_bytes: u64,
}

/// A demoted entry returned by [`MemoryTier::put`] so the caller can write
/// it to the disk tier outside of the memory lock.
pub struct Demoted {
    pub key: SegmentKey,
    pub segment: CachedSegment,
}

impl MemoryTier {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            inner: Mutex::new(Inner {
                lru: LruCache::new(NonZeroUsize::new(usize::MAX).unwrap()),
                current_bytes: 0,
            }),
        }
    }

    /// Read a segment, promoting it to most-recently-used.
    pub fn get(&self, key: &SegmentKey) -> Option<CachedSegment> {
        self.inner.lock().lru.get(key).cloned()
    }

    /// Whether `size` fits in the memory tier at all (spec 4.B: values
    /// larger than the budget bypass the memory tier entirely).
    pub fn fits(&self, size: u64) -> bool {
        size <= self.budget
    }

    /// Insert a segment, evicting least-recently-used entries until the
    /// budget is respected. Returns the entries evicted so the caller can
    /// demote them to disk.
    pub fn put(&self, key: SegmentKey, segment: CachedSegment) -> Vec<Demoted> {
        let size = segment.bytes.len() as u64;
        let mut inner = self.inner.lock();

        if let Some(old) = inner.lru.peek(&key) {
            inner.current_bytes = inner.current_bytes.saturating_sub(old.bytes.len() as u64);
        }
        inner.lru.put(key, segment);
        inner.current_bytes += size;

        let mut evicted = Vec::new();
        while inner.current_bytes > self.budget {
            match inner.lru.pop_lru() {
                Some((evicted_key, evicted_segment)) => {
                    inner.current_bytes = inner
                        .current_bytes
                        .saturating_sub(evicted_segment.bytes.len() as u64);
                    evicted.push(Demoted {
                        key: evicted_key,
                        segment: evicted_segment,
                    });
                }
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&self, key: &SegmentKey) -> Option<CachedSegment> {
        let mut inner = self.inner.lock();
        let removed = inner.lru.pop(key);
        if let Some(segment) = &removed {
            inner.current_bytes = inner.current_bytes.saturating_sub(segment.bytes.len() as u64);
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.current_bytes = 0;
    }

    pub fn current_bytes(&self) -> u64 {
        self.inner.lock().current_bytes
    }
}

pub type SharedMemoryTier = Arc<MemoryTier>;

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(len: usize) -> CachedSegment {
        CachedSegment {
            bytes: Bytes::from(vec![0u8; len]),
            total_bytes: len as u64,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let tier = MemoryTier::new(1_000);
        let key = SegmentKey::new("fp", 0, Some(99));
        tier.put(key.clone(), seg(100));
        let got = tier.get(&key).unwrap();
        assert_eq!(got.bytes.len(), 100);
    }

    #[test]
    fn eviction_respects_budget() {
        let tier = MemoryTier::new(150);
        let a = SegmentKey::new("fp", 0, Some(99));
        let b = SegmentKey::new("fp", 100, Some(199));
        tier.put(a.clone(), seg(100));
        let evicted = tier.put(b.clone(), seg(100));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, a);
        assert!(tier.get(&a).is_none());
        assert!(tier.get(&b).is_some());
        assert!(tier.current_bytes() <= 150);
    }

    #[test]
    fn value_exceeding_budget_does_not_fit() {
        let tier = MemoryTier::new(50);
        assert!(!tier.fits(100));
    }

    #[test]
    fn get_promotes_to_most_recently_used() {
        let tier = MemoryTier::new(150);
        let a = SegmentKey::new("fp", 0, Some(99));
        let b = SegmentKey::new("fp", 100, Some(199));
        tier.put(a.clone(), seg(100));
        tier.put(b.clone(), seg(0));
        tier.get(&a);
        let c = SegmentKey::new("fp", 200, Some(299));
        let evicted = tier.put(c, seg(100));
        assert_eq!(evicted[0].key, b);
    }
}
