//! Pool of warm [`FastIndex`] values shared across the buffer pool (spec §4.3
//! "Fast-index pool"): "a fast index is 'stolen' from the least-recently-
//! searched buffer" is implemented here as plain LRU eviction, grounded in the
//! teacher's general cache idiom (the `lru` crate is already part of the
//! teacher's dependency stack, used by `pager::mod` for its page cache).

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use crate::page::{FastIndex, PageId};
use crate::volume::VolumeId;

/// Shared cache mapping a page to its (possibly stale) fast index.
pub struct FastIndexPool {
    cache: Mutex<LruCache<(VolumeId, PageId), FastIndex>>,
}

impl FastIndexPool {
    /// Builds a pool holding at most `capacity` fast indexes.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        FastIndexPool {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached fast index for `(volume, page)`, if any, marking it
    /// most-recently-used.
    pub fn get(&self, volume: VolumeId, page: PageId) -> Option<FastIndex> {
        self.cache.lock().get(&(volume, page)).cloned()
    }

    /// Installs (or replaces) the fast index for `(volume, page)`.
    pub fn put(&self, volume: VolumeId, page: PageId, index: FastIndex) {
        self.cache.lock().put((volume, page), index);
    }

    /// Drops any cached fast index for `(volume, page)`; called whenever a
    /// structural change invalidates it (spec §3: "invalidated on any
    /// structural change to the page").
    pub fn invalidate(&self, volume: VolumeId, page: PageId) {
        self.cache.lock().pop(&(volume, page));
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// True if the pool holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_invalidates() {
        let pool = FastIndexPool::new(2);
        let idx = FastIndex::build(&[0, 1, 1]);
        pool.put(VolumeId(1), PageId(1), idx.clone());
        assert_eq!(pool.get(VolumeId(1), PageId(1)), Some(idx));
        pool.invalidate(VolumeId(1), PageId(1));
        assert_eq!(pool.get(VolumeId(1), PageId(1)), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let pool = FastIndexPool::new(1);
        pool.put(VolumeId(1), PageId(1), FastIndex::build(&[0]));
        pool.put(VolumeId(1), PageId(2), FastIndex::build(&[0]));
        assert!(pool.get(VolumeId(1), PageId(1)).is_none());
        assert!(pool.get(VolumeId(1), PageId(2)).is_some());
    }
}
