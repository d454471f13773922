//! Fixed-size page cache with per-page reader/writer claims (spec §4.3).
//!
//! Grounded in `src/primitives/pager/frame.rs`'s `Frame`/`FrameState` shape and
//! the RAII-guard idiom of `src/primitives/concurrency/mod.rs`, but reworked
//! into an arena of stable-index slots per the re-architecture guidance in
//! spec §9 ("model cyclic buffer <-> fast-index references as arenas with
//! stable indices").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::page::PageId;
use crate::pager::lock_manager::{LockManager, TaskId};
use crate::volume::VolumeId;

/// Abstraction the buffer pool reads through and writes back to on eviction or
/// checkpoint copy; implemented by `volume::Volume`. Kept as a trait (matching
/// the teacher's `PageStore` abstraction in `primitives/pager`) so the buffer
/// pool and B-tree layers do not depend on the concrete volume file format.
pub trait PageSource: Send + Sync {
    /// Reads one page's raw bytes (including its generic header).
    fn read_page(&self, volume: VolumeId, page: PageId) -> Result<Vec<u8>>;
    /// Writes one page's raw bytes back to its home address.
    fn write_page(&self, volume: VolumeId, page: PageId, data: &[u8]) -> Result<()>;
    /// Configured page size for this source.
    fn page_size(&self) -> usize;
    /// Allocates a fresh page, preferring a reclaimed garbage-chain page over
    /// growing the volume (spec §4.5/§6).
    fn allocate_page(&self) -> Result<PageId>;
    /// Returns `page` to the garbage chain for future reuse.
    fn free_page(&self, page: PageId) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct FrameKey {
    volume: VolumeId,
    page: PageId,
}

struct Frame {
    key: Option<FrameKey>,
    data: Vec<u8>,
    dirty: bool,
    generation: u64,
}

impl Frame {
    fn empty(page_size: usize) -> Self {
        Frame {
            key: None,
            data: vec![0u8; page_size],
            dirty: false,
            generation: 0,
        }
    }
}

#[derive(Default)]
struct ClaimState {
    readers: HashMap<TaskId, u32>,
    writer: Option<(TaskId, u32)>,
}

impl ClaimState {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    fn reader_count(&self) -> usize {
        self.readers.len()
    }
}

struct Slot {
    frame: Mutex<Frame>,
    claim: Mutex<ClaimState>,
    claim_changed: Condvar,
}

impl Slot {
    fn new(page_size: usize) -> Self {
        Slot {
            frame: Mutex::new(Frame::empty(page_size)),
            claim: Mutex::new(ClaimState::default()),
            claim_changed: Condvar::new(),
        }
    }
}

/// A claimed page, released automatically on drop.
pub struct PageGuard<'p> {
    pool: &'p BufferPool,
    slot: usize,
    task: TaskId,
    writer: bool,
}

impl<'p> PageGuard<'p> {
    /// Read-only view of the page bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.pool.slots[self.slot].frame.lock().data.clone()
    }

    /// True if this guard holds the writer claim.
    pub fn is_writer(&self) -> bool {
        self.writer
    }

    /// Applies `f` to the page's mutable bytes and marks the frame dirty.
    /// Panics (via `debug_assert!`) if called on a reader claim, since that
    /// would silently bypass the writer-exclusivity invariant.
    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(self.writer, "with_bytes_mut called without a writer claim");
        let mut frame = self.pool.slots[self.slot].frame.lock();
        let r = f(&mut frame.data);
        frame.dirty = true;
        frame.generation += 1;
        r
    }

    /// True if the underlying frame has unflushed modifications.
    pub fn is_dirty(&self) -> bool {
        self.pool.slots[self.slot].frame.lock().dirty
    }

    /// Attempts to upgrade a reader claim to a writer claim without blocking.
    /// On failure the caller must `drop` this guard and reacquire as a writer
    /// (spec §4.3: "failure forces release and reacquire to avoid deadlock").
    pub fn try_upgrade(&mut self) -> bool {
        if self.writer {
            return true;
        }
        let mut claim = self.pool.slots[self.slot].claim.lock();
        if claim.writer.is_none() && claim.readers.len() == 1 && claim.readers.contains_key(&self.task)
        {
            claim.readers.remove(&self.task);
            claim.writer = Some((self.task, 1));
            self.writer = true;
            true
        } else {
            false
        }
    }
}

impl<'p> Drop for PageGuard<'p> {
    fn drop(&mut self) {
        self.pool.release(self.slot, self.task, self.writer);
    }
}

/// A fixed-size, claim-based cache of pages from one or more volumes.
pub struct BufferPool {
    slots: Vec<Slot>,
    index: Mutex<HashMap<FrameKey, usize>>,
    clock_hand: Mutex<usize>,
    lock_manager: Arc<LockManager>,
    page_size: usize,
}

impl BufferPool {
    /// Builds a pool with room for `capacity` pages of `page_size` bytes each.
    pub fn new(capacity: usize, page_size: usize, lock_manager: Arc<LockManager>) -> Self {
        let slots = (0..capacity).map(|_| Slot::new(page_size)).collect();
        BufferPool {
            slots,
            index: Mutex::new(HashMap::new()),
            clock_hand: Mutex::new(0),
            lock_manager,
            page_size,
        }
    }

    /// Number of page slots in the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Acquires a claim on `(volume, page)`, reading through `source` if the
    /// page is not already cached (or if `must_read` forces a fresh read even
    /// when cached metadata looks current). Blocks, subject to `deadline`,
    /// until the requested claim is available.
    pub fn get<'p>(
        &'p self,
        source: &dyn PageSource,
        volume: VolumeId,
        page: PageId,
        writer: bool,
        must_read: bool,
        task: TaskId,
        deadline: Duration,
    ) -> Result<PageGuard<'p>> {
        let key = FrameKey { volume, page };
        let slot_idx = self.resolve_slot(source, key, must_read)?;
        self.acquire_claim(slot_idx, task, writer, deadline)?;
        self.lock_manager.record_claim(task);
        Ok(PageGuard {
            pool: self,
            slot: slot_idx,
            task,
            writer,
        })
    }

    fn resolve_slot(&self, source: &dyn PageSource, key: FrameKey, must_read: bool) -> Result<usize> {
        {
            let index = self.index.lock();
            if let Some(&slot) = index.get(&key) {
                if !must_read {
                    return Ok(slot);
                }
            }
        }
        // Miss (or forced re-read): load from the source, then find or evict a
        // slot to hold it.
        let data = source.read_page(key.volume, key.page)?;
        let mut index = self.index.lock();
        if let Some(&slot) = index.get(&key) {
            let mut frame = self.slots[slot].frame.lock();
            frame.data = data;
            frame.dirty = false;
            return Ok(slot);
        }
        let slot = self.evict_victim(source)?;
        {
            let mut frame = self.slots[slot].frame.lock();
            frame.key = Some(key);
            frame.data = data;
            frame.dirty = false;
            frame.generation += 1;
        }
        index.insert(key, slot);
        Ok(slot)
    }

    /// Scans for an unclaimed, clean slot (clock algorithm starting at the
    /// shared hand); if none is free, writes back one dirty, unclaimed slot
    /// first (spec §4.3 "Eviction").
    fn evict_victim(&self, source: &dyn PageSource) -> Result<usize> {
        let n = self.slots.len();
        if n == 0 {
            return Err(Error::InUse);
        }
        let start = {
            let mut hand = self.clock_hand.lock();
            let s = *hand;
            *hand = (*hand + 1) % n;
            s
        };
        // First pass: unclaimed and clean.
        for i in 0..n {
            let idx = (start + i) % n;
            let claim = self.slots[idx].claim.lock();
            if claim.is_free() {
                let frame = self.slots[idx].frame.lock();
                if !frame.dirty {
                    drop(frame);
                    drop(claim);
                    self.evict_slot(idx);
                    return Ok(idx);
                }
            }
        }
        // Second pass: unclaimed, write back the first dirty one found.
        for i in 0..n {
            let idx = (start + i) % n;
            let claim = self.slots[idx].claim.lock();
            if claim.is_free() {
                drop(claim);
                self.flush_slot(source, idx)?;
                self.evict_slot(idx);
                return Ok(idx);
            }
        }
        Err(Error::InUse)
    }

    fn evict_slot(&self, idx: usize) {
        let mut index = self.index.lock();
        let mut frame = self.slots[idx].frame.lock();
        if let Some(key) = frame.key.take() {
            index.remove(&key);
        }
        frame.dirty = false;
    }

    /// Writes a dirty, unclaimed slot back to its volume home. The journal
    /// manager is responsible for having already durably recorded the `PA`
    /// image before this is called during normal checkpoint-driven eviction;
    /// this path is the last-resort "clean pass" eviction described in spec
    /// §4.3 and is only reached when the pool is fully pinned otherwise.
    fn flush_slot(&self, source: &dyn PageSource, idx: usize) -> Result<()> {
        let mut frame = self.slots[idx].frame.lock();
        if let Some(key) = frame.key {
            if frame.dirty {
                source.write_page(key.volume, key.page, &frame.data)?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    fn acquire_claim(&self, slot: usize, task: TaskId, writer: bool, deadline: Duration) -> Result<()> {
        let slot_ref = &self.slots[slot];
        let start = Instant::now();
        let mut claim = slot_ref.claim.lock();
        loop {
            if writer {
                let can_take = match claim.writer {
                    Some((holder, _)) => holder == task,
                    None => claim.readers.is_empty() || (claim.reader_count() == 1 && claim.readers.contains_key(&task)),
                };
                if can_take {
                    if let Some((holder, count)) = claim.writer {
                        if holder == task {
                            claim.writer = Some((holder, count + 1));
                            return Ok(());
                        }
                    }
                    claim.readers.remove(&task);
                    claim.writer = Some((task, 1));
                    return Ok(());
                }
            } else if claim.writer.is_none() || claim.writer.map(|(h, _)| h) == Some(task) {
                *claim.readers.entry(task).or_insert(0) += 1;
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(Error::TimedOut);
            }
            let remaining = deadline - elapsed;
            let timed_out = slot_ref
                .claim_changed
                .wait_for(&mut claim, remaining)
                .timed_out();
            if timed_out {
                return Err(Error::TimedOut);
            }
        }
    }

    fn release(&self, slot: usize, task: TaskId, writer: bool) {
        let slot_ref = &self.slots[slot];
        {
            let mut claim = slot_ref.claim.lock();
            if writer {
                if let Some((holder, count)) = claim.writer {
                    debug_assert_eq!(holder, task);
                    if count > 1 {
                        claim.writer = Some((holder, count - 1));
                    } else {
                        claim.writer = None;
                    }
                }
            } else if let Some(count) = claim.readers.get_mut(&task) {
                if *count > 1 {
                    *count -= 1;
                } else {
                    claim.readers.remove(&task);
                }
            }
        }
        slot_ref.claim_changed.notify_all();
        self.lock_manager.record_release(task);
    }

    /// Page size this pool was configured with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as StdMutex;

    struct MemSource {
        pages: StdMutex<HashMap<(VolumeId, PageId), Vec<u8>>>,
        page_size: usize,
    }

    impl PageSource for MemSource {
        fn read_page(&self, volume: VolumeId, page: PageId) -> Result<Vec<u8>> {
            Ok(self
                .pages
                .lock()
                .get(&(volume, page))
                .cloned()
                .unwrap_or_else(|| vec![0u8; self.page_size]))
        }
        fn write_page(&self, volume: VolumeId, page: PageId, data: &[u8]) -> Result<()> {
            self.pages.lock().insert((volume, page), data.to_vec());
            Ok(())
        }
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn allocate_page(&self) -> Result<PageId> {
            let mut pages = self.pages.lock();
            let next = pages.len() as u64 + 1;
            let id = PageId(next);
            pages.insert((VolumeId(1), id), vec![0u8; self.page_size]);
            Ok(id)
        }

        fn free_page(&self, _page: PageId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reentrant_reader_claims_allowed() {
        let lm = Arc::new(LockManager::new());
        let pool = BufferPool::new(4, 64, lm);
        let source = MemSource {
            pages: StdMutex::new(HashMap::new()),
            page_size: 64,
        };
        let task = TaskId::allocate();
        let g1 = pool
            .get(&source, VolumeId(1), PageId(1), false, false, task, Duration::from_millis(100))
            .unwrap();
        let g2 = pool
            .get(&source, VolumeId(1), PageId(1), false, false, task, Duration::from_millis(100))
            .unwrap();
        assert!(!g1.is_writer());
        assert!(!g2.is_writer());
    }

    #[test]
    fn writer_excludes_other_writer() {
        let lm = Arc::new(LockManager::new());
        let pool = BufferPool::new(4, 64, lm);
        let source = MemSource {
            pages: StdMutex::new(HashMap::new()),
            page_size: 64,
        };
        let t1 = TaskId::allocate();
        let t2 = TaskId::allocate();
        let _g1 = pool
            .get(&source, VolumeId(1), PageId(1), true, false, t1, Duration::from_millis(100))
            .unwrap();
        let res = pool.get(&source, VolumeId(1), PageId(1), true, false, t2, Duration::from_millis(50));
        assert!(matches!(res, Err(Error::TimedOut)));
    }

    #[test]
    fn release_unblocks_waiting_writer() {
        let lm = Arc::new(LockManager::new());
        let pool = Arc::new(BufferPool::new(4, 64, lm));
        let source = Arc::new(MemSource {
            pages: StdMutex::new(HashMap::new()),
            page_size: 64,
        });
        let t1 = TaskId::allocate();
        let t2 = TaskId::allocate();
        let g1 = pool
            .get(source.as_ref(), VolumeId(1), PageId(1), true, false, t1, Duration::from_millis(500))
            .unwrap();

        let pool2 = Arc::clone(&pool);
        let source2 = Arc::clone(&source);
        let handle = std::thread::spawn(move || {
            pool2
                .get(source2.as_ref(), VolumeId(1), PageId(1), true, false, t2, Duration::from_secs(2))
                .map(|g| g.is_writer())
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(g1);
        assert!(handle.join().unwrap().unwrap());
    }
}
