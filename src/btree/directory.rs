//! The directory tree: a single well-known [`Tree`] per volume mapping tree
//! names to their metadata (spec §3 "Tree", §3 "Volume... directory root").

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Key, Segment};
use crate::error::{Error, Result};
use crate::page::PageId;
use crate::pager::{BufferPool, FastIndexPool, PageSource, TaskId};
use crate::volume::VolumeId;

use super::options::BTreeOptions;
use super::tree::Tree;

/// Per-tree metadata stored as the directory tree's value: the tree's own
/// root page, plus its accumulator slots (spec §4.7 "up to 64 per tree").
#[derive(Clone, Debug, PartialEq)]
pub struct TreeMeta {
    pub root: PageId,
    pub accumulators: Vec<Option<crate::accumulator::Accumulator>>,
}

impl TreeMeta {
    fn fresh(root: PageId) -> Self {
        TreeMeta {
            root,
            accumulators: Vec::new(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 1 + self.accumulators.len() * 24);
        out.extend_from_slice(&self.root.0.to_be_bytes());
        out.push(self.accumulators.len() as u8);
        for slot in &self.accumulators {
            match slot {
                None => out.push(0),
                Some(acc) => {
                    out.push(1);
                    out.extend_from_slice(&acc.encode());
                }
            }
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 9 {
            return Err(Error::CorruptVolume("truncated tree metadata record"));
        }
        let root = PageId(u64::from_be_bytes(bytes[0..8].try_into().unwrap()));
        let count = bytes[8] as usize;
        let mut cursor = 9;
        let mut accumulators = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = *bytes
                .get(cursor)
                .ok_or(Error::CorruptVolume("truncated accumulator slot tag"))?;
            cursor += 1;
            match tag {
                0 => accumulators.push(None),
                1 => {
                    let (acc, used) = crate::accumulator::Accumulator::decode(&bytes[cursor..])?;
                    cursor += used;
                    accumulators.push(Some(acc));
                }
                _ => return Err(Error::CorruptVolume("unknown accumulator slot tag")),
            }
        }
        Ok(TreeMeta { root, accumulators })
    }
}

/// The tree-name -> [`TreeMeta`] directory, itself a [`Tree`] whose root is
/// recorded in the volume header (spec §3).
pub struct Directory<S: PageSource> {
    tree: Tree<S>,
}

impl<S: PageSource> Directory<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn open_or_create(
        pool: Arc<BufferPool>,
        fast_index_pool: Arc<FastIndexPool>,
        source: Arc<S>,
        volume: VolumeId,
        page_size: usize,
        salt: u64,
        root: Option<PageId>,
        claim_deadline: Duration,
        task: TaskId,
    ) -> Result<Self> {
        let tree = Tree::open_or_create(
            pool,
            fast_index_pool,
            source,
            volume,
            page_size,
            salt,
            root,
            BTreeOptions::default(),
            claim_deadline,
            task,
        )?;
        Ok(Directory { tree })
    }

    /// The directory tree's own root page, to be persisted as the volume's
    /// `directory_root`.
    pub fn root_page(&self) -> PageId {
        self.tree.root_page()
    }

    /// Pages rewritten in the directory tree by the most recent operation;
    /// see [`Tree::take_touched_pages`].
    pub fn take_touched_pages(&self) -> Vec<(PageId, Vec<u8>, Vec<u8>)> {
        self.tree.take_touched_pages()
    }

    fn name_key(name: &str) -> Key {
        Key::new([Segment::Str(name.to_string())])
    }

    /// Looks up a named tree's metadata.
    pub fn lookup(&self, task: TaskId, name: &str) -> Result<Option<TreeMeta>> {
        match self.tree.get(task, &Self::name_key(name))? {
            Some(bytes) => Ok(Some(TreeMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Registers a brand-new tree with its own freshly allocated root leaf.
    pub fn create_tree(&self, task: TaskId, name: &str, root: PageId) -> Result<()> {
        if self.lookup(task, name)?.is_some() {
            return Err(Error::InvalidSpec("tree name already registered".into()));
        }
        let meta = TreeMeta::fresh(root);
        self.tree.put(task, &Self::name_key(name), &meta.encode())
    }

    /// Persists a tree's updated metadata (e.g. after its root changed due to
    /// a split, or an accumulator delta folded in at commit).
    pub fn save(&self, task: TaskId, name: &str, meta: &TreeMeta) -> Result<()> {
        self.tree.put(task, &Self::name_key(name), &meta.encode())
    }

    /// Registers a fresh accumulator in `name`'s metadata at `slot`, growing
    /// the slot vector as needed (spec §4.7 "up to 64 per tree"). Rejects a
    /// slot that already holds an accumulator.
    pub fn create_accumulator(
        &self,
        task: TaskId,
        name: &str,
        slot: u8,
        kind: crate::accumulator::AccumulatorKind,
    ) -> Result<()> {
        let mut meta = self
            .lookup(task, name)?
            .ok_or_else(|| Error::InvalidSpec(format!("tree {:?} does not exist", name)))?;
        while meta.accumulators.len() <= slot as usize {
            meta.accumulators.push(None);
        }
        if meta.accumulators[slot as usize].is_some() {
            return Err(Error::InvalidSpec(format!("accumulator slot {slot} already registered on {name:?}")));
        }
        meta.accumulators[slot as usize] = Some(crate::accumulator::Accumulator::new(kind));
        self.save(task, name, &meta)
    }

    /// Removes a tree's directory entry. Does not reclaim the tree's own
    /// pages; callers drive that separately (whole-subtree deallocation, spec
    /// §4.2 "range delete").
    pub fn drop_tree(&self, task: TaskId, name: &str) -> Result<bool> {
        self.tree.delete(task, &Self::name_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::LockManager;
    use std::collections::HashMap;

    struct MemSource {
        pages: parking_lot::Mutex<HashMap<PageId, Vec<u8>>>,
        next: std::sync::atomic::AtomicU64,
        page_size: usize,
    }

    impl MemSource {
        fn new(page_size: usize) -> Self {
            MemSource {
                pages: parking_lot::Mutex::new(HashMap::new()),
                next: std::sync::atomic::AtomicU64::new(1),
                page_size,
            }
        }
    }

    impl PageSource for MemSource {
        fn read_page(&self, _volume: VolumeId, page: PageId) -> Result<Vec<u8>> {
            Ok(self
                .pages
                .lock()
                .get(&page)
                .cloned()
                .unwrap_or_else(|| vec![0u8; self.page_size]))
        }
        fn write_page(&self, _volume: VolumeId, page: PageId, data: &[u8]) -> Result<()> {
            self.pages.lock().insert(page, data.to_vec());
            Ok(())
        }
        fn page_size(&self) -> usize {
            self.page_size
        }
        fn allocate_page(&self) -> Result<PageId> {
            let id = PageId(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
            self.pages.lock().insert(id, vec![0u8; self.page_size]);
            Ok(id)
        }
        fn free_page(&self, page: PageId) -> Result<()> {
            self.pages.lock().remove(&page);
            Ok(())
        }
    }

    fn new_directory(page_size: usize) -> Directory<MemSource> {
        let lm = Arc::new(LockManager::new());
        let pool = Arc::new(BufferPool::new(64, page_size, lm));
        let fip = Arc::new(FastIndexPool::new(64));
        let source = Arc::new(MemSource::new(page_size));
        let task = TaskId::allocate();
        Directory::open_or_create(pool, fip, source, VolumeId(1), page_size, 7, None, Duration::from_millis(500), task)
            .unwrap()
    }

    #[test]
    fn create_then_lookup_tree() {
        let dir = new_directory(1024);
        let task = TaskId::allocate();
        dir.create_tree(task, "widgets", PageId(5)).unwrap();
        let meta = dir.lookup(task, "widgets").unwrap().unwrap();
        assert_eq!(meta.root, PageId(5));
        assert!(dir.lookup(task, "missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_create_rejected() {
        let dir = new_directory(1024);
        let task = TaskId::allocate();
        dir.create_tree(task, "widgets", PageId(5)).unwrap();
        assert!(dir.create_tree(task, "widgets", PageId(6)).is_err());
    }

    #[test]
    fn drop_tree_removes_entry() {
        let dir = new_directory(1024);
        let task = TaskId::allocate();
        dir.create_tree(task, "widgets", PageId(5)).unwrap();
        assert!(dir.drop_tree(task, "widgets").unwrap());
        assert!(dir.lookup(task, "widgets").unwrap().is_none());
        assert!(!dir.drop_tree(task, "widgets").unwrap());
    }
}
