//! Volume storage: a file-backed extent of fixed-size pages, its header, and
//! its garbage (free-page) chain (spec §3, §4.5, §6).

mod garbage;
mod header;
mod spec_string;

pub use garbage::GarbageChain;
pub use header::{VolumeHeader, SIGNATURE, SUPPORTED_VERSION_RANGE, VOLUME_HEADER_LEN};
pub use spec_string::{parse_volume_spec, CreatePolicy, VolumeSpec};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::page::{PageHeader, PageId, PageKind};
use crate::pager::PageSource;

/// Process-unique handle identifying an open volume; distinct from the
/// on-disk volume id stored in the header (which defends against a stale
/// reopen of the same file, per spec §3 "unique id defends against stale
/// reopen").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VolumeId(pub u64);

static NEXT_VOLUME_HANDLE: AtomicU64 = AtomicU64::new(1);

/// An open, file-backed volume.
pub struct Volume {
    handle: VolumeId,
    file: Mutex<File>,
    path: PathBuf,
    header: Mutex<VolumeHeader>,
}

impl Volume {
    /// Creates a brand-new volume file with a fresh header and an empty
    /// garbage chain.
    pub fn create(path: impl AsRef<Path>, page_size: u32, initial_pages: u64) -> Result<Self> {
        if !matches!(page_size, 1024 | 2048 | 4096 | 8192 | 16384) {
            return Err(Error::InvalidSpec(format!(
                "unsupported page size {page_size}"
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let mut rng = rand::thread_rng();
        let id = rng.next_u64();
        let now = VolumeHeader::now();
        let header = VolumeHeader {
            version: header::TARGET_VERSION,
            page_size,
            timestamp: now,
            id,
            next_available_page: 1,
            extended_page_count: initial_pages,
            extension_pages: initial_pages,
            maximum_pages: u64::MAX,
            directory_root: PageId::NONE,
            garbage_root: PageId::NONE,
            reads: 0,
            writes: 0,
            gets: 0,
            global_timestamp: now,
        };
        file.set_len(page_size as u64 * initial_pages.max(1))?;
        let mut buf = vec![0u8; page_size as usize];
        header.encode(&mut buf)?;
        file.write_all_at_offset(0, &buf)?;
        file.sync_all()?;
        Ok(Volume {
            handle: VolumeId(NEXT_VOLUME_HANDLE.fetch_add(1, Ordering::Relaxed)),
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            header: Mutex::new(header),
        })
    }

    /// Opens an existing volume file, validating its header (spec §4.5
    /// "On open").
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut probe = [0u8; 64];
        file.seek(SeekFrom::Start(0))?;
        let n = file.read(&mut probe)?;
        if n < VOLUME_HEADER_LEN {
            return Err(Error::CorruptVolume("volume header truncated"));
        }
        let header = VolumeHeader::decode(&probe)?;
        let file_len = file.seek(SeekFrom::End(0))?;
        let required = header.next_available_page.saturating_sub(1) * header.page_size as u64
            + header.page_size as u64;
        if file_len < required {
            return Err(Error::CorruptVolume(
                "volume file shorter than its declared page count",
            ));
        }
        if header.global_timestamp > VolumeHeader::now() {
            return Err(Error::CorruptVolume(
                "volume global timestamp is in the future (torn reopen)",
            ));
        }
        Ok(Volume {
            handle: VolumeId(NEXT_VOLUME_HANDLE.fetch_add(1, Ordering::Relaxed)),
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            header: Mutex::new(header),
        })
    }

    /// This open volume's process-local handle.
    pub fn handle(&self) -> VolumeId {
        self.handle
    }

    /// The file path this volume was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current header.
    pub fn header(&self) -> VolumeHeader {
        self.header.lock().clone()
    }

    /// Extends the file by `extension_pages` and bumps `extended_page_count`
    /// (spec §4.5 "On grow").
    pub fn grow(&self) -> Result<()> {
        let mut header = self.header.lock();
        let add = header.extension_pages.max(1);
        if header.extended_page_count + add > header.maximum_pages {
            return Err(Error::CorruptVolume("volume would exceed maximum pages"));
        }
        header.extended_page_count += add;
        let new_len = header.page_size as u64 * header.extended_page_count;
        self.file.lock().set_len(new_len)?;
        Ok(())
    }

    /// Allocates the next unused page, extending the volume if necessary. Does
    /// not consult the garbage chain — callers should prefer
    /// `GarbageChain::pop` first and only fall back to this.
    pub fn allocate_fresh_page(&self) -> Result<PageId> {
        let mut header = self.header.lock();
        let page = PageId(header.next_available_page);
        header.next_available_page += 1;
        if header.next_available_page > header.extended_page_count {
            drop(header);
            self.grow()?;
        }
        Ok(page)
    }

    fn page_offset(&self, page: PageId) -> u64 {
        page.0 * self.header.lock().page_size as u64
    }

    /// Validates that `page` is a plausible address in this volume.
    pub fn check_page_address(&self, page: PageId) -> Result<()> {
        let header = self.header.lock();
        if page.0 >= header.next_available_page {
            return Err(Error::InvalidPageAddress {
                volume: self.handle,
                page,
            });
        }
        Ok(())
    }

    /// Reads `page`'s full bytes (generic header + payload).
    pub fn read_page_raw(&self, page: PageId) -> Result<Vec<u8>> {
        self.check_page_address(page)?;
        let offset = self.page_offset(page);
        let page_size = self.header.lock().page_size as usize;
        let mut buf = vec![0u8; page_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        self.header.lock().reads += 1;
        Ok(buf)
    }

    /// Writes `page`'s full bytes at its home address.
    pub fn write_page_raw(&self, page: PageId, data: &[u8]) -> Result<()> {
        let page_size = self.header.lock().page_size as usize;
        if data.len() != page_size {
            return Err(Error::Conversion("page write buffer size mismatch"));
        }
        let offset = self.page_offset(page);
        {
            let mut file = self.file.lock();
            file.write_all_at_offset(offset, data)?;
        }
        self.header.lock().writes += 1;
        Ok(())
    }

    /// Flushes the header (spec §4.5: "Header updates... are flushed on
    /// checkpoint boundaries only"). Callers invoke this from the checkpoint
    /// path, not on every mutation.
    pub fn flush_header(&self) -> Result<()> {
        let header = self.header.lock().clone();
        let page_size = header.page_size as usize;
        let mut buf = vec![0u8; page_size];
        header.encode(&mut buf)?;
        {
            let mut file = self.file.lock();
            file.write_all_at_offset(0, &buf)?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Compare-and-swap style update of the garbage-chain root, used by
    /// `GarbageChain` so concurrent allocations/deallocations don't race on a
    /// stale header copy.
    pub fn cas_garbage_root(&self, expected: PageId, new: PageId) -> bool {
        let mut header = self.header.lock();
        if header.garbage_root == expected {
            header.garbage_root = new;
            true
        } else {
            false
        }
    }

    /// Current garbage-chain root.
    pub fn garbage_root(&self) -> PageId {
        self.header.lock().garbage_root
    }

    /// Current directory-tree root (the tree-name -> tree-metadata B-tree).
    pub fn directory_root(&self) -> PageId {
        self.header.lock().directory_root
    }

    /// Sets the directory-tree root.
    pub fn set_directory_root(&self, page: PageId) {
        self.header.lock().directory_root = page;
    }
}

/// Adapts [`Volume`] to the buffer pool's [`PageSource`] abstraction, stamping
/// a fresh generic [`PageHeader`] salt check on every read.
impl PageSource for Volume {
    fn read_page(&self, _volume: VolumeId, page: PageId) -> Result<Vec<u8>> {
        let bytes = self.read_page_raw(page)?;
        // Validate the generic header is at least structurally sane; callers
        // needing kind-specific validation do so in the `page` module.
        if bytes.len() >= crate::page::PAGE_HDR_LEN {
            let _ = PageHeader::decode(&bytes);
        }
        Ok(bytes)
    }

    fn write_page(&self, _volume: VolumeId, page: PageId, data: &[u8]) -> Result<()> {
        self.write_page_raw(page, data)
    }

    fn page_size(&self) -> usize {
        self.header.lock().page_size as usize
    }

    fn allocate_page(&self) -> Result<PageId> {
        if let Some(page) = GarbageChain::new(self).pop()? {
            return Ok(page);
        }
        self.allocate_fresh_page()
    }

    fn free_page(&self, page: PageId) -> Result<()> {
        GarbageChain::new(self).push(page)
    }
}

trait WriteAtOffset {
    fn write_all_at_offset(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;
}

impl WriteAtOffset for File {
    fn write_all_at_offset(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }
}

/// Builds the reserved page-0 header kind marker so `Volume::create` can reuse
/// the generic page-header encoder for documentation purposes (the volume
/// header itself uses its own fixed layout per spec §6, but sharing the
/// `PageKind::Meta` tag keeps `page` module tooling able to at least recognize
/// page 0).
pub fn meta_page_kind() -> PageKind {
    PageKind::Meta
}
