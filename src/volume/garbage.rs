//! The garbage (free-page) chain: a singly-linked list of reclaimed pages
//! threaded through the pages themselves, rooted at
//! [`VolumeHeader::garbage_root`](super::VolumeHeader) (spec §4.5, §6).
//!
//! Grounded in the teacher's free-list idiom in `src/storage/heap.rs`, where
//! freed slots are threaded through a next-pointer stored in the freed
//! payload itself rather than kept in a separate structure.

use crate::error::Result;
use crate::page::PageId;
use crate::volume::Volume;

/// Offset of the next-pointer within a garbage page's payload (right after
/// the generic 32-byte page header).
const NEXT_PTR_OFFSET: usize = crate::page::PAGE_HDR_LEN;

/// Operates on a [`Volume`]'s garbage chain. Holds no state of its own; the
/// chain root lives in the volume header so it survives a reopen.
pub struct GarbageChain<'v> {
    volume: &'v Volume,
}

impl<'v> GarbageChain<'v> {
    /// Borrows `volume`'s garbage chain.
    pub fn new(volume: &'v Volume) -> Self {
        GarbageChain { volume }
    }

    /// Pops the head of the chain, returning `None` if it is empty. Retries
    /// the CAS against the volume header's `garbage_root` field until it
    /// succeeds, so concurrent poppers don't stomp one another.
    pub fn pop(&self) -> Result<Option<PageId>> {
        loop {
            let head = self.volume.garbage_root();
            if head.is_none() {
                return Ok(None);
            }
            let page = self.volume.read_page_raw(head)?;
            let next = PageId(u64::from_be_bytes(
                page[NEXT_PTR_OFFSET..NEXT_PTR_OFFSET + 8].try_into().unwrap(),
            ));
            if self.volume.cas_garbage_root(head, next) {
                return Ok(Some(head));
            }
            // Another task raced us; retry with the fresh root.
        }
    }

    /// Pushes `page` onto the chain, making it the new head. `page`'s prior
    /// contents are irrelevant; the entire page is overwritten with a
    /// next-pointer payload.
    pub fn push(&self, page: PageId) -> Result<()> {
        loop {
            let head = self.volume.garbage_root();
            let page_size = self.volume.header().page_size as usize;
            let mut buf = vec![0u8; page_size];
            buf[NEXT_PTR_OFFSET..NEXT_PTR_OFFSET + 8].copy_from_slice(&head.0.to_be_bytes());
            self.volume.write_page_raw(page, &buf)?;
            if self.volume.cas_garbage_root(head, page) {
                return Ok(());
            }
            // Root moved under us; the page write above is harmless (it'll
            // be overwritten by whichever push wins), retry.
        }
    }

    /// Counts chain length by walking it; `O(n)`, intended for diagnostics
    /// and tests only.
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        let mut current = self.volume.garbage_root();
        while !current.is_none() {
            let page = self.volume.read_page_raw(current)?;
            current = PageId(u64::from_be_bytes(
                page[NEXT_PTR_OFFSET..NEXT_PTR_OFFSET + 8].try_into().unwrap(),
            ));
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn push_then_pop_is_lifo() {
        let dir = tempdir().unwrap();
        let vol = Volume::create(dir.path().join("v.db"), 1024, 8).unwrap();
        let a = vol.allocate_fresh_page().unwrap();
        let b = vol.allocate_fresh_page().unwrap();
        let chain = GarbageChain::new(&vol);
        chain.push(a).unwrap();
        chain.push(b).unwrap();
        assert_eq!(chain.len().unwrap(), 2);
        assert_eq!(chain.pop().unwrap(), Some(b));
        assert_eq!(chain.pop().unwrap(), Some(a));
        assert_eq!(chain.pop().unwrap(), None);
    }
}
