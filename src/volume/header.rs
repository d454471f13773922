//! Volume page-0 header layout (spec §6 "Volume header").
//!
//! Grounded in `src/primitives/pager/meta.rs`'s byte-range-constant idiom for
//! a fixed, hand-packed metadata page.

use crate::error::{Error, Result};
use crate::page::PageId;

/// Magic bytes identifying a sombra-kv volume file.
pub const SIGNATURE: [u8; 8] = *b"SKVOL\x00\x00\x01";

/// Inclusive range of on-disk format versions this build accepts.
pub const SUPPORTED_VERSION_RANGE: (u16, u16) = (1, 1);

/// The version this build writes.
pub(super) const TARGET_VERSION: u16 = 1;

/// Fixed byte length of the encoded header (fits in the smallest supported
/// page size of 1024 bytes with room to spare).
pub const VOLUME_HEADER_LEN: usize = 128;

mod field {
    pub const SIGNATURE: std::ops::Range<usize> = 0..8;
    pub const VERSION: std::ops::Range<usize> = 8..10;
    pub const PAGE_SIZE: std::ops::Range<usize> = 10..14;
    pub const TIMESTAMP: std::ops::Range<usize> = 14..22;
    pub const ID: std::ops::Range<usize> = 22..30;
    pub const NEXT_AVAILABLE_PAGE: std::ops::Range<usize> = 30..38;
    pub const EXTENDED_PAGE_COUNT: std::ops::Range<usize> = 38..46;
    pub const EXTENSION_PAGES: std::ops::Range<usize> = 46..54;
    pub const MAXIMUM_PAGES: std::ops::Range<usize> = 54..62;
    pub const DIRECTORY_ROOT: std::ops::Range<usize> = 62..70;
    pub const GARBAGE_ROOT: std::ops::Range<usize> = 70..78;
    pub const READS: std::ops::Range<usize> = 78..86;
    pub const WRITES: std::ops::Range<usize> = 86..94;
    pub const GETS: std::ops::Range<usize> = 94..102;
    pub const GLOBAL_TIMESTAMP: std::ops::Range<usize> = 102..110;
}

/// Decoded page-0 header of a volume file.
///
/// `reads`/`writes`/`gets` are cumulative counters surfaced for diagnostics
/// (spec §6: "lifetime read/write/get counters"); they are advisory and not
/// used for correctness.
#[derive(Clone, Debug)]
pub struct VolumeHeader {
    pub version: u16,
    pub page_size: u32,
    pub timestamp: u64,
    pub id: u64,
    pub next_available_page: u64,
    pub extended_page_count: u64,
    pub extension_pages: u64,
    pub maximum_pages: u64,
    pub directory_root: PageId,
    pub garbage_root: PageId,
    pub reads: u64,
    pub writes: u64,
    pub gets: u64,
    pub global_timestamp: u64,
}

impl VolumeHeader {
    /// Seconds since the Unix epoch, used to stamp creation/global timestamps.
    pub(super) fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Encodes this header into `buf`'s first [`VOLUME_HEADER_LEN`] bytes.
    /// `buf` must be at least that long (normally a full page).
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < VOLUME_HEADER_LEN {
            return Err(Error::Conversion("buffer too small for volume header"));
        }
        buf[field::SIGNATURE].copy_from_slice(&SIGNATURE);
        buf[field::VERSION].copy_from_slice(&self.version.to_be_bytes());
        buf[field::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[field::TIMESTAMP].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[field::ID].copy_from_slice(&self.id.to_be_bytes());
        buf[field::NEXT_AVAILABLE_PAGE].copy_from_slice(&self.next_available_page.to_be_bytes());
        buf[field::EXTENDED_PAGE_COUNT].copy_from_slice(&self.extended_page_count.to_be_bytes());
        buf[field::EXTENSION_PAGES].copy_from_slice(&self.extension_pages.to_be_bytes());
        buf[field::MAXIMUM_PAGES].copy_from_slice(&self.maximum_pages.to_be_bytes());
        buf[field::DIRECTORY_ROOT].copy_from_slice(&self.directory_root.0.to_be_bytes());
        buf[field::GARBAGE_ROOT].copy_from_slice(&self.garbage_root.0.to_be_bytes());
        buf[field::READS].copy_from_slice(&self.reads.to_be_bytes());
        buf[field::WRITES].copy_from_slice(&self.writes.to_be_bytes());
        buf[field::GETS].copy_from_slice(&self.gets.to_be_bytes());
        buf[field::GLOBAL_TIMESTAMP].copy_from_slice(&self.global_timestamp.to_be_bytes());
        Ok(())
    }

    /// Decodes a header from the first [`VOLUME_HEADER_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < VOLUME_HEADER_LEN {
            return Err(Error::CorruptVolume("volume header truncated"));
        }
        if buf[field::SIGNATURE] != SIGNATURE {
            return Err(Error::CorruptVolume("volume signature mismatch"));
        }
        let version = u16::from_be_bytes(buf[field::VERSION].try_into().unwrap());
        if version < SUPPORTED_VERSION_RANGE.0 || version > SUPPORTED_VERSION_RANGE.1 {
            return Err(Error::CorruptVolume("unsupported volume format version"));
        }
        Ok(VolumeHeader {
            version,
            page_size: u32::from_be_bytes(buf[field::PAGE_SIZE].try_into().unwrap()),
            timestamp: u64::from_be_bytes(buf[field::TIMESTAMP].try_into().unwrap()),
            id: u64::from_be_bytes(buf[field::ID].try_into().unwrap()),
            next_available_page: u64::from_be_bytes(
                buf[field::NEXT_AVAILABLE_PAGE].try_into().unwrap(),
            ),
            extended_page_count: u64::from_be_bytes(
                buf[field::EXTENDED_PAGE_COUNT].try_into().unwrap(),
            ),
            extension_pages: u64::from_be_bytes(buf[field::EXTENSION_PAGES].try_into().unwrap()),
            maximum_pages: u64::from_be_bytes(buf[field::MAXIMUM_PAGES].try_into().unwrap()),
            directory_root: PageId(u64::from_be_bytes(
                buf[field::DIRECTORY_ROOT].try_into().unwrap(),
            )),
            garbage_root: PageId(u64::from_be_bytes(
                buf[field::GARBAGE_ROOT].try_into().unwrap(),
            )),
            reads: u64::from_be_bytes(buf[field::READS].try_into().unwrap()),
            writes: u64::from_be_bytes(buf[field::WRITES].try_into().unwrap()),
            gets: u64::from_be_bytes(buf[field::GETS].try_into().unwrap()),
            global_timestamp: u64::from_be_bytes(
                buf[field::GLOBAL_TIMESTAMP].try_into().unwrap(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = VolumeHeader {
            version: TARGET_VERSION,
            page_size: 8192,
            timestamp: 1_700_000_000,
            id: 42,
            next_available_page: 7,
            extended_page_count: 100,
            extension_pages: 50,
            maximum_pages: 1_000_000,
            directory_root: PageId(3),
            garbage_root: PageId::NONE,
            reads: 10,
            writes: 5,
            gets: 20,
            global_timestamp: 1_700_000_500,
        };
        let mut buf = vec![0u8; 8192];
        header.encode(&mut buf).unwrap();
        let decoded = VolumeHeader::decode(&buf).unwrap();
        assert_eq!(decoded.page_size, 8192);
        assert_eq!(decoded.directory_root, PageId(3));
        assert_eq!(decoded.gets, 20);
    }

    #[test]
    fn rejects_bad_signature() {
        let buf = vec![0u8; 8192];
        assert!(VolumeHeader::decode(&buf).is_err());
    }
}
