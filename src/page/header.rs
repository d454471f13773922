//! Generic page header shared by every page kind.
//!
//! Grounded in `crates/sombra-types/src/lib.rs`'s `page` module: a fixed
//! 32-byte, big-endian header (magic, format version, page kind, page size,
//! page number, salt, CRC32) that precedes every page-kind-specific payload.

use crate::error::{Error, Result};
use crate::page::PageId;

/// Magic bytes identifying a page belonging to this engine's volumes.
pub const PAGE_MAGIC: [u8; 4] = *b"SKV1";
/// On-disk page header format version.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Size in bytes of the generic page header.
pub const PAGE_HDR_LEN: usize = 32;

mod field {
    use core::ops::Range;
    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const PAGE_KIND: usize = 6;
    pub const RESERVED: usize = 7;
    pub const PAGE_SIZE: Range<usize> = 8..12;
    pub const PAGE_NO: Range<usize> = 12..20;
    pub const SALT: Range<usize> = 20..28;
    pub const CRC32: Range<usize> = 28..32;
}

/// The role a page plays, stored in its header so a reader can validate it
/// against the expected kind before interpreting the payload.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Volume header / page 0.
    Meta = 1,
    /// Free-page ("garbage") chain node.
    FreeList = 2,
    /// B-tree leaf (data) page.
    BTreeLeaf = 3,
    /// B-tree internal (index) page.
    BTreeInternal = 4,
    /// Long-record continuation page.
    LongRecord = 5,
}

impl PageKind {
    fn try_from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => PageKind::Meta,
            2 => PageKind::FreeList,
            3 => PageKind::BTreeLeaf,
            4 => PageKind::BTreeInternal,
            5 => PageKind::LongRecord,
            _ => return Err(Error::CorruptVolume("unknown page kind")),
        })
    }
}

/// The fixed-size, big-endian page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// On-disk format version.
    pub format_version: u16,
    /// Which kind of page this is.
    pub kind: PageKind,
    /// Declared page size; must match the volume's configured page size.
    pub page_size: u32,
    /// This page's own number.
    pub page_no: PageId,
    /// Per-volume random salt mixed into the checksum to detect stale reads
    /// from a previous incarnation of the same page number.
    pub salt: u64,
    /// CRC32 of the rest of the page (header with this field zeroed, plus
    /// payload), checked on read when `checksum_verify_on_read` is enabled.
    pub crc32: u32,
}

impl PageHeader {
    /// Builds a header with `crc32` left at zero; call [`PageHeader::with_crc32`]
    /// once the payload checksum has been computed.
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(Error::InvalidSpec("page size smaller than header".into()));
        }
        Ok(PageHeader {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_size,
            page_no,
            salt,
            crc32: 0,
        })
    }

    /// Returns a copy of this header with `crc32` set.
    pub fn with_crc32(mut self, crc32: u32) -> Self {
        self.crc32 = crc32;
        self
    }

    /// Encodes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(Error::Conversion("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[field::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[field::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[field::PAGE_KIND] = self.kind as u8;
        hdr[field::RESERVED] = 0;
        hdr[field::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        hdr[field::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
        hdr[field::SALT].copy_from_slice(&self.salt.to_be_bytes());
        hdr[field::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Decodes and validates a header from the first [`PAGE_HDR_LEN`] bytes of
    /// `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(Error::CorruptVolume("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        let magic: [u8; 4] = hdr[field::MAGIC].try_into().unwrap();
        if magic != PAGE_MAGIC {
            return Err(Error::CorruptVolume("invalid page magic"));
        }
        let format_version = u16::from_be_bytes(hdr[field::FORMAT_VERSION].try_into().unwrap());
        if format_version != PAGE_FORMAT_VERSION {
            return Err(Error::CorruptVolume("unsupported page format version"));
        }
        if hdr[field::RESERVED] != 0 {
            return Err(Error::CorruptVolume("page header reserved byte not zero"));
        }
        let kind = PageKind::try_from_u8(hdr[field::PAGE_KIND])?;
        let page_size = u32::from_be_bytes(hdr[field::PAGE_SIZE].try_into().unwrap());
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(Error::CorruptVolume("page size smaller than header"));
        }
        let page_no = PageId(u64::from_be_bytes(hdr[field::PAGE_NO].try_into().unwrap()));
        let salt = u64::from_be_bytes(hdr[field::SALT].try_into().unwrap());
        let crc32 = u32::from_be_bytes(hdr[field::CRC32].try_into().unwrap());
        Ok(PageHeader {
            format_version,
            kind,
            page_size,
            page_no,
            salt,
            crc32,
        })
    }

    /// Zeroes the CRC32 field of an encoded header buffer, as required before
    /// computing a checksum over the rest of the page.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < field::CRC32.end {
            return Err(Error::Conversion("page header buffer too small"));
        }
        buf[field::CRC32].fill(0);
        Ok(())
    }

    /// Computes the CRC32 of a full page buffer with its CRC32 field treated
    /// as zero, regardless of what is currently stored there.
    pub fn compute_crc32(buf: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..field::CRC32.start]);
        hasher.update(&[0u8; 4]);
        hasher.update(&buf[field::CRC32.end..]);
        hasher.finalize()
    }

    /// Stamps `buf` with its own checksum: clears the CRC32 field, computes
    /// the checksum over the result, then writes it back.
    pub fn stamp_crc32(buf: &mut [u8]) -> Result<()> {
        Self::clear_crc32(buf)?;
        let crc = Self::compute_crc32(buf);
        buf[field::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Verifies a page buffer's stored CRC32 against its contents.
    pub fn verify_crc32(buf: &[u8]) -> Result<()> {
        let stored = u32::from_be_bytes(buf[field::CRC32].try_into().unwrap());
        if stored != Self::compute_crc32(buf) {
            return Err(Error::CorruptVolume("page checksum mismatch"));
        }
        Ok(())
    }
}
