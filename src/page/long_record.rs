//! Long-record chains: values too large for a single cell are split into an
//! inline descriptor plus a right-linked chain of continuation pages
//! (spec §3 "Long-record chain", §4.2 "Long-record I/O").

use crate::page::PageId;

/// Hard bound on the number of pages a long-record chain may span; exceeding
/// it on read is treated as `corrupt-volume` (spec §4.2).
pub const MAX_LONG_RECORD_CHAIN: usize = 1 << 20;

/// Number of leading bytes of the value kept inline in the cell alongside the
/// descriptor, so short scans (e.g. prefix comparisons) avoid chasing the
/// chain.
pub const INLINE_PREFIX_LEN: usize = 32;

/// Stored inline in a B-tree cell in place of the value when the value exceeds
/// a page's long-record threshold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LongRecordDescriptor {
    /// Total length of the logical value, across all chain pages.
    pub total_size: u64,
    /// First page of the right-linked continuation chain.
    pub head_page: PageId,
    /// First `INLINE_PREFIX_LEN` bytes of the value (or all of it, zero-padded,
    /// if shorter).
    pub prefix: [u8; INLINE_PREFIX_LEN],
}

impl LongRecordDescriptor {
    /// Marker byte distinguishing a long-record descriptor from a raw inline
    /// value when decoding a cell cannot rely on length alone.
    pub const MARKER: u8 = 0xFE;

    /// Builds a descriptor from a full value and the head page it will be
    /// chained from.
    pub fn describe(value: &[u8], head_page: PageId) -> Self {
        let mut prefix = [0u8; INLINE_PREFIX_LEN];
        let n = value.len().min(INLINE_PREFIX_LEN);
        prefix[..n].copy_from_slice(&value[..n]);
        LongRecordDescriptor {
            total_size: value.len() as u64,
            head_page,
            prefix,
        }
    }

    /// Encodes the descriptor: marker byte, 8-byte size, 8-byte head page,
    /// 32-byte prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 8 + INLINE_PREFIX_LEN);
        out.push(Self::MARKER);
        out.extend_from_slice(&self.total_size.to_be_bytes());
        out.extend_from_slice(&self.head_page.0.to_be_bytes());
        out.extend_from_slice(&self.prefix);
        out
    }

    /// Decodes a descriptor previously produced by [`LongRecordDescriptor::encode`].
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 1 + 8 + 8 + INLINE_PREFIX_LEN || bytes[0] != Self::MARKER {
            return None;
        }
        let total_size = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
        let head_page = PageId(u64::from_be_bytes(bytes[9..17].try_into().unwrap()));
        let mut prefix = [0u8; INLINE_PREFIX_LEN];
        prefix.copy_from_slice(&bytes[17..17 + INLINE_PREFIX_LEN]);
        Some(LongRecordDescriptor {
            total_size,
            head_page,
            prefix,
        })
    }
}

/// One continuation page's worth of a long-record value: the chunk of bytes
/// stored there plus the next page in the chain (`PageId::NONE` at the tail).
#[derive(Clone, Debug)]
pub struct LongRecordPage {
    /// This chunk's bytes.
    pub chunk: Vec<u8>,
    /// Next page in the right-linked chain, or `PageId::NONE` if this is last.
    pub next: PageId,
}

/// Splits a value into chunks no larger than `chunk_size`, in the order they
/// should be written (the chain is built tail-to-head per spec §4.2, so the
/// caller writes these in reverse and links each to the previously-written
/// page).
pub fn chunk_value(value: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if chunk_size == 0 {
        return vec![value];
    }
    value.chunks(chunk_size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let value = vec![7u8; 100];
        let d = LongRecordDescriptor::describe(&value, PageId(5));
        let encoded = d.encode();
        let decoded = LongRecordDescriptor::decode(&encoded).unwrap();
        assert_eq!(d, decoded);
    }

    #[test]
    fn short_value_prefix_is_zero_padded() {
        let value = vec![1u8, 2, 3];
        let d = LongRecordDescriptor::describe(&value, PageId(1));
        assert_eq!(&d.prefix[..3], &[1, 2, 3]);
        assert!(d.prefix[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn chunking_covers_whole_value() {
        let value: Vec<u8> = (0..250u32).map(|v| v as u8).collect();
        let chunks = chunk_value(&value, 100);
        assert_eq!(chunks.len(), 3);
        let rejoined: Vec<u8> = chunks.into_iter().flatten().copied().collect();
        assert_eq!(rejoined, value);
    }
}
