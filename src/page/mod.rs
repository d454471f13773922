//! Page layout & buffer: the fixed-size page header, slotted B-tree page body
//! with prefix elision, the per-page fast index, and long-record chains
//! (spec §3, §4.2, §6).

mod btree;
mod fast_index;
mod header;
mod long_record;

pub use btree::{
    decode_internal_record, decode_leaf_record, encode_internal_record, encode_leaf_record,
    reconstruct_key, shared_prefix_len, BTreePage, InternalRecordRef, LeafRecordRef, PageMutExt,
    BTREE_PAYLOAD_HDR_LEN, KEY_BLOCK_LEN,
};
pub use fast_index::FastIndex;
pub use header::{PageHeader, PageKind, PAGE_HDR_LEN};
pub use long_record::{
    chunk_value, LongRecordDescriptor, LongRecordPage, INLINE_PREFIX_LEN, MAX_LONG_RECORD_CHAIN,
};

/// Stable page number within a volume. Page 0 is always the volume header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// The reserved volume-header page.
    pub const HEADER: PageId = PageId(0);

    /// Sentinel used in on-disk fields meaning "no page" (0 is reserved for the
    /// header, so it can never be a legitimate neighbor/child pointer).
    pub const NONE: PageId = PageId(0);

    /// True if this is the `NONE` sentinel.
    pub fn is_none(self) -> bool {
        self == PageId::NONE
    }
}
