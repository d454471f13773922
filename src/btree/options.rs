//! B-tree tuning knobs (spec §5), grounded in
//! `src/storage/btree/tree/definition/types.rs`'s `BTreeOptions`.

/// Configuration knobs for a single [`super::Tree`].
#[derive(Clone, Debug)]
pub struct BTreeOptions {
    /// Verify the generic page header's CRC on every read.
    pub checksum_verify_on_read: bool,
    /// A leaf record (suffix + cell) at or above this many bytes is spilled
    /// into a long-record chain instead of being stored inline. Defaults to
    /// one quarter of the page size, a conservative threshold keeping most of
    /// a leaf page available for other keys even after one large value.
    pub long_record_threshold: Option<usize>,
    /// A page is a merge candidate on delete once its payload utilization
    /// drops below this percentage.
    pub merge_fill_threshold: u8,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        BTreeOptions {
            checksum_verify_on_read: true,
            long_record_threshold: None,
            merge_fill_threshold: 25,
        }
    }
}

impl BTreeOptions {
    /// Resolves the effective long-record threshold for a given page size.
    pub fn long_record_threshold(&self, page_size: usize) -> usize {
        self.long_record_threshold.unwrap_or(page_size / 4)
    }
}
