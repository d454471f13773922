//! Transaction index, timestamp oracle, and write-write conflict resolution
//! (spec §3, §4.7).
//!
//! Grounded in `packages/core/src/db/timestamp_oracle.rs`'s `TimestampOracle`
//! and `packages/core/src/db/transaction.rs`'s `Transaction`/`TxState` shape,
//! generalized off the graph-specific node/edge/dirty-page bookkeeping onto
//! the spec's `ts`/`tc`/`ta`/write-write-lock fields.

mod index;
mod oracle;
mod status;

pub use index::TransactionIndex;
pub use oracle::TimestampOracle;
pub use status::{CommitState, TransactionStatus};

/// A logical clock value: MVCC visibility, commit ordering, and accumulator
/// snapshots are all expressed in this unit.
pub type Timestamp = u64;

/// Identifies one transaction for the lifetime of the engine process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxId(pub u64);

impl TxId {
    /// Allocates a fresh, process-unique transaction id.
    pub fn allocate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TxId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}
