//! Hash-bucketed registry of in-flight transaction status records (spec §4.7,
//! §5 "transaction index uses hash bucketing with short critical sections").

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::status::resolve;
use super::{Timestamp, TransactionStatus, TxId};

const BUCKET_COUNT: usize = 16;

fn bucket_of(id: TxId) -> usize {
    (id.0 as usize) % BUCKET_COUNT
}

/// Registry of every transaction currently known to the engine: running,
/// committing, or not yet reclaimed after commit/abort (spec §4.7).
pub struct TransactionIndex {
    buckets: Vec<Mutex<HashMap<TxId, Arc<TransactionStatus>>>>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        TransactionIndex {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Registers a freshly started transaction.
    pub fn begin(&self, id: TxId, ts: Timestamp) -> Arc<TransactionStatus> {
        let status = Arc::new(TransactionStatus::new(id, ts));
        self.buckets[bucket_of(id)].lock().insert(id, status.clone());
        status
    }

    pub fn lookup(&self, id: TxId) -> Option<Arc<TransactionStatus>> {
        self.buckets[bucket_of(id)].lock().get(&id).cloned()
    }

    /// Drops a transaction's status record once its MVCC versions have all
    /// been pruned and no running transaction's snapshot can still need it.
    pub fn reclaim(&self, id: TxId) -> bool {
        let mut bucket = self.buckets[bucket_of(id)].lock();
        match bucket.get(&id) {
            Some(status) if status.mvv_count.load(Ordering::Acquire) == 0 => {
                bucket.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// The oldest start timestamp among all registered (not yet reclaimed)
    /// transactions, used as the MVCC prune watermark and the checkpoint
    /// quiesce condition.
    pub fn oldest_active_timestamp(&self) -> Option<Timestamp> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.lock().values().map(|s| s.ts).collect::<Vec<_>>())
            .min()
    }

    /// True once every registered transaction with `ts < boundary` has
    /// finished (spec §4.8 checkpoint wait condition).
    pub fn all_older_than_finished(&self, boundary: Timestamp) -> bool {
        !self
            .buckets
            .iter()
            .any(|bucket| bucket.lock().values().any(|s| s.ts < boundary))
    }

    /// Resolves a write-write conflict between `self_id` (about to write) and
    /// `holder_id` (the transaction that owns the conflicting uncommitted
    /// version), including deadlock detection via the `depends_on`
    /// back-pointer chain (spec §4.7: "cycle → deadlock, treated as
    /// rollback").
    pub fn ww_dependency(&self, self_id: TxId, holder_id: TxId, deadline: Duration) -> Result<()> {
        let self_status = self.lookup(self_id).ok_or(Error::Rollback)?;
        let holder_status = match self.lookup(holder_id) {
            Some(s) => s,
            None => return Ok(()),
        };

        self_status.set_depends_on(Some(holder_id));
        if self.creates_cycle(self_id, holder_id) {
            self_status.set_depends_on(None);
            return Err(Error::Deadlock);
        }

        let result = resolve(&self_status, &holder_status, deadline);
        self_status.set_depends_on(None);
        result
    }

    /// Walks the `depends_on` chain starting at `holder_id`; a cycle back to
    /// `self_id` means granting this wait would deadlock.
    fn creates_cycle(&self, self_id: TxId, holder_id: TxId) -> bool {
        let mut current = holder_id;
        let mut hops = 0usize;
        loop {
            if current == self_id {
                return true;
            }
            hops += 1;
            if hops > BUCKET_COUNT * 64 {
                // Bounded walk: an implausibly long chain is treated as
                // "no cycle found" rather than risking an unbounded loop.
                return false;
            }
            match self.lookup(current).and_then(|s| s.depends_on()) {
                Some(next) => current = next,
                None => return false,
            }
        }
    }
}

impl Default for TransactionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_then_lookup() {
        let index = TransactionIndex::new();
        let status = index.begin(TxId(1), 10);
        assert_eq!(status.ts, 10);
        assert!(index.lookup(TxId(1)).is_some());
        assert!(index.lookup(TxId(2)).is_none());
    }

    #[test]
    fn reclaim_requires_zero_mvv_count() {
        let index = TransactionIndex::new();
        let status = index.begin(TxId(1), 10);
        status.mvv_count.store(1, Ordering::Release);
        assert!(!index.reclaim(TxId(1)));
        status.mvv_count.store(0, Ordering::Release);
        assert!(index.reclaim(TxId(1)));
        assert!(index.lookup(TxId(1)).is_none());
    }

    #[test]
    fn oldest_active_timestamp_tracks_minimum() {
        let index = TransactionIndex::new();
        index.begin(TxId(1), 30);
        index.begin(TxId(2), 10);
        index.begin(TxId(3), 20);
        assert_eq!(index.oldest_active_timestamp(), Some(10));
    }

    #[test]
    fn ww_dependency_detects_two_cycle_as_deadlock() {
        let index = TransactionIndex::new();
        index.begin(TxId(1), 1);
        index.begin(TxId(2), 2);
        // Tx 2 is already waiting behind tx 1.
        index.lookup(TxId(2)).unwrap().set_depends_on(Some(TxId(1)));
        // Tx 1 now tries to wait behind tx 2: a cycle.
        let err = index.ww_dependency(TxId(1), TxId(2), Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, Error::Deadlock));
    }

    #[test]
    fn ww_dependency_ignores_aborted_holder() {
        let index = TransactionIndex::new();
        index.begin(TxId(1), 1);
        let holder = index.begin(TxId(2), 2);
        holder.abort(5);
        assert!(index.ww_dependency(TxId(1), TxId(2), Duration::from_millis(5)).is_ok());
    }
}
