//! Explicit transaction handle bound to one [`crate::engine::Engine`] (spec
//! §10). A transaction is bound to exactly one `Session` at a time: the
//! session owns the transaction id, its snapshot timestamp, and its
//! `TransactionStatus` registration for its entire lifetime, ending in
//! exactly one of [`Session::commit`] or [`Session::rollback`]. Dropping a
//! session that reached neither rolls the transaction back, so a panic
//! mid-transaction (or an early `?` return) can never leave one half-open.

use std::sync::Arc;

use crate::accumulator::{AccumulatorDelta, AccumulatorKind};
use crate::codec::Key;
use crate::engine::Engine;
use crate::error::Result;
use crate::pager::TaskId;
use crate::txn::{Timestamp, TransactionStatus, TxId};

/// One open transaction against an [`Engine`]. Reads see a consistent
/// snapshot as of the session's start timestamp, including its own writes;
/// writes are pending until [`Session::commit`] and invisible to every other
/// session until then.
pub struct Session {
    engine: Engine,
    task: TaskId,
    tx: TxId,
    status: Arc<TransactionStatus>,
    finished: bool,
}

impl Session {
    pub(crate) fn new(engine: Engine, task: TaskId, tx: TxId, status: Arc<TransactionStatus>) -> Self {
        Session { engine, task, tx, status, finished: false }
    }

    /// This transaction's id, for diagnostics (e.g. correlating with
    /// `tracing` spans or a deadlock report).
    pub fn id(&self) -> TxId {
        self.tx
    }

    /// This transaction's snapshot timestamp.
    pub fn snapshot_timestamp(&self) -> Timestamp {
        self.status.ts
    }

    /// Reads `key` in `tree` as visible to this transaction's snapshot,
    /// including any value this same transaction already wrote.
    pub fn get(&mut self, tree: &str, key: &Key) -> Result<Option<Vec<u8>>> {
        self.engine.inner().get(self.task, self.tx, tree, key, self.status.ts)
    }

    /// Writes `key` in `tree`, blocking on any other in-flight transaction's
    /// pending write to the same key (spec §4.7 write-write conflict
    /// resolution). Returns [`crate::error::Error::Rollback`] if the
    /// conflict resolves against this transaction; the caller should retry
    /// the whole transaction from the start.
    pub fn put(&mut self, tree: &str, key: &Key, value: Vec<u8>) -> Result<()> {
        self.engine.inner().put(self.task, self.tx, tree, key, Some(value))
    }

    /// Deletes `key` in `tree`, returning whether it was previously visible
    /// to this snapshot. Subject to the same write-write conflict resolution
    /// as [`Session::put`].
    pub fn delete(&mut self, tree: &str, key: &Key) -> Result<bool> {
        let existed = self.get(tree, key)?.is_some();
        self.engine.inner().put(self.task, self.tx, tree, key, None)?;
        Ok(existed)
    }

    /// Registers a fresh `kind` accumulator at `slot` on `tree` (spec §4.7,
    /// up to 64 slots per tree). Takes effect immediately; it is not part of
    /// this transaction's pending writes and is not rolled back if this
    /// transaction later aborts.
    pub fn create_accumulator(&mut self, tree: &str, slot: u8, kind: AccumulatorKind) -> Result<()> {
        self.engine.inner().create_accumulator(self.task, tree, slot, kind)
    }

    /// Buffers a delta against `tree`'s accumulator at `slot`, folded into
    /// the accumulator's committed value only if this transaction commits
    /// (spec §4.7 "Accumulators").
    pub fn accumulate(&mut self, tree: &str, slot: u8, delta: i64) {
        self.status.record_delta(AccumulatorDelta { tree: tree.to_string(), slot, delta });
    }

    /// Reads `tree`'s accumulator at `slot` as visible to this transaction's
    /// snapshot, or `None` if the slot has never been registered.
    pub fn read_accumulator(&mut self, tree: &str, slot: u8) -> Result<Option<i64>> {
        self.engine.inner().read_accumulator(self.task, tree, slot, self.status.ts)
    }

    /// Commits the transaction: allocates its commit timestamp, stamps every
    /// version it wrote, and durably appends its `TC` journal record. Returns
    /// the commit timestamp.
    pub fn commit(mut self) -> Result<Timestamp> {
        self.finished = true;
        self.engine.inner().commit(self.task, self.tx, &self.status)
    }

    /// Rolls the transaction back, dropping every version it wrote.
    pub fn rollback(mut self) {
        self.finished = true;
        self.engine.inner().abort(self.task, self.tx, &self.status);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.inner().abort(self.task, self.tx, &self.status);
        }
    }
}
