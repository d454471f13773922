//! Per-transaction status record, grounded in
//! `packages/core/src/db/transaction.rs`'s `Transaction`/`TxState`,
//! generalized off graph-specific dirty-page/node/edge tracking onto the
//! spec's `ts`/`tc`/`ta`/write-write-lock fields (spec §4.7).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::accumulator::AccumulatorDelta;
use crate::error::{Error, Result};

use super::{Timestamp, TxId};

/// A transaction's commit progress, packed so readers can observe it without
/// taking a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    /// Still running; writes are only visible to itself.
    Uncommitted,
    /// Commit has started (WAL `TC` record not yet durable); carries the
    /// timestamp that will become the commit timestamp once durable.
    Committing(Timestamp),
    /// Durably committed at this timestamp.
    Committed(Timestamp),
    /// Rolled back; its writes must never become visible.
    Aborted,
}

fn encode(state: CommitState) -> i64 {
    match state {
        CommitState::Uncommitted => 0,
        CommitState::Committing(ts) => -(ts as i64),
        CommitState::Committed(ts) => ts as i64,
        CommitState::Aborted => i64::MIN,
    }
}

fn decode(raw: i64) -> CommitState {
    if raw == 0 {
        CommitState::Uncommitted
    } else if raw == i64::MIN {
        CommitState::Aborted
    } else if raw < 0 {
        CommitState::Committing((-raw) as Timestamp)
    } else {
        CommitState::Committed(raw as Timestamp)
    }
}

/// A single-permit semaphore held for a transaction's entire lifetime,
/// released on commit or rollback. Conflicting writers wait on it rather than
/// polling (spec §4.7 `ww_lock`).
struct WwLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl WwLock {
    fn new() -> Self {
        WwLock {
            held: Mutex::new(true),
            released: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.released.notify_all();
    }

    /// Waits up to `deadline` for the lock to be released. Returns `true` if
    /// it observed a release (the caller should re-check overall state, since
    /// another waiter may have been notified first), `false` on timeout.
    fn wait_for_release(&self, deadline: Instant) -> bool {
        let mut held = self.held.lock();
        while *held {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let timeout = deadline - now;
            let result = self.released.wait_for(&mut held, timeout);
            if result.timed_out() {
                return !*held;
            }
        }
        true
    }
}

/// The mutable status record registered in the [`super::TransactionIndex`]
/// for one transaction's lifetime.
pub struct TransactionStatus {
    id: TxId,
    /// Start (snapshot) timestamp.
    pub ts: Timestamp,
    tc: AtomicI64,
    /// Abort-cleanup timestamp: once set, no reader needs this transaction's
    /// writes and its versions are eligible for pruning.
    ta: AtomicU64,
    /// Count of MVCC version entries still attributed to this transaction.
    /// The transaction index reclaims a status record only once this reaches
    /// zero and no active reader's `ts` predates `ta`.
    pub mvv_count: AtomicI64,
    deltas: Mutex<Vec<AccumulatorDelta>>,
    ww_lock: WwLock,
    /// Back-pointer used for write-write cycle (deadlock) detection: the
    /// transaction this one is currently waiting behind, if any.
    depends_on: Mutex<Option<TxId>>,
}

impl TransactionStatus {
    pub fn new(id: TxId, ts: Timestamp) -> Self {
        TransactionStatus {
            id,
            ts,
            tc: AtomicI64::new(encode(CommitState::Uncommitted)),
            ta: AtomicU64::new(0),
            mvv_count: AtomicI64::new(0),
            deltas: Mutex::new(Vec::new()),
            ww_lock: WwLock::new(),
            depends_on: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn commit_state(&self) -> CommitState {
        decode(self.tc.load(Ordering::Acquire))
    }

    /// Marks commit as started: `tc` becomes `-commit_ts` so concurrent
    /// readers can tell a commit is in flight without yet trusting it durable.
    pub fn begin_commit(&self, commit_ts: Timestamp) {
        self.tc.store(encode(CommitState::Committing(commit_ts)), Ordering::Release);
    }

    /// Marks commit durable: `tc` becomes `+commit_ts`.
    pub fn finish_commit(&self, commit_ts: Timestamp) {
        self.tc.store(encode(CommitState::Committed(commit_ts)), Ordering::Release);
        self.ww_lock.release();
    }

    /// Marks the transaction aborted and releases any waiters on its
    /// `ww_lock`.
    pub fn abort(&self, abort_ts: Timestamp) {
        self.tc.store(encode(CommitState::Aborted), Ordering::Release);
        self.ta.store(abort_ts, Ordering::Release);
        self.ww_lock.release();
    }

    pub fn abort_timestamp(&self) -> Option<Timestamp> {
        match self.ta.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Buffers a commit-scoped accumulator delta, folded in at commit time
    /// (spec §4.7 "Accumulators").
    pub fn record_delta(&self, delta: AccumulatorDelta) {
        self.deltas.lock().push(delta);
    }

    /// Drains the buffered accumulator deltas for commit-time folding.
    pub fn take_deltas(&self) -> Vec<AccumulatorDelta> {
        std::mem::take(&mut self.deltas.lock())
    }

    pub(super) fn set_depends_on(&self, holder: Option<TxId>) {
        *self.depends_on.lock() = holder;
    }

    pub(super) fn depends_on(&self) -> Option<TxId> {
        *self.depends_on.lock()
    }

    pub(super) fn wait_for_release(&self, deadline: Instant) -> bool {
        self.ww_lock.wait_for_release(deadline)
    }
}

/// Resolves a write-write conflict between `self_status` (the transaction
/// about to write) and `holder` (the transaction whose uncommitted version it
/// collided with), per spec §4.7:
/// - holder aborted → ignore the conflict, proceed.
/// - holder already committed or mid-commit → the younger transaction rolls
///   back.
/// - holder still running and older → wait briefly on the holder's `ww_lock`,
///   then re-resolve.
///
/// Cycle detection (deadlock) is the caller's ([`super::TransactionIndex`])
/// responsibility, since it requires the full dependency graph.
pub(super) fn resolve(
    self_status: &TransactionStatus,
    holder: &TransactionStatus,
    deadline: Duration,
) -> Result<()> {
    let wait_deadline = Instant::now() + deadline;
    loop {
        match holder.commit_state() {
            CommitState::Aborted => return Ok(()),
            CommitState::Committing(_) | CommitState::Committed(_) => return Err(Error::Rollback),
            CommitState::Uncommitted => {
                if holder.ts >= self_status.ts {
                    // Holder started at or after self; nothing to wait on.
                    return Ok(());
                }
                if !holder.wait_for_release(wait_deadline) {
                    return Err(Error::TimedOut);
                }
                // Re-check: the holder may have aborted, committed, or simply
                // released spuriously alongside another waiter.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_state_round_trips() {
        let status = TransactionStatus::new(TxId(1), 10);
        assert_eq!(status.commit_state(), CommitState::Uncommitted);
        status.begin_commit(20);
        assert_eq!(status.commit_state(), CommitState::Committing(20));
        status.finish_commit(20);
        assert_eq!(status.commit_state(), CommitState::Committed(20));
    }

    #[test]
    fn abort_releases_waiters() {
        let holder = TransactionStatus::new(TxId(1), 1);
        holder.abort(5);
        assert_eq!(holder.commit_state(), CommitState::Aborted);
        assert_eq!(holder.abort_timestamp(), Some(5));
    }

    #[test]
    fn resolve_ignores_aborted_holder() {
        let self_status = TransactionStatus::new(TxId(2), 2);
        let holder = TransactionStatus::new(TxId(1), 1);
        holder.abort(5);
        assert!(resolve(&self_status, &holder, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn resolve_rolls_back_against_committed_holder() {
        let self_status = TransactionStatus::new(TxId(2), 2);
        let holder = TransactionStatus::new(TxId(1), 1);
        holder.begin_commit(3);
        holder.finish_commit(3);
        assert!(matches!(
            resolve(&self_status, &holder, Duration::from_millis(10)),
            Err(Error::Rollback)
        ));
    }

    #[test]
    fn resolve_waits_then_times_out_on_live_older_holder() {
        let self_status = TransactionStatus::new(TxId(2), 5);
        let holder = TransactionStatus::new(TxId(1), 1);
        let err = resolve(&self_status, &holder, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::TimedOut));
    }

    #[test]
    fn resolve_proceeds_against_younger_live_holder() {
        let self_status = TransactionStatus::new(TxId(1), 1);
        let holder = TransactionStatus::new(TxId(2), 5);
        assert!(resolve(&self_status, &holder, Duration::from_millis(10)).is_ok());
    }
}
