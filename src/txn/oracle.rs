//! Monotonic timestamp allocation, grounded in
//! `packages/core/src/db/timestamp_oracle.rs`'s `TimestampOracle`.

use std::sync::atomic::{AtomicU64, Ordering};

use super::Timestamp;

/// Sentinel written to `proposed_checkpoint` between "a checkpoint timestamp
/// has been decided" and "it has been published", closing the race spec §4.7
/// calls out: a reader that observes the sentinel spins rather than seeing a
/// stale or torn value.
const PROPOSING: Timestamp = u64::MAX;

/// Allocates monotonically increasing timestamps used as transaction start
/// times, commit times, and checkpoint boundaries.
#[derive(Debug)]
pub struct TimestampOracle {
    current: AtomicU64,
    proposed_checkpoint: AtomicU64,
}

impl TimestampOracle {
    /// Timestamp 0 is reserved to mean "not yet committed" (spec §4.7), so
    /// allocation starts at 1.
    pub fn new() -> Self {
        TimestampOracle {
            current: AtomicU64::new(1),
            proposed_checkpoint: AtomicU64::new(0),
        }
    }

    /// Restores the oracle's counter after journal recovery.
    pub fn with_starting_timestamp(starting: Timestamp) -> Self {
        TimestampOracle {
            current: AtomicU64::new(starting.max(1)),
            proposed_checkpoint: AtomicU64::new(0),
        }
    }

    /// Allocates and returns the next timestamp. Used for both transaction
    /// start (`ts`) and commit (`tc`) timestamps.
    pub fn update_timestamp(&self) -> Timestamp {
        self.current.fetch_add(1, Ordering::AcqRel)
    }

    /// The most recently allocated timestamp, without allocating a new one.
    pub fn current_timestamp(&self) -> Timestamp {
        self.current.load(Ordering::Acquire)
    }

    /// Allocates a checkpoint timestamp, publishing the sentinel first so
    /// concurrent readers of [`TimestampOracle::checkpoint_timestamp`] never
    /// observe a half-written value.
    pub fn allocate_checkpoint(&self) -> Timestamp {
        self.proposed_checkpoint.store(PROPOSING, Ordering::Release);
        let ts = self.update_timestamp();
        self.proposed_checkpoint.store(ts, Ordering::Release);
        ts
    }

    /// The last published checkpoint timestamp, spinning past an in-flight
    /// [`TimestampOracle::allocate_checkpoint`] call.
    pub fn checkpoint_timestamp(&self) -> Timestamp {
        loop {
            let v = self.proposed_checkpoint.load(Ordering::Acquire);
            if v != PROPOSING {
                return v;
            }
            std::hint::spin_loop();
        }
    }
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}
