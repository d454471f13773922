//! Engine configuration, grounded in the teacher's `Config` preset pattern
//! (`db/config.rs`): a plain struct with named constructors for common
//! deployment profiles rather than a config-file format (the CLI/config-file
//! surface that would parse one is out of scope, spec §1).

use std::time::Duration;

/// Durability policy for journal writes, matching the shape of the teacher's
/// `SyncMode` enum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncMode {
    /// fsync after every commit.
    Full,
    /// fsync on a periodic timer, batching several commits per sync.
    GroupCommit,
    /// fsync only at checkpoint boundaries.
    Checkpoint,
    /// Never fsync explicitly; rely on OS writeback. Used for throwaway/benchmark
    /// volumes only.
    Off,
}

/// Engine-wide configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Page size in bytes; must be one of 1024, 2048, 4096, 8192, 16384 (spec §3).
    pub page_size: u32,
    /// Pages to allocate when a volume is first created.
    pub initial_pages: u64,
    /// Pages to add each time a volume is grown.
    pub extension_pages: u64,
    /// Hard cap on a volume's page count.
    pub maximum_pages: u64,
    /// Number of page-sized buffers kept in the buffer pool.
    pub buffer_pool_pages: usize,
    /// Number of fast-index arrays kept warm in the fast-index pool.
    pub fast_index_pool_capacity: usize,
    /// Maximum size of one journal segment before rollover.
    pub journal_segment_size: u64,
    /// Journal durability policy.
    pub journal_sync_mode: SyncMode,
    /// Interval between automatic checkpoint proposals.
    pub checkpoint_interval: Duration,
    /// Bound on the number of deferred cleanup actions queued at once.
    pub cleanup_queue_capacity: usize,
    /// How long a blocking acquisition waits before failing with `TimedOut`.
    pub claim_deadline: Duration,
    /// How long a transaction may run before it is eligible for timeout.
    pub transaction_timeout: Duration,
    /// Quiescent I/O budget (bytes/sec) the checkpoint copier throttles to
    /// unless a copy is marked urgent.
    pub io_meter_quiescent_bytes_per_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: 8192,
            initial_pages: 16,
            extension_pages: 256,
            maximum_pages: 1 << 20,
            buffer_pool_pages: 4096,
            fast_index_pool_capacity: 1024,
            journal_segment_size: 64 * 1024 * 1024,
            journal_sync_mode: SyncMode::GroupCommit,
            checkpoint_interval: Duration::from_secs(60),
            cleanup_queue_capacity: 8192,
            claim_deadline: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(300),
            io_meter_quiescent_bytes_per_sec: 64 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Favors throughput over minimal latency; larger buffer pool and segments,
    /// group-commit durability.
    pub fn production() -> Self {
        Config {
            buffer_pool_pages: 65536,
            journal_segment_size: 256 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(300),
            ..Config::default()
        }
    }

    /// A modest middle ground suitable for interactive workloads and tests that
    /// still want realistic background-task cadence.
    pub fn balanced() -> Self {
        Config::default()
    }

    /// Maximum durability: fsync every commit, short checkpoint interval.
    pub fn durable() -> Self {
        Config {
            journal_sync_mode: SyncMode::Full,
            checkpoint_interval: Duration::from_secs(10),
            ..Config::default()
        }
    }

    /// Smallest reasonable footprint for short-lived tests; small pages, small
    /// pool, no group-commit delay.
    pub fn ephemeral() -> Self {
        Config {
            page_size: 1024,
            initial_pages: 4,
            extension_pages: 16,
            maximum_pages: 4096,
            buffer_pool_pages: 64,
            fast_index_pool_capacity: 32,
            journal_segment_size: 1024 * 1024,
            journal_sync_mode: SyncMode::Off,
            checkpoint_interval: Duration::from_millis(500),
            cleanup_queue_capacity: 256,
            claim_deadline: Duration::from_secs(5),
            transaction_timeout: Duration::from_secs(30),
            io_meter_quiescent_bytes_per_sec: 8 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_have_valid_page_sizes() {
        for cfg in [
            Config::default(),
            Config::production(),
            Config::balanced(),
            Config::durable(),
            Config::ephemeral(),
        ] {
            assert!(matches!(cfg.page_size, 1024 | 2048 | 4096 | 8192 | 16384));
            assert!(cfg.maximum_pages >= cfg.initial_pages);
        }
    }
}
