//! Structured logging initialization.
//!
//! The engine instruments subsystem boundaries (volume open/close, checkpoint
//! start/finish, recovery scan, cleanup action failures, rollback) with
//! `tracing` spans and events rather than ad-hoc printing. This module only
//! wires up a subscriber; callers embedding the engine in a larger application
//! may install their own subscriber instead and skip this entirely.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading its filter from `RUST_LOG`,
/// falling back to `default_filter` when the environment variable is unset.
///
/// Safe to call more than once; subsequent calls are no-ops (the crate does not
/// treat a second subscriber installation as an error, since tests in this
/// workspace each call it independently).
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
