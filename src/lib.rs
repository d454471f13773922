//! # sombra-kv - embedded, transactional, ordered key/value storage engine
//!
//! `sombra-kv` is a page-oriented B-tree storage engine with prefix elision,
//! a claim-based buffer pool, multi-version concurrency control, and a
//! segmented write-ahead journal with checkpoint-driven recovery.
//!
//! ## Architecture
//!
//! - **`codec`** — order-preserving typed key encoding.
//! - **`page`** — on-disk page layouts (generic header, B-tree payload, fast
//!   index, long-record chains).
//! - **`pager`** — the in-process buffer pool, its per-task claim discipline,
//!   and the fast-index pool.
//! - **`volume`** — file-backed page storage, volume header, garbage chain.
//! - **`btree`** — search/insert/delete/split/merge over pages.
//! - **`mvcc`** — multi-version cell encoding and visibility.
//! - **`txn`** — the transaction index, timestamp oracle, and write-write
//!   conflict detection.
//! - **`accumulator`** — SUM/MIN/MAX/SEQ accumulators with snapshot-consistent
//!   reads.
//! - **`journal`** — the segmented, typed-record write-ahead log and crash
//!   recovery.
//! - **`checkpoint`** — checkpoint allocation and the background copier.
//! - **`cleanup`** — bounded deferred-maintenance queue.
//! - **`task`** / **`engine`** / **`session`** — the concurrency and resource
//!   model: an explicit `Engine` handle, cooperative background tasks, and
//!   `Session` handles carrying the active transaction.

pub mod accumulator;
pub mod btree;
pub mod checkpoint;
pub mod cleanup;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod logging;
pub mod mvcc;
pub mod page;
pub mod pager;
pub mod session;
pub mod task;
pub mod txn;
pub mod volume;

pub use crate::config::{Config, SyncMode};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::session::Session;
