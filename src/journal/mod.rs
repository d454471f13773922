//! Segmented, typed-record write-ahead journal (spec §3, §4.6, §6), grounded
//! in `crates/sombra-wal/src/lib.rs`'s CRC-chained frame WAL, generalized to
//! the spec's typed records, per-segment handle tables, and checkpoint-gated
//! rollover.

mod manager;
mod record;
mod segment;

pub use manager::{JournalAddress, JournalManager, RecoveryOutcome};
pub use record::{
    CpPayload, DrPayload, DtPayload, ItPayload, IvPayload, JournalRecordKind, PaPayload, RawRecord, SrPayload,
    TcPayload, TsPayload,
};
pub use segment::{segment_file_name, Segment, SegmentScan};
