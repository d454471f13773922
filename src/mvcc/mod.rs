//! Multi-version cell encoding and MVCC visibility (spec §3, §4.7), grounded
//! in `packages/core/src/storage/version.rs`'s `VersionMetadata`/
//! `VersionedRecordKind` shape, generalized from the fixed 25-byte
//! single-version record onto the spec's variable-length multi-entry cell.

use crate::error::{Error, Result};
use crate::txn::Timestamp;

/// Bits of a [`VersionHandle`] reserved for the intra-timestamp step counter,
/// disambiguating multiple versions committed at the same timestamp (a
/// transaction's own chain of writes to the same key within one commit).
const STEP_BITS: u32 = 10;
const STEP_MASK: u64 = (1 << STEP_BITS) - 1;

/// Packs a commit timestamp and an intra-timestamp step into one ordinal so
/// version chains sort by `(timestamp, step)` as a single integer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct VersionHandle(pub u64);

impl VersionHandle {
    pub fn new(timestamp: Timestamp, step: u16) -> Self {
        debug_assert!((step as u64) <= STEP_MASK);
        VersionHandle((timestamp << STEP_BITS) | (step as u64 & STEP_MASK))
    }

    /// `0` means "not yet committed" — excluded by [`mvcc_read`].
    pub fn timestamp(self) -> Timestamp {
        self.0 >> STEP_BITS
    }

    pub fn step(self) -> u16 {
        (self.0 & STEP_MASK) as u16
    }
}

/// One versioned entry in a [`Cell::Versions`] chain.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionEntry {
    pub handle: VersionHandle,
    /// `None` marks a tombstone: the key was deleted as of this version.
    pub payload: Option<Vec<u8>>,
}

/// The value stored for a key, in one of three representations depending on
/// whether it has ever been contended (spec §4.7).
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    /// An uncontended live value, never versioned.
    Raw(Vec<u8>),
    /// An uncontended tombstone.
    Antivalue,
    /// A chain of versions in descending handle order (newest first).
    Versions(Vec<VersionEntry>),
}

impl Cell {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Cell::Raw(bytes) => {
                let mut out = Vec::with_capacity(1 + bytes.len());
                out.push(0);
                out.extend_from_slice(bytes);
                out
            }
            Cell::Antivalue => vec![1],
            Cell::Versions(entries) => {
                let mut out = vec![2];
                out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for entry in entries {
                    out.extend_from_slice(&entry.handle.0.to_be_bytes());
                    match &entry.payload {
                        None => out.extend_from_slice(&u32::MAX.to_be_bytes()),
                        Some(payload) => {
                            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                            out.extend_from_slice(payload);
                        }
                    }
                }
                out
            }
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(0) => Ok(Cell::Raw(bytes[1..].to_vec())),
            Some(1) => Ok(Cell::Antivalue),
            Some(2) => {
                let count = u32::from_be_bytes(
                    bytes
                        .get(1..5)
                        .ok_or(Error::CorruptVolume("truncated mvcc cell count"))?
                        .try_into()
                        .unwrap(),
                ) as usize;
                let mut cursor = 5;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let handle_bytes = bytes
                        .get(cursor..cursor + 8)
                        .ok_or(Error::CorruptVolume("truncated mvcc version handle"))?;
                    let handle = VersionHandle(u64::from_be_bytes(handle_bytes.try_into().unwrap()));
                    cursor += 8;
                    let len_bytes = bytes
                        .get(cursor..cursor + 4)
                        .ok_or(Error::CorruptVolume("truncated mvcc version length"))?;
                    let len = u32::from_be_bytes(len_bytes.try_into().unwrap());
                    cursor += 4;
                    let payload = if len == u32::MAX {
                        None
                    } else {
                        let len = len as usize;
                        let slice = bytes
                            .get(cursor..cursor + len)
                            .ok_or(Error::CorruptVolume("truncated mvcc version payload"))?;
                        cursor += len;
                        Some(slice.to_vec())
                    };
                    entries.push(VersionEntry { handle, payload });
                }
                Ok(Cell::Versions(entries))
            }
            _ => Err(Error::CorruptVolume("unknown mvcc cell tag")),
        }
    }
}

/// Resolves the value of `cell` as visible to a reader with snapshot
/// timestamp `ts_r`: the first version with `0 < tc(entry) <= ts_r`, or "not
/// present" — which includes landing on a tombstone (spec §4.7 `mvcc_read`).
pub fn mvcc_read(cell: &Cell, ts_r: Timestamp) -> Option<Vec<u8>> {
    match cell {
        Cell::Raw(bytes) => Some(bytes.clone()),
        Cell::Antivalue => None,
        Cell::Versions(entries) => entries
            .iter()
            .find(|entry| {
                let ts = entry.handle.timestamp();
                ts > 0 && ts <= ts_r
            })
            .and_then(|entry| entry.payload.clone()),
    }
}

/// Drops version entries no active reader can still resolve to, and collapses
/// a chain down to a plain [`Cell::Raw`]/[`Cell::Antivalue`] once only one
/// entry survives (spec §4.7 `prune`). Idempotent: running it twice with the
/// same `oldest_active_ts` is a no-op the second time. Callers hold the
/// owning page's buffer claim for the duration, so this never races a
/// concurrent mutation of the same cell — only concurrent *reads*, which see
/// either the pre- or post-prune bytes atomically via the page's own claim
/// discipline.
pub fn prune(cell: &mut Cell, oldest_active_ts: Timestamp) {
    if let Cell::Versions(entries) = cell {
        let mut kept = Vec::with_capacity(entries.len());
        let mut kept_watermark_entry = false;
        for entry in entries.drain(..) {
            let ts = entry.handle.timestamp();
            if ts == 0 {
                // Not yet committed: never pruned here, only removed
                // synchronously by its own transaction's abort path.
                kept.push(entry);
            } else if ts > oldest_active_ts {
                kept.push(entry);
            } else if !kept_watermark_entry {
                kept_watermark_entry = true;
                kept.push(entry);
            }
        }
        *entries = kept;

        if entries.len() == 1 && entries[0].handle.timestamp() > 0 && entries[0].handle.timestamp() <= oldest_active_ts
        {
            let only = entries.remove(0);
            *cell = match only.payload {
                Some(bytes) => Cell::Raw(bytes),
                None => Cell::Antivalue,
            };
        }
    }
}

/// Builds the cell that results from writing `payload` at `handle` over
/// `existing` (`None` for a key never written before). An uncontended
/// `Raw`/`Antivalue` predecessor is lifted into a one-entry chain at
/// timestamp 1 — the floor every allocated timestamp sorts above, so its
/// "always visible" meaning under [`mvcc_read`] is preserved exactly.
pub fn write_version(existing: Option<&Cell>, handle: VersionHandle, payload: Option<Vec<u8>>) -> Cell {
    let mut entries = match existing {
        None => Vec::new(),
        Some(Cell::Raw(bytes)) => vec![VersionEntry { handle: VersionHandle::new(1, 0), payload: Some(bytes.clone()) }],
        Some(Cell::Antivalue) => vec![VersionEntry { handle: VersionHandle::new(1, 0), payload: None }],
        Some(Cell::Versions(entries)) => entries.clone(),
    };
    entries.push(VersionEntry { handle, payload });
    entries.sort_by(|a, b| b.handle.cmp(&a.handle));
    Cell::Versions(entries)
}

/// Resolves a cell's pending (`timestamp == 0`) entry once its writing
/// transaction finishes. On commit (`resolution` is `Some(commit_ts)`) the
/// entry is stamped with the real commit timestamp in place; on abort
/// (`None`) it is dropped. A transaction's own write discipline guarantees at
/// most one pending entry exists per cell at a time, since a repeat write by
/// the same transaction replaces rather than appends (spec §4.7 `ww_lock`
/// owner is the only writer of a `tc = 0` entry).
///
/// Returns `None` when resolving leaves no entries at all — an abort of a
/// brand-new key that never had a prior value — which the caller must turn
/// into removing the key from its tree rather than writing a degenerate cell.
pub fn resolve_pending(cell: &Cell, resolution: Option<Timestamp>) -> Option<Cell> {
    match cell {
        Cell::Versions(entries) => {
            let mut resolved = Vec::with_capacity(entries.len());
            for entry in entries {
                if entry.handle.timestamp() == 0 {
                    if let Some(commit_ts) = resolution {
                        resolved.push(VersionEntry {
                            handle: VersionHandle::new(commit_ts, entry.handle.step()),
                            payload: entry.payload.clone(),
                        });
                    }
                } else {
                    resolved.push(entry.clone());
                }
            }
            if resolved.is_empty() {
                None
            } else {
                Some(Cell::Versions(resolved))
            }
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(ts: Timestamp, payload: Option<&str>) -> VersionEntry {
        VersionEntry {
            handle: VersionHandle::new(ts, 0),
            payload: payload.map(|s| s.as_bytes().to_vec()),
        }
    }

    #[test]
    fn version_handle_packs_and_unpacks() {
        let h = VersionHandle::new(42, 3);
        assert_eq!(h.timestamp(), 42);
        assert_eq!(h.step(), 3);
    }

    #[test]
    fn mvcc_read_finds_newest_visible_version() {
        let cell = Cell::Versions(vec![committed(30, Some("c")), committed(20, Some("b")), committed(10, Some("a"))]);
        assert_eq!(mvcc_read(&cell, 25), Some(b"b".to_vec()));
        assert_eq!(mvcc_read(&cell, 5), None);
        assert_eq!(mvcc_read(&cell, 100), Some(b"c".to_vec()));
    }

    #[test]
    fn mvcc_read_honors_tombstones() {
        let cell = Cell::Versions(vec![committed(20, None), committed(10, Some("a"))]);
        assert_eq!(mvcc_read(&cell, 25), None);
        assert_eq!(mvcc_read(&cell, 15), Some(b"a".to_vec()));
    }

    #[test]
    fn raw_and_antivalue_are_always_visible() {
        assert_eq!(mvcc_read(&Cell::Raw(b"x".to_vec()), 1), Some(b"x".to_vec()));
        assert_eq!(mvcc_read(&Cell::Antivalue, 1), None);
    }

    #[test]
    fn prune_drops_superseded_versions_and_keeps_the_watermark_entry() {
        let mut cell = Cell::Versions(vec![committed(30, Some("c")), committed(20, Some("b")), committed(10, Some("a"))]);
        prune(&mut cell, 15);
        match &cell {
            Cell::Versions(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].handle.timestamp(), 30);
                assert_eq!(entries[1].handle.timestamp(), 10);
            }
            _ => panic!("expected Versions"),
        }
    }

    #[test]
    fn prune_collapses_to_raw_once_only_one_version_survives() {
        let mut cell = Cell::Versions(vec![committed(10, Some("a"))]);
        prune(&mut cell, 50);
        assert_eq!(cell, Cell::Raw(b"a".to_vec()));
    }

    #[test]
    fn prune_collapses_to_antivalue_for_a_lone_tombstone() {
        let mut cell = Cell::Versions(vec![committed(10, None)]);
        prune(&mut cell, 50);
        assert_eq!(cell, Cell::Antivalue);
    }

    #[test]
    fn write_version_lifts_raw_predecessor_to_floor_timestamp() {
        let cell = write_version(Some(&Cell::Raw(b"old".to_vec())), VersionHandle::new(10, 0), Some(b"new".to_vec()));
        assert_eq!(mvcc_read(&cell, 1), Some(b"old".to_vec()));
        assert_eq!(mvcc_read(&cell, 10), Some(b"new".to_vec()));
    }

    #[test]
    fn write_version_appends_to_existing_chain() {
        let cell = Cell::Versions(vec![committed(10, Some("a"))]);
        let cell = write_version(Some(&cell), VersionHandle::new(20, 0), Some(b"b".to_vec()));
        assert_eq!(mvcc_read(&cell, 15), Some(b"a".to_vec()));
        assert_eq!(mvcc_read(&cell, 20), Some(b"b".to_vec()));
    }

    #[test]
    fn resolve_pending_stamps_the_pending_entry_on_commit() {
        let cell = Cell::Versions(vec![
            VersionEntry { handle: VersionHandle::new(0, 0), payload: Some(b"new".to_vec()) },
            committed(10, Some("old")),
        ]);
        let resolved = resolve_pending(&cell, Some(20)).unwrap();
        assert_eq!(mvcc_read(&resolved, 10), Some(b"old".to_vec()));
        assert_eq!(mvcc_read(&resolved, 20), Some(b"new".to_vec()));
    }

    #[test]
    fn resolve_pending_drops_the_pending_entry_on_abort() {
        let cell = Cell::Versions(vec![
            VersionEntry { handle: VersionHandle::new(0, 0), payload: Some(b"new".to_vec()) },
            committed(10, Some("old")),
        ]);
        let resolved = resolve_pending(&cell, None).unwrap();
        assert_eq!(mvcc_read(&resolved, 20), Some(b"old".to_vec()));
    }

    #[test]
    fn resolve_pending_on_abort_of_a_brand_new_key_yields_none() {
        let cell = Cell::Versions(vec![VersionEntry { handle: VersionHandle::new(0, 0), payload: Some(b"new".to_vec()) }]);
        assert!(resolve_pending(&cell, None).is_none());
    }

    #[test]
    fn encode_decode_round_trips_every_variant() {
        for cell in [
            Cell::Raw(b"hello".to_vec()),
            Cell::Antivalue,
            Cell::Versions(vec![committed(10, Some("a")), committed(5, None)]),
        ] {
            let bytes = cell.encode();
            assert_eq!(Cell::decode(&bytes).unwrap(), cell);
        }
    }
}
