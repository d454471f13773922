//! Per-tree SUM/MIN/MAX/SEQ accumulators with snapshot-consistent reads
//! (spec §4.7 "Accumulators").
//!
//! No direct teacher counterpart (the graph-DB teacher has no aggregate
//! primitive); modeled on `packages/core/src/db/timestamp_oracle.rs`'s
//! committed-value-plus-snapshot-map idiom, generalized from "one clock" to
//! "one folded value per accumulator".

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::txn::Timestamp;

/// Which fold an accumulator applies to committed deltas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccumulatorKind {
    Sum,
    Min,
    Max,
    /// Monotonic allocation counter; deltas are always positive and folded
    /// the same way as `Sum`.
    Seq,
}

impl AccumulatorKind {
    fn identity(self) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => 0,
            AccumulatorKind::Min => i64::MAX,
            AccumulatorKind::Max => i64::MIN,
        }
    }

    fn fold(self, base: i64, delta: i64) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => base.saturating_add(delta),
            AccumulatorKind::Min => base.min(delta),
            AccumulatorKind::Max => base.max(delta),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            AccumulatorKind::Sum => 0,
            AccumulatorKind::Min => 1,
            AccumulatorKind::Max => 2,
            AccumulatorKind::Seq => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => AccumulatorKind::Sum,
            1 => AccumulatorKind::Min,
            2 => AccumulatorKind::Max,
            3 => AccumulatorKind::Seq,
            _ => return Err(Error::CorruptVolume("unknown accumulator kind byte")),
        })
    }
}

/// A commit-scoped delta recorded by a transaction, folded into its target
/// accumulator when the transaction's `TC` record becomes durable.
#[derive(Clone, Debug)]
pub struct AccumulatorDelta {
    pub tree: String,
    pub slot: u8,
    pub delta: i64,
}

/// One SUM/MIN/MAX/SEQ accumulator. Up to 64 live per tree (spec §4.7), held
/// in that tree's [`crate::btree::TreeMeta`].
#[derive(Clone, Debug, PartialEq)]
pub struct Accumulator {
    kind: AccumulatorKind,
    committed_base: i64,
    /// Cumulative folded value as of each commit timestamp; reading at `ts_r`
    /// is "the newest snapshot at or before `ts_r`", equivalent to folding
    /// every delta with `tc <= ts_r` from scratch but O(log n) instead of
    /// O(deltas) (spec §8 invariant 9, the accumulator snapshot law).
    snapshots: BTreeMap<Timestamp, i64>,
}

impl Accumulator {
    pub fn new(kind: AccumulatorKind) -> Self {
        Accumulator {
            kind,
            committed_base: kind.identity(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> AccumulatorKind {
        self.kind
    }

    /// Folds a transaction's delta into the committed value at `commit_ts`,
    /// recording a new snapshot entry. Must be called in increasing
    /// `commit_ts` order (the journal's commit order).
    pub fn apply_commit(&mut self, commit_ts: Timestamp, delta: i64) {
        self.committed_base = self.kind.fold(self.committed_base, delta);
        self.snapshots.insert(commit_ts, self.committed_base);
    }

    /// The accumulator's value as visible to a reader with snapshot `ts_r`.
    pub fn read(&self, ts_r: Timestamp) -> i64 {
        match self.snapshots.range(..=ts_r).next_back() {
            Some((_, value)) => *value,
            None => self.kind.identity(),
        }
    }

    /// Drops snapshot entries no active reader can still need: every entry
    /// strictly older than the newest one at or before `oldest_active_ts` is
    /// redundant, since any read at or above `oldest_active_ts` would resolve
    /// to that newest-at-or-before entry anyway.
    pub fn prune(&mut self, oldest_active_ts: Timestamp) {
        let keep_from = self.snapshots.range(..=oldest_active_ts).next_back().map(|(k, _)| *k);
        if let Some(keep_from) = keep_from {
            self.snapshots = self.snapshots.split_off(&keep_from);
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + 2 + self.snapshots.len() * 16);
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.committed_base.to_be_bytes());
        out.extend_from_slice(&(self.snapshots.len() as u16).to_be_bytes());
        for (ts, value) in &self.snapshots {
            out.extend_from_slice(&ts.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < 11 {
            return Err(Error::CorruptVolume("truncated accumulator record"));
        }
        let kind = AccumulatorKind::from_byte(bytes[0])?;
        let committed_base = i64::from_be_bytes(bytes[1..9].try_into().unwrap());
        let count = u16::from_be_bytes(bytes[9..11].try_into().unwrap()) as usize;
        let mut cursor = 11;
        let mut snapshots = BTreeMap::new();
        for _ in 0..count {
            let entry = bytes
                .get(cursor..cursor + 16)
                .ok_or(Error::CorruptVolume("truncated accumulator snapshot entry"))?;
            let ts = Timestamp::from_be_bytes(entry[0..8].try_into().unwrap());
            let value = i64::from_be_bytes(entry[8..16].try_into().unwrap());
            snapshots.insert(ts, value);
            cursor += 16;
        }
        Ok((
            Accumulator {
                kind,
                committed_base,
                snapshots,
            },
            cursor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_accumulator_folds_in_commit_order() {
        let mut acc = Accumulator::new(AccumulatorKind::Sum);
        acc.apply_commit(10, 5);
        acc.apply_commit(20, 3);
        assert_eq!(acc.read(5), 0);
        assert_eq!(acc.read(10), 5);
        assert_eq!(acc.read(15), 5);
        assert_eq!(acc.read(20), 8);
    }

    #[test]
    fn min_and_max_track_extremes() {
        let mut min = Accumulator::new(AccumulatorKind::Min);
        min.apply_commit(1, 10);
        min.apply_commit(2, 4);
        min.apply_commit(3, 7);
        assert_eq!(min.read(3), 4);

        let mut max = Accumulator::new(AccumulatorKind::Max);
        max.apply_commit(1, 10);
        max.apply_commit(2, 4);
        assert_eq!(max.read(2), 10);
    }

    #[test]
    fn prune_drops_redundant_old_snapshots() {
        let mut acc = Accumulator::new(AccumulatorKind::Sum);
        acc.apply_commit(10, 1);
        acc.apply_commit(20, 1);
        acc.apply_commit(30, 1);
        acc.prune(25);
        assert_eq!(acc.snapshots.len(), 2);
        assert_eq!(acc.read(22), 2);
        assert_eq!(acc.read(30), 3);
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut acc = Accumulator::new(AccumulatorKind::Seq);
        acc.apply_commit(5, 1);
        acc.apply_commit(9, 1);
        let bytes = acc.encode();
        let (decoded, used) = Accumulator::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, acc);
    }
}
