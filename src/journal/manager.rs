//! Segmented, typed-record journal manager: handle tables, page-map, the
//! checkpoint-deferred rollover policy, transaction framing, and recovery
//! (spec §3, §4.6, §6, §8).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::page::PageId;
use crate::txn::{Timestamp, TxId};
use crate::volume::VolumeId;

use super::record::{
    CpPayload, DrPayload, DtPayload, ItPayload, IvPayload, JournalRecordKind, PaPayload, SrPayload, TcPayload,
    TsPayload,
};
use super::segment::Segment;

const PAGE_MAP_BUCKETS: usize = 16;

/// Byte offset of one record within the journal: which segment generation,
/// and the segment-local offset of its header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct JournalAddress {
    pub generation: u32,
    pub offset: u64,
}

fn page_map_bucket(key: &(VolumeId, PageId)) -> usize {
    (key.0 .0 as usize ^ (key.1 .0 as usize).rotate_left(16)) % PAGE_MAP_BUCKETS
}

#[derive(Default)]
struct HandleTable {
    next: u32,
    volumes: HashMap<VolumeId, u32>,
    trees: HashMap<(u32, String), u32>,
}

impl HandleTable {
    fn reset(&mut self) {
        self.next = 0;
        self.volumes.clear();
        self.trees.clear();
    }

    fn alloc(&mut self) -> u32 {
        self.next += 1;
        self.next
    }
}

/// Outcome of scanning the journal forward from its last checkpoint (spec §8
/// "Recovery"): the committed set, the timestamp high-water mark to restore
/// the oracle from, and every page whose bytes must be rewritten into its
/// volume because a torn write (or none at all) reached the volume file.
pub struct RecoveryOutcome {
    pub committed: HashMap<TxId, Timestamp>,
    pub highest_timestamp: Timestamp,
    pub last_checkpoint: Option<CpPayload>,
    pub recovered_pages: HashMap<(VolumeId, PageId), Vec<u8>>,
}

/// The segmented append-only journal (spec §3 "Journal").
pub struct JournalManager {
    dir: PathBuf,
    prefix: String,
    segment_size: u64,
    segments: Mutex<Vec<Arc<Segment>>>,
    handles: Mutex<HandleTable>,
    page_map: Vec<Mutex<HashMap<(VolumeId, PageId), JournalAddress>>>,
    base_address: Mutex<JournalAddress>,
    pending_rollover: AtomicBool,
}

impl JournalManager {
    /// Opens the journal directory, creating an initial segment if empty, and
    /// returns the manager alongside what recovery determined (spec §8).
    pub fn open_or_create(
        dir: &Path,
        prefix: &str,
        segment_size: u64,
        created_at: Timestamp,
        read_volume_page: impl FnMut(VolumeId, PageId) -> Result<Vec<u8>>,
    ) -> Result<(Self, RecoveryOutcome)> {
        fs::create_dir_all(dir)?;
        let mut generations = existing_generations(dir, prefix)?;
        let segments = if generations.is_empty() {
            generations.push(0);
            vec![Arc::new(Segment::create(dir, prefix, 0, created_at)?)]
        } else {
            generations
                .iter()
                .map(|&gen| Segment::open_existing(dir.join(super::segment::segment_file_name(prefix, gen)), gen))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .map(Arc::new)
                .collect()
        };

        let manager = JournalManager {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            segment_size,
            segments: Mutex::new(segments),
            handles: Mutex::new(HandleTable::default()),
            page_map: (0..PAGE_MAP_BUCKETS).map(|_| Mutex::new(HashMap::new())).collect(),
            base_address: Mutex::new(JournalAddress { generation: 0, offset: 0 }),
            pending_rollover: AtomicBool::new(false),
        };

        let outcome = manager.recover(read_volume_page)?;
        if let Some(cp) = &outcome.last_checkpoint {
            *manager.base_address.lock() = JournalAddress { generation: cp.base_generation, offset: cp.base_offset };
        }
        Ok((manager, outcome))
    }

    fn current_segment(&self) -> Arc<Segment> {
        self.segments.lock().last().expect("journal always has at least one segment").clone()
    }

    fn segment(&self, generation: u32) -> Result<Arc<Segment>> {
        self.segments
            .lock()
            .iter()
            .find(|s| s.generation() == generation)
            .cloned()
            .ok_or(Error::CorruptVolume("journal segment generation not resident"))
    }

    fn volume_handle(&self, volume: VolumeId, path: &str, timestamp: Timestamp) -> Result<u32> {
        let mut handles = self.handles.lock();
        if let Some(&h) = handles.volumes.get(&volume) {
            return Ok(h);
        }
        let h = handles.alloc();
        handles.volumes.insert(volume, h);
        drop(handles);
        let payload = IvPayload { handle: h, volume, path: path.to_string() }.encode();
        self.current_segment().append(JournalRecordKind::Iv, timestamp, &payload)?;
        Ok(h)
    }

    fn tree_handle(&self, volume_handle: u32, name: &str, timestamp: Timestamp) -> Result<u32> {
        let key = (volume_handle, name.to_string());
        let mut handles = self.handles.lock();
        if let Some(&h) = handles.trees.get(&key) {
            return Ok(h);
        }
        let h = handles.alloc();
        handles.trees.insert(key, h);
        drop(handles);
        let payload = ItPayload { handle: h, volume_handle, name: name.to_string() }.encode();
        self.current_segment().append(JournalRecordKind::It, timestamp, &payload)?;
        Ok(h)
    }

    /// Records a page image, eliding any unchanged prefix/suffix run against
    /// `previous` (spec §8 `PA` payload). `previous` is the buffer pool's
    /// resident pre-write copy, not a value re-derived from the journal.
    pub fn record_page_image(
        &self,
        volume: VolumeId,
        volume_path: &str,
        page: PageId,
        previous: &[u8],
        new: &[u8],
        timestamp: Timestamp,
    ) -> Result<JournalAddress> {
        let volume_handle = self.volume_handle(volume, volume_path, timestamp)?;
        let (left_size, right_size) = elided_run(previous, new);
        let middle = new[left_size..new.len() - right_size].to_vec();
        let payload = PaPayload {
            volume_handle,
            page,
            left_size: left_size as u32,
            right_size: right_size as u32,
            middle,
        }
        .encode();
        let segment = self.current_segment();
        let offset = segment.append(JournalRecordKind::Pa, timestamp, &payload)?;
        let address = JournalAddress { generation: segment.generation(), offset };
        let key = (volume, page);
        self.page_map[page_map_bucket(&key)].lock().insert(key, address);
        self.maybe_flag_rollover(&segment);
        Ok(address)
    }

    pub fn begin_transaction(&self, tx: TxId, start_ts: Timestamp) -> Result<()> {
        let payload = TsPayload { tx, start_ts }.encode();
        self.current_segment().append(JournalRecordKind::Ts, start_ts, &payload)?;
        Ok(())
    }

    pub fn record_put(
        &self,
        tx: TxId,
        volume: VolumeId,
        volume_path: &str,
        tree: &str,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
    ) -> Result<()> {
        let volume_handle = self.volume_handle(volume, volume_path, timestamp)?;
        let tree_handle = self.tree_handle(volume_handle, tree, timestamp)?;
        let payload = SrPayload { tx, volume_handle, tree_handle, key: key.to_vec(), value: value.to_vec() }.encode();
        self.current_segment().append(JournalRecordKind::Sr, timestamp, &payload)?;
        Ok(())
    }

    pub fn record_delete(
        &self,
        tx: TxId,
        volume: VolumeId,
        volume_path: &str,
        tree: &str,
        key: &[u8],
        timestamp: Timestamp,
    ) -> Result<()> {
        let volume_handle = self.volume_handle(volume, volume_path, timestamp)?;
        let tree_handle = self.tree_handle(volume_handle, tree, timestamp)?;
        let payload = DrPayload { tx, volume_handle, tree_handle, key: key.to_vec() }.encode();
        self.current_segment().append(JournalRecordKind::Dr, timestamp, &payload)?;
        Ok(())
    }

    pub fn record_delta(&self, tx: TxId, tree_handle: u32, slot: u8, delta: i64, timestamp: Timestamp) -> Result<()> {
        let payload = DtPayload { tx, tree_handle, slot, delta }.encode();
        self.current_segment().append(JournalRecordKind::Dt, timestamp, &payload)?;
        Ok(())
    }

    /// Appends the transaction's `TC` record. The caller must not acknowledge
    /// commit to its client until the segment has been synced per the
    /// configured [`crate::config::SyncMode`] (spec §8 "Transaction framing").
    pub fn commit_transaction(&self, tx: TxId, commit_ts: Timestamp) -> Result<()> {
        let payload = TcPayload { tx, commit_ts }.encode();
        self.current_segment().append(JournalRecordKind::Tc, commit_ts, &payload)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.current_segment().sync()
    }

    /// Appends a `CP` record carrying the journal's current base address
    /// and, if a rollover was deferred waiting for this checkpoint boundary,
    /// performs it now (spec §8/§9: "rollover is only permitted at a
    /// checkpoint boundary").
    pub fn checkpoint(&self, checkpoint_ts: Timestamp) -> Result<()> {
        let base_address = self.base_address();
        let payload = CpPayload {
            checkpoint_ts,
            base_generation: base_address.generation,
            base_offset: base_address.offset,
        }
        .encode();
        self.current_segment().append(JournalRecordKind::Cp, checkpoint_ts, &payload)?;
        self.sync()?;
        if self.pending_rollover.swap(false, Ordering::AcqRel) {
            self.rollover(checkpoint_ts)?;
        }
        Ok(())
    }

    /// Advances `base_address` monotonically once the copier has durably
    /// written a page image at or after `candidate` to its volume home
    /// (spec §9: "`Copier`... advances `base_address` on success").
    pub fn advance_base_address(&self, candidate: JournalAddress) {
        let mut base = self.base_address.lock();
        if candidate > *base {
            *base = candidate;
        }
    }

    fn maybe_flag_rollover(&self, segment: &Segment) {
        if segment.len() >= self.segment_size {
            self.pending_rollover.store(true, Ordering::Release);
        }
    }

    fn rollover(&self, timestamp: Timestamp) -> Result<()> {
        let mut segments = self.segments.lock();
        let old = segments.last().unwrap().clone();
        old.append(JournalRecordKind::Je, timestamp, &[])?;
        old.sync()?;
        let new_generation = old.generation() + 1;
        let new_segment = Segment::create(&self.dir, &self.prefix, new_generation, timestamp)?;
        segments.push(Arc::new(new_segment));
        drop(segments);
        self.handles.lock().reset();
        Ok(())
    }

    /// Base address below which every page image is guaranteed copied to its
    /// volume home; segments wholly below it may be deleted (spec §8 "Base
    /// address").
    pub fn base_address(&self) -> JournalAddress {
        *self.base_address.lock()
    }

    /// Deletes every segment file strictly older than `self.base_address()`.
    pub fn reclaim_segments(&self) -> Result<()> {
        let base = self.base_address();
        let mut segments = self.segments.lock();
        let mut retained = Vec::with_capacity(segments.len());
        for segment in segments.drain(..) {
            if segment.generation() < base.generation {
                fs::remove_file(segment.path())?;
            } else {
                retained.push(segment);
            }
        }
        *segments = retained;
        Ok(())
    }

    /// Pops the oldest page-map entry (by journal address), if any — the
    /// copier's unit of work (spec §9).
    pub fn oldest_pending_page(&self) -> Option<((VolumeId, PageId), JournalAddress)> {
        let mut best: Option<((VolumeId, PageId), JournalAddress)> = None;
        for bucket in &self.page_map {
            let bucket = bucket.lock();
            for (&key, &addr) in bucket.iter() {
                if best.map(|(_, b)| addr < b).unwrap_or(true) {
                    best = Some((key, addr));
                }
            }
        }
        best
    }

    /// Removes a page-map entry once the copier has durably written it to
    /// its volume home.
    pub fn clear_page_entry(&self, key: (VolumeId, PageId), at: JournalAddress) {
        let mut bucket = self.page_map[page_map_bucket(&key)].lock();
        if bucket.get(&key) == Some(&at) {
            bucket.remove(&key);
        }
    }

    /// Reads back the raw `PA` payload at a journal address, for the copier
    /// to reconstruct a page's bytes against its current volume image.
    pub fn read_page_record(&self, at: JournalAddress) -> Result<PaPayload> {
        let segment = self.segment(at.generation)?;
        let record = segment.read_record_at(at.offset)?;
        if !matches!(record.kind, JournalRecordKind::Pa) {
            return Err(Error::CorruptVolume("journal address does not point at a PA record"));
        }
        PaPayload::decode(&record.payload)
    }

    /// Walks every segment from the oldest resident one, replaying handle
    /// tables, the page map, and transaction commit state, and reconstructing
    /// full page bytes for every page touched since the volume's on-disk
    /// image (spec §8 "Recovery").
    fn recover(&self, mut read_volume_page: impl FnMut(VolumeId, PageId) -> Result<Vec<u8>>) -> Result<RecoveryOutcome> {
        let mut committed = HashMap::new();
        let mut started: HashMap<TxId, Timestamp> = HashMap::new();
        let mut highest_timestamp: Timestamp = 0;
        let mut last_checkpoint: Option<CpPayload> = None;
        let mut volume_by_handle: HashMap<u32, (VolumeId, String)> = HashMap::new();
        let mut recovered_pages: HashMap<(VolumeId, PageId), Vec<u8>> = HashMap::new();

        let segments: Vec<Arc<Segment>> = self.segments.lock().clone();
        for segment in segments {
            let mut scan = segment.scan_from(0)?;
            loop {
                let (_, record) = match scan.next_record()? {
                    Some(pair) => pair,
                    None => break,
                };
                highest_timestamp = highest_timestamp.max(record.timestamp);
                match record.kind {
                    JournalRecordKind::Iv => {
                        let iv = IvPayload::decode(&record.payload)?;
                        volume_by_handle.insert(iv.handle, (iv.volume, iv.path));
                    }
                    JournalRecordKind::Pa => {
                        let pa = PaPayload::decode(&record.payload)?;
                        let (volume, _) = volume_by_handle
                            .get(&pa.volume_handle)
                            .cloned()
                            .ok_or(Error::CorruptVolume("PA record references unbound volume handle"))?;
                        let key = (volume, pa.page);
                        let base = match recovered_pages.get(&key) {
                            Some(bytes) => bytes.clone(),
                            None => read_volume_page(volume, pa.page)?,
                        };
                        let rebuilt = pa.reconstruct(&base);
                        recovered_pages.insert(key, rebuilt);
                        let addr = JournalAddress { generation: segment.generation(), offset: 0 };
                        let _ = addr; // page-map entries are rebuilt by the live manager on next write; recovery only needs bytes.
                    }
                    JournalRecordKind::Ts => {
                        let ts = TsPayload::decode(&record.payload)?;
                        started.insert(ts.tx, ts.start_ts);
                    }
                    JournalRecordKind::Tc => {
                        let tc = TcPayload::decode(&record.payload)?;
                        committed.insert(tc.tx, tc.commit_ts);
                    }
                    JournalRecordKind::Cp => {
                        last_checkpoint = Some(CpPayload::decode(&record.payload)?);
                    }
                    JournalRecordKind::It | JournalRecordKind::Sr | JournalRecordKind::Dr | JournalRecordKind::Dt
                    | JournalRecordKind::Jh | JournalRecordKind::Je => {}
                }
            }
        }

        Ok(RecoveryOutcome {
            committed,
            highest_timestamp,
            last_checkpoint,
            recovered_pages,
        })
    }
}

/// Lengths of the unchanged leading and trailing byte runs between `previous`
/// and `new`, capped so they never overlap.
fn elided_run(previous: &[u8], new: &[u8]) -> (usize, usize) {
    if previous.len() != new.len() {
        return (0, 0);
    }
    let len = new.len();
    let left = previous.iter().zip(new.iter()).take_while(|(a, b)| a == b).count();
    let mut right = 0;
    while right < len - left && previous[len - 1 - right] == new[len - 1 - right] {
        right += 1;
    }
    (left, right)
}

fn existing_generations(dir: &Path, prefix: &str) -> Result<Vec<u32>> {
    let mut generations = Vec::new();
    if !dir.exists() {
        return Ok(generations);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix(&format!("{prefix}.")) {
            if let Ok(gen) = suffix.parse::<u32>() {
                generations.push(gen);
            }
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn no_volume_pages(_volume: VolumeId, _page: PageId) -> Result<Vec<u8>> {
        Ok(vec![0u8; 16])
    }

    #[test]
    fn fresh_journal_has_one_empty_segment() {
        let dir = tempdir().unwrap();
        let (journal, outcome) = JournalManager::open_or_create(dir.path(), "journal", 1 << 20, 1, no_volume_pages).unwrap();
        assert_eq!(journal.segments.lock().len(), 1);
        assert!(outcome.committed.is_empty());
    }

    #[test]
    fn put_and_commit_round_trip_through_recovery() {
        let dir = tempdir().unwrap();
        let (journal, _) = JournalManager::open_or_create(dir.path(), "journal", 1 << 20, 1, no_volume_pages).unwrap();
        let tx = TxId(1);
        journal.begin_transaction(tx, 10).unwrap();
        journal
            .record_put(tx, VolumeId(1), "/vol/a", "tree-a", b"k", b"v", 11)
            .unwrap();
        journal.commit_transaction(tx, 12).unwrap();
        journal.sync().unwrap();
        drop(journal);

        let (_, outcome) = JournalManager::open_or_create(dir.path(), "journal", 1 << 20, 1, no_volume_pages).unwrap();
        assert_eq!(outcome.committed.get(&tx), Some(&12));
    }

    #[test]
    fn page_image_reconstructs_through_recovery() {
        let dir = tempdir().unwrap();
        let (journal, _) = JournalManager::open_or_create(dir.path(), "journal", 1 << 20, 1, no_volume_pages).unwrap();
        let previous = vec![0u8; 16];
        let mut updated = previous.clone();
        updated[4] = 42;
        journal
            .record_page_image(VolumeId(1), "/vol/a", PageId(3), &previous, &updated, 5)
            .unwrap();
        drop(journal);

        let (_, outcome) =
            JournalManager::open_or_create(dir.path(), "journal", 1 << 20, 1, |_, _| Ok(previous.clone())).unwrap();
        assert_eq!(outcome.recovered_pages.get(&(VolumeId(1), PageId(3))), Some(&updated));
    }

    #[test]
    fn checkpoint_performs_deferred_rollover() {
        let dir = tempdir().unwrap();
        let (journal, _) = JournalManager::open_or_create(dir.path(), "journal", 64, 1, no_volume_pages).unwrap();
        // Drive the current segment past its tiny size cap.
        for i in 0..5u64 {
            journal
                .record_page_image(VolumeId(1), "/vol/a", PageId(i), &[0u8; 16], &[1u8; 16], 2)
                .unwrap();
        }
        assert_eq!(journal.segments.lock().len(), 1);
        journal.checkpoint(100).unwrap();
        assert_eq!(journal.segments.lock().len(), 2);
    }
}
