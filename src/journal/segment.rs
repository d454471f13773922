//! One journal segment file: `<prefix>.<6-digit-generation>` (spec §6),
//! opening with a `JH` record and, on rollover, closing with a `JE` record.
//! Grounded in `crates/sombra-wal/src/lib.rs`'s `Wal`/`WalIterator` append +
//! sequential-scan shape.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::txn::Timestamp;

use super::record::{decode_record, encode_record, JournalRecordKind, RawRecord, RECORD_HEADER_LEN, RECORD_TRAILER_LEN};

/// Renders the on-disk filename for a segment generation under `prefix`.
pub fn segment_file_name(prefix: &str, generation: u32) -> String {
    format!("{prefix}.{generation:06}")
}

struct SegmentState {
    file: File,
    append_offset: u64,
}

/// One append-only segment file plus its current write offset.
pub struct Segment {
    path: PathBuf,
    generation: u32,
    state: Mutex<SegmentState>,
}

impl Segment {
    /// Creates a brand-new segment, writing its opening `JH` record.
    pub fn create(dir: &Path, prefix: &str, generation: u32, created_at: Timestamp) -> Result<Self> {
        let path = dir.join(segment_file_name(prefix, generation));
        let mut file = OpenOptions::new().create_new(true).read(true).write(true).open(&path)?;
        let header = encode_record(JournalRecordKind::Jh, created_at, &generation.to_be_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        let append_offset = header.len() as u64;
        Ok(Segment {
            path,
            generation,
            state: Mutex::new(SegmentState { file, append_offset }),
        })
    }

    /// Reopens an existing segment file for continued appends (recovery
    /// found this to be the newest, possibly not-yet-closed, segment).
    pub fn open_existing(path: PathBuf, generation: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let append_offset = file.metadata()?.len();
        Ok(Segment {
            path,
            generation,
            state: Mutex::new(SegmentState { file, append_offset }),
        })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, returning the byte offset its header starts at.
    pub fn append(&self, kind: JournalRecordKind, timestamp: Timestamp, payload: &[u8]) -> Result<u64> {
        let bytes = encode_record(kind, timestamp, payload);
        let mut state = self.state.lock();
        let offset = state.append_offset;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&bytes)?;
        state.append_offset += bytes.len() as u64;
        Ok(offset)
    }

    pub fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.state.lock().append_offset
    }

    /// Reads one record starting exactly at `offset`; used by the copier and
    /// recovery to fetch a specific `PA` record located via the page map.
    pub fn read_record_at(&self, offset: u64) -> Result<RawRecord> {
        let mut state = self.state.lock();
        let end = state.append_offset;
        if offset + RECORD_HEADER_LEN as u64 > end {
            return Err(Error::CorruptVolume("journal record offset out of range"));
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut header_buf)?;
        let length = u32::from_be_bytes(header_buf[2..6].try_into().unwrap()) as usize;
        if length < RECORD_HEADER_LEN {
            return Err(Error::CorruptVolume("journal record length underflows header"));
        }
        let remaining = length - RECORD_HEADER_LEN + RECORD_TRAILER_LEN;
        let mut rest = vec![0u8; remaining];
        state.file.read_exact(&mut rest)?;
        let mut full = Vec::with_capacity(RECORD_HEADER_LEN + remaining);
        full.extend_from_slice(&header_buf);
        full.extend_from_slice(&rest);
        match decode_record(&full)? {
            Some((record, _)) => Ok(record),
            None => Err(Error::CorruptVolume("journal record failed checksum")),
        }
    }

    /// A forward scan over every well-formed record from `start_offset`,
    /// stopping at the first truncated or checksum-invalid record (the
    /// normal clean/dirty-shutdown end-of-segment indicator).
    pub fn scan_from(&self, start_offset: u64) -> Result<SegmentScan> {
        let mut state = self.state.lock();
        let end = state.append_offset;
        state.file.seek(SeekFrom::Start(start_offset))?;
        let mut buf = Vec::new();
        state.file.by_ref().take(end - start_offset).read_to_end(&mut buf)?;
        Ok(SegmentScan {
            generation: self.generation,
            start_offset,
            buf,
            cursor: 0,
        })
    }
}

/// Sequential decode cursor over a segment's bytes, yielding each record
/// along with the absolute file offset it started at.
pub struct SegmentScan {
    generation: u32,
    start_offset: u64,
    buf: Vec<u8>,
    cursor: usize,
}

impl SegmentScan {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The offset immediately after the last record successfully decoded;
    /// becomes the recovery resume point / torn-tail boundary.
    pub fn valid_up_to(&self) -> u64 {
        self.start_offset + self.cursor as u64
    }

    pub fn next_record(&mut self) -> Result<Option<(u64, RawRecord)>> {
        match decode_record(&self.buf[self.cursor..])? {
            Some((record, consumed)) => {
                let offset = self.start_offset + self.cursor as u64;
                self.cursor += consumed;
                Ok(Some((offset, record)))
            }
            None => Ok(None),
        }
    }
}
