//! Journal record framing and the typed record payloads (spec §3, §4.6, §6),
//! grounded in `crates/sombra-wal/src/lib.rs`'s big-endian `FileHeader`/
//! `FrameHeader` encoding, generalized from one fixed page-image frame shape
//! onto the spec's family of typed records.

use crate::error::{Error, Result};
use crate::page::PageId;
use crate::txn::{Timestamp, TxId};
use crate::volume::VolumeId;

/// Fixed portion of every record: `{type: u16, length: u32, timestamp: u64}`.
/// `length` counts the header plus payload; a `u32` CRC32 trailer follows the
/// payload and is not counted in `length`.
pub const RECORD_HEADER_LEN: usize = 2 + 4 + 8;
pub const RECORD_TRAILER_LEN: usize = 4;

/// One journal record kind (spec §3 "journal record kinds").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JournalRecordKind {
    /// Volume handle introduction, scoped to the current segment.
    Iv,
    /// Tree handle introduction, scoped to the current segment.
    It,
    /// A page image, possibly delta-trimmed (`left_size`/`right_size`).
    Pa,
    /// Transaction start.
    Ts,
    /// Transaction commit.
    Tc,
    /// Store (put) within a transaction.
    Sr,
    /// Delete within a transaction.
    Dr,
    /// Accumulator delta within a transaction.
    Dt,
    /// Checkpoint marker.
    Cp,
    /// Segment header (first record in every segment file).
    Jh,
    /// Segment end (last record before rollover).
    Je,
}

impl JournalRecordKind {
    fn to_code(self) -> u16 {
        match self {
            JournalRecordKind::Iv => 1,
            JournalRecordKind::It => 2,
            JournalRecordKind::Pa => 3,
            JournalRecordKind::Ts => 4,
            JournalRecordKind::Tc => 5,
            JournalRecordKind::Sr => 6,
            JournalRecordKind::Dr => 7,
            JournalRecordKind::Dt => 8,
            JournalRecordKind::Cp => 9,
            JournalRecordKind::Jh => 10,
            JournalRecordKind::Je => 11,
        }
    }

    fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            1 => JournalRecordKind::Iv,
            2 => JournalRecordKind::It,
            3 => JournalRecordKind::Pa,
            4 => JournalRecordKind::Ts,
            5 => JournalRecordKind::Tc,
            6 => JournalRecordKind::Sr,
            7 => JournalRecordKind::Dr,
            8 => JournalRecordKind::Dt,
            9 => JournalRecordKind::Cp,
            10 => JournalRecordKind::Jh,
            11 => JournalRecordKind::Je,
            _ => return Err(Error::CorruptVolume("unknown journal record kind")),
        })
    }
}

/// A decoded record: kind, commit/wall timestamp carried in the header, and
/// its raw payload bytes (still to be interpreted per `kind`).
#[derive(Clone, Debug)]
pub struct RawRecord {
    pub kind: JournalRecordKind,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// Encodes one record's on-disk bytes: header, payload, CRC32 trailer over
/// both. Grounded in the teacher's "fixed header, CRC covers header+payload"
/// frame shape.
pub fn encode_record(kind: JournalRecordKind, timestamp: Timestamp, payload: &[u8]) -> Vec<u8> {
    let length = (RECORD_HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + RECORD_TRAILER_LEN);
    out.extend_from_slice(&kind.to_code().to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(payload);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Decodes one record starting at the front of `bytes`, returning the record
/// and the number of bytes it consumed. `Ok(None)` means `bytes` does not
/// hold a complete, checksum-valid record — the normal end-of-segment
/// condition on a clean or torn shutdown (spec §8 recovery).
pub fn decode_record(bytes: &[u8]) -> Result<Option<(RawRecord, usize)>> {
    if bytes.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let code = u16::from_be_bytes(bytes[0..2].try_into().unwrap());
    let length = u32::from_be_bytes(bytes[2..6].try_into().unwrap()) as usize;
    if length < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let total = length + RECORD_TRAILER_LEN;
    if bytes.len() < total {
        return Ok(None);
    }
    let timestamp = Timestamp::from_be_bytes(bytes[6..14].try_into().unwrap());
    let payload = bytes[RECORD_HEADER_LEN..length].to_vec();
    let stored_crc = u32::from_be_bytes(bytes[length..total].try_into().unwrap());
    let actual_crc = crc32fast::hash(&bytes[..length]);
    if stored_crc != actual_crc {
        return Ok(None);
    }
    let kind = match JournalRecordKind::from_code(code) {
        Ok(kind) => kind,
        Err(_) => return Ok(None),
    };
    Ok(Some((RawRecord { kind, timestamp, payload }, total)))
}

fn push_bytes_with_len(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_len_prefixed<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = u32::from_be_bytes(
        bytes
            .get(*cursor..*cursor + 4)
            .ok_or(Error::CorruptVolume("truncated journal length prefix"))?
            .try_into()
            .unwrap(),
    ) as usize;
    *cursor += 4;
    let slice = bytes
        .get(*cursor..*cursor + len)
        .ok_or(Error::CorruptVolume("truncated journal length-prefixed field"))?;
    *cursor += len;
    Ok(slice)
}

/// Payload of an `IV` record: binds a handle to a volume for the rest of the
/// current segment.
pub struct IvPayload {
    pub handle: u32,
    pub volume: VolumeId,
    pub path: String,
}

impl IvPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.extend_from_slice(&self.volume.0.to_be_bytes());
        push_bytes_with_len(&mut out, self.path.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(Error::CorruptVolume("truncated IV payload"));
        }
        let handle = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let volume = VolumeId(u64::from_be_bytes(bytes[4..12].try_into().unwrap()));
        let mut cursor = 12;
        let path_bytes = take_len_prefixed(bytes, &mut cursor)?;
        let path = String::from_utf8(path_bytes.to_vec()).map_err(|_| Error::CorruptVolume("IV path not utf-8"))?;
        Ok(IvPayload { handle, volume, path })
    }
}

/// Payload of an `IT` record: binds a handle to a tree name within a volume
/// handle for the rest of the current segment.
pub struct ItPayload {
    pub handle: u32,
    pub volume_handle: u32,
    pub name: String,
}

impl ItPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.extend_from_slice(&self.volume_handle.to_be_bytes());
        push_bytes_with_len(&mut out, self.name.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::CorruptVolume("truncated IT payload"));
        }
        let handle = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let volume_handle = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let mut cursor = 8;
        let name_bytes = take_len_prefixed(bytes, &mut cursor)?;
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| Error::CorruptVolume("IT name not utf-8"))?;
        Ok(ItPayload { handle, volume_handle, name })
    }
}

/// Payload of a `PA` record: a page image, with an unchanged prefix/suffix
/// run elided (spec §8: "`PA` payload carries volume-handle, page-address,
/// and `left_size`/`right_size` so an unused middle run is omitted").
pub struct PaPayload {
    pub volume_handle: u32,
    pub page: PageId,
    pub left_size: u32,
    pub right_size: u32,
    pub middle: Vec<u8>,
}

impl PaPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 8 + 4 + 4 + self.middle.len());
        out.extend_from_slice(&self.volume_handle.to_be_bytes());
        out.extend_from_slice(&self.page.0.to_be_bytes());
        out.extend_from_slice(&self.left_size.to_be_bytes());
        out.extend_from_slice(&self.right_size.to_be_bytes());
        out.extend_from_slice(&self.middle);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 20 {
            return Err(Error::CorruptVolume("truncated PA payload"));
        }
        let volume_handle = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let page = PageId(u64::from_be_bytes(bytes[4..12].try_into().unwrap()));
        let left_size = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let right_size = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        let middle = bytes[20..].to_vec();
        Ok(PaPayload { volume_handle, page, left_size, right_size, middle })
    }

    /// Reconstructs a full page image given the previous image to source the
    /// elided prefix/suffix runs from.
    pub fn reconstruct(&self, previous: &[u8]) -> Vec<u8> {
        let mut out = previous.to_vec();
        let left = self.left_size as usize;
        let right = self.right_size as usize;
        let mid_end = out.len().saturating_sub(right);
        if left <= mid_end && mid_end - left == self.middle.len() {
            out[left..mid_end].copy_from_slice(&self.middle);
        }
        out
    }
}

/// Payload of a `TS` record: a transaction has started.
pub struct TsPayload {
    pub tx: TxId,
    pub start_ts: Timestamp,
}

impl TsPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.tx.0.to_be_bytes());
        out.extend_from_slice(&self.start_ts.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(Error::CorruptVolume("truncated TS payload"));
        }
        Ok(TsPayload {
            tx: TxId(u64::from_be_bytes(bytes[0..8].try_into().unwrap())),
            start_ts: Timestamp::from_be_bytes(bytes[8..16].try_into().unwrap()),
        })
    }
}

/// Payload of a `TC` record: a transaction's commit became durable.
pub struct TcPayload {
    pub tx: TxId,
    pub commit_ts: Timestamp,
}

impl TcPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.tx.0.to_be_bytes());
        out.extend_from_slice(&self.commit_ts.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(Error::CorruptVolume("truncated TC payload"));
        }
        Ok(TcPayload {
            tx: TxId(u64::from_be_bytes(bytes[0..8].try_into().unwrap())),
            commit_ts: Timestamp::from_be_bytes(bytes[8..16].try_into().unwrap()),
        })
    }
}

/// Payload of an `SR` (store) record: a put within a transaction.
pub struct SrPayload {
    pub tx: TxId,
    pub volume_handle: u32,
    pub tree_handle: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl SrPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.tx.0.to_be_bytes());
        out.extend_from_slice(&self.volume_handle.to_be_bytes());
        out.extend_from_slice(&self.tree_handle.to_be_bytes());
        push_bytes_with_len(&mut out, &self.key);
        push_bytes_with_len(&mut out, &self.value);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(Error::CorruptVolume("truncated SR payload"));
        }
        let tx = TxId(u64::from_be_bytes(bytes[0..8].try_into().unwrap()));
        let volume_handle = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let tree_handle = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let mut cursor = 16;
        let key = take_len_prefixed(bytes, &mut cursor)?.to_vec();
        let value = take_len_prefixed(bytes, &mut cursor)?.to_vec();
        Ok(SrPayload { tx, volume_handle, tree_handle, key, value })
    }
}

/// Payload of a `DR` (delete) record: a remove within a transaction.
pub struct DrPayload {
    pub tx: TxId,
    pub volume_handle: u32,
    pub tree_handle: u32,
    pub key: Vec<u8>,
}

impl DrPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.tx.0.to_be_bytes());
        out.extend_from_slice(&self.volume_handle.to_be_bytes());
        out.extend_from_slice(&self.tree_handle.to_be_bytes());
        push_bytes_with_len(&mut out, &self.key);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(Error::CorruptVolume("truncated DR payload"));
        }
        let tx = TxId(u64::from_be_bytes(bytes[0..8].try_into().unwrap()));
        let volume_handle = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let tree_handle = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let mut cursor = 16;
        let key = take_len_prefixed(bytes, &mut cursor)?.to_vec();
        Ok(DrPayload { tx, volume_handle, tree_handle, key })
    }
}

/// Payload of a `DT` record: an accumulator delta folded at this
/// transaction's commit.
pub struct DtPayload {
    pub tx: TxId,
    pub tree_handle: u32,
    pub slot: u8,
    pub delta: i64,
}

impl DtPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21);
        out.extend_from_slice(&self.tx.0.to_be_bytes());
        out.extend_from_slice(&self.tree_handle.to_be_bytes());
        out.push(self.slot);
        out.extend_from_slice(&self.delta.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 21 {
            return Err(Error::CorruptVolume("truncated DT payload"));
        }
        let tx = TxId(u64::from_be_bytes(bytes[0..8].try_into().unwrap()));
        let tree_handle = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let slot = bytes[12];
        let delta = i64::from_be_bytes(bytes[13..21].try_into().unwrap());
        Ok(DtPayload { tx, tree_handle, slot, delta })
    }
}

/// Payload of a `CP` record: a checkpoint became durable, advancing the
/// recovery safe point.
pub struct CpPayload {
    pub checkpoint_ts: Timestamp,
    pub base_generation: u32,
    pub base_offset: u64,
}

impl CpPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        out.extend_from_slice(&self.checkpoint_ts.to_be_bytes());
        out.extend_from_slice(&self.base_generation.to_be_bytes());
        out.extend_from_slice(&self.base_offset.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 20 {
            return Err(Error::CorruptVolume("truncated CP payload"));
        }
        Ok(CpPayload {
            checkpoint_ts: Timestamp::from_be_bytes(bytes[0..8].try_into().unwrap()),
            base_generation: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            base_offset: u64::from_be_bytes(bytes[12..20].try_into().unwrap()),
        })
    }
}
