//! Segment types and the order-preserving encoding for [`Key`].
//!
//! Grounded in `crates/sombra-btree/src/codecs.rs`'s `KeyCodec`/`ValCodec` trait
//! shape, generalized from that file's two built-in scalar impls (`u64`,
//! `Vec<u8>`) to the typed-segment tuple spec §4.1 requires.

use smallvec::SmallVec;

use crate::error::{Error, Result};

/// One scalar within a [`Key`] tuple.
#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    /// SQL-style null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    I64(i64),
    /// IEEE-754 double.
    F64(f64),
    /// Raw byte array.
    Bytes(Vec<u8>),
    /// UTF-8 string.
    Str(String),
    /// Milliseconds since the Unix epoch.
    Date(i64),
}

/// A typed tuple key. Segments compare first by type tag, then by the
/// order-preserving payload within that type.
#[derive(Clone, Debug, PartialEq)]
pub struct Key(pub SmallVec<[Segment; 4]>);

impl Key {
    /// Builds a key from a list of segments.
    pub fn new(segments: impl IntoIterator<Item = Segment>) -> Self {
        Key(segments.into_iter().collect())
    }
}

/// An open or closed endpoint used when constructing a range scan.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyBound {
    /// Sorts before every real key.
    Before,
    /// Sorts after every real key.
    After,
    /// Includes the given key.
    Inclusive(Key),
    /// Excludes the given key but bounds on its neighborhood.
    Exclusive(Key),
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum TypeTag {
    Null = 1,
    Bool = 2,
    I64 = 3,
    F64 = 4,
    Bytes = 5,
    Str = 6,
    Date = 7,
}

impl TypeTag {
    fn of(seg: &Segment) -> Self {
        match seg {
            Segment::Null => TypeTag::Null,
            Segment::Bool(_) => TypeTag::Bool,
            Segment::I64(_) => TypeTag::I64,
            Segment::F64(_) => TypeTag::F64,
            Segment::Bytes(_) => TypeTag::Bytes,
            Segment::Str(_) => TypeTag::Str,
            Segment::Date(_) => TypeTag::Date,
        }
    }

    fn try_from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => TypeTag::Null,
            2 => TypeTag::Bool,
            3 => TypeTag::I64,
            4 => TypeTag::F64,
            5 => TypeTag::Bytes,
            6 => TypeTag::Str,
            7 => TypeTag::Date,
            _ => return Err(Error::Conversion("unknown key segment type tag")),
        })
    }
}

/// Flips the sign bit of a two's-complement integer so that unsigned byte
/// comparison of the big-endian representation equals signed numeric order.
fn i64_order_preserving(v: i64) -> [u8; 8] {
    let flipped = (v as u64) ^ (1u64 << 63);
    flipped.to_be_bytes()
}

fn i64_from_order_preserving(bytes: [u8; 8]) -> i64 {
    let flipped = u64::from_be_bytes(bytes);
    (flipped ^ (1u64 << 63)) as i64
}

/// IEEE-754 order-preserving transform: for non-negative floats, flipping the
/// sign bit puts them above all negatives; for negative floats, flipping every
/// bit reverses their (otherwise descending-as-magnitude-grows) bit order into
/// ascending numeric order.
fn f64_order_preserving(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let transformed = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    transformed.to_be_bytes()
}

fn f64_from_order_preserving(bytes: [u8; 8]) -> f64 {
    let transformed = u64::from_be_bytes(bytes);
    let bits = if transformed & (1u64 << 63) != 0 {
        transformed & !(1u64 << 63)
    } else {
        !transformed
    };
    f64::from_bits(bits)
}

/// Escapes zero bytes in a segment payload (`0x00` -> `0x00 0xFF`) and appends
/// the two-byte terminator `0x00 0x00`.
fn push_escaped_segment(out: &mut Vec<u8>, payload: &[u8]) {
    for &b in payload {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Reads one escaped, terminated segment payload starting at `pos`, returning
/// the unescaped bytes and the position just past the terminator.
fn read_escaped_segment(bytes: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut payload = Vec::new();
    loop {
        if pos >= bytes.len() {
            return Err(Error::Conversion("truncated key segment"));
        }
        let b = bytes[pos];
        if b == 0x00 {
            pos += 1;
            if pos >= bytes.len() {
                return Err(Error::Conversion("truncated key segment escape"));
            }
            match bytes[pos] {
                0x00 => {
                    pos += 1;
                    return Ok((payload, pos));
                }
                0xFF => {
                    payload.push(0x00);
                    pos += 1;
                }
                _ => return Err(Error::Conversion("invalid key segment escape sequence")),
            }
        } else {
            payload.push(b);
            pos += 1;
        }
    }
}

/// Encodes a key to an order-preserving byte string.
pub fn encode_key(key: &Key) -> Vec<u8> {
    let mut out = Vec::new();
    for seg in key.0.iter() {
        out.push(TypeTag::of(seg) as u8);
        match seg {
            Segment::Null => push_escaped_segment(&mut out, &[]),
            Segment::Bool(b) => push_escaped_segment(&mut out, &[*b as u8]),
            Segment::I64(v) => push_escaped_segment(&mut out, &i64_order_preserving(*v)),
            Segment::F64(v) => push_escaped_segment(&mut out, &f64_order_preserving(*v)),
            Segment::Bytes(b) => push_escaped_segment(&mut out, b),
            Segment::Str(s) => push_escaped_segment(&mut out, s.as_bytes()),
            Segment::Date(ms) => push_escaped_segment(&mut out, &i64_order_preserving(*ms)),
        }
    }
    out
}

/// Decodes a byte string produced by [`encode_key`] back into a [`Key`].
pub fn decode_key(bytes: &[u8]) -> Result<Key> {
    let mut segments = SmallVec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let tag = TypeTag::try_from_u8(bytes[pos])?;
        pos += 1;
        let (payload, next) = read_escaped_segment(bytes, pos)?;
        pos = next;
        let seg = match tag {
            TypeTag::Null => Segment::Null,
            TypeTag::Bool => {
                if payload.len() != 1 {
                    return Err(Error::Conversion("malformed bool segment"));
                }
                Segment::Bool(payload[0] != 0)
            }
            TypeTag::I64 => {
                let arr: [u8; 8] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Conversion("malformed i64 segment"))?;
                Segment::I64(i64_from_order_preserving(arr))
            }
            TypeTag::F64 => {
                let arr: [u8; 8] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Conversion("malformed f64 segment"))?;
                Segment::F64(f64_from_order_preserving(arr))
            }
            TypeTag::Bytes => Segment::Bytes(payload),
            TypeTag::Str => Segment::Str(
                String::from_utf8(payload).map_err(|_| Error::Conversion("malformed utf-8 segment"))?,
            ),
            TypeTag::Date => {
                let arr: [u8; 8] = payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Conversion("malformed date segment"))?;
                Segment::Date(i64_from_order_preserving(arr))
            }
        };
        segments.push(seg);
    }
    Ok(Key(segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(key: Key) {
        let encoded = encode_key(&key);
        let decoded = decode_key(&encoded).expect("decode");
        assert_eq!(decoded, key);
    }

    #[test]
    fn roundtrips_each_segment_type() {
        roundtrip(Key::new([Segment::Null]));
        roundtrip(Key::new([Segment::Bool(true)]));
        roundtrip(Key::new([Segment::Bool(false)]));
        roundtrip(Key::new([Segment::I64(-42)]));
        roundtrip(Key::new([Segment::I64(i64::MIN)]));
        roundtrip(Key::new([Segment::I64(i64::MAX)]));
        roundtrip(Key::new([Segment::F64(-1.5)]));
        roundtrip(Key::new([Segment::F64(0.0)]));
        roundtrip(Key::new([Segment::F64(f64::MAX)]));
        roundtrip(Key::new([Segment::Bytes(vec![0, 1, 2, 0, 0, 255])]));
        roundtrip(Key::new([Segment::Str("hello\u{0}world".to_string())]));
        roundtrip(Key::new([Segment::Date(1_700_000_000_000)]));
        roundtrip(Key::new([
            Segment::Str("a".into()),
            Segment::I64(7),
            Segment::Bytes(vec![9, 9]),
        ]));
    }

    #[test]
    fn i64_order_preserving_matches_numeric_order() {
        let mut values = vec![i64::MIN, -100, -1, 0, 1, 100, i64::MAX];
        let mut encoded: Vec<[u8; 8]> = values.iter().map(|v| i64_order_preserving(*v)).collect();
        let mut sorted_values = values.clone();
        sorted_values.sort();
        let mut sorted_encoded = encoded.clone();
        sorted_encoded.sort();
        values.sort();
        encoded.sort();
        assert_eq!(values, sorted_values);
        assert_eq!(encoded, sorted_encoded);
    }

    #[test]
    fn f64_order_preserving_matches_numeric_order() {
        let values = vec![f64::MIN, -1.5, -0.0, 0.0, 1.5, f64::MAX];
        let mut encoded: Vec<[u8; 8]> = values.iter().map(|v| f64_order_preserving(*v)).collect();
        let sorted_encoded = {
            let mut v = encoded.clone();
            v.sort();
            v
        };
        encoded.sort();
        assert_eq!(encoded, sorted_encoded);
        for w in encoded.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn whole_key_byte_order_matches_segment_order() {
        let a = encode_key(&Key::new([Segment::Str("apple".into())]));
        let b = encode_key(&Key::new([Segment::Str("banana".into())]));
        assert!(a < b);

        let ints = encode_key(&Key::new([Segment::I64(5)]));
        let strs = encode_key(&Key::new([Segment::Str("x".into())]));
        assert!(ints < strs, "I64 segments must sort before Str segments");
    }

    #[test]
    fn before_and_after_bound_every_real_key() {
        let k = encode_key(&Key::new([Segment::Str("anything".into())]));
        assert!(crate::codec::BEFORE < k.as_slice());
        assert!(k.as_slice() < crate::codec::AFTER);
    }
}
