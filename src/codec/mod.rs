//! Typed key codec and sort order (spec §4.1).
//!
//! Keys are tuples of typed segments. Each segment encodes to a byte string such
//! that lexicographic comparison of the encoded bytes equals the semantic order
//! within its type, and a one-byte type tag orders segments of different types.
//! Segments are separated by a zero byte, with zero bytes occurring inside a
//! segment's payload escaped by doubling, so that whole-key byte comparison
//! equals whole-key semantic comparison (tuple order, shorter-is-less on a
//! shared prefix).

mod key;

pub use key::{decode_key, encode_key, Key, KeyBound, Segment};

/// The single-byte encoding that sorts before any real encoded key.
pub const BEFORE: &[u8] = &[];
/// The single-byte encoding that sorts after any real encoded key. `0xFF` cannot
/// begin a valid segment, since segment type tags occupy the low end of the byte
/// range, so no real key can collide with it.
pub const AFTER: &[u8] = &[0xFF];
