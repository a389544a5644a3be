//! Internal-key format and comparators.
//!
//! Every record in the engine is keyed by an internal key: the user key
//! followed by an 8-byte little-endian trailer packing a 56-bit sequence
//! number and an 8-bit value type.
//!
//! ```text
//! +----------------------+--------------------------------+
//! | user key (n bytes)   | (sequence << 8) | type, u64 LE |
//! +----------------------+--------------------------------+
//! ```
//!
//! Internal keys order by user key ascending, then sequence descending,
//! then type descending. The newest record for a user key is therefore the
//! smallest internal key with that user-key prefix, so a seek to
//! `(user_key, MAX_SEQUENCE_NUMBER, seek type)` positions at the newest
//! record.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Engine-wide monotonic write identifier. Only the low 56 bits are usable;
/// zero is reserved as "earliest".
pub type SequenceNumber = u64;

/// The largest representable sequence number.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1u64 << 56) - 1;

/// Width of the packed trailer at the end of every internal key.
pub const TRAILER_SIZE: usize = 8;

/// The kind of record an internal key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    Deletion = 0x0,
    Value = 0x1,
}

/// Value type used when constructing seek targets. Must be the highest
/// numbered type so the target sorts before every record with the same
/// (user key, sequence).
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl TryFrom<u8> for ValueType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0x0 => Ok(ValueType::Deletion),
            0x1 => Ok(ValueType::Value),
            other => Err(Error::Corruption(format!("unknown value type {other:#x}"))),
        }
    }
}

/// Packs a sequence number and value type into the 8-byte trailer value.
pub fn pack_sequence_and_type(seq: SequenceNumber, t: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

/// Appends the internal key for `(user_key, seq, t)` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, t: ValueType) {
    dst.extend_from_slice(user_key);
    let mut trailer = [0u8; TRAILER_SIZE];
    LittleEndian::write_u64(&mut trailer, pack_sequence_and_type(seq, t));
    dst.extend_from_slice(&trailer);
}

/// A borrowed, decoded view of an internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// Decodes an internal key. Fails with corruption if the input is shorter
/// than the trailer or carries an unknown value type.
pub fn parse_internal_key(ikey: &[u8]) -> Result<ParsedInternalKey<'_>> {
    if ikey.len() < TRAILER_SIZE {
        return Err(Error::Corruption(format!(
            "internal key too short: {} bytes",
            ikey.len()
        )));
    }
    let trailer = LittleEndian::read_u64(&ikey[ikey.len() - TRAILER_SIZE..]);
    let value_type = ValueType::try_from((trailer & 0xff) as u8)?;
    Ok(ParsedInternalKey {
        user_key: &ikey[..ikey.len() - TRAILER_SIZE],
        sequence: trailer >> 8,
        value_type,
    })
}

/// Returns the user-key prefix of an encoded internal key.
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    assert!(ikey.len() >= TRAILER_SIZE);
    &ikey[..ikey.len() - TRAILER_SIZE]
}

fn extract_trailer(ikey: &[u8]) -> u64 {
    LittleEndian::read_u64(&ikey[ikey.len() - TRAILER_SIZE..])
}

/// User-key ordering injected into the engine.
///
/// Implementations must be total orders over byte strings. The shortening
/// hooks may return their input unchanged; callers only rely on the
/// ordering contract (`start <= separator <= limit`, `key <= successor`).
pub trait Comparator: Send + Sync {
    /// Identifies the ordering; persisted in the descriptor and checked on
    /// recovery.
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns a key `k` with `start <= k < limit` under this ordering,
    /// preferably shorter than `start`. Returning `start` is always valid.
    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8>;

    /// Returns a key `k >= key`, preferably shorter. Returning `key` is
    /// always valid.
    fn find_short_successor(&self, key: &[u8]) -> Vec<u8>;
}

/// Lexicographic byte ordering, the default user comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "stratadb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let min_len = start.len().min(limit.len());
        let mut diff = 0;
        while diff < min_len && start[diff] == limit[diff] {
            diff += 1;
        }
        if diff >= min_len {
            // One is a prefix of the other; no shortening possible.
            return start.to_vec();
        }
        let byte = start[diff];
        if byte < 0xff && byte + 1 < limit[diff] {
            let mut sep = start[..=diff].to_vec();
            sep[diff] += 1;
            debug_assert!(self.compare(&sep, limit) == Ordering::Less);
            return sep;
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        for (i, &byte) in key.iter().enumerate() {
            if byte != 0xff {
                let mut succ = key[..=i].to_vec();
                succ[i] += 1;
                return succ;
            }
        }
        // Run of 0xff bytes; leave unchanged.
        key.to_vec()
    }
}

/// Orders internal keys: user key ascending (per the wrapped comparator),
/// then trailer descending, so newer sequences sort first.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => extract_trailer(b).cmp(&extract_trailer(a)),
            ord => ord,
        }
    }

    pub fn compare_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.as_slice(), b.as_slice())
    }

    /// Internal-key separator: shortens the user-key prefix when the user
    /// comparator permits and reattaches a trailer that sorts before every
    /// record of the shortened key.
    pub fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let tmp = self.user.find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len() && self.user.compare(user_start, &tmp) == Ordering::Less {
            let mut sep = Vec::with_capacity(tmp.len() + TRAILER_SIZE);
            append_internal_key(&mut sep, &tmp, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            debug_assert!(self.compare(start, &sep) == Ordering::Less);
            debug_assert!(self.compare(&sep, limit) == Ordering::Less);
            return sep;
        }
        start.to_vec()
    }

    pub fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let tmp = self.user.find_short_successor(user_key);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            let mut succ = Vec::with_capacity(tmp.len() + TRAILER_SIZE);
            append_internal_key(&mut succ, &tmp, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            debug_assert!(self.compare(key, &succ) == Ordering::Less);
            return succ;
        }
        key.to_vec()
    }
}

/// An owned, encoded internal key.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber, t: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut rep, user_key, seq, t);
        Self { rep }
    }

    /// Wraps an already-encoded internal key.
    pub fn decode_from(encoded: &[u8]) -> Self {
        Self {
            rep: encoded.to_vec(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.rep
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.rep
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match parse_internal_key(&self.rep) {
            Ok(parsed) => write!(
                f,
                "'{}' @ {} : {:?}",
                String::from_utf8_lossy(parsed.user_key),
                parsed.sequence,
                parsed.value_type
            ),
            Err(_) => write!(f, "(bad){:?}", self.rep),
        }
    }
}

/// Target for point lookups: an internal key whose trailer pins the read
/// sequence, so a ceiling search lands on the newest visible record.
pub struct LookupKey {
    rep: Vec<u8>,
    user_len: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut rep, user_key, sequence, VALUE_TYPE_FOR_SEEK);
        Self {
            rep,
            user_len: user_key.len(),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.rep
    }

    pub fn user_key(&self) -> &[u8] {
        &self.rep[..self.user_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ikey(user_key: &[u8], seq: SequenceNumber, t: ValueType) -> Vec<u8> {
        let mut out = Vec::new();
        append_internal_key(&mut out, user_key, seq, t);
        out
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let cases: &[(&[u8], SequenceNumber, ValueType)] = &[
            (b"", 0, ValueType::Value),
            (b"k", 1, ValueType::Deletion),
            (b"foo", 100, ValueType::Value),
            (b"\x00\xff", MAX_SEQUENCE_NUMBER, ValueType::Value),
        ];
        for &(user_key, seq, t) in cases {
            let encoded = ikey(user_key, seq, t);
            assert_eq!(encoded.len(), user_key.len() + TRAILER_SIZE);
            let parsed = parse_internal_key(&encoded).expect("parse failed");
            assert_eq!(parsed.user_key, user_key);
            assert_eq!(parsed.sequence, seq);
            assert_eq!(parsed.value_type, t);
        }
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert!(matches!(
            parse_internal_key(b"short"),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let mut bad = ikey(b"k", 5, ValueType::Value);
        let n = bad.len();
        bad[n - 8] = 0x7f; // low trailer byte is the type tag
        assert!(matches!(
            parse_internal_key(&bad),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_internal_key_ordering() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));

        // User key ascending.
        assert_eq!(
            icmp.compare(
                &ikey(b"a", 100, ValueType::Value),
                &ikey(b"b", 1, ValueType::Value)
            ),
            Ordering::Less
        );
        // Same user key: higher sequence sorts first.
        assert_eq!(
            icmp.compare(
                &ikey(b"k", 11, ValueType::Value),
                &ikey(b"k", 10, ValueType::Value)
            ),
            Ordering::Less
        );
        // Same user key and sequence: Value sorts before Deletion.
        assert_eq!(
            icmp.compare(
                &ikey(b"k", 10, ValueType::Value),
                &ikey(b"k", 10, ValueType::Deletion)
            ),
            Ordering::Less
        );
    }

    #[test]
    fn test_lookup_key_is_ceiling_for_user_key() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let lookup = LookupKey::new(b"k", MAX_SEQUENCE_NUMBER);
        // The lookup target sorts before (or at) every record of "k"...
        assert!(
            icmp.compare(lookup.internal_key(), &ikey(b"k", 12345, ValueType::Value))
                != Ordering::Greater
        );
        // ...and after every record of preceding user keys.
        assert_eq!(
            icmp.compare(lookup.internal_key(), &ikey(b"j", 0, ValueType::Deletion)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_bytewise_shortest_separator() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.find_shortest_separator(b"abcdef", b"abzzzz"), b"abd");
        // Prefix relationship: unchanged.
        assert_eq!(cmp.find_shortest_separator(b"abc", b"abcd"), b"abc");
        // Adjacent bytes leave no room.
        assert_eq!(cmp.find_shortest_separator(b"aby", b"abz"), b"aby");
    }

    #[test]
    fn test_bytewise_short_successor() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.find_short_successor(b"abc"), b"b");
        assert_eq!(cmp.find_short_successor(b"\xff\xffq"), b"\xff\xffr");
        assert_eq!(cmp.find_short_successor(b"\xff\xff"), b"\xff\xff");
    }

    #[test]
    fn test_internal_separator_contract() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let start = ikey(b"foo", 100, ValueType::Value);
        let limit = ikey(b"hello", 200, ValueType::Value);
        let sep = icmp.find_shortest_separator(&start, &limit);
        assert_eq!(icmp.compare(&start, &sep), Ordering::Less);
        assert_eq!(icmp.compare(&sep, &limit), Ordering::Less);
        // The shortened separator carries the seek trailer.
        let parsed = parse_internal_key(&sep).unwrap();
        assert_eq!(parsed.sequence, MAX_SEQUENCE_NUMBER);
        assert_eq!(parsed.value_type, VALUE_TYPE_FOR_SEEK);
    }

    #[test]
    fn test_internal_separator_same_user_key_unchanged() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let start = ikey(b"foo", 100, ValueType::Value);
        let limit = ikey(b"foo", 50, ValueType::Value);
        assert_eq!(icmp.find_shortest_separator(&start, &limit), start);
    }

    #[test]
    fn test_internal_successor_contract() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let key = ikey(b"abc", 42, ValueType::Value);
        let succ = icmp.find_short_successor(&key);
        assert_eq!(icmp.compare(&key, &succ), Ordering::Less);
    }
}
