//! Internal key encoding and ordering.
//!
//! Every record in the engine is keyed by an *internal key*: the user key
//! followed by an 8-byte trailer packing a 56-bit sequence number and an
//! 8-bit value kind. Internal keys order by user key ascending, then by
//! sequence descending, then by kind descending, which places the newest
//! version (and any tombstone) of a user key in front of older versions.
//! Every merged reader in the engine depends on that invariant.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Largest assignable sequence number (56 bits).
pub const MAX_SEQ: u64 = (1 << 56) - 1;

/// Length of the packed trailer at the end of every internal key.
pub const TRAILER_LEN: usize = 8;

/// The kind of a record: a live value or a deletion tombstone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Deletion = 0,
    Value = 1,
}

/// Kind used for range boundary probes. Paired with [`MAX_SEQ`] it compares
/// immediately before every real record for the same user key.
pub const KIND_SEEK: ValueKind = ValueKind::Value;

impl ValueKind {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ValueKind::Deletion),
            1 => Ok(ValueKind::Value),
            _ => Err(Error::Corruption(format!("invalid value kind: {b}"))),
        }
    }
}

/// Packs sequence and kind into the 8-byte trailer value.
pub fn pack_trailer(seq: u64, kind: ValueKind) -> u64 {
    debug_assert!(seq <= MAX_SEQ);
    (seq << 8) | kind as u64
}

/// Appends `user_key || trailer` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: u64, kind: ValueKind) {
    dst.extend_from_slice(user_key);
    let mut trailer = [0u8; TRAILER_LEN];
    LittleEndian::write_u64(&mut trailer, pack_trailer(seq, kind));
    dst.extend_from_slice(&trailer);
}

/// Builds a fresh internal key.
pub fn encode_internal_key(user_key: &[u8], seq: u64, kind: ValueKind) -> Vec<u8> {
    let mut ikey = Vec::with_capacity(user_key.len() + TRAILER_LEN);
    append_internal_key(&mut ikey, user_key, seq, kind);
    ikey
}

/// A borrowed view of a decoded internal key.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub user_key: &'a [u8],
    pub seq: u64,
    pub kind: ValueKind,
}

/// Splits an internal key into its parts, validating the trailer.
pub fn parse_internal_key(ikey: &[u8]) -> Result<ParsedKey<'_>> {
    if ikey.len() < TRAILER_LEN {
        return Err(crate::corrupt!("internal key too short: {} bytes", ikey.len()));
    }
    let (user_key, trailer) = ikey.split_at(ikey.len() - TRAILER_LEN);
    let packed = LittleEndian::read_u64(trailer);
    let kind = ValueKind::from_u8((packed & 0xff) as u8)?;
    Ok(ParsedKey {
        user_key,
        seq: packed >> 8,
        kind,
    })
}

/// The user-key prefix of an internal key. The key must carry a trailer.
pub fn user_key(ikey: &[u8]) -> &[u8] {
    debug_assert!(ikey.len() >= TRAILER_LEN);
    &ikey[..ikey.len() - TRAILER_LEN]
}

fn trailer(ikey: &[u8]) -> u64 {
    LittleEndian::read_u64(&ikey[ikey.len() - TRAILER_LEN..])
}

/// A total order over user keys. Must be consistent across every run that
/// touches a given database; the manifest records its name and refuses to
/// open with a different one.
pub trait Comparator: Send + Sync {
    fn name(&self) -> &'static str;
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// The default comparator: plain lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "silt.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Orders internal keys: user comparator ascending, then trailer descending.
#[derive(Clone)]
pub struct InternalComparator {
    user: Arc<dyn Comparator>,
}

impl InternalComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(user_key(a), user_key(b)) {
            Ordering::Equal => trailer(b).cmp(&trailer(a)),
            ord => ord,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icmp() -> InternalComparator {
        InternalComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_roundtrip() {
        let ikey = encode_internal_key(b"user-key", 42, ValueKind::Value);
        let parsed = parse_internal_key(&ikey).unwrap();
        assert_eq!(parsed.user_key, b"user-key");
        assert_eq!(parsed.seq, 42);
        assert_eq!(parsed.kind, ValueKind::Value);
    }

    #[test]
    fn test_roundtrip_empty_key_and_max_seq() {
        let ikey = encode_internal_key(b"", MAX_SEQ, ValueKind::Deletion);
        let parsed = parse_internal_key(&ikey).unwrap();
        assert_eq!(parsed.user_key, b"");
        assert_eq!(parsed.seq, MAX_SEQ);
        assert_eq!(parsed.kind, ValueKind::Deletion);
    }

    #[test]
    fn test_parse_rejects_short_key() {
        assert!(parse_internal_key(b"short").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_kind() {
        let mut ikey = encode_internal_key(b"k", 1, ValueKind::Value);
        let n = ikey.len();
        ikey[n - TRAILER_LEN] = 0x7f;
        assert!(parse_internal_key(&ikey).is_err());
    }

    #[test]
    fn test_order_by_user_key() {
        let cmp = icmp();
        let a = encode_internal_key(b"a", 100, ValueKind::Value);
        let b = encode_internal_key(b"b", 1, ValueKind::Value);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_newer_seq_sorts_first() {
        let cmp = icmp();
        let newer = encode_internal_key(b"k", 9, ValueKind::Value);
        let older = encode_internal_key(b"k", 3, ValueKind::Value);
        assert_eq!(cmp.compare(&newer, &older), Ordering::Less);
    }

    #[test]
    fn test_tombstone_sorts_before_value_at_same_seq() {
        let cmp = icmp();
        let value = encode_internal_key(b"k", 7, ValueKind::Value);
        let tombstone = encode_internal_key(b"k", 7, ValueKind::Deletion);
        assert_eq!(cmp.compare(&value, &tombstone), Ordering::Less);
    }

    #[test]
    fn test_seek_key_precedes_all_records() {
        let cmp = icmp();
        let probe = encode_internal_key(b"k", MAX_SEQ, KIND_SEEK);
        let newest = encode_internal_key(b"k", 1_000_000, ValueKind::Value);
        assert_eq!(cmp.compare(&probe, &newest), Ordering::Less);
    }
}
