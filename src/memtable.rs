//! In-memory sorted write buffer.
//!
//! A memtable maps internal keys to values inside a lock-free skip list, so
//! the single writer (the write coordinator) never blocks readers. Keys
//! carry the internal comparator with them because internal-key order is not
//! byte order: the same user key sorts newest-sequence-first.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::key::{
    encode_internal_key, parse_internal_key, InternalComparator, ValueKind, KIND_SEEK, MAX_SEQ,
};

/// Skip-list key: an encoded internal key ordered by the internal comparator.
#[derive(Clone)]
pub(crate) struct MemKey {
    ikey: Vec<u8>,
    icmp: InternalComparator,
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.ikey, &other.ikey)
    }
}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

/// Mutable sorted buffer for the most recent writes. Append-only while
/// active; frozen (by pointer swap in the database, not by flag) once full.
pub struct Memtable {
    icmp: InternalComparator,
    map: SkipMap<MemKey, Vec<u8>>,
    size: AtomicUsize,
}

impl Memtable {
    pub fn new(icmp: InternalComparator) -> Self {
        Self {
            icmp,
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Inserts one record. Distinct sequences keep every version of a user
    /// key side by side, newest first.
    pub fn insert(&self, seq: u64, kind: ValueKind, ukey: &[u8], value: &[u8]) {
        let ikey = encode_internal_key(ukey, seq, kind);
        self.size
            .fetch_add(ikey.len() + value.len(), AtomicOrdering::Relaxed);
        self.map.insert(
            MemKey {
                ikey,
                icmp: self.icmp.clone(),
            },
            value.to_vec(),
        );
    }

    /// Looks up `ukey` as of `seq`. Returns `Some(Some(v))` for a live
    /// value, `Some(None)` for a tombstone, `None` when this memtable holds
    /// nothing visible for the key.
    pub fn get(&self, ukey: &[u8], seq: u64) -> Option<Option<Vec<u8>>> {
        debug_assert!(seq <= MAX_SEQ);
        let probe = MemKey {
            ikey: encode_internal_key(ukey, seq, KIND_SEEK),
            icmp: self.icmp.clone(),
        };
        let entry = self.map.lower_bound(Bound::Included(&probe))?;
        let parsed = parse_internal_key(&entry.key().ikey).ok()?;
        if self.icmp.user().compare(parsed.user_key, ukey) != Ordering::Equal {
            return None;
        }
        match parsed.kind {
            ValueKind::Value => Some(Some(entry.value().clone())),
            ValueKind::Deletion => Some(None),
        }
    }

    /// Total encoded bytes held, used for the rotation threshold.
    pub fn approximate_size(&self) -> usize {
        self.size.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterator over entries in internal-key order. Entries published after
    /// creation are visible, which is harmless: readers bound visibility by
    /// sequence number, not by iterator creation time.
    pub fn iter(self: &Arc<Self>) -> MemIterator {
        MemIterator {
            mem: Arc::clone(self),
            current: None,
        }
    }

    fn probe(&self, ikey: &[u8]) -> MemKey {
        MemKey {
            ikey: ikey.to_vec(),
            icmp: self.icmp.clone(),
        }
    }
}

/// Cursor over a memtable. Holds owned copies of the current entry, so it
/// stays valid however long the caller keeps it.
pub struct MemIterator {
    mem: Arc<Memtable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl InternalIterator for MemIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let entry = self.mem.map.front();
        self.current = entry.map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn seek_to_last(&mut self) {
        let entry = self.mem.map.back();
        self.current = entry.map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn seek(&mut self, target: &[u8]) {
        let probe = self.mem.probe(target);
        let entry = self.mem.map.lower_bound(Bound::Included(&probe));
        self.current = entry.map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn next(&mut self) {
        let Some((ikey, _)) = self.current.take() else {
            return;
        };
        let probe = self.mem.probe(&ikey);
        let entry = self.mem.map.lower_bound(Bound::Excluded(&probe));
        self.current = entry.map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn prev(&mut self) {
        let Some((ikey, _)) = self.current.take() else {
            return;
        };
        let probe = self.mem.probe(&ikey);
        let entry = self.mem.map.upper_bound(Bound::Excluded(&probe));
        self.current = entry.map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator is valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator is valid").1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{user_key, BytewiseComparator};

    fn memtable() -> Arc<Memtable> {
        Arc::new(Memtable::new(InternalComparator::new(Arc::new(
            BytewiseComparator,
        ))))
    }

    #[test]
    fn test_get_returns_newest_visible_version() {
        let mem = memtable();
        mem.insert(1, ValueKind::Value, b"k", b"v1");
        mem.insert(5, ValueKind::Value, b"k", b"v2");

        assert_eq!(mem.get(b"k", MAX_SEQ), Some(Some(b"v2".to_vec())));
        assert_eq!(mem.get(b"k", 5), Some(Some(b"v2".to_vec())));
        // A snapshot taken before the overwrite still sees v1.
        assert_eq!(mem.get(b"k", 4), Some(Some(b"v1".to_vec())));
        assert_eq!(mem.get(b"k", 1), Some(Some(b"v1".to_vec())));
        // Before the first write nothing is visible.
        assert_eq!(mem.get(b"k", 0), None);
    }

    #[test]
    fn test_tombstone_shadows_value() {
        let mem = memtable();
        mem.insert(1, ValueKind::Value, b"k", b"v");
        mem.insert(2, ValueKind::Deletion, b"k", b"");

        assert_eq!(mem.get(b"k", MAX_SEQ), Some(None));
        assert_eq!(mem.get(b"k", 1), Some(Some(b"v".to_vec())));
        assert_eq!(mem.get(b"other", MAX_SEQ), None);
    }

    #[test]
    fn test_size_tracks_inserted_bytes() {
        let mem = memtable();
        assert_eq!(mem.approximate_size(), 0);
        mem.insert(1, ValueKind::Value, b"abc", b"12345");
        // 3 key bytes + 8 trailer bytes + 5 value bytes.
        assert_eq!(mem.approximate_size(), 16);
    }

    #[test]
    fn test_iterator_orders_by_user_key_then_seq_desc() {
        let mem = memtable();
        mem.insert(1, ValueKind::Value, b"b", b"b1");
        mem.insert(3, ValueKind::Value, b"a", b"a3");
        mem.insert(2, ValueKind::Value, b"a", b"a2");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = parse_internal_key(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.seq));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 2),
                (b"b".to_vec(), 1)
            ]
        );
    }

    #[test]
    fn test_iterator_seek_and_prev() {
        let mem = memtable();
        mem.insert(1, ValueKind::Value, b"a", b"1");
        mem.insert(2, ValueKind::Value, b"c", b"2");
        mem.insert(3, ValueKind::Value, b"e", b"3");

        let mut iter = mem.iter();
        iter.seek(&encode_internal_key(b"c", MAX_SEQ, KIND_SEEK));
        assert!(iter.valid());
        assert_eq!(user_key(iter.key()), b"c");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(user_key(iter.key()), b"a");

        iter.prev();
        assert!(!iter.valid());

        iter.seek_to_last();
        assert_eq!(user_key(iter.key()), b"e");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        let mem = memtable();
        let writer = {
            let mem = Arc::clone(&mem);
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    mem.insert(i + 1, ValueKind::Value, format!("k{i:04}").as_bytes(), b"v");
                }
            })
        };
        // Readers may observe any prefix of the writes, never a torn entry.
        for _ in 0..100 {
            if let Some(found) = mem.get(b"k0000", MAX_SEQ) {
                assert_eq!(found, Some(b"v".to_vec()));
            }
        }
        writer.join().unwrap();
        assert_eq!(mem.get(b"k0999", MAX_SEQ), Some(Some(b"v".to_vec())));
    }
}
