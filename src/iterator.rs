//! Iteration: the internal cursor seam, the k-way merging cursor, and the
//! snapshot-bounded iterator handed to callers.
//!
//! Every data source (memtable, table, level) exposes the same bidirectional
//! cursor surface. The merging iterator fuses any number of them into one
//! stream in internal-key order using a heap keyed by the internal
//! comparator; ties go to the newer source. The DB iterator sits on top,
//! resolving each user key to its newest record at or below the read
//! sequence and hiding tombstones.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::key::{
    encode_internal_key, parse_internal_key, user_key, InternalComparator, ValueKind, KIND_SEEK,
};
use crate::table::cache::TableCache;
use crate::table::TableIter;
use crate::version::FileMeta;

/// Bidirectional cursor over entries keyed by internal keys.
///
/// `key`/`value` may only be called while `valid()`; `next`/`prev` may only
/// be called while `valid()`. After any seek, `status` reports the first
/// error the cursor ran into, and the cursor is invalid.
pub trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

struct HeapEntry {
    key: Vec<u8>,
    child: usize,
    icmp: InternalComparator,
    reverse: bool,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry. Forward mode wants the
        // smallest key out first, reverse mode the largest; equal keys go to
        // the newer (lower-numbered) source either way.
        let by_key = if self.reverse {
            self.icmp.compare(&self.key, &other.key)
        } else {
            self.icmp.compare(&other.key, &self.key)
        };
        by_key.then_with(|| other.child.cmp(&self.child))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Merges child cursors into one stream in internal-key order.
pub struct MergingIter {
    icmp: InternalComparator,
    children: Vec<Box<dyn InternalIterator>>,
    heap: BinaryHeap<HeapEntry>,
    direction: Direction,
    current: Option<usize>,
}

impl MergingIter {
    pub fn new(icmp: InternalComparator, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            icmp,
            children,
            heap: BinaryHeap::new(),
            direction: Direction::Forward,
            current: None,
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap.clear();
        let reverse = self.direction == Direction::Reverse;
        for (idx, child) in self.children.iter().enumerate() {
            if child.valid() {
                self.heap.push(HeapEntry {
                    key: child.key().to_vec(),
                    child: idx,
                    icmp: self.icmp.clone(),
                    reverse,
                });
            }
        }
        self.current = self.heap.peek().map(|e| e.child);
    }

    fn advance_current_and_reheap(&mut self) {
        // Only the winner moved; its old heap entry was popped by the
        // caller, so push its new position if it still has one.
        if let Some(idx) = self.current {
            let child = &mut self.children[idx];
            if child.valid() {
                self.heap.push(HeapEntry {
                    key: child.key().to_vec(),
                    child: idx,
                    icmp: self.icmp.clone(),
                    reverse: self.direction == Direction::Reverse,
                });
            }
        }
        self.current = self.heap.peek().map(|e| e.child);
    }
}

impl InternalIterator for MergingIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.rebuild_heap();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.rebuild_heap();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.rebuild_heap();
    }

    fn next(&mut self) {
        let Some(current) = self.current else { return };
        if self.direction == Direction::Reverse {
            // Every other child sits at the largest entry below the current
            // key; put each at its first entry above it instead.
            let key = self.children[current].key().to_vec();
            for (idx, child) in self.children.iter_mut().enumerate() {
                if idx == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.icmp.compare(child.key(), &key) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
            self.children[current].next();
            self.rebuild_heap();
            return;
        }
        self.heap.pop();
        self.children[current].next();
        self.advance_current_and_reheap();
    }

    fn prev(&mut self) {
        let Some(current) = self.current else { return };
        if self.direction == Direction::Forward {
            // Mirror image of the switch in next(): park every other child
            // at its largest entry below the current key.
            let key = self.children[current].key().to_vec();
            for (idx, child) in self.children.iter_mut().enumerate() {
                if idx == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
            self.children[current].prev();
            self.rebuild_heap();
            return;
        }
        self.heap.pop();
        self.children[current].prev();
        self.advance_current_and_reheap();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("iterator is valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator is valid")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

/// Cursor over one level's non-overlapping, ordered table files, opening
/// each table lazily through the table cache.
pub(crate) struct LevelIter {
    icmp: InternalComparator,
    files: Vec<Arc<FileMeta>>,
    cache: Arc<TableCache>,
    fill_cache: bool,
    idx: usize,
    table_iter: Option<TableIter>,
    status: Option<Error>,
}

impl LevelIter {
    pub fn new(
        icmp: InternalComparator,
        files: Vec<Arc<FileMeta>>,
        cache: Arc<TableCache>,
        fill_cache: bool,
    ) -> Self {
        Self {
            icmp,
            files,
            cache,
            fill_cache,
            idx: 0,
            table_iter: None,
            status: None,
        }
    }

    fn open(&mut self, idx: usize) -> bool {
        self.idx = idx;
        let file = &self.files[idx];
        match self.cache.table(file.num, file.size) {
            Ok(table) => {
                self.table_iter = Some(table.iter(self.fill_cache));
                true
            }
            Err(err) => {
                self.status = Some(err);
                self.table_iter = None;
                false
            }
        }
    }

    /// Whether the exhausted table's cursor had an error, or `None` when
    /// the cursor is still live (or absent).
    fn exhausted_status(&self) -> Option<Result<()>> {
        match &self.table_iter {
            Some(iter) if !iter.valid() => Some(iter.status()),
            _ => None,
        }
    }

    fn forward_until_valid(&mut self) {
        while let Some(status) = self.exhausted_status() {
            if let Err(err) = status {
                self.status = Some(err);
                self.table_iter = None;
                return;
            }
            if self.idx + 1 >= self.files.len() {
                self.table_iter = None;
                return;
            }
            let next = self.idx + 1;
            if !self.open(next) {
                return;
            }
            if let Some(iter) = self.table_iter.as_mut() {
                iter.seek_to_first();
            }
        }
    }

    fn backward_until_valid(&mut self) {
        while let Some(status) = self.exhausted_status() {
            if let Err(err) = status {
                self.status = Some(err);
                self.table_iter = None;
                return;
            }
            if self.idx == 0 {
                self.table_iter = None;
                return;
            }
            let prev = self.idx - 1;
            if !self.open(prev) {
                return;
            }
            if let Some(iter) = self.table_iter.as_mut() {
                iter.seek_to_last();
            }
        }
    }
}

impl InternalIterator for LevelIter {
    fn valid(&self) -> bool {
        self.status.is_none()
            && self
                .table_iter
                .as_ref()
                .map(|iter| iter.valid())
                .unwrap_or(false)
    }

    fn seek_to_first(&mut self) {
        self.status = None;
        self.table_iter = None;
        if self.files.is_empty() {
            return;
        }
        if self.open(0) {
            if let Some(iter) = self.table_iter.as_mut() {
                iter.seek_to_first();
            }
            self.forward_until_valid();
        }
    }

    fn seek_to_last(&mut self) {
        self.status = None;
        self.table_iter = None;
        if self.files.is_empty() {
            return;
        }
        let last = self.files.len() - 1;
        if self.open(last) {
            if let Some(iter) = self.table_iter.as_mut() {
                iter.seek_to_last();
            }
            self.backward_until_valid();
        }
    }

    fn seek(&mut self, target: &[u8]) {
        self.status = None;
        self.table_iter = None;
        // First file whose largest key reaches the target.
        let idx = self
            .files
            .partition_point(|f| self.icmp.compare(&f.largest, target) == Ordering::Less);
        if idx >= self.files.len() {
            return;
        }
        if self.open(idx) {
            if let Some(iter) = self.table_iter.as_mut() {
                iter.seek(target);
            }
            self.forward_until_valid();
        }
    }

    fn next(&mut self) {
        if let Some(iter) = self.table_iter.as_mut() {
            iter.next();
            self.forward_until_valid();
        }
    }

    fn prev(&mut self) {
        if let Some(iter) = self.table_iter.as_mut() {
            iter.prev();
            self.backward_until_valid();
        }
    }

    fn key(&self) -> &[u8] {
        self.table_iter.as_ref().expect("iterator is valid").key()
    }

    fn value(&self) -> &[u8] {
        self.table_iter.as_ref().expect("iterator is valid").value()
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => self
                .table_iter
                .as_ref()
                .map(|iter| iter.status())
                .unwrap_or(Ok(())),
        }
    }
}

/// Anything the iterator must keep alive while it runs: the version whose
/// tables it reads and the memtables it walks.
pub(crate) type IterPins = Vec<Box<dyn std::any::Any + Send>>;

/// Ordered iterator over user keys, bounded by a snapshot sequence.
///
/// For each distinct user key it surfaces the newest record at or below the
/// sequence; keys whose newest visible record is a tombstone are skipped
/// entirely.
pub struct DbIterator {
    icmp: InternalComparator,
    iter: MergingIter,
    seq: u64,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    status: Option<Error>,
    released: bool,
    _pins: IterPins,
}

impl DbIterator {
    pub(crate) fn new(
        icmp: InternalComparator,
        iter: MergingIter,
        seq: u64,
        pins: IterPins,
    ) -> Self {
        Self {
            icmp,
            iter,
            seq,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
            released: false,
            _pins: pins,
        }
    }

    /// Whether the iterator is positioned on an entry.
    pub fn valid(&self) -> bool {
        self.valid && !self.released
    }

    /// Current user key. Only while `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        match self.direction {
            Direction::Forward => user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// Current value. Only while `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// First error the iterator ran into, if any.
    pub fn status(&self) -> Result<()> {
        if self.released {
            return Err(Error::IterReleased);
        }
        match &self.status {
            Some(err) => Err(err.clone()),
            None => self.iter.status(),
        }
    }

    /// Detaches the iterator from the database ahead of drop; every later
    /// call reports `IterReleased`.
    pub fn release(&mut self) {
        self.released = true;
        self.valid = false;
    }

    pub fn seek_to_first(&mut self) {
        if self.released {
            return;
        }
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        if self.released {
            return;
        }
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Positions at the first key at or after `target`.
    pub fn seek(&mut self, target: &[u8]) {
        if self.released {
            return;
        }
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        self.saved_key.extend_from_slice(target);
        self.iter
            .seek(&encode_internal_key(target, self.seq, KIND_SEEK));
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        if self.direction == Direction::Reverse {
            // The underlying cursor sits just before this key's entries.
            self.direction = Direction::Forward;
            if self.iter.valid() {
                self.iter.next();
            } else {
                self.iter.seek_to_first();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return false;
            }
            // saved_key still names the key to step past.
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(user_key(self.iter.key()));
            self.iter.next();
        }
        self.find_next_user_entry(true);
        self.valid
    }

    pub fn prev(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        if self.direction == Direction::Forward {
            // Back the cursor off every entry of the current user key.
            self.saved_key.clear();
            self.saved_key.extend_from_slice(user_key(self.iter.key()));
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return false;
                }
                if self
                    .icmp
                    .user()
                    .compare(user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
        self.valid
    }

    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        while self.iter.valid() {
            let parsed = match parse_internal_key(self.iter.key()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.status = Some(err);
                    self.valid = false;
                    return;
                }
            };
            if parsed.seq <= self.seq {
                match parsed.kind {
                    ValueKind::Deletion => {
                        // Everything older for this user key is shadowed.
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        skipping = true;
                    }
                    ValueKind::Value => {
                        let hidden = skipping
                            && self.icmp.user().compare(parsed.user_key, &self.saved_key)
                                != Ordering::Greater;
                        if !hidden {
                            self.saved_key.clear();
                            self.valid = true;
                            return;
                        }
                    }
                }
            }
            self.iter.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);
        let mut kind = ValueKind::Deletion;
        while self.iter.valid() {
            let parsed = match parse_internal_key(self.iter.key()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.status = Some(err);
                    self.valid = false;
                    return;
                }
            };
            if parsed.seq <= self.seq {
                if kind != ValueKind::Deletion
                    && self.icmp.user().compare(parsed.user_key, &self.saved_key)
                        == Ordering::Less
                {
                    // A live record for saved_key is in hand and the scan
                    // stepped onto an earlier user key.
                    break;
                }
                kind = parsed.kind;
                match kind {
                    ValueKind::Deletion => {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    }
                    ValueKind::Value => {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.iter.value());
                    }
                }
            }
            self.iter.prev();
        }
        if kind == ValueKind::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, MAX_SEQ};
    use crate::memtable::Memtable;

    fn icmp() -> InternalComparator {
        InternalComparator::new(Arc::new(BytewiseComparator))
    }

    fn mem_with(entries: &[(&[u8], u64, ValueKind, &[u8])]) -> Arc<Memtable> {
        let mem = Arc::new(Memtable::new(icmp()));
        for (key, seq, kind, value) in entries {
            mem.insert(*seq, *kind, key, value);
        }
        mem
    }

    fn collect_forward(iter: &mut DbIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        out
    }

    fn db_iter(children: Vec<Box<dyn InternalIterator>>, seq: u64) -> DbIterator {
        DbIterator::new(icmp(), MergingIter::new(icmp(), children), seq, Vec::new())
    }

    #[test]
    fn test_merging_orders_across_children() {
        let a = mem_with(&[
            (b"a", 1, ValueKind::Value, b"a1"),
            (b"c", 3, ValueKind::Value, b"c3"),
        ]);
        let b = mem_with(&[
            (b"b", 2, ValueKind::Value, b"b2"),
            (b"d", 4, ValueKind::Value, b"d4"),
        ]);
        let mut merge = MergingIter::new(
            icmp(),
            vec![Box::new(a.iter()), Box::new(b.iter())],
        );

        merge.seek_to_first();
        let mut keys = Vec::new();
        while merge.valid() {
            keys.push(user_key(merge.key()).to_vec());
            merge.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_merging_reverse_scan() {
        let a = mem_with(&[
            (b"a", 1, ValueKind::Value, b"a1"),
            (b"c", 3, ValueKind::Value, b"c3"),
        ]);
        let b = mem_with(&[(b"b", 2, ValueKind::Value, b"b2")]);
        let mut merge = MergingIter::new(
            icmp(),
            vec![Box::new(a.iter()), Box::new(b.iter())],
        );

        merge.seek_to_last();
        let mut keys = Vec::new();
        while merge.valid() {
            keys.push(user_key(merge.key()).to_vec());
            merge.prev();
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_merging_direction_switch_mid_stream() {
        let a = mem_with(&[
            (b"a", 1, ValueKind::Value, b""),
            (b"c", 2, ValueKind::Value, b""),
            (b"e", 3, ValueKind::Value, b""),
        ]);
        let b = mem_with(&[
            (b"b", 4, ValueKind::Value, b""),
            (b"d", 5, ValueKind::Value, b""),
        ]);
        let mut merge = MergingIter::new(
            icmp(),
            vec![Box::new(a.iter()), Box::new(b.iter())],
        );

        merge.seek_to_first();
        merge.next();
        merge.next();
        assert_eq!(user_key(merge.key()), b"c");

        merge.prev();
        assert_eq!(user_key(merge.key()), b"b");
        merge.next();
        assert_eq!(user_key(merge.key()), b"c");
        merge.next();
        assert_eq!(user_key(merge.key()), b"d");
    }

    #[test]
    fn test_db_iter_resolves_newest_visible() {
        let mem = mem_with(&[
            (b"k", 1, ValueKind::Value, b"v1"),
            (b"k", 5, ValueKind::Value, b"v5"),
            (b"other", 2, ValueKind::Value, b"o"),
        ]);

        let mut iter = db_iter(vec![Box::new(mem.iter())], MAX_SEQ);
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                (b"k".to_vec(), b"v5".to_vec()),
                (b"other".to_vec(), b"o".to_vec())
            ]
        );

        // At a snapshot before seq 5 the older value resurfaces.
        let mut iter = db_iter(vec![Box::new(mem.iter())], 4);
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                (b"k".to_vec(), b"v1".to_vec()),
                (b"other".to_vec(), b"o".to_vec())
            ]
        );
    }

    #[test]
    fn test_db_iter_hides_tombstoned_keys() {
        let mem = mem_with(&[
            (b"a", 1, ValueKind::Value, b"av"),
            (b"b", 2, ValueKind::Value, b"bv"),
            (b"b", 3, ValueKind::Deletion, b""),
            (b"c", 4, ValueKind::Value, b"cv"),
        ]);

        let mut iter = db_iter(vec![Box::new(mem.iter())], MAX_SEQ);
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                (b"a".to_vec(), b"av".to_vec()),
                (b"c".to_vec(), b"cv".to_vec())
            ]
        );

        // Before the delete the key is visible.
        let mut iter = db_iter(vec![Box::new(mem.iter())], 2);
        assert_eq!(
            collect_forward(&mut iter),
            vec![
                (b"a".to_vec(), b"av".to_vec()),
                (b"b".to_vec(), b"bv".to_vec())
            ]
        );
    }

    #[test]
    fn test_db_iter_backward_scan() {
        let mem = mem_with(&[
            (b"a", 1, ValueKind::Value, b"av"),
            (b"b", 2, ValueKind::Value, b"bv"),
            (b"b", 5, ValueKind::Deletion, b""),
            (b"c", 3, ValueKind::Value, b"cv"),
            (b"d", 4, ValueKind::Value, b"dv"),
        ]);

        let mut iter = db_iter(vec![Box::new(mem.iter())], MAX_SEQ);
        iter.seek_to_last();
        let mut out = Vec::new();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        assert_eq!(
            out,
            vec![
                (b"d".to_vec(), b"dv".to_vec()),
                (b"c".to_vec(), b"cv".to_vec()),
                (b"a".to_vec(), b"av".to_vec()),
            ]
        );
    }

    #[test]
    fn test_db_iter_direction_changes() {
        let mem = mem_with(&[
            (b"a", 1, ValueKind::Value, b"1"),
            (b"b", 2, ValueKind::Value, b"2"),
            (b"c", 3, ValueKind::Value, b"3"),
        ]);

        let mut iter = db_iter(vec![Box::new(mem.iter())], MAX_SEQ);
        iter.seek_to_first();
        iter.next();
        assert_eq!(iter.key(), b"b");
        iter.prev();
        assert_eq!(iter.key(), b"a");
        iter.next();
        assert_eq!(iter.key(), b"b");
        iter.next();
        assert_eq!(iter.key(), b"c");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_db_iter_seek() {
        let mem = mem_with(&[
            (b"alpha", 1, ValueKind::Value, b"1"),
            (b"beta", 2, ValueKind::Value, b"2"),
            (b"delta", 3, ValueKind::Value, b"3"),
        ]);

        let mut iter = db_iter(vec![Box::new(mem.iter())], MAX_SEQ);
        iter.seek(b"b");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"beta");

        iter.seek(b"beta");
        assert_eq!(iter.key(), b"beta");

        iter.seek(b"zz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_db_iter_release() {
        let mem = mem_with(&[(b"a", 1, ValueKind::Value, b"1")]);
        let mut iter = db_iter(vec![Box::new(mem.iter())], MAX_SEQ);
        iter.seek_to_first();
        assert!(iter.valid());
        iter.release();
        assert!(!iter.valid());
        assert_eq!(iter.status(), Err(Error::IterReleased));
        assert!(!iter.next());
    }

    #[test]
    fn test_db_iter_prev_stops_at_first_key() {
        let mem = mem_with(&[
            (b"a", 1, ValueKind::Value, b"1"),
            (b"b", 2, ValueKind::Value, b"2"),
        ]);
        let mut iter = db_iter(vec![Box::new(mem.iter())], MAX_SEQ);
        iter.seek(b"b");
        assert_eq!(iter.key(), b"b");
        iter.prev();
        assert_eq!(iter.key(), b"a");
        iter.prev();
        assert!(!iter.valid());
    }
}
