//! Versions: immutable snapshots of the tree's table layout.
//!
//! A version lists the live tables of every level plus the compaction
//! bookkeeping derived from them. Readers grab the current version (an
//! `Arc`), use it without locks, and drop it; a superseded version stays
//! alive while any iterator, snapshot reader or compaction still holds it,
//! and the files it references stay on disk just as long.

pub mod edit;
pub mod set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::config::{max_bytes_for_level, L0_COMPACTION_TRIGGER, MAX_GRANDPARENT_OVERLAP, NUM_LEVELS};
use crate::error::Result;
use crate::iterator::{InternalIterator, LevelIter};
use crate::key::{user_key, InternalComparator};
use crate::table::cache::TableCache;

/// Metadata for one table file.
#[derive(Debug)]
pub struct FileMeta {
    pub num: u64,
    pub size: u64,
    /// Smallest internal key in the table.
    pub smallest: Vec<u8>,
    /// Largest internal key in the table.
    pub largest: Vec<u8>,
    /// Seek misses this table may absorb before it becomes a compaction
    /// candidate. One seek costs about as much as compacting 16KiB.
    allowed_seeks: AtomicI64,
}

impl FileMeta {
    pub fn new(num: u64, size: u64, smallest: Vec<u8>, largest: Vec<u8>) -> Self {
        let allowed_seeks = (size as i64 / (16 * 1024)).max(100);
        Self {
            num,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }

    /// Records one seek miss; true once the budget is exhausted.
    fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) <= 1
    }
}

/// Outcome of a point lookup against one version.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The newest visible record is a live value.
    Value(Vec<u8>),
    /// The newest visible record is a tombstone.
    Deleted,
    /// No table holds a visible record for the key.
    Miss,
}

/// An immutable per-level table layout.
pub struct Version {
    icmp: InternalComparator,
    table_cache: Arc<TableCache>,
    pub(crate) files: Vec<Vec<Arc<FileMeta>>>,
    /// Level most in need of size compaction and how urgent it is;
    /// a score >= 1.0 means overdue.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
    seek_compact: Mutex<Option<(usize, Arc<FileMeta>)>>,
}

impl Version {
    pub(crate) fn empty(icmp: InternalComparator, table_cache: Arc<TableCache>) -> Self {
        Self {
            icmp,
            table_cache,
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_score: 0.0,
            compaction_level: 0,
            seek_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files.get(level).map(|f| f.len()).unwrap_or(0)
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files
            .get(level)
            .map(|files| files.iter().map(|f| f.size).sum())
            .unwrap_or(0)
    }

    pub(crate) fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub(crate) fn icmp(&self) -> &InternalComparator {
        &self.icmp
    }

    /// Computes the size-compaction score after the file lists change.
    /// L0 scores by table count because every L0 table widens each read;
    /// deeper levels score by bytes against their budget.
    pub(crate) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = self.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64;
        for level in 1..NUM_LEVELS - 1 {
            let score = self.level_bytes(level) as f64 / max_bytes_for_level(level) as f64;
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Point lookup. Searches L0 newest-first, then one binary-searched
    /// candidate per deeper level, stopping at the first record for the
    /// user key. The boolean asks the caller to schedule a seek-triggered
    /// compaction.
    pub fn get(&self, ikey: &[u8], fill_cache: bool) -> Result<(Lookup, bool)> {
        let ukey = user_key(ikey);
        let ucmp = self.icmp.user();
        let mut first_missed: Option<&Arc<FileMeta>> = None;

        // L0 tables overlap; consult every covering table, newest first.
        let mut l0: Vec<&Arc<FileMeta>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(ukey, user_key(&f.smallest)) != Ordering::Less
                    && ucmp.compare(ukey, user_key(&f.largest)) != Ordering::Greater
            })
            .collect();
        l0.sort_by(|a, b| b.num.cmp(&a.num));
        for file in l0 {
            if let Some(found) = self.search_table(file, ikey, ukey, fill_cache)? {
                return Ok((found, false));
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            let idx = files.partition_point(|f| self.icmp.compare(&f.largest, ikey) == Ordering::Less);
            let Some(file) = files.get(idx) else { continue };
            if ucmp.compare(ukey, user_key(&file.smallest)) == Ordering::Less {
                continue;
            }
            match self.search_table(file, ikey, ukey, fill_cache)? {
                Some(found) => {
                    let schedule = match first_missed {
                        Some(missed) => self.note_seek_miss(missed),
                        None => false,
                    };
                    return Ok((found, schedule));
                }
                None => {
                    if first_missed.is_none() {
                        first_missed = Some(file);
                    }
                }
            }
        }

        let schedule = match first_missed {
            Some(missed) => self.note_seek_miss(missed),
            None => false,
        };
        Ok((Lookup::Miss, schedule))
    }

    fn search_table(
        &self,
        file: &Arc<FileMeta>,
        ikey: &[u8],
        ukey: &[u8],
        fill_cache: bool,
    ) -> Result<Option<Lookup>> {
        let table = self.table_cache.table(file.num, file.size)?;
        let Some((found_key, value)) = table.get(ikey, fill_cache)? else {
            return Ok(None);
        };
        let parsed = crate::key::parse_internal_key(&found_key)?;
        if self.icmp.user().compare(parsed.user_key, ukey) != Ordering::Equal {
            return Ok(None);
        }
        Ok(Some(match parsed.kind {
            crate::key::ValueKind::Value => Lookup::Value(value),
            crate::key::ValueKind::Deletion => Lookup::Deleted,
        }))
    }

    fn note_seek_miss(&self, file: &Arc<FileMeta>) -> bool {
        if !file.charge_seek() {
            return false;
        }
        // The last level has nowhere to compact into.
        let level = (1..NUM_LEVELS - 1)
            .find(|&l| self.files[l].iter().any(|f| f.num == file.num));
        let Some(level) = level else { return false };
        let mut hint = self.seek_compact.lock().expect("seek hint poisoned");
        if hint.is_none() {
            *hint = Some((level, Arc::clone(file)));
            return true;
        }
        false
    }

    /// A pending seek-triggered compaction, if a table has exhausted its
    /// seek budget.
    pub(crate) fn seek_compaction_hint(&self) -> Option<(usize, Arc<FileMeta>)> {
        self.seek_compact.lock().expect("seek hint poisoned").clone()
    }

    /// Tables in `level` whose user-key ranges touch `[begin, end]`; `None`
    /// bounds are open. In L0 the range grows transitively: a table pulled
    /// in widens the range, which may pull in more tables.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMeta>> {
        let ucmp = self.icmp.user();
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs: Vec<Arc<FileMeta>> = Vec::new();
        'restart: loop {
            inputs.clear();
            for file in &self.files[level] {
                let file_start = user_key(&file.smallest);
                let file_limit = user_key(&file.largest);
                if let Some(b) = &begin {
                    if ucmp.compare(file_limit, b) == Ordering::Less {
                        continue;
                    }
                }
                if let Some(e) = &end {
                    if ucmp.compare(file_start, e) == Ordering::Greater {
                        continue;
                    }
                }
                inputs.push(Arc::clone(file));
                if level == 0 {
                    // L0 files overlap each other, so the effective range
                    // must cover this file too.
                    let widen_begin = begin
                        .as_deref()
                        .is_some_and(|b| ucmp.compare(file_start, b) == Ordering::Less);
                    if widen_begin {
                        begin = Some(file_start.to_vec());
                        continue 'restart;
                    }
                    let widen_end = end
                        .as_deref()
                        .is_some_and(|e| ucmp.compare(file_limit, e) == Ordering::Greater);
                    if widen_end {
                        end = Some(file_limit.to_vec());
                        continue 'restart;
                    }
                }
            }
            return inputs;
        }
    }

    /// Whether any table in `level` overlaps the user-key range.
    pub fn overlap_in_level(&self, level: usize, begin: &[u8], end: &[u8]) -> bool {
        !self
            .overlapping_inputs(level, Some(begin), Some(end))
            .is_empty()
    }

    /// Destination level for a fresh memtable flush. A table that overlaps
    /// nothing in L0 or L1 and would not drag a huge L2 overlap behind it
    /// can skip straight to L1.
    pub fn pick_output_level(&self, smallest_user: &[u8], largest_user: &[u8]) -> usize {
        if self.overlap_in_level(0, smallest_user, largest_user)
            || self.overlap_in_level(1, smallest_user, largest_user)
        {
            return 0;
        }
        let grandparents =
            self.overlapping_inputs(2, Some(smallest_user), Some(largest_user));
        let overlap: u64 = grandparents.iter().map(|f| f.size).sum();
        if overlap > MAX_GRANDPARENT_OVERLAP {
            return 0;
        }
        1
    }

    /// Appends one cursor per data source: each L0 table and one
    /// concatenating cursor per deeper level.
    pub(crate) fn add_iters(
        &self,
        fill_cache: bool,
        out: &mut Vec<Box<dyn InternalIterator>>,
    ) -> Result<()> {
        for file in &self.files[0] {
            let table = self.table_cache.table(file.num, file.size)?;
            out.push(Box::new(table.iter(fill_cache)));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                out.push(Box::new(LevelIter::new(
                    self.icmp.clone(),
                    self.files[level].clone(),
                    Arc::clone(&self.table_cache),
                    fill_cache,
                )));
            }
        }
        Ok(())
    }

    /// Approximate byte offset of `ikey` within the whole version, the sum
    /// of whole tables below it plus a block-level probe into tables that
    /// straddle it.
    pub fn approximate_offset(&self, ikey: &[u8]) -> Result<u64> {
        let mut offset = 0;
        for level in 0..NUM_LEVELS {
            for file in &self.files[level] {
                if self.icmp.compare(&file.largest, ikey) != Ordering::Greater {
                    offset += file.size;
                } else if self.icmp.compare(&file.smallest, ikey) == Ordering::Greater {
                    if level > 0 {
                        break;
                    }
                } else {
                    let table = self.table_cache.table(file.num, file.size)?;
                    offset += table.approximate_offset_of(ikey);
                }
            }
        }
        Ok(offset)
    }
}
