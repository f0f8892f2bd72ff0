//! The version set: current version, manifest log, and compaction picking.
//!
//! Every change to the table layout flows through [`VersionSet::log_and_apply`]:
//! the edit is applied to the current version to produce the next one, the
//! edit is appended to the manifest and fsynced, and only then does the
//! current pointer move. A failed manifest write leaves the old version
//! current and the new tables unreferenced, ready for garbage collection.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::config::{Options, MAX_GRANDPARENT_OVERLAP, MAX_TABLE_SIZE, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::iterator::{InternalIterator, LevelIter, MergingIter};
use crate::journal;
use crate::key::{user_key, InternalComparator};
use crate::storage::{
    file_name, read_file_to_vec, write_file_atomic, FileDesc, FileKind, Storage, WritableFile,
};
use crate::table::cache::TableCache;

use super::edit::VersionEdit;
use super::{FileMeta, Version};

struct State {
    current: Arc<Version>,
    /// Every version still referenced somewhere; pruned after each install.
    live: VecDeque<Arc<Version>>,
    manifest: Option<journal::Writer<Box<dyn WritableFile>>>,
    manifest_num: u64,
    journal_num: u64,
    prev_journal_num: u64,
    /// Largest internal key compacted so far per level, so size compactions
    /// rotate through the keyspace.
    compaction_pointers: Vec<Vec<u8>>,
}

pub struct VersionSet {
    storage: Arc<dyn Storage>,
    opts: Options,
    icmp: InternalComparator,
    table_cache: Arc<TableCache>,
    next_file_num: AtomicU64,
    last_seq: AtomicU64,
    state: Mutex<State>,
}

impl VersionSet {
    pub fn new(
        storage: Arc<dyn Storage>,
        opts: Options,
        icmp: InternalComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        let current = Arc::new(Version::empty(icmp.clone(), Arc::clone(&table_cache)));
        let mut live = VecDeque::new();
        live.push_back(Arc::clone(&current));
        Self {
            storage,
            opts,
            icmp,
            table_cache,
            next_file_num: AtomicU64::new(1),
            last_seq: AtomicU64::new(0),
            state: Mutex::new(State {
                current,
                live,
                manifest: None,
                manifest_num: 0,
                journal_num: 0,
                prev_journal_num: 0,
                compaction_pointers: vec![Vec::new(); NUM_LEVELS],
            }),
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.state.lock().expect("version set poisoned").current)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(AtomicOrdering::Acquire)
    }

    pub fn set_last_seq(&self, seq: u64) {
        self.last_seq.store(seq, AtomicOrdering::Release);
    }

    /// Allocates a fresh file number.
    pub fn new_file_num(&self) -> u64 {
        self.next_file_num.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Ensures future allocations stay above an observed number.
    pub fn mark_file_num(&self, num: u64) {
        let mut next = self.next_file_num.load(AtomicOrdering::SeqCst);
        while next <= num {
            match self.next_file_num.compare_exchange(
                next,
                num + 1,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => next = observed,
            }
        }
    }

    pub fn next_file_num_hint(&self) -> u64 {
        self.next_file_num.load(AtomicOrdering::SeqCst)
    }

    pub fn journal_num(&self) -> u64 {
        self.state.lock().expect("version set poisoned").journal_num
    }

    pub fn prev_journal_num(&self) -> u64 {
        self.state
            .lock()
            .expect("version set poisoned")
            .prev_journal_num
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    /// Applies `edit` to the current version, makes it durable in the
    /// manifest, and installs the result as current.
    pub fn log_and_apply(&self, edit: &mut VersionEdit) -> Result<()> {
        let mut state = self.state.lock().expect("version set poisoned");

        if edit.journal_num.is_none() {
            edit.set_journal_num(state.journal_num);
        }
        if edit.prev_journal_num.is_none() {
            edit.set_prev_journal_num(state.prev_journal_num);
        }
        edit.set_next_file_num(self.next_file_num.load(AtomicOrdering::SeqCst));
        edit.set_last_seq(self.last_seq());

        let mut next = apply_edit(&state.current, edit, &self.icmp, &self.table_cache);
        next.finalize();
        let next = Arc::new(next);

        // First commit on a fresh manifest: write a base snapshot so the
        // manifest alone reconstructs the whole state.
        let mut installed_manifest = None;
        if state.manifest.is_none() {
            let manifest_num = self.new_file_num();
            let fd = FileDesc::new(FileKind::Manifest, manifest_num);
            let file = self.storage.create(fd)?;
            let mut writer = journal::Writer::new(file);
            if let Err(err) = self.write_snapshot(&state, &mut writer) {
                let _ = self.storage.remove(fd);
                return Err(err);
            }
            state.manifest = Some(writer);
            state.manifest_num = manifest_num;
            installed_manifest = Some(manifest_num);
        }

        let writer = state.manifest.as_mut().expect("manifest writer set");
        let result = writer.append(&edit.encode()).and_then(|_| writer.sync());
        if let Err(err) = result {
            // The old version stays current; a half-written fresh manifest
            // is unreferenced and gets collected.
            if let Some(num) = installed_manifest.take() {
                state.manifest = None;
                let _ = self.storage.remove(FileDesc::new(FileKind::Manifest, num));
            }
            return Err(err);
        }

        if let Some(num) = installed_manifest {
            let current = format!("{}\n", file_name(FileDesc::new(FileKind::Manifest, num)));
            if let Err(err) = write_file_atomic(
                self.storage.as_ref(),
                self.new_file_num(),
                FileDesc::CURRENT,
                current.as_bytes(),
            ) {
                state.manifest = None;
                let _ = self.storage.remove(FileDesc::new(FileKind::Manifest, num));
                return Err(err);
            }
        }

        for (level, key) in &edit.compaction_pointers {
            state.compaction_pointers[*level] = key.clone();
        }
        state.journal_num = edit.journal_num.expect("journal_num filled above");
        state.prev_journal_num = edit.prev_journal_num.expect("prev_journal_num filled above");
        state.current = Arc::clone(&next);
        state.live.push_back(next);
        state.live.retain(|v| Arc::strong_count(v) > 1);
        Ok(())
    }

    fn write_snapshot(
        &self,
        state: &State,
        writer: &mut journal::Writer<Box<dyn WritableFile>>,
    ) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.opts.comparator.name());
        for (level, key) in state.compaction_pointers.iter().enumerate() {
            if !key.is_empty() {
                edit.set_compaction_pointer(level, key.clone());
            }
        }
        for (level, files) in state.current.files.iter().enumerate() {
            for file in files {
                edit.add_file(
                    level,
                    file.num,
                    file.size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        writer.append(&edit.encode())
    }

    /// Replays CURRENT and the manifest it names, installing the recovered
    /// version. Corruption here is fatal; `Recover` exists for that.
    pub fn recover(&self) -> Result<()> {
        let current_content = read_file_to_vec(self.storage.as_ref(), FileDesc::CURRENT)?;
        let name = std::str::from_utf8(&current_content)
            .map_err(|_| Error::Corruption("CURRENT is not utf-8".into()))?
            .trim_end();
        let manifest_fd = crate::storage::parse_file_name(name)
            .filter(|fd| fd.kind == FileKind::Manifest)
            .ok_or_else(|| Error::Corruption(format!("CURRENT names '{name}'")))?;

        let file = self.storage.open_sequential(manifest_fd)?;
        let mut reader = journal::Reader::new(file, Box::new(journal::TracingSink), true);

        let mut files: Vec<Vec<Arc<FileMeta>>> = vec![Vec::new(); NUM_LEVELS];
        let mut pointers = vec![Vec::new(); NUM_LEVELS];
        let mut journal_num = None;
        let mut prev_journal_num = None;
        let mut next_file_num = None;
        let mut last_seq = None;

        while let Some(record) = reader.next()? {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                if name != self.opts.comparator.name() {
                    return Err(Error::InvalidArgument(format!(
                        "database comparator is '{name}', options carry '{}'",
                        self.opts.comparator.name()
                    )));
                }
            }
            for (level, num) in &edit.deleted_files {
                if *level >= NUM_LEVELS {
                    return Err(Error::Corruption(format!("edit deletes in level {level}")));
                }
                files[*level].retain(|f| f.num != *num);
            }
            for nf in &edit.new_files {
                if nf.level >= NUM_LEVELS {
                    return Err(Error::Corruption(format!("edit adds in level {}", nf.level)));
                }
                files[nf.level].push(Arc::new(FileMeta::new(
                    nf.num,
                    nf.size,
                    nf.smallest.clone(),
                    nf.largest.clone(),
                )));
            }
            for (level, key) in &edit.compaction_pointers {
                pointers[*level] = key.clone();
            }
            journal_num = edit.journal_num.or(journal_num);
            prev_journal_num = edit.prev_journal_num.or(prev_journal_num);
            next_file_num = edit.next_file_num.or(next_file_num);
            last_seq = edit.last_seq.or(last_seq);
        }

        let next_file_num = next_file_num
            .ok_or_else(|| Error::Corruption("manifest never set next file number".into()))?;
        let last_seq =
            last_seq.ok_or_else(|| Error::Corruption("manifest never set last sequence".into()))?;

        sort_level_files(&mut files, &self.icmp);
        let mut version = Version::empty(self.icmp.clone(), Arc::clone(&self.table_cache));
        version.files = files;
        version.finalize();
        let version = Arc::new(version);

        let mut state = self.state.lock().expect("version set poisoned");
        state.current = Arc::clone(&version);
        state.live.clear();
        state.live.push_back(version);
        state.journal_num = journal_num.unwrap_or(0);
        state.prev_journal_num = prev_journal_num.unwrap_or(0);
        state.compaction_pointers = pointers;
        state.manifest = None;
        state.manifest_num = manifest_fd.num;
        drop(state);

        self.mark_file_num(next_file_num.saturating_sub(1));
        self.mark_file_num(manifest_fd.num);
        self.set_last_seq(last_seq);
        Ok(())
    }

    /// File numbers referenced by any live version, plus the manifest.
    pub fn live_files(&self) -> HashSet<u64> {
        let state = self.state.lock().expect("version set poisoned");
        let mut live = HashSet::new();
        for version in &state.live {
            for files in &version.files {
                for file in files {
                    live.insert(file.num);
                }
            }
        }
        live
    }

    pub fn manifest_num(&self) -> u64 {
        self.state.lock().expect("version set poisoned").manifest_num
    }

    /// Picks the most urgent compaction: size-triggered first, then the
    /// seek hint. `None` means the tree is in shape.
    pub fn pick_compaction(&self) -> Option<Compaction> {
        let current = self.current();
        let (level, mut inputs0) = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            let files = &current.files[level];
            if files.is_empty() {
                return None;
            }
            // Resume past the last compacted key, wrapping to the start.
            let pointer = {
                let state = self.state.lock().expect("version set poisoned");
                state.compaction_pointers[level].clone()
            };
            let file = files
                .iter()
                .find(|f| {
                    pointer.is_empty()
                        || self.icmp.compare(&f.largest, &pointer) == Ordering::Greater
                })
                .unwrap_or(&files[0]);
            (level, vec![Arc::clone(file)])
        } else if let Some((level, file)) = current.seek_compaction_hint() {
            (level, vec![file])
        } else {
            return None;
        };

        if level == 0 {
            // L0 inputs expand to every transitively overlapping table.
            let (smallest, largest) = user_range(&self.icmp, &inputs0);
            inputs0 = current.overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!inputs0.is_empty());
        }
        Some(self.setup_other_inputs(current, level, inputs0))
    }

    /// Compaction for a manual user-key range, or `None` when the level has
    /// nothing in range.
    pub fn compact_range(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        // Bound one manual step; the caller loops until the range is clean.
        // L0 cannot be truncated: dropping an overlapping newer table while
        // compacting an older one would let stale data resurface.
        if level > 0 {
            let mut total = 0;
            for (i, file) in inputs.iter().enumerate() {
                total += file.size;
                if total >= MAX_TABLE_SIZE {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }
        Some(self.setup_other_inputs(current, level, inputs))
    }

    fn setup_other_inputs(
        &self,
        current: Arc<Version>,
        level: usize,
        inputs0: Vec<Arc<FileMeta>>,
    ) -> Compaction {
        let (smallest, largest) = user_range(&self.icmp, &inputs0);
        let inputs1 = current.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        let grandparents = if level + 2 < NUM_LEVELS {
            let mut all = inputs0.clone();
            all.extend(inputs1.iter().cloned());
            let (all_smallest, all_largest) = user_range(&self.icmp, &all);
            current.overlapping_inputs(level + 2, Some(&all_smallest), Some(&all_largest))
        } else {
            Vec::new()
        };

        // Move the pointer now rather than at commit, so a failed attempt
        // tries a different range next time.
        let largest_internal = inputs0
            .iter()
            .map(|f| &f.largest)
            .max_by(|a, b| self.icmp.compare(a, b))
            .expect("inputs0 not empty")
            .clone();
        {
            let mut state = self.state.lock().expect("version set poisoned");
            state.compaction_pointers[level] = largest_internal.clone();
        }
        let mut edit = VersionEdit::new();
        edit.set_compaction_pointer(level, largest_internal);

        Compaction {
            level,
            inputs: [inputs0, inputs1],
            grandparents,
            edit,
            version: current,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
        }
    }
}

fn sort_level_files(files: &mut [Vec<Arc<FileMeta>>], icmp: &InternalComparator) {
    files[0].sort_by_key(|f| f.num);
    for level_files in files.iter_mut().skip(1) {
        level_files.sort_by(|a, b| icmp.compare(&a.smallest, &b.smallest));
    }
}

fn apply_edit(
    base: &Version,
    edit: &VersionEdit,
    icmp: &InternalComparator,
    table_cache: &Arc<TableCache>,
) -> Version {
    let mut files = base.files.clone();
    for (level, num) in &edit.deleted_files {
        files[*level].retain(|f| f.num != *num);
    }
    for nf in &edit.new_files {
        files[nf.level].push(Arc::new(FileMeta::new(
            nf.num,
            nf.size,
            nf.smallest.clone(),
            nf.largest.clone(),
        )));
    }
    sort_level_files(&mut files, icmp);
    let mut version = Version::empty(icmp.clone(), Arc::clone(table_cache));
    version.files = files;
    version
}

fn user_range(icmp: &InternalComparator, files: &[Arc<FileMeta>]) -> (Vec<u8>, Vec<u8>) {
    let ucmp = icmp.user();
    let mut smallest = user_key(&files[0].smallest).to_vec();
    let mut largest = user_key(&files[0].largest).to_vec();
    for file in &files[1..] {
        if ucmp.compare(user_key(&file.smallest), &smallest) == Ordering::Less {
            smallest = user_key(&file.smallest).to_vec();
        }
        if ucmp.compare(user_key(&file.largest), &largest) == Ordering::Greater {
            largest = user_key(&file.largest).to_vec();
        }
    }
    (smallest, largest)
}

/// A planned level-to-level merge: inputs, grandparent bookkeeping, and the
/// edit that will publish its outputs.
pub struct Compaction {
    pub level: usize,
    pub inputs: [Vec<Arc<FileMeta>>; 2],
    pub grandparents: Vec<Arc<FileMeta>>,
    pub edit: VersionEdit,
    version: Arc<Version>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
}

impl Compaction {
    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    pub fn num_input_files(&self) -> usize {
        self.inputs[0].len() + self.inputs[1].len()
    }

    /// A single input with nothing to merge against can be adopted by the
    /// next level as-is, as long as it would not create an oversized
    /// grandparent overlap for the compaction after this one.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && self.grandparents.iter().map(|f| f.size).sum::<u64>() <= MAX_GRANDPARENT_OVERLAP
    }

    /// Marks every input file deleted in the pending edit.
    pub fn add_input_deletions(&mut self) {
        for (which, level) in [(0, self.level), (1, self.level + 1)] {
            for file in &self.inputs[which] {
                self.edit.delete_file(level, file.num);
            }
        }
    }

    /// True when no level beyond the output can hold `ukey`, which makes a
    /// tombstone for it safe to drop.
    pub fn is_base_level_for_key(&self, ukey: &[u8]) -> bool {
        let ucmp = self.version.icmp().user();
        for level in self.level + 2..NUM_LEVELS {
            for file in &self.version.files[level] {
                if ucmp.compare(ukey, user_key(&file.largest)) != Ordering::Greater
                    && ucmp.compare(ukey, user_key(&file.smallest)) != Ordering::Less
                {
                    return false;
                }
            }
        }
        true
    }

    /// Tracks grandparent overlap as output keys stream by; true means the
    /// current output table should be cut here.
    pub fn should_stop_before(&mut self, ikey: &[u8], icmp: &InternalComparator) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(ikey, &self.grandparents[self.grandparent_index].largest)
                == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > MAX_GRANDPARENT_OVERLAP {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// One merged cursor over every input table.
    pub fn input_iter(&self) -> Result<MergingIter> {
        let icmp = self.version.icmp().clone();
        let cache = self.version.table_cache();
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        if self.level == 0 {
            for file in &self.inputs[0] {
                let table = cache.table(file.num, file.size)?;
                children.push(Box::new(table.iter(false)));
            }
        } else if !self.inputs[0].is_empty() {
            children.push(Box::new(LevelIter::new(
                icmp.clone(),
                self.inputs[0].clone(),
                Arc::clone(cache),
                false,
            )));
        }
        if !self.inputs[1].is_empty() {
            children.push(Box::new(LevelIter::new(
                icmp.clone(),
                self.inputs[1].clone(),
                Arc::clone(cache),
                false,
            )));
        }
        Ok(MergingIter::new(icmp, children))
    }

    /// The version whose files this compaction reads. Held for the whole
    /// run so those files cannot be deleted underneath it.
    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{encode_internal_key, BytewiseComparator, ValueKind};
    use crate::storage::mem::MemStorage;
    use crate::table::BlockCache;

    fn icmp() -> InternalComparator {
        InternalComparator::new(Arc::new(BytewiseComparator))
    }

    fn vset() -> (Arc<MemStorage>, VersionSet) {
        let storage = MemStorage::new();
        let opts = Options::new();
        let cache = Arc::new(TableCache::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            icmp(),
            &opts,
            Arc::new(BlockCache::default()),
        ));
        let set = VersionSet::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            opts,
            icmp(),
            cache,
        );
        (storage, set)
    }

    fn ikey(ukey: &[u8]) -> Vec<u8> {
        encode_internal_key(ukey, 1, ValueKind::Value)
    }

    #[test]
    fn test_file_numbers_are_monotone() {
        let (_storage, set) = vset();
        let a = set.new_file_num();
        let b = set.new_file_num();
        assert!(b > a);
        set.mark_file_num(100);
        assert!(set.new_file_num() > 100);
        // Marking a smaller number never regresses the counter.
        set.mark_file_num(5);
        assert!(set.new_file_num() > 100);
    }

    #[test]
    fn test_log_and_apply_installs_version() {
        let (storage, set) = vset();
        let mut edit = VersionEdit::new();
        edit.add_file(0, set.new_file_num(), 100, ikey(b"a"), ikey(b"m"));
        set.log_and_apply(&mut edit).unwrap();

        let current = set.current();
        assert_eq!(current.num_files(0), 1);
        assert!(storage.exists(FileDesc::CURRENT));
        assert!(storage.exists(FileDesc::new(FileKind::Manifest, set.manifest_num())));
    }

    #[test]
    fn test_recover_rebuilds_state() {
        let (storage, set) = vset();
        set.set_last_seq(42);
        let table_num = set.new_file_num();
        let mut edit = VersionEdit::new();
        edit.set_journal_num(7);
        edit.add_file(1, table_num, 2048, ikey(b"a"), ikey(b"z"));
        set.log_and_apply(&mut edit).unwrap();
        let next_hint = set.next_file_num_hint();

        let opts = Options::new();
        let cache = Arc::new(TableCache::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            icmp(),
            &opts,
            Arc::new(BlockCache::default()),
        ));
        let recovered = VersionSet::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            opts,
            icmp(),
            cache,
        );
        recovered.recover().unwrap();

        assert_eq!(recovered.last_seq(), 42);
        assert_eq!(recovered.journal_num(), 7);
        assert!(recovered.next_file_num_hint() >= next_hint.saturating_sub(1));
        let current = recovered.current();
        assert_eq!(current.num_files(1), 1);
        assert_eq!(current.files[1][0].num, table_num);
    }

    #[test]
    fn test_recover_rejects_comparator_mismatch() {
        struct OtherComparator;
        impl crate::key::Comparator for OtherComparator {
            fn name(&self) -> &'static str {
                "test.OtherComparator"
            }
            fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
                a.cmp(b)
            }
        }

        let (storage, set) = vset();
        set.log_and_apply(&mut VersionEdit::new()).unwrap();

        let opts = Options::new().comparator(Arc::new(OtherComparator));
        let other_icmp = InternalComparator::new(opts.comparator.clone());
        let cache = Arc::new(TableCache::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            other_icmp.clone(),
            &opts,
            Arc::new(BlockCache::default()),
        ));
        let recovered = VersionSet::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            opts,
            other_icmp,
            cache,
        );
        assert!(matches!(
            recovered.recover(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pick_compaction_on_full_l0() {
        let (_storage, set) = vset();
        let mut edit = VersionEdit::new();
        for _ in 0..4 {
            edit.add_file(0, set.new_file_num(), 1024, ikey(b"a"), ikey(b"m"));
        }
        set.log_and_apply(&mut edit).unwrap();

        let compaction = set.pick_compaction().expect("L0 at trigger");
        assert_eq!(compaction.level, 0);
        assert_eq!(compaction.inputs[0].len(), 4, "all overlapping L0 tables");
        assert!(compaction.inputs[1].is_empty());
        assert!(!compaction.is_trivial_move(), "multiple inputs");
    }

    #[test]
    fn test_pick_compaction_none_when_healthy() {
        let (_storage, set) = vset();
        let mut edit = VersionEdit::new();
        edit.add_file(0, set.new_file_num(), 1024, ikey(b"a"), ikey(b"m"));
        set.log_and_apply(&mut edit).unwrap();
        assert!(set.pick_compaction().is_none());
    }

    #[test]
    fn test_trivial_move_detected() {
        let (_storage, set) = vset();
        let mut edit = VersionEdit::new();
        // Level 1 oversized with two disjoint files; level 2 empty.
        edit.add_file(
            1,
            set.new_file_num(),
            11 * 1024 * 1024,
            ikey(b"a"),
            ikey(b"c"),
        );
        edit.add_file(1, set.new_file_num(), 1024, ikey(b"x"), ikey(b"z"));
        set.log_and_apply(&mut edit).unwrap();

        let compaction = set.pick_compaction().expect("level 1 over budget");
        assert_eq!(compaction.level, 1);
        assert_eq!(compaction.inputs[0].len(), 1);
        assert!(compaction.inputs[1].is_empty());
        assert!(compaction.is_trivial_move());
    }

    #[test]
    fn test_compaction_pointer_rotates_through_level() {
        let (_storage, set) = vset();
        let mut edit = VersionEdit::new();
        edit.add_file(
            1,
            set.new_file_num(),
            11 * 1024 * 1024,
            ikey(b"a"),
            ikey(b"c"),
        );
        edit.add_file(
            1,
            set.new_file_num(),
            11 * 1024 * 1024,
            ikey(b"m"),
            ikey(b"o"),
        );
        set.log_and_apply(&mut edit).unwrap();

        let first = set.pick_compaction().expect("over budget");
        let first_file = first.inputs[0][0].num;
        // The pointer moved past the first file even though its edit never
        // committed, so the next pick starts at the second file.
        let second = set.pick_compaction().expect("still over budget");
        assert_ne!(second.inputs[0][0].num, first_file);
    }

    #[test]
    fn test_compact_range_inputs() {
        let (_storage, set) = vset();
        let mut edit = VersionEdit::new();
        edit.add_file(1, set.new_file_num(), 10, ikey(b"a"), ikey(b"c"));
        edit.add_file(1, set.new_file_num(), 10, ikey(b"e"), ikey(b"g"));
        set.log_and_apply(&mut edit).unwrap();

        let compaction = set.compact_range(1, Some(b"f"), Some(b"z")).expect("hit");
        assert_eq!(compaction.inputs[0].len(), 1);
        assert!(set.compact_range(1, Some(b"x"), Some(b"z")).is_none());
        assert!(set.compact_range(2, None, None).is_none());
    }

    #[test]
    fn test_live_files_covers_all_versions() {
        let (_storage, set) = vset();
        let first_num = set.new_file_num();
        let mut edit = VersionEdit::new();
        edit.add_file(0, first_num, 10, ikey(b"a"), ikey(b"c"));
        set.log_and_apply(&mut edit).unwrap();

        // Pin the first version as an outstanding reader would.
        let pinned = set.current();

        let second_num = set.new_file_num();
        let mut edit = VersionEdit::new();
        edit.delete_file(0, first_num);
        edit.add_file(1, second_num, 10, ikey(b"a"), ikey(b"c"));
        set.log_and_apply(&mut edit).unwrap();

        let live = set.live_files();
        assert!(live.contains(&second_num));
        assert!(
            live.contains(&first_num),
            "pinned version keeps the old file live"
        );

        drop(pinned);
        let mut edit = VersionEdit::new();
        set.log_and_apply(&mut edit).unwrap();
        let live = set.live_files();
        assert!(!live.contains(&first_num), "unpinned version released");
    }
}
