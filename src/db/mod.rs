//! The database handle: open/recover, reads, writes, snapshots, iterators,
//! manual compaction, properties, and shutdown.
//!
//! # Shape
//!
//! ```text
//!        writers ──► write queue ──► journal worker ──► active memtable
//!                                      (dedicated          │ rotate
//!                                       thread)            ▼
//!        readers ◄── memtables + current version      frozen memtable
//!                           ▲                              │ flush
//!                           │ install                      ▼
//!                    compaction worker ◄──────────── level 0 tables
//!                    (dedicated thread, merges L(n) → L(n+1))
//! ```
//!
//! Two background threads do the long-running work and talk to the
//! foreground through mailboxes and ack channels. All shared state lives in
//! [`DbInner`], which both workers hold via `Arc`.

mod compaction;
mod write;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::SyncSender;
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::batch::Batch;
use crate::config::{Options, ReadOptions, WriteOptions, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::iterator::{DbIterator, InternalIterator, IterPins, MergingIter};
use crate::journal;
use crate::key::{encode_internal_key, parse_internal_key, InternalComparator, KIND_SEEK, MAX_SEQ};
use crate::memtable::Memtable;
use crate::snapshot::{Snapshot, SnapshotList};
use crate::storage::{FileDesc, FileKind, Storage, WritableFile};
use crate::table::cache::TableCache;
use crate::table::BlockCache;
use crate::version::edit::VersionEdit;
use crate::version::set::VersionSet;
use crate::version::Lookup;

use compaction::Task;
use write::{JournalMsg, WriteRequest};

pub(crate) struct MemState {
    pub(crate) active: Arc<Memtable>,
    pub(crate) frozen: Option<Arc<Memtable>>,
}

pub(crate) struct JournalState {
    pub(crate) writer: journal::Writer<Box<dyn WritableFile>>,
    pub(crate) num: u64,
}

#[derive(Default)]
pub(crate) struct BgState {
    /// First background failure; latched until close and surfaced to
    /// writers and to `close()`.
    pub(crate) compaction_err: Option<Error>,
    /// Mirrors `mem.frozen.is_some()` so writers can wait on the condvar
    /// without touching the memtable lock.
    pub(crate) has_frozen: bool,
    pub(crate) work_scheduled: bool,
}

pub(crate) struct DbInner {
    pub(crate) opts: Options,
    pub(crate) icmp: InternalComparator,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) versions: VersionSet,
    pub(crate) mem: RwLock<MemState>,
    pub(crate) journal: Mutex<JournalState>,
    pub(crate) snapshots: Arc<SnapshotList>,
    pub(crate) write_queue: Mutex<VecDeque<Arc<WriteRequest>>>,
    pub(crate) journal_tx: SyncSender<JournalMsg>,
    pub(crate) compaction_tx: SyncSender<Task>,
    pub(crate) bg: Mutex<BgState>,
    pub(crate) bg_cv: Condvar,
    pub(crate) closed: AtomicBool,
}

impl DbInner {
    /// Wakes the compaction worker unless it already has a wake-up queued
    /// or is dead in the error state.
    pub(crate) fn maybe_schedule_compaction(&self) {
        if self.closed.load(AtomicOrdering::Acquire) {
            return;
        }
        {
            let Ok(mut bg) = self.bg.lock() else { return };
            if bg.work_scheduled || bg.compaction_err.is_some() {
                return;
            }
            bg.work_scheduled = true;
        }
        let _ = self.compaction_tx.send(Task::Work);
    }
}

/// An embedded ordered key/value store.
///
/// All methods are safe to call concurrently. The handle must be closed
/// with [`DB::close`]; dropping it performs a best-effort close.
pub struct DB {
    inner: Arc<DbInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DB {
    /// Opens a database on `storage`, creating it when `create_if_missing`
    /// is set, and replays the journal tail.
    pub fn open(storage: Arc<dyn Storage>, opts: Options) -> Result<DB> {
        Self::open_inner(storage, opts, false)
    }

    /// Opens a database whose manifest is missing or damaged by scanning
    /// every table on storage into level 0 and rebuilding a fresh manifest.
    pub fn recover(storage: Arc<dyn Storage>, opts: Options) -> Result<DB> {
        Self::open_inner(storage, opts, true)
    }

    fn open_inner(storage: Arc<dyn Storage>, opts: Options, rebuild: bool) -> Result<DB> {
        storage.lock()?;
        match Self::open_locked(Arc::clone(&storage), opts, rebuild) {
            Ok(db) => Ok(db),
            Err(err) => {
                let _ = storage.unlock();
                Err(err)
            }
        }
    }

    fn open_locked(storage: Arc<dyn Storage>, opts: Options, rebuild: bool) -> Result<DB> {
        let icmp = InternalComparator::new(opts.comparator.clone());
        let block_cache = opts
            .block_cache
            .clone()
            .unwrap_or_else(|| Arc::new(BlockCache::default()));
        let table_cache = Arc::new(TableCache::new(
            Arc::clone(&storage),
            icmp.clone(),
            &opts,
            block_cache,
        ));
        let versions = VersionSet::new(
            Arc::clone(&storage),
            opts.clone(),
            icmp.clone(),
            Arc::clone(&table_cache),
        );

        let mut edit = VersionEdit::new();
        if rebuild {
            if opts.strict {
                return Err(Error::InvalidArgument(
                    "cannot rebuild a manifest in strict mode".into(),
                ));
            }
            rebuild_from_tables(&storage, &versions, &table_cache, &mut edit)?;
        } else if storage.exists(FileDesc::CURRENT) {
            if opts.error_if_exists {
                return Err(Error::InvalidArgument("database already exists".into()));
            }
            versions.recover()?;
        } else if !opts.create_if_missing {
            return Err(Error::InvalidArgument(
                "database missing and create_if_missing is off".into(),
            ));
        }

        let max_seq = recover_journals(&storage, &versions, &icmp, &opts, &mut edit)?;
        if max_seq > versions.last_seq() {
            versions.set_last_seq(max_seq);
        }

        // Start a fresh journal and commit everything recovery produced.
        let journal_num = versions.new_file_num();
        let journal_file = storage.create(FileDesc::new(FileKind::Journal, journal_num))?;
        edit.set_journal_num(journal_num);
        edit.set_prev_journal_num(0);
        versions.log_and_apply(&mut edit)?;

        let (journal_tx, journal_rx) = mpsc::sync_channel(4);
        let (compaction_tx, compaction_rx) = mpsc::sync_channel(16);
        let inner = Arc::new(DbInner {
            icmp: icmp.clone(),
            storage,
            versions,
            mem: RwLock::new(MemState {
                active: Arc::new(Memtable::new(icmp)),
                frozen: None,
            }),
            journal: Mutex::new(JournalState {
                writer: journal::Writer::new(journal_file),
                num: journal_num,
            }),
            snapshots: Arc::new(SnapshotList::default()),
            write_queue: Mutex::new(VecDeque::new()),
            journal_tx,
            compaction_tx,
            bg: Mutex::new(BgState::default()),
            bg_cv: Condvar::new(),
            closed: AtomicBool::new(false),
            opts,
        });

        compaction::delete_obsolete_files(&inner);

        let mut threads = Vec::with_capacity(2);
        {
            let inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("silt-journal".into())
                    .spawn(move || write::journal_worker(inner, journal_rx))
                    .map_err(|e| Error::Io(e.to_string()))?,
            );
        }
        {
            let inner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("silt-compaction".into())
                    .spawn(move || compaction::compaction_worker(inner, compaction_rx))
                    .map_err(|e| Error::Io(e.to_string()))?,
            );
        }

        let db = DB {
            inner,
            threads: Mutex::new(threads),
        };
        // Recovery may have left L0 over its trigger.
        db.inner.maybe_schedule_compaction();
        Ok(db)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(AtomicOrdering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn read_seq(&self, opts: &ReadOptions) -> Result<u64> {
        match &opts.snapshot {
            Some(snapshot) => {
                if snapshot.is_released() {
                    return Err(Error::SnapshotReleased);
                }
                Ok(snapshot.seq())
            }
            None => Ok(self.inner.versions.last_seq()),
        }
    }

    /// Stores `key = value`.
    pub fn put(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> Result<()> {
        let mut batch = Batch::new();
        batch.put(key, value);
        self.write(batch, opts)
    }

    /// Removes `key` by writing a tombstone.
    pub fn delete(&self, key: &[u8], opts: &WriteOptions) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.write(batch, opts)
    }

    /// Applies every mutation in `batch` atomically.
    pub fn write(&self, batch: Batch, opts: &WriteOptions) -> Result<()> {
        self.check_open()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.write(Some(batch), opts)
    }

    /// The value for `key`, or [`Error::NotFound`].
    pub fn get(&self, key: &[u8], opts: &ReadOptions) -> Result<Vec<u8>> {
        self.check_open()?;
        let seq = self.read_seq(opts)?;

        let (active, frozen) = {
            let mem = self.inner.mem.read()?;
            (Arc::clone(&mem.active), mem.frozen.clone())
        };
        if let Some(found) = active.get(key, seq) {
            return found.ok_or(Error::NotFound);
        }
        if let Some(frozen) = frozen {
            if let Some(found) = frozen.get(key, seq) {
                return found.ok_or(Error::NotFound);
            }
        }

        let ikey = encode_internal_key(key, seq, KIND_SEEK);
        let version = self.inner.versions.current();
        let (lookup, schedule) = version.get(&ikey, !opts.dont_fill_cache)?;
        if schedule {
            self.inner.maybe_schedule_compaction();
        }
        match lookup {
            Lookup::Value(value) => Ok(value),
            Lookup::Deleted | Lookup::Miss => Err(Error::NotFound),
        }
    }

    /// An ordered iterator over the database as of now, or as of the
    /// snapshot in `opts`.
    pub fn iterator(&self, opts: &ReadOptions) -> Result<DbIterator> {
        self.check_open()?;
        let seq = self.read_seq(opts)?;

        let (active, frozen) = {
            let mem = self.inner.mem.read()?;
            (Arc::clone(&mem.active), mem.frozen.clone())
        };
        let version = self.inner.versions.current();

        let mut children: Vec<Box<dyn InternalIterator>> = vec![Box::new(active.iter())];
        if let Some(frozen) = &frozen {
            children.push(Box::new(frozen.iter()));
        }
        version.add_iters(!opts.dont_fill_cache, &mut children)?;

        let mut pins: IterPins = vec![Box::new(Arc::clone(&version)), Box::new(active)];
        if let Some(frozen) = frozen {
            pins.push(Box::new(frozen));
        }
        if let Some(snapshot) = &opts.snapshot {
            pins.push(Box::new(snapshot.clone()));
        }

        Ok(DbIterator::new(
            self.inner.icmp.clone(),
            MergingIter::new(self.inner.icmp.clone(), children),
            seq,
            pins,
        ))
    }

    /// Pins the current sequence for consistent reads until released.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.check_open()?;
        Ok(self
            .inner
            .snapshots
            .acquire(self.inner.versions.last_seq()))
    }

    /// Approximate on-disk byte sizes for the given `[start, limit)` user
    /// key ranges. Memtable contents are not counted.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Result<Vec<u64>> {
        self.check_open()?;
        let version = self.inner.versions.current();
        let mut sizes = Vec::with_capacity(ranges.len());
        for (start, limit) in ranges {
            let start_key = encode_internal_key(start, MAX_SEQ, KIND_SEEK);
            let limit_key = encode_internal_key(limit, MAX_SEQ, KIND_SEEK);
            let start_off = version.approximate_offset(&start_key)?;
            let limit_off = version.approximate_offset(&limit_key)?;
            sizes.push(limit_off.saturating_sub(start_off));
        }
        Ok(sizes)
    }

    /// Flushes the memtable and compacts every level overlapping the range;
    /// `None` bounds cover the whole keyspace. Shadowed versions older than
    /// every live snapshot are discarded.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.check_open()?;
        // Rotate the active memtable out so the range includes fresh writes.
        self.inner.write(None, &WriteOptions::default())?;

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.inner
            .compaction_tx
            .send(Task::Manual {
                begin: begin.map(|b| b.to_vec()),
                end: end.map(|e| e.to_vec()),
                ack: ack_tx,
            })
            .map_err(|_| Error::Closed)?;
        match ack_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Introspection properties:
    /// `silt.num-files-at-level<N>`, `silt.stats`, `silt.sstables`.
    pub fn property(&self, name: &str) -> Result<String> {
        self.check_open()?;
        let Some(prop) = name.strip_prefix("silt.") else {
            return Err(Error::InvalidArgument(format!("unknown property: {name}")));
        };
        let version = self.inner.versions.current();

        if let Some(suffix) = prop.strip_prefix("num-files-at-level") {
            let level: usize = suffix.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad level in property: {name}"))
            })?;
            if level >= NUM_LEVELS {
                return Err(Error::InvalidArgument(format!(
                    "level {level} out of range in property: {name}"
                )));
            }
            return Ok(version.num_files(level).to_string());
        }

        match prop {
            "stats" => {
                let mut out = String::from("Level  Tables  Size(MB)\n");
                for level in 0..NUM_LEVELS {
                    let tables = version.num_files(level);
                    if tables == 0 {
                        continue;
                    }
                    let mb = version.level_bytes(level) as f64 / (1024.0 * 1024.0);
                    out.push_str(&format!("{level:>5}  {tables:>6}  {mb:>8.3}\n"));
                }
                Ok(out)
            }
            "sstables" => {
                let mut out = String::new();
                for level in 0..NUM_LEVELS {
                    if version.num_files(level) == 0 {
                        continue;
                    }
                    out.push_str(&format!("--- level {level} ---\n"));
                    for file in &version.files[level] {
                        out.push_str(&format!(
                            "{}:{}[{:?} .. {:?}]\n",
                            file.num,
                            file.size,
                            String::from_utf8_lossy(crate::key::user_key(&file.smallest)),
                            String::from_utf8_lossy(crate::key::user_key(&file.largest)),
                        ));
                    }
                }
                Ok(out)
            }
            _ => Err(Error::InvalidArgument(format!("unknown property: {name}"))),
        }
    }

    /// Shuts the database down: refuses new calls, stops both workers,
    /// flushes the journal, and releases the storage lock. Returns the
    /// first latched compaction error, if any.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, AtomicOrdering::AcqRel) {
            return Err(Error::Closed);
        }
        // Writers parked in back-pressure waits observe the flag and bail.
        self.inner.bg_cv.notify_all();

        let _ = self.inner.compaction_tx.send(Task::Close);
        let _ = self.inner.journal_tx.send(JournalMsg::Close);
        if let Ok(mut threads) = self.threads.lock() {
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }

        // Clean shutdown makes even non-sync writes durable.
        if let Ok(mut journal) = self.inner.journal.lock() {
            if let Err(err) = journal.writer.sync() {
                tracing::warn!(error = %err, "journal sync on close failed");
            }
        }

        let latched = self
            .inner
            .bg
            .lock()
            .ok()
            .and_then(|bg| bg.compaction_err.clone());
        self.inner.storage.unlock()?;
        match latched {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if !self.inner.closed.load(AtomicOrdering::Acquire) {
            tracing::warn!("database dropped without close");
            let _ = self.close();
        }
    }
}

/// Replays every journal at or after the manifest's journal number into
/// fresh memtables, spilling oversized ones to L0 tables as it goes.
/// Returns the largest sequence seen.
fn recover_journals(
    storage: &Arc<dyn Storage>,
    versions: &VersionSet,
    icmp: &InternalComparator,
    opts: &Options,
    edit: &mut VersionEdit,
) -> Result<u64> {
    let min_journal = versions.journal_num();
    let prev_journal = versions.prev_journal_num();
    let mut journals = storage.list_kind(FileKind::Journal)?;
    journals.retain(|fd| fd.num >= min_journal || fd.num == prev_journal);

    let mut max_seq = 0u64;
    let mut mem: Option<Arc<Memtable>> = None;
    for fd in journals {
        versions.mark_file_num(fd.num);
        tracing::info!(journal = fd.num, "replaying journal");
        let file = storage.open_sequential(fd)?;
        let mut reader = journal::Reader::new(file, Box::new(journal::TracingSink), opts.strict);
        while let Some(record) = reader.next()? {
            let batch = Batch::decode(&record)?;
            let target = mem.get_or_insert_with(|| Arc::new(Memtable::new(icmp.clone())));
            batch.replay_into(target)?;
            max_seq = max_seq.max(batch.seq() + batch.len() as u64 - 1);

            if target.approximate_size() > opts.write_buffer {
                // Bound recovery memory the same way the write path does.
                if let Some((num, size, smallest, largest)) =
                    compaction::build_table(storage, versions, icmp, opts, target)?
                {
                    edit.add_file(0, num, size, smallest, largest);
                }
                mem = None;
            }
        }
    }
    if let Some(target) = mem {
        if let Some((num, size, smallest, largest)) =
            compaction::build_table(storage, versions, icmp, opts, &target)?
        {
            edit.add_file(0, num, size, smallest, largest);
        }
    }
    Ok(max_seq)
}

/// Manifest-less repair: adopts every complete table on storage into L0 and
/// seeds the sequence counter from the data itself.
fn rebuild_from_tables(
    storage: &Arc<dyn Storage>,
    versions: &VersionSet,
    table_cache: &Arc<TableCache>,
    edit: &mut VersionEdit,
) -> Result<()> {
    for fd in storage.list()? {
        if !matches!(fd.kind, FileKind::Current | FileKind::Lock) {
            versions.mark_file_num(fd.num);
        }
    }

    let mut max_seq = 0u64;
    for fd in storage.list_kind(FileKind::Table)? {
        let size = storage.size(fd)?;
        let table = match table_cache.table(fd.num, size) {
            Ok(table) => table,
            Err(err) => {
                tracing::warn!(table = fd.num, error = %err, "skipping unreadable table");
                continue;
            }
        };
        let mut iter = table.iter(false);
        iter.seek_to_first();
        if !iter.valid() {
            continue;
        }
        let smallest = iter.key().to_vec();
        let mut largest = smallest.clone();
        while iter.valid() {
            largest.clear();
            largest.extend_from_slice(iter.key());
            if let Ok(parsed) = parse_internal_key(iter.key()) {
                max_seq = max_seq.max(parsed.seq);
            }
            iter.next();
        }
        iter.status()?;
        tracing::info!(table = fd.num, bytes = size, "table adopted into level 0");
        edit.add_file(0, fd.num, size, smallest, largest);
    }

    if max_seq > versions.last_seq() {
        versions.set_last_seq(max_seq);
    }
    Ok(())
}
