//! The compaction engine: a single background worker that flushes frozen
//! memtables to L0 (or below, when nothing overlaps), merges levels, and
//! services manual range compactions.
//!
//! The worker drains its mailbox one task at a time and re-evaluates the
//! triggers after each: a frozen memtable outranks everything, then the
//! highest size score, then the seek hint. Any failure latches into the
//! compaction error, which blocks writers until the database is closed.

use std::cmp::Ordering;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use crate::config::{Options, MAX_TABLE_SIZE, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{parse_internal_key, user_key, InternalComparator, ValueKind, MAX_SEQ};
use crate::memtable::Memtable;
use crate::storage::{FileDesc, FileKind, Storage};
use crate::table::TableBuilder;
use crate::version::edit::VersionEdit;
use crate::version::set::{Compaction, VersionSet};

use super::DbInner;

/// A request to the compaction worker.
pub(crate) enum Task {
    /// Re-evaluate triggers and run until nothing is pending.
    Work,
    /// Compact every level overlapping the user-key range.
    Manual {
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        ack: SyncSender<Result<()>>,
    },
    Close,
}

pub(crate) fn compaction_worker(inner: Arc<DbInner>, rx: Receiver<Task>) {
    loop {
        let Ok(task) = rx.recv() else { break };
        match task {
            Task::Close => break,
            Task::Work => background_work(&inner),
            Task::Manual { begin, end, ack } => {
                let result = if inner.closed.load(AtomicOrdering::Acquire) {
                    Err(Error::Closed)
                } else if let Some(err) = latched_error(&inner) {
                    Err(err)
                } else {
                    manual_compaction(&inner, begin.as_deref(), end.as_deref())
                };
                if let Err(err) = &result {
                    if *err != Error::Closed {
                        latch_error(&inner, err.clone());
                    }
                }
                let _ = ack.send(result);
            }
        }
    }
    // Anything still queued is answered, not abandoned.
    while let Ok(task) = rx.try_recv() {
        if let Task::Manual { ack, .. } = task {
            let _ = ack.send(Err(Error::Closed));
        }
    }
}

fn latched_error(inner: &DbInner) -> Option<Error> {
    inner
        .bg
        .lock()
        .ok()
        .and_then(|bg| bg.compaction_err.clone())
}

fn latch_error(inner: &DbInner, err: Error) {
    tracing::error!(error = %err, "compaction failed, latching error");
    if let Ok(mut bg) = inner.bg.lock() {
        if bg.compaction_err.is_none() {
            bg.compaction_err = Some(err);
        }
    }
    inner.bg_cv.notify_all();
}

fn background_work(inner: &DbInner) {
    if let Ok(mut bg) = inner.bg.lock() {
        bg.work_scheduled = false;
    }
    loop {
        if inner.closed.load(AtomicOrdering::Acquire) || latched_error(inner).is_some() {
            break;
        }
        let has_frozen = inner
            .mem
            .read()
            .map(|mem| mem.frozen.is_some())
            .unwrap_or(false);

        let result = if has_frozen {
            compact_memtable(inner)
        } else if let Some(compaction) = inner.versions.pick_compaction() {
            run_compaction(inner, compaction, true)
        } else {
            break;
        };

        match result {
            Ok(()) => inner.bg_cv.notify_all(),
            Err(err) => {
                latch_error(inner, err);
                break;
            }
        }
    }
    inner.bg_cv.notify_all();
}

/// Drains the frozen memtable into a table and retires its journal.
pub(crate) fn compact_memtable(inner: &DbInner) -> Result<()> {
    let Some(frozen) = inner.mem.read()?.frozen.clone() else {
        return Ok(());
    };
    let version = inner.versions.current();

    let mut edit = VersionEdit::new();
    if let Some((num, size, smallest, largest)) = build_table(
        &inner.storage,
        &inner.versions,
        &inner.icmp,
        &inner.opts,
        &frozen,
    )? {
        let level = version.pick_output_level(user_key(&smallest), user_key(&largest));
        tracing::info!(table = num, level, bytes = size, "memtable flushed");
        edit.add_file(level, num, size, smallest, largest);
    }

    // Recovery no longer needs the retired journal once this commits.
    edit.set_journal_num(inner.journal.lock()?.num);
    edit.set_prev_journal_num(0);
    inner.versions.log_and_apply(&mut edit)?;

    inner.mem.write()?.frozen = None;
    inner.bg.lock()?.has_frozen = false;
    inner.bg_cv.notify_all();

    delete_obsolete_files(inner);
    Ok(())
}

/// Builds a table holding every entry of `mem`. Returns `None` for an empty
/// memtable; cleans up the file on failure.
pub(crate) fn build_table(
    storage: &Arc<dyn Storage>,
    versions: &VersionSet,
    icmp: &InternalComparator,
    opts: &Options,
    mem: &Arc<Memtable>,
) -> Result<Option<(u64, u64, Vec<u8>, Vec<u8>)>> {
    if mem.is_empty() {
        return Ok(None);
    }
    let num = versions.new_file_num();
    let fd = FileDesc::new(FileKind::Table, num);
    let result = (|| {
        let file = storage.create(fd)?;
        let mut builder = TableBuilder::new(file, icmp.clone(), opts);
        let mut iter = mem.iter();
        iter.seek_to_first();
        while iter.valid() {
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        let smallest = builder.smallest().expect("memtable not empty").to_vec();
        let largest = builder.largest().expect("memtable not empty").to_vec();
        let size = builder.finish()?;
        Ok((num, size, smallest, largest))
    })();
    match result {
        Ok(info) => Ok(Some(info)),
        Err(err) => {
            let _ = storage.remove(fd);
            Err(err)
        }
    }
}

/// Executes one planned compaction: either a trivial move or a full merge
/// that rewrites the inputs into the next level. Manual compactions never
/// take the move shortcut; the caller asked for the data to be rewritten.
fn run_compaction(inner: &DbInner, mut c: Compaction, allow_trivial_move: bool) -> Result<()> {
    if allow_trivial_move && c.is_trivial_move() {
        let file = Arc::clone(&c.inputs[0][0]);
        c.edit.delete_file(c.level, file.num);
        c.edit.add_file(
            c.output_level(),
            file.num,
            file.size,
            file.smallest.clone(),
            file.largest.clone(),
        );
        inner.versions.log_and_apply(&mut c.edit)?;
        tracing::info!(
            table = file.num,
            from = c.level,
            to = c.output_level(),
            "table moved without rewrite"
        );
        delete_obsolete_files(inner);
        return Ok(());
    }

    // Records at or below this horizon that are shadowed by a newer record
    // for the same user key can never be observed again.
    let smallest_snapshot = inner
        .snapshots
        .smallest()
        .unwrap_or_else(|| inner.versions.last_seq());

    let icmp = inner.icmp.clone();
    let ucmp = icmp.user().clone();
    let input_files = c.num_input_files();
    let mut iter = c.input_iter()?;
    iter.seek_to_first();

    let mut outputs: Vec<(u64, u64, Vec<u8>, Vec<u8>)> = Vec::new();
    let mut current: Option<(u64, TableBuilder)> = None;
    let mut created: Vec<u64> = Vec::new();
    let mut last_user_key: Option<Vec<u8>> = None;
    // One above any real sequence marks "no newer record seen yet".
    let mut last_seq_for_key = MAX_SEQ + 1;

    let merge_result = (|| -> Result<()> {
        while iter.valid() {
            let ikey = iter.key().to_vec();
            let parsed = parse_internal_key(&ikey)?;

            let user_changed = match &last_user_key {
                Some(last) => ucmp.compare(parsed.user_key, last) != Ordering::Equal,
                None => true,
            };
            if user_changed {
                // Outputs are only cut between user keys, so every version
                // of a key lands in one table and boundary lookups stay
                // single-file.
                if current.is_some()
                    && (current.as_ref().unwrap().1.estimated_size() >= MAX_TABLE_SIZE
                        || c.should_stop_before(&ikey, &icmp))
                {
                    finish_output(&mut current, &mut outputs)?;
                }
                last_user_key = Some(parsed.user_key.to_vec());
                last_seq_for_key = MAX_SEQ + 1;
            }

            let drop = if last_seq_for_key <= smallest_snapshot {
                // A newer record for this key is itself below the horizon.
                true
            } else {
                parsed.kind == ValueKind::Deletion
                    && parsed.seq <= smallest_snapshot
                    && c.is_base_level_for_key(parsed.user_key)
            };
            last_seq_for_key = parsed.seq;

            if !drop {
                if current.is_none() {
                    let num = inner.versions.new_file_num();
                    created.push(num);
                    let file = inner.storage.create(FileDesc::new(FileKind::Table, num))?;
                    current = Some((num, TableBuilder::new(file, icmp.clone(), &inner.opts)));
                }
                let (_, builder) = current.as_mut().expect("output open");
                builder.add(&ikey, iter.value())?;
            }
            iter.next();
        }
        iter.status()?;
        finish_output(&mut current, &mut outputs)?;
        Ok(())
    })();

    if let Err(err) = merge_result {
        for num in created {
            let _ = inner.storage.remove(FileDesc::new(FileKind::Table, num));
        }
        return Err(err);
    }

    c.add_input_deletions();
    for (num, size, smallest, largest) in &outputs {
        c.edit.add_file(
            c.output_level(),
            *num,
            *size,
            smallest.clone(),
            largest.clone(),
        );
    }
    if let Err(err) = inner.versions.log_and_apply(&mut c.edit) {
        for num in created {
            let _ = inner.storage.remove(FileDesc::new(FileKind::Table, num));
        }
        return Err(err);
    }

    tracing::info!(
        level = c.level,
        inputs = input_files,
        outputs = outputs.len(),
        bytes = outputs.iter().map(|o| o.1).sum::<u64>(),
        "levels merged"
    );
    delete_obsolete_files(inner);
    Ok(())
}

fn finish_output(
    current: &mut Option<(u64, TableBuilder)>,
    outputs: &mut Vec<(u64, u64, Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    let Some((num, builder)) = current.take() else {
        return Ok(());
    };
    let smallest = builder.smallest().expect("output never empty").to_vec();
    let largest = builder.largest().expect("output never empty").to_vec();
    let size = builder.finish()?;
    outputs.push((num, size, smallest, largest));
    Ok(())
}

/// Walks every level that overlaps the range and compacts it downward,
/// flushing the memtables first so the range includes fresh writes.
fn manual_compaction(inner: &DbInner, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
    while inner.mem.read()?.frozen.is_some() {
        compact_memtable(inner)?;
    }
    for level in 0..NUM_LEVELS - 1 {
        loop {
            if inner.closed.load(AtomicOrdering::Acquire) {
                return Err(Error::Closed);
            }
            let Some(compaction) = inner.versions.compact_range(level, begin, end) else {
                break;
            };
            run_compaction(inner, compaction, false)?;
        }
    }
    Ok(())
}

/// Removes files no live version references: superseded journals and
/// manifests, unreferenced tables, and stray temp files.
pub(crate) fn delete_obsolete_files(inner: &DbInner) {
    let live = inner.versions.live_files();
    let journal_num = inner.versions.journal_num();
    let prev_journal_num = inner.versions.prev_journal_num();
    let manifest_num = inner.versions.manifest_num();

    let files = match inner.storage.list() {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(error = %err, "skipping obsolete file sweep");
            return;
        }
    };
    for fd in files {
        let keep = match fd.kind {
            FileKind::Journal => fd.num >= journal_num || fd.num == prev_journal_num,
            FileKind::Manifest => fd.num >= manifest_num,
            FileKind::Table => live.contains(&fd.num),
            FileKind::Temp => false,
            FileKind::Current | FileKind::Lock => true,
        };
        if keep {
            continue;
        }
        if fd.kind == FileKind::Table {
            inner.versions.table_cache().evict(fd.num);
        }
        match inner.storage.remove(fd) {
            Ok(()) => tracing::debug!(?fd, "removed obsolete file"),
            Err(err) => tracing::warn!(?fd, error = %err, "failed to remove obsolete file"),
        }
    }
}
