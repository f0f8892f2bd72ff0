//! The write path: a group-committing queue of writers, the journal worker,
//! and the back-pressure loop that keeps the memtable and L0 in bounds.
//!
//! Writers enqueue themselves; the queue head is the leader. The leader
//! makes room in the memtable, folds follower batches into its own up to a
//! size cap, commits the merged batch (journal, then memtable, then the
//! published sequence), hands every follower the group's outcome, and
//! promotes the next head. A batch of N records owns sequence numbers
//! `last_seq+1 ..= last_seq+N`, and `last_seq` only advances after the
//! records are readable in the memtable.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::batch::Batch;
use crate::config::{WriteOptions, L0_SLOWDOWN_TRIGGER, L0_STOP_TRIGGER};
use crate::error::{Error, Result};
use crate::journal;
use crate::memtable::Memtable;
use crate::storage::{FileDesc, FileKind};

use super::{DbInner, JournalState};

/// Merged batches stop growing at 1 MiB, or sooner for small leaders so a
/// tiny write is not held hostage to a huge group.
const MAX_GROUP_BYTES: usize = 1 << 20;
const SMALL_LEADER_BYTES: usize = 128 * 1024;

/// A request to the journal worker.
pub(crate) enum JournalMsg {
    Append {
        data: Vec<u8>,
        sync: bool,
        ack: SyncSender<Result<()>>,
    },
    Close,
}

/// Runs on the dedicated journal thread: appends merged batches and acks
/// each one. Requests queued before `Close` are always answered.
pub(crate) fn journal_worker(inner: Arc<DbInner>, rx: Receiver<JournalMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            JournalMsg::Append { data, sync, ack } => {
                let result = append_record(&inner, &data, sync);
                let _ = ack.send(result);
            }
            JournalMsg::Close => break,
        }
    }
}

fn append_record(inner: &DbInner, data: &[u8], sync: bool) -> Result<()> {
    let mut journal = inner.journal.lock()?;
    journal.writer.append(data)?;
    if sync {
        journal.writer.sync()?;
    }
    Ok(())
}

struct ReqState {
    result: Option<Result<()>>,
    leader: bool,
}

/// One writer waiting in the commit queue.
pub(crate) struct WriteRequest {
    /// Taken by the group leader; `None` marks a pure rotation request.
    batch: Mutex<Option<Batch>>,
    sync: bool,
    force_rotate: bool,
    state: Mutex<ReqState>,
    cv: Condvar,
}

impl WriteRequest {
    fn new(batch: Option<Batch>, sync: bool, force_rotate: bool) -> Self {
        Self {
            batch: Mutex::new(batch),
            sync,
            force_rotate,
            state: Mutex::new(ReqState {
                result: None,
                leader: false,
            }),
            cv: Condvar::new(),
        }
    }
}

impl DbInner {
    /// Commits `batch` with group commit. `None` forces a memtable rotation
    /// instead of writing anything, used by manual compaction.
    pub(crate) fn write(&self, batch: Option<Batch>, opts: &WriteOptions) -> Result<()> {
        let force_rotate = batch.is_none();
        let req = Arc::new(WriteRequest::new(batch, opts.sync, force_rotate));

        let is_leader = {
            let mut queue = self.write_queue.lock()?;
            queue.push_back(Arc::clone(&req));
            queue.len() == 1
        };

        if !is_leader {
            let mut state = req.state.lock()?;
            while state.result.is_none() && !state.leader {
                state = req.cv.wait(state)?;
            }
            if let Some(result) = state.result.take() {
                return result;
            }
            // Promoted: fall through and lead the next group.
        }
        self.write_as_leader(req)
    }

    fn write_as_leader(&self, leader: Arc<WriteRequest>) -> Result<()> {
        let mut result = self.make_room_for_write(leader.force_rotate);

        let mut group = vec![Arc::clone(&leader)];
        if result.is_ok() {
            let (members, merged, sync) = self.build_group(&leader)?;
            group = members;
            if let Some(mut merged) = merged {
                result = self.commit_group(&mut merged, sync);
            }
        }

        // Hand out the outcome and promote the next queue head.
        let next_leader = {
            let mut queue = self.write_queue.lock()?;
            for member in &group {
                let popped = queue.pop_front().expect("group members head the queue");
                debug_assert!(Arc::ptr_eq(&popped, member));
            }
            queue.front().cloned()
        };
        for member in group.iter().filter(|m| !Arc::ptr_eq(m, &leader)) {
            let mut state = member.state.lock()?;
            state.result = Some(result.clone());
            member.cv.notify_one();
        }
        if let Some(next) = next_leader {
            let mut state = next.state.lock()?;
            state.leader = true;
            next.cv.notify_one();
        }
        result
    }

    /// Folds queued followers into the leader's batch. Sync writes never
    /// ride in a group led by a non-sync write, and rotation requests
    /// always commit alone.
    fn build_group(
        &self,
        leader: &Arc<WriteRequest>,
    ) -> Result<(Vec<Arc<WriteRequest>>, Option<Batch>, bool)> {
        let queue = self.write_queue.lock()?;
        let mut members = vec![Arc::clone(leader)];
        let mut merged = leader.batch.lock()?.take();
        let sync = leader.sync;

        if let Some(lead_batch) = merged.as_mut() {
            let cap = if lead_batch.byte_size() <= SMALL_LEADER_BYTES {
                lead_batch.byte_size() + SMALL_LEADER_BYTES
            } else {
                MAX_GROUP_BYTES
            };
            for follower in queue.iter().skip(1) {
                if follower.force_rotate || (follower.sync && !sync) {
                    break;
                }
                let mut follower_batch = follower.batch.lock()?;
                let size = follower_batch.as_ref().map_or(0, |b| b.byte_size());
                if lead_batch.byte_size() + size > cap {
                    break;
                }
                if let Some(batch) = follower_batch.take() {
                    lead_batch.append_batch(&batch);
                }
                members.push(Arc::clone(follower));
            }
        }
        Ok((members, merged, sync))
    }

    fn commit_group(&self, merged: &mut Batch, sync: bool) -> Result<()> {
        if merged.is_empty() {
            return Ok(());
        }
        let base_seq = self.versions.last_seq() + 1;
        let count = merged.len() as u64;
        merged.set_seq(base_seq);

        // Journal first; a batch is never in the memtable without being in
        // the journal.
        let (ack_tx, ack_rx) = std::sync::mpsc::sync_channel(1);
        let sent = self.journal_tx.send(JournalMsg::Append {
            data: merged.encode().to_vec(),
            sync,
            ack: ack_tx,
        });
        if sent.is_err() {
            return Err(Error::Closed);
        }
        match ack_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::Closed),
        }

        let active = Arc::clone(&self.mem.read()?.active);
        merged.replay_into(&active)?;
        self.versions.set_last_seq(base_seq + count - 1);
        Ok(())
    }

    /// Blocks the leader until the active memtable can take another batch:
    /// delay once near the L0 slowdown trigger, wait out an unflushed
    /// frozen memtable or a full L0, then rotate when the buffer is full.
    fn make_room_for_write(&self, force: bool) -> Result<()> {
        let mut force = force;
        let mut allow_delay = !force;
        loop {
            if self.closed.load(AtomicOrdering::Acquire) {
                return Err(Error::Closed);
            }
            if let Some(err) = &self.bg.lock()?.compaction_err {
                return Err(err.clone());
            }

            if allow_delay && self.versions.current().num_files(0) >= L0_SLOWDOWN_TRIGGER {
                // One millisecond of back-pressure per write, handed to the
                // compaction thread rather than to this writer's latency.
                std::thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                continue;
            }

            let (mem_size, has_frozen) = {
                let mem = self.mem.read()?;
                (mem.active.approximate_size(), mem.frozen.is_some())
            };
            if !force && mem_size <= self.opts.write_buffer {
                return Ok(());
            }

            if has_frozen {
                tracing::debug!("waiting for memtable flush");
                let mut bg = self.bg.lock()?;
                while bg.has_frozen
                    && bg.compaction_err.is_none()
                    && !self.closed.load(AtomicOrdering::Acquire)
                {
                    bg = self.bg_cv.wait(bg)?;
                }
                continue;
            }

            if self.versions.current().num_files(0) >= L0_STOP_TRIGGER {
                tracing::warn!("level 0 at stop trigger, stalling writes");
                let mut bg = self.bg.lock()?;
                while self.versions.current().num_files(0) >= L0_STOP_TRIGGER
                    && bg.compaction_err.is_none()
                    && !self.closed.load(AtomicOrdering::Acquire)
                {
                    bg = self.bg_cv.wait(bg)?;
                }
                continue;
            }

            if force && mem_size == 0 {
                // Nothing to rotate out.
                return Ok(());
            }
            self.rotate_memtable()?;
            force = false;
        }
    }

    /// Freezes the active memtable behind a fresh journal and memtable.
    /// Only the write-slot holder gets here, so exactly one rotation can be
    /// in flight.
    fn rotate_memtable(&self) -> Result<()> {
        let new_num = self.versions.new_file_num();
        let file = self
            .storage
            .create(FileDesc::new(FileKind::Journal, new_num))?;

        let old_num = {
            let mut journal = self.journal.lock()?;
            let old_num = journal.num;
            *journal = JournalState {
                writer: journal::Writer::new(file),
                num: new_num,
            };
            old_num
        };
        {
            let mut mem = self.mem.write()?;
            let frozen = std::mem::replace(
                &mut mem.active,
                Arc::new(Memtable::new(self.icmp.clone())),
            );
            mem.frozen = Some(frozen);
        }
        self.bg.lock()?.has_frozen = true;
        tracing::debug!(old_journal = old_num, new_journal = new_num, "memtable rotated");
        self.maybe_schedule_compaction();
        Ok(())
    }
}
