//! Snapshots: pinned sequence numbers providing consistent read views.
//!
//! The registry tracks every outstanding snapshot sequence. Compaction asks
//! for the smallest live one to decide which shadowed versions of a user key
//! are safe to drop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Registry of outstanding snapshot sequences. Duplicate sequences are
/// refcounted: two snapshots taken with no intervening write share an entry.
#[derive(Default)]
pub(crate) struct SnapshotList {
    seqs: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotList {
    /// Registers `seq` and hands back the caller's handle.
    pub fn acquire(self: &Arc<Self>, seq: u64) -> Snapshot {
        *self
            .seqs
            .lock()
            .expect("snapshot registry poisoned")
            .entry(seq)
            .or_insert(0) += 1;
        Snapshot {
            inner: Arc::new(SnapshotHandle {
                seq,
                list: Arc::downgrade(self),
                released: AtomicBool::new(false),
            }),
        }
    }

    fn release(&self, seq: u64) {
        let mut seqs = self.seqs.lock().expect("snapshot registry poisoned");
        if let Some(count) = seqs.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                seqs.remove(&seq);
            }
        }
    }

    /// The oldest outstanding sequence, or `None` when no snapshot is live.
    pub fn smallest(&self) -> Option<u64> {
        self.seqs
            .lock()
            .expect("snapshot registry poisoned")
            .first_key_value()
            .map(|(seq, _)| *seq)
    }
}

struct SnapshotHandle {
    seq: u64,
    list: Weak<SnapshotList>,
    released: AtomicBool,
}

impl SnapshotHandle {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            if let Some(list) = self.list.upgrade() {
                list.release(self.seq);
            }
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// A consistent read view at a fixed sequence. Clones share one registry
/// entry; the entry is dropped on explicit [`release`](Snapshot::release) or
/// when the last clone goes away.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotHandle>,
}

impl Snapshot {
    /// The pinned sequence number.
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// Unpins the sequence. Reads through this snapshot afterwards fail
    /// with `SnapshotReleased`.
    pub fn release(&self) {
        self.inner.release();
    }

    pub(crate) fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("seq", &self.inner.seq)
            .field("released", &self.is_released())
            .finish()
    }
}
