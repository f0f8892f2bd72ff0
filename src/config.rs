use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::key::{BytewiseComparator, Comparator};
use crate::snapshot::Snapshot;
use crate::table::BlockCache;

/// Number of levels in the tree, L0 included.
pub const NUM_LEVELS: usize = 7;

/// L0 table count that makes the level's compaction score reach 1.0.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// L0 table count at which each writer is delayed once by 1ms.
pub const L0_SLOWDOWN_TRIGGER: usize = 8;

/// L0 table count at which writers block until compaction catches up.
pub const L0_STOP_TRIGGER: usize = 12;

/// Target size of tables emitted by compaction.
pub const MAX_TABLE_SIZE: u64 = 2 * 1024 * 1024;

/// Compaction output is cut early once its key range overlaps this many
/// bytes of the grandparent level, bounding future compaction work.
pub const MAX_GRANDPARENT_OVERLAP: u64 = 10 * MAX_TABLE_SIZE;

/// Byte budget for a level. L0 is scored by table count instead.
pub fn max_bytes_for_level(level: usize) -> u64 {
    debug_assert!(level >= 1);
    let mut bytes = 10 * 1024 * 1024;
    for _ in 1..level {
        bytes *= 10;
    }
    bytes
}

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database if the storage holds none (default: false)
    pub create_if_missing: bool,

    /// Fail open if the database already exists (default: false)
    pub error_if_exists: bool,

    /// Treat any journal corruption during recovery as fatal instead of
    /// truncating at the first bad frame (default: false)
    pub strict: bool,

    /// Memtable size that triggers rotation to a frozen memtable (default: 4MiB)
    pub write_buffer: usize,

    /// Uncompressed payload size of table data blocks (default: 4KiB)
    pub block_size: usize,

    /// Keys between restart points inside a data block (default: 16)
    pub block_restart_interval: usize,

    /// Cap on concurrently open table files (default: 1000)
    pub max_open_files: usize,

    /// Shared block cache; one is created per database when absent
    pub block_cache: Option<Arc<BlockCache>>,

    /// Per-table key filter; tables are built without filters when absent
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// User-key order. Must match the comparator the database was created with.
    pub comparator: Arc<dyn Comparator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            strict: false,
            write_buffer: 4 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_open_files: 1000,
            block_cache: None,
            filter_policy: None,
            comparator: Arc::new(BytewiseComparator),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    pub fn error_if_exists(mut self, yes: bool) -> Self {
        self.error_if_exists = yes;
        self
    }

    pub fn strict(mut self, yes: bool) -> Self {
        self.strict = yes;
        self
    }

    pub fn write_buffer(mut self, bytes: usize) -> Self {
        self.write_buffer = bytes;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn block_restart_interval(mut self, keys: usize) -> Self {
        self.block_restart_interval = keys;
        self
    }

    pub fn max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    pub fn block_cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    pub fn comparator(mut self, cmp: Arc<dyn Comparator>) -> Self {
        self.comparator = cmp;
        self
    }
}

/// Per-write durability knobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Fsync the journal before acknowledging the write (default: false)
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync(mut self, yes: bool) -> Self {
        self.sync = yes;
        self
    }
}

/// Per-read knobs.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Skip populating the block cache with blocks read for this operation,
    /// useful for bulk scans (default: fill)
    pub dont_fill_cache: bool,

    /// Read as of this snapshot instead of the latest sequence
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    pub fn dont_fill_cache(mut self, yes: bool) -> Self {
        self.dont_fill_cache = yes;
        self
    }

    pub fn snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}
