//! Silt is an embedded, ordered key/value storage engine organized as a
//! log-structured merge-tree.
//!
//! Writes land in a journal-backed memtable and migrate through immutable
//! sorted tables arranged in levels; background compaction keeps the levels
//! bounded while point reads, ordered scans and consistent snapshots stay
//! available throughout. Storage is pluggable: the filesystem backend is the
//! production path, the in-memory backend serves tests and ephemeral use.
//!
//! ```no_run
//! use std::sync::Arc;
//! use silt::{Options, ReadOptions, WriteOptions, DB};
//!
//! # fn main() -> silt::Result<()> {
//! let storage = Arc::new(silt::storage::fs::FsStorage::open("./db")?);
//! let db = DB::open(storage, Options::new().create_if_missing(true))?;
//!
//! db.put(b"hello", b"world", &WriteOptions::default())?;
//! assert_eq!(db.get(b"hello", &ReadOptions::default())?, b"world");
//!
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod journal;
pub mod key;
pub mod memtable;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod version;

pub use batch::Batch;
pub use config::{Options, ReadOptions, WriteOptions};
pub use db::DB;
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use iterator::DbIterator;
pub use key::{BytewiseComparator, Comparator};
pub use snapshot::Snapshot;
pub use storage::{FileDesc, FileKind, Storage};
