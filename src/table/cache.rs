//! Cache of open table readers, bounding file descriptors at
//! `max_open_files` minus a reserve for the journal, manifest and lock.

use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::config::Options;
use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::key::InternalComparator;
use crate::storage::{FileDesc, FileKind, Storage};

use super::{BlockCache, Table};

/// File descriptors kept back for non-table files.
const RESERVED_FDS: usize = 10;

pub struct TableCache {
    storage: Arc<dyn Storage>,
    icmp: InternalComparator,
    policy: Option<Arc<dyn FilterPolicy>>,
    block_cache: Arc<BlockCache>,
    cache: Mutex<Cache<u64, Arc<Table>>>,
}

impl TableCache {
    pub fn new(
        storage: Arc<dyn Storage>,
        icmp: InternalComparator,
        opts: &Options,
        block_cache: Arc<BlockCache>,
    ) -> Self {
        let capacity = opts.max_open_files.saturating_sub(RESERVED_FDS).max(1);
        Self {
            storage,
            icmp,
            policy: opts.filter_policy.clone(),
            block_cache,
            cache: Mutex::new(Cache::new(capacity, None)),
        }
    }

    /// An open reader for table `file_num`, reusing a cached handle when one
    /// exists. Dropping the last `Arc` closes the underlying file.
    pub fn table(&self, file_num: u64, size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lock()?.get(&file_num) {
            return Ok(table);
        }
        let fd = FileDesc::new(FileKind::Table, file_num);
        let file = self.storage.open_random(fd)?;
        let table = Arc::new(Table::open(
            file_num,
            file,
            size,
            self.icmp.clone(),
            self.policy.clone(),
            Arc::clone(&self.block_cache),
        )?);
        self.cache.lock()?.insert(file_num, Arc::clone(&table));
        Ok(table)
    }

    /// Forgets the reader for a deleted table so its descriptor closes as
    /// soon as in-flight readers drop their handles.
    pub fn evict(&self, file_num: u64) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&file_num);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{encode_internal_key, BytewiseComparator, ValueKind};
    use crate::storage::mem::MemStorage;
    use crate::table::TableBuilder;

    fn icmp() -> InternalComparator {
        InternalComparator::new(Arc::new(BytewiseComparator))
    }

    fn write_table(storage: &Arc<MemStorage>, num: u64) -> u64 {
        let fd = FileDesc::new(FileKind::Table, num);
        let file = storage.create(fd).unwrap();
        let mut builder = TableBuilder::new(file, icmp(), &Options::new());
        builder
            .add(
                &encode_internal_key(b"k", 1, ValueKind::Value),
                format!("table-{num}").as_bytes(),
            )
            .unwrap();
        builder.finish().unwrap()
    }

    fn table_cache(storage: &Arc<MemStorage>) -> TableCache {
        TableCache::new(
            Arc::clone(storage) as Arc<dyn Storage>,
            icmp(),
            &Options::new(),
            Arc::new(BlockCache::default()),
        )
    }

    #[test]
    fn test_open_is_cached() {
        let storage = MemStorage::new();
        let size = write_table(&storage, 1);
        let cache = table_cache(&storage);

        let first = cache.table(1, size).unwrap();
        let second = cache.table(1, size).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_evict_reopens() {
        let storage = MemStorage::new();
        let size = write_table(&storage, 1);
        let cache = table_cache(&storage);

        let first = cache.table(1, size).unwrap();
        cache.evict(1);
        let second = cache.table(1, size).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_missing_table_errors() {
        let storage = MemStorage::new();
        let cache = table_cache(&storage);
        assert!(cache.table(404, 1234).is_err());
    }
}
