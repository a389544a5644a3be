//! Bounded map from file number to open table handle.
//!
//! Point reads and compaction both go through here so a hot table's index
//! stays parsed and its descriptor stays open. Thread safety comes from
//! sharded locking; entries are `Arc`s, so an in-flight iterator keeps its
//! table alive across eviction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::config::ReadOptions;
use crate::error::{Error, Result};
use crate::filename::{alt_table_file_name, table_file_name};
use crate::key::InternalKeyComparator;
use crate::sstable::{Table, TableIterator};

const SHARD_COUNT: usize = 16;

pub struct TableCache {
    dir: PathBuf,
    icmp: InternalKeyComparator,
    shards: Vec<Mutex<Cache<u64, Arc<Table>>>>,
}

impl TableCache {
    pub fn new(dir: &Path, icmp: InternalKeyComparator, capacity: usize) -> Self {
        let per_shard = (capacity / SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(Cache::new(per_shard)))
            .collect();
        Self {
            dir: dir.to_path_buf(),
            icmp,
            shards,
        }
    }

    /// Returns the open table for `file_number`, opening and caching it on
    /// a miss. The committed `file_size` is validated on open.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        let mut shard = self.shard(file_number).lock()?;
        if let Some(table) = shard.get(&file_number) {
            return Ok(table);
        }

        let path = table_file_name(&self.dir, file_number);
        let table = match Table::open(&path, file_size, self.icmp.clone()) {
            Ok(table) => table,
            Err(Error::Io(_)) => {
                // Fall back to the legacy table name.
                let alt = alt_table_file_name(&self.dir, file_number);
                Table::open(&alt, file_size, self.icmp.clone())?
            }
            Err(e) => return Err(e),
        };
        let table = Arc::new(table);
        shard.insert(file_number, Arc::clone(&table));
        Ok(table)
    }

    /// Point lookup in one table: invokes `visitor` with the first entry
    /// whose internal key is >= `internal_key`. Returns whether it ran.
    pub fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
        visitor: impl FnMut(&[u8], &[u8]),
    ) -> Result<bool> {
        let table = self.find_table(file_number, file_size)?;
        table.get(internal_key, options.verify_checksums, visitor)
    }

    /// Forward iterator over one table's entries.
    pub fn new_iterator(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TableIterator> {
        let table = self.find_table(file_number, file_size)?;
        Ok(table.iter(options.verify_checksums))
    }

    /// Drops the cached handle for a deleted table file.
    pub fn evict(&self, file_number: u64) {
        if let Ok(mut shard) = self.shard(file_number).lock() {
            shard.remove(&file_number);
        }
    }

    fn shard(&self, file_number: u64) -> &Mutex<Cache<u64, Arc<Table>>> {
        &self.shards[file_number as usize % SHARD_COUNT]
    }
}
