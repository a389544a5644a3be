//! In-memory write buffer keyed by internal keys.
//!
//! The memtable absorbs writes before they are flushed as a table file. It
//! is an ordered multimap over internal keys backed by
//! `crossbeam-skiplist::SkipMap`, which gives the required concurrency
//! contract: one writer, many readers, reads never block.
//!
//! Because internal keys order newest-sequence-first within a user key, a
//! ceiling search from `(user_key, read_sequence)` lands exactly on the
//! newest record visible at that sequence.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::key::{
    append_internal_key, parse_internal_key, InternalKeyComparator, LookupKey, SequenceNumber,
    ValueType,
};

/// Outcome of a memtable point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The newest visible record is a value.
    Found(Vec<u8>),
    /// The newest visible record is a tombstone.
    Deleted,
    /// No record for this user key at or below the lookup sequence.
    NotFound,
}

/// Skiplist key: an encoded internal key ordered by the internal-key
/// comparator rather than raw bytes.
struct TableKey {
    rep: Vec<u8>,
    icmp: InternalKeyComparator,
}

impl TableKey {
    fn new(rep: Vec<u8>, icmp: InternalKeyComparator) -> Self {
        Self { rep, icmp }
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TableKey {}

impl PartialOrd for TableKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TableKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.rep, &other.rep)
    }
}

/// Per-entry bookkeeping overhead charged to the memory estimate.
const ENTRY_OVERHEAD: usize = 16;

/// In-memory sorted table of internal-key → value entries.
///
/// Shared via `Arc`; dropped when the last reader or the flush that wrote
/// it out releases its handle.
pub struct MemTable {
    icmp: InternalKeyComparator,
    table: SkipMap<TableKey, Vec<u8>>,
    approximate_size: AtomicUsize,
}

impl MemTable {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        Self {
            icmp,
            table: SkipMap::new(),
            approximate_size: AtomicUsize::new(0),
        }
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Inserts an entry keyed by `(user_key, seq, t)`. Tombstones carry an
    /// empty value.
    pub fn add(&self, seq: SequenceNumber, t: ValueType, user_key: &[u8], value: &[u8]) {
        let mut rep = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut rep, user_key, seq, t);
        self.approximate_size.fetch_add(
            rep.len() + value.len() + ENTRY_OVERHEAD,
            AtomicOrdering::Relaxed,
        );
        self.table
            .insert(TableKey::new(rep, self.icmp.clone()), value.to_vec());
    }

    /// Ceiling search for the newest record visible at the lookup's
    /// sequence.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let bound = TableKey::new(key.internal_key().to_vec(), self.icmp.clone());
        let Some(entry) = self.table.lower_bound(std::ops::Bound::Included(&bound)) else {
            return LookupResult::NotFound;
        };
        let Ok(parsed) = parse_internal_key(&entry.key().rep) else {
            // Keys are only ever written by `add`; treat damage as absent.
            return LookupResult::NotFound;
        };
        if self
            .icmp
            .user_comparator()
            .compare(parsed.user_key, key.user_key())
            != Ordering::Equal
        {
            return LookupResult::NotFound;
        }
        match parsed.value_type {
            ValueType::Value => LookupResult::Found(entry.value().clone()),
            ValueType::Deletion => LookupResult::Deleted,
        }
    }

    /// Bytes consumed by entries (estimate).
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Ordered forward iterator over `(internal_key, value)` entries.
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: Arc::clone(self),
            last_key: None,
            exhausted: false,
        }
    }
}

/// Forward iterator over a memtable snapshot-in-time of entries.
///
/// Holds an `Arc` on the memtable so the entries outlive any rotation, and
/// re-seeks past the last yielded key each step, which keeps the iterator
/// valid while a writer concurrently inserts.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    last_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl Iterator for MemTableIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let entry = match &self.last_key {
            Some(last) => {
                let bound = TableKey::new(last.clone(), self.mem.icmp.clone());
                self.mem
                    .table
                    .lower_bound(std::ops::Bound::Excluded(&bound))
            }
            None => self.mem.table.front(),
        };
        match entry {
            Some(entry) => {
                let key = entry.key().rep.clone();
                let value = entry.value().clone();
                self.last_key = Some(key.clone());
                Some((key, value))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}
