//! Iterator plumbing for compaction and multi-source scans.
//!
//! A [`MergingIterator`] folds N sorted internal-key streams into one
//! globally ordered stream using a min-heap keyed by the internal-key
//! comparator. Equal keys cannot occur across table files, but the
//! tie-break by source index keeps the merge stable anyway.
//!
//! A [`LevelFileIterator`] concatenates the tables of one sorted,
//! disjoint level: an outer cursor over the file list and an inner table
//! iterator fetched from the table cache on demand.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::config::ReadOptions;
use crate::error::Result;
use crate::key::InternalKeyComparator;
use crate::sstable::TableIterator;
use crate::table_cache::TableCache;
use crate::version::compaction::Compaction;
use crate::version::FileMetadata;

/// A boxed sorted stream of `(internal_key, value)` entries.
pub type KvStream = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
    icmp: InternalKeyComparator,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we pop smallest keys
        // first; on equal keys the lower source index wins.
        self.icmp
            .compare(&self.key, &other.key)
            .reverse()
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sorted streams into one globally ordered stream. An error from
/// any source is surfaced in order and ends the merge: compaction must not
/// silently drop a damaged input.
pub struct MergingIterator {
    icmp: InternalKeyComparator,
    sources: Vec<KvStream>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<crate::error::Error>,
}

impl MergingIterator {
    pub fn new(icmp: InternalKeyComparator, sources: Vec<KvStream>) -> Self {
        let mut merged = Self {
            icmp,
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            pending_error: None,
        };
        for source in 0..merged.sources.len() {
            merged.advance(source);
        }
        merged
    }

    /// Pulls the next entry from one source into the heap.
    fn advance(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source,
                icmp: self.icmp.clone(),
            }),
            Some(Err(e)) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            self.heap.clear();
            return Some(Err(e));
        }
        let entry = self.heap.pop()?;
        self.advance(entry.source);
        Some(Ok((entry.key, entry.value)))
    }
}

/// Concatenates the tables of a sorted, disjoint file list.
pub struct LevelFileIterator {
    cache: Arc<TableCache>,
    options: ReadOptions,
    files: Vec<Arc<FileMetadata>>,
    next_file: usize,
    current: Option<TableIterator>,
}

impl LevelFileIterator {
    pub fn new(
        cache: Arc<TableCache>,
        options: ReadOptions,
        files: Vec<Arc<FileMetadata>>,
    ) -> Self {
        Self {
            cache,
            options,
            files,
            next_file: 0,
            current: None,
        }
    }
}

impl Iterator for LevelFileIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(entry) = iter.next() {
                    return Some(entry);
                }
            }
            let file = self.files.get(self.next_file)?;
            self.next_file += 1;
            match self
                .cache
                .new_iterator(&self.options, file.number(), file.file_size())
            {
                Ok(iter) => self.current = Some(iter),
                Err(e) => {
                    self.next_file = self.files.len();
                    self.current = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Builds the merged input stream for a compaction.
///
/// Level-0 inputs each contribute their own table iterator because their
/// ranges overlap; inputs from deeper levels are disjoint and sorted, so
/// one concatenating iterator per list suffices.
pub fn make_input_iterator(
    c: &Compaction,
    icmp: InternalKeyComparator,
    cache: Arc<TableCache>,
    options: &ReadOptions,
) -> Result<MergingIterator> {
    let mut sources: Vec<KvStream> = Vec::new();

    for which in 0..2 {
        if c.inputs(which).is_empty() {
            continue;
        }
        if which == 0 && c.level() == 0 {
            for file in c.inputs(0) {
                let iter = cache.new_iterator(options, file.number(), file.file_size())?;
                sources.push(Box::new(iter));
            }
        } else {
            sources.push(Box::new(LevelFileIterator::new(
                Arc::clone(&cache),
                options.clone(),
                c.inputs(which).to_vec(),
            )));
        }
    }

    Ok(MergingIterator::new(icmp, sources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filename::table_file_name;
    use crate::key::{parse_internal_key, BytewiseComparator, InternalKey, ValueType};
    use crate::sstable::TableBuilder;
    use crate::tmpfs::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn ikey(user_key: &[u8], seq: u64) -> Vec<u8> {
        InternalKey::new(user_key, seq, ValueType::Value).into_vec()
    }

    fn stream(entries: Vec<(Vec<u8>, Vec<u8>)>) -> KvStream {
        Box::new(entries.into_iter().map(Ok))
    }

    #[test]
    fn test_merge_interleaves_sources() {
        let a = stream(vec![
            (ikey(b"a", 1), b"1".to_vec()),
            (ikey(b"c", 1), b"3".to_vec()),
        ]);
        let b = stream(vec![
            (ikey(b"b", 1), b"2".to_vec()),
            (ikey(b"d", 1), b"4".to_vec()),
        ]);

        let merged: Vec<_> = MergingIterator::new(icmp(), vec![a, b])
            .collect::<Result<Vec<_>>>()
            .expect("merge failed");
        let user_keys: Vec<_> = merged
            .iter()
            .map(|(k, _)| parse_internal_key(k).unwrap().user_key.to_vec())
            .collect();
        assert_eq!(user_keys, vec![b"a", b"b", b"c", b"d"]);
    }

    #[test]
    fn test_merge_orders_same_user_key_by_sequence() {
        let newer = stream(vec![(ikey(b"k", 20), b"new".to_vec())]);
        let older = stream(vec![(ikey(b"k", 10), b"old".to_vec())]);

        let merged: Vec<_> = MergingIterator::new(icmp(), vec![older, newer])
            .collect::<Result<Vec<_>>>()
            .expect("merge failed");
        let sequences: Vec<_> = merged
            .iter()
            .map(|(k, _)| parse_internal_key(k).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![20, 10]);
    }

    #[test]
    fn test_merge_empty_sources() {
        let merged: Vec<_> = MergingIterator::new(icmp(), vec![])
            .collect::<Result<Vec<_>>>()
            .expect("merge failed");
        assert!(merged.is_empty());

        let merged: Vec<_> = MergingIterator::new(icmp(), vec![stream(vec![]), stream(vec![])])
            .collect::<Result<Vec<_>>>()
            .expect("merge failed");
        assert!(merged.is_empty());
    }

    #[test]
    fn test_merge_propagates_errors() {
        let good = stream(vec![(ikey(b"a", 1), b"1".to_vec())]);
        let bad: KvStream = Box::new(
            vec![
                Ok((ikey(b"b", 1), b"2".to_vec())),
                Err(crate::error::Error::Corruption("damaged".into())),
            ]
            .into_iter(),
        );

        let results: Vec<_> = MergingIterator::new(icmp(), vec![good, bad]).collect();
        assert!(results.iter().any(|r| r.is_err()));
    }

    #[test]
    fn test_level_file_iterator_concatenates() {
        let dir = TempDir::new().expect("temp dir");
        let cache = Arc::new(TableCache::new(dir.path(), icmp(), 8));

        let mut files = Vec::new();
        for (number, keys) in [(1u64, [b"a", b"b"]), (2u64, [b"c", b"d"])] {
            let mut builder =
                TableBuilder::new(&table_file_name(dir.path(), number), icmp()).expect("builder");
            for key in keys {
                builder.add(&ikey(key, 5), b"v").expect("add");
            }
            let size = builder.finish().expect("finish");
            files.push(Arc::new(FileMetadata::new(
                number,
                size,
                InternalKey::new(keys[0], 5, ValueType::Value),
                InternalKey::new(keys[1], 5, ValueType::Value),
            )));
        }

        let entries: Vec<_> =
            LevelFileIterator::new(cache, ReadOptions::default(), files)
                .collect::<Result<Vec<_>>>()
                .expect("scan failed");
        let user_keys: Vec<_> = entries
            .iter()
            .map(|(k, _)| parse_internal_key(k).unwrap().user_key.to_vec())
            .collect();
        assert_eq!(user_keys, vec![b"a", b"b", b"c", b"d"]);
    }
}
