//! Applies version edits to a base version.
//!
//! The builder accumulates per-level added and deleted file sets from one
//! or more edits, then materializes a new version whose level lists merge
//! the base and the additions in smallest-key order. This is the single
//! point where level invariants are enforced: any overlap between
//! neighboring files above level 0 is rejected as corruption.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;

use crate::config::{Config, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::key::InternalKeyComparator;
use crate::version::edit::VersionEdit;
use crate::version::{FileMetadata, Version};

struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<Arc<FileMetadata>>,
}

pub struct VersionBuilder {
    base: Arc<Version>,
    levels: Vec<LevelState>,
}

impl VersionBuilder {
    pub fn new(base: Arc<Version>) -> Self {
        let levels = (0..NUM_LEVELS)
            .map(|_| LevelState {
                deleted: HashSet::new(),
                added: Vec::new(),
            })
            .collect();
        Self { base, levels }
    }

    /// Accumulates one edit's file changes. Counter fields and compact
    /// pointers are the version set's concern, not the builder's.
    pub fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted.insert(*number);
        }
        for file in &edit.new_files {
            let meta = Arc::new(FileMetadata::new(
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            ));
            // An addition cancels an earlier deletion of the same number.
            self.levels[file.level].deleted.remove(&file.number);
            self.levels[file.level].added.push(meta);
        }
    }

    /// Materializes the accumulated state into a new version.
    pub fn save_to(&mut self, icmp: &InternalKeyComparator, config: Arc<Config>) -> Result<Version> {
        let mut version = Version::new(icmp.clone(), config);

        for (level, state) in self.levels.iter_mut().enumerate() {
            state
                .added
                .sort_by(|a, b| by_smallest_key(icmp, a, b));

            let merged: Vec<Arc<FileMetadata>> = self.base.files(level)
                .iter()
                .cloned()
                .merge_by(state.added.iter().cloned(), |a, b| {
                    by_smallest_key(icmp, a, b) != Ordering::Greater
                })
                .filter(|f| !state.deleted.contains(&f.number()))
                .collect();

            if level > 0 {
                for pair in merged.windows(2) {
                    if icmp.compare(pair[0].largest().as_slice(), pair[1].smallest().as_slice())
                        != Ordering::Less
                    {
                        return Err(Error::Corruption(format!(
                            "files {} and {} overlap in level {level}",
                            pair[0].number(),
                            pair[1].number()
                        )));
                    }
                }
            }
            version.files[level] = merged;
        }

        Ok(version)
    }
}

/// Order by smallest internal key, ties broken by file number ascending.
fn by_smallest_key(
    icmp: &InternalKeyComparator,
    a: &Arc<FileMetadata>,
    b: &Arc<FileMetadata>,
) -> Ordering {
    icmp.compare(a.smallest().as_slice(), b.smallest().as_slice())
        .then_with(|| a.number().cmp(&b.number()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, InternalKey, ValueType};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    fn empty_base() -> Arc<Version> {
        Arc::new(Version::new(icmp(), config()))
    }

    fn add_file_edit(edit: &mut VersionEdit, level: usize, number: u64, keys: (&[u8], &[u8])) {
        edit.add_file(
            level,
            number,
            1024,
            InternalKey::new(keys.0, 100, ValueType::Value),
            InternalKey::new(keys.1, 50, ValueType::Value),
        );
    }

    fn level_numbers(v: &Version, level: usize) -> Vec<u64> {
        v.files(level).iter().map(|f| f.number()).collect()
    }

    #[test]
    fn test_add_files_sorted_by_smallest() {
        let mut edit = VersionEdit::new();
        add_file_edit(&mut edit, 1, 2, (b"m", b"o"));
        add_file_edit(&mut edit, 1, 1, (b"a", b"c"));

        let mut builder = VersionBuilder::new(empty_base());
        builder.apply(&edit);
        let v = builder.save_to(&icmp(), config()).expect("save failed");

        assert_eq!(level_numbers(&v, 1), vec![1, 2]);
    }

    #[test]
    fn test_merge_with_base_preserves_order() {
        // Base holds files 1 (a-c) and 3 (m-o); the edit wedges 2 (e-g)
        // between them.
        let mut base_edit = VersionEdit::new();
        add_file_edit(&mut base_edit, 1, 1, (b"a", b"c"));
        add_file_edit(&mut base_edit, 1, 3, (b"m", b"o"));
        let mut builder = VersionBuilder::new(empty_base());
        builder.apply(&base_edit);
        let base = Arc::new(builder.save_to(&icmp(), config()).expect("save failed"));

        let mut edit = VersionEdit::new();
        add_file_edit(&mut edit, 1, 2, (b"e", b"g"));
        let mut builder = VersionBuilder::new(base);
        builder.apply(&edit);
        let v = builder.save_to(&icmp(), config()).expect("save failed");

        assert_eq!(level_numbers(&v, 1), vec![1, 2, 3]);
    }

    #[test]
    fn test_delete_removes_file() {
        let mut base_edit = VersionEdit::new();
        add_file_edit(&mut base_edit, 1, 1, (b"a", b"c"));
        add_file_edit(&mut base_edit, 1, 2, (b"e", b"g"));
        let mut builder = VersionBuilder::new(empty_base());
        builder.apply(&base_edit);
        let base = Arc::new(builder.save_to(&icmp(), config()).expect("save failed"));

        let mut edit = VersionEdit::new();
        edit.remove_file(1, 1);
        let mut builder = VersionBuilder::new(base);
        builder.apply(&edit);
        let v = builder.save_to(&icmp(), config()).expect("save failed");

        assert_eq!(level_numbers(&v, 1), vec![2]);
    }

    #[test]
    fn test_edit_then_inverse_restores_file_set() {
        let mut base_edit = VersionEdit::new();
        add_file_edit(&mut base_edit, 1, 1, (b"a", b"c"));
        add_file_edit(&mut base_edit, 2, 2, (b"a", b"z"));
        let mut builder = VersionBuilder::new(empty_base());
        builder.apply(&base_edit);
        let base = Arc::new(builder.save_to(&icmp(), config()).expect("save failed"));

        // Forward: replace file 1 with file 3 at level 1.
        let mut forward = VersionEdit::new();
        forward.remove_file(1, 1);
        add_file_edit(&mut forward, 1, 3, (b"e", b"g"));

        let mut builder = VersionBuilder::new(Arc::clone(&base));
        builder.apply(&forward);
        let middle = Arc::new(builder.save_to(&icmp(), config()).expect("save failed"));
        assert_eq!(level_numbers(&middle, 1), vec![3]);

        // Inverse: swap added and deleted.
        let mut inverse = VersionEdit::new();
        inverse.remove_file(1, 3);
        add_file_edit(&mut inverse, 1, 1, (b"a", b"c"));

        let mut builder = VersionBuilder::new(middle);
        builder.apply(&inverse);
        let restored = builder.save_to(&icmp(), config()).expect("save failed");

        for level in 0..NUM_LEVELS {
            assert_eq!(
                level_numbers(&restored, level),
                level_numbers(&base, level),
                "level {level}"
            );
        }
    }

    #[test]
    fn test_add_cancels_pending_delete() {
        let mut builder = VersionBuilder::new(empty_base());
        let mut delete = VersionEdit::new();
        delete.remove_file(1, 7);
        builder.apply(&delete);
        let mut add = VersionEdit::new();
        add_file_edit(&mut add, 1, 7, (b"a", b"c"));
        builder.apply(&add);

        let v = builder.save_to(&icmp(), config()).expect("save failed");
        assert_eq!(level_numbers(&v, 1), vec![7]);
    }

    #[test]
    fn test_overlap_above_level_zero_is_corruption() {
        let mut edit = VersionEdit::new();
        add_file_edit(&mut edit, 1, 1, (b"a", b"m"));
        add_file_edit(&mut edit, 1, 2, (b"k", b"z"));

        let mut builder = VersionBuilder::new(empty_base());
        builder.apply(&edit);
        assert!(matches!(
            builder.save_to(&icmp(), config()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_overlap_allowed_in_level_zero() {
        let mut edit = VersionEdit::new();
        add_file_edit(&mut edit, 0, 1, (b"a", b"m"));
        add_file_edit(&mut edit, 0, 2, (b"k", b"z"));

        let mut builder = VersionBuilder::new(empty_base());
        builder.apply(&edit);
        let v = builder.save_to(&icmp(), config()).expect("save failed");
        assert_eq!(v.num_files(0), 2);
    }
}
