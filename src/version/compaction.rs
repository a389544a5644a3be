//! A planned compaction: the chosen level, its input files from two
//! adjacent levels, and the grandparent overlap state used to bound output
//! file fan-out.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{Config, NUM_LEVELS};
use crate::key::{InternalKey, InternalKeyComparator};
use crate::version::edit::VersionEdit;
use crate::version::{total_file_size, FileMetadata, Version};

pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    grandparent_overlap_limit: u64,
    icmp: InternalKeyComparator,

    pub(crate) input_version: Option<Arc<Version>>,
    pub(crate) edit: VersionEdit,

    /// Inputs from `level` and `level + 1`.
    pub(crate) inputs: [Vec<Arc<FileMetadata>>; 2],

    /// Files at `level + 2` overlapping the compaction's range.
    pub(crate) grandparents: Vec<Arc<FileMetadata>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    /// Per-level cursors for `is_base_level_for_key`; valid because both
    /// compaction output keys and level file lists advance monotonically.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub fn new(config: &Config, icmp: InternalKeyComparator, level: usize) -> Self {
        Self {
            level,
            max_output_file_size: config.max_file_size,
            grandparent_overlap_limit: config.max_grandparent_overlap_bytes(),
            icmp,
            input_version: None,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// The level being compacted; outputs land at `level + 1`.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetadata> {
        &self.inputs[which][i]
    }

    pub fn inputs(&self, which: usize) -> &[Arc<FileMetadata>] {
        &self.inputs[which]
    }

    pub fn input_version(&self) -> Option<&Arc<Version>> {
        self.input_version.as_ref()
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    pub fn take_edit(&mut self) -> VersionEdit {
        std::mem::take(&mut self.edit)
    }

    /// True when the compaction can be performed by reassigning a single
    /// input file to the next level instead of rewriting it: one input,
    /// nothing overlapping at level+1, and little enough grandparent
    /// overlap that a future compaction stays cheap.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.grandparent_overlap_limit
    }

    /// Records every input file as deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.remove_file(self.level + which, file.number());
            }
        }
    }

    /// True when no level deeper than the output level contains `user_key`.
    /// Tombstones for such keys can be dropped by the compaction.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let Some(version) = &self.input_version else {
            return false;
        };
        let ucmp = self.icmp.user_comparator();
        for level in self.level + 2..NUM_LEVELS {
            let files = version.files(level);
            while let Some(file) = files.get(self.level_ptrs[level]) {
                if ucmp.compare(user_key, file.largest().user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, file.smallest().user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                // Keys only grow during output; the cursor never rewinds.
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Consulted for every output key: true when the current output file
    /// should be cut before `internal_key` because it already overlaps too
    /// many grandparent bytes.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while let Some(grandparent) = self.grandparents.get(self.grandparent_index) {
            if self
                .icmp
                .compare(internal_key, grandparent.largest().as_slice())
                != Ordering::Greater
            {
                break;
            }
            if self.seen_key {
                self.overlapped_bytes += grandparent.file_size();
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.grandparent_overlap_limit {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// Smallest and largest internal keys across `inputs[0]`.
    pub(crate) fn base_range(&self) -> (InternalKey, InternalKey) {
        range_of(&self.icmp, self.inputs[0].iter())
    }

    /// Smallest and largest internal keys across both input lists.
    pub(crate) fn total_range(&self) -> (InternalKey, InternalKey) {
        range_of(&self.icmp, self.inputs[0].iter().chain(self.inputs[1].iter()))
    }
}

pub(crate) fn range_of<'a>(
    icmp: &InternalKeyComparator,
    files: impl Iterator<Item = &'a Arc<FileMetadata>>,
) -> (InternalKey, InternalKey) {
    let mut smallest: Option<&InternalKey> = None;
    let mut largest: Option<&InternalKey> = None;
    for file in files {
        if smallest.is_none_or(|s| icmp.compare(file.smallest().as_slice(), s.as_slice()) == Ordering::Less)
        {
            smallest = Some(file.smallest());
        }
        if largest.is_none_or(|l| icmp.compare(file.largest().as_slice(), l.as_slice()) == Ordering::Greater)
        {
            largest = Some(file.largest());
        }
    }
    (
        smallest.cloned().unwrap_or_default(),
        largest.cloned().unwrap_or_default(),
    )
}
