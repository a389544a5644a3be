//! The mutable container of versions.
//!
//! The version set owns the current version, the monotonic file-number and
//! sequence counters, the per-level compaction cursor, and the descriptor
//! log. Every change to the file set flows through [`VersionSet::log_and_apply`]:
//! the edit is made durable in the descriptor before the new version is
//! installed, so a crash at any point recovers to a consistent prior
//! version.
//!
//! `log_and_apply` takes the caller's state mutex and releases it around
//! the descriptor-log write and its durability sync, re-acquiring it to
//! install the candidate. That window is the only suspension point in a
//! version-set operation: reads and writes proceed while the descriptor
//! flushes, and descriptor writes themselves serialize on the writer's
//! own lock. Callers serialize whole version transitions (the engine
//! allows one flush or compaction at a time).

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::{Config, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filename::{
    descriptor_file_name, parse_file_name, read_current_file, set_current_file, FileType,
};
use crate::key::{InternalKey, InternalKeyComparator, SequenceNumber};
use crate::table_cache::TableCache;
use crate::version::builder::VersionBuilder;
use crate::version::compaction::{range_of, Compaction};
use crate::version::edit::VersionEdit;
use crate::version::log::{LogReader, LogWriter};
use crate::version::{total_file_size, FileMetadata, Version};

pub struct VersionSet {
    dir: PathBuf,
    config: Arc<Config>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    /// Write-ahead log file in use; 0 when none.
    log_number: u64,
    /// Log of the memtable being flushed; 0 when none.
    prev_log_number: u64,

    /// The open descriptor writer. Kept behind its own lock so the state
    /// mutex can be dropped while a record is written and synced;
    /// descriptor writes serialize here.
    descriptor_log: Arc<Mutex<Option<LogWriter>>>,

    current: Arc<Version>,
    /// Every version ever installed, pruned opportunistically. Older
    /// versions stay reachable here while an iterator, snapshot read, or
    /// in-flight compaction holds them.
    live: Vec<Weak<Version>>,

    /// Per-level cursor: the largest key of the most recent compaction at
    /// that level. The next compaction at the level starts after it.
    compact_pointer: Vec<Vec<u8>>,
}

impl VersionSet {
    pub fn new(dir: PathBuf, config: Arc<Config>, table_cache: Arc<TableCache>) -> Self {
        let icmp = InternalKeyComparator::new(config.comparator.clone());
        let current = Arc::new(Version::new(icmp.clone(), Arc::clone(&config)));
        let live = vec![Arc::downgrade(&current)];
        Self {
            dir,
            config,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: Arc::new(Mutex::new(None)),
            current,
            live,
            compact_pointer: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    /// Allocates a fresh file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Returns an allocated-but-unused number to the counter when possible.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.level_bytes(level)
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score() >= 1.0 || self.current.file_to_compact().is_some()
    }

    /// File numbers referenced by any live version. Obsolete-file deletion
    /// must spare everything in this set.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.live.retain(|v| v.strong_count() > 0);
        let mut live = HashSet::new();
        for weak in &self.live {
            if let Some(version) = weak.upgrade() {
                for level in 0..NUM_LEVELS {
                    for file in version.files(level) {
                        live.insert(file.number());
                    }
                }
            }
        }
        live
    }

    /// Creates the initial descriptor and CURRENT pointer for an empty
    /// database directory.
    pub fn init_new_db(&mut self) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let path = descriptor_file_name(&self.dir, 1);
        let mut log = LogWriter::create(&path)?;
        let result = log
            .add_record(&edit.encode())
            .and_then(|()| log.sync())
            .and_then(|()| set_current_file(&self.dir, 1));
        if let Err(e) = result {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(())
    }

    /// The engine's version-transition primitive.
    ///
    /// Under the caller's mutex (`caller_mutex` with `guard` held, with
    /// `versions` projecting the guarded state to this version set): fills
    /// the edit's counter fields, builds and scores the candidate version,
    /// and rotates to a fresh descriptor seeded with a snapshot when none
    /// is open. The guard is then **released** for the descriptor-log
    /// write, its durability sync, and the CURRENT update, and re-acquired
    /// to install the candidate as current. On failure the version set is
    /// left in its pre-call state and a half-created descriptor is
    /// deleted.
    ///
    /// Callers must serialize version transitions; concurrent readers and
    /// writers are unaffected by the unlocked window.
    pub fn log_and_apply<'a, T>(
        caller_mutex: &'a Mutex<T>,
        mut guard: MutexGuard<'a, T>,
        versions: fn(&mut T) -> &mut VersionSet,
        mut edit: VersionEdit,
    ) -> (MutexGuard<'a, T>, Result<()>) {
        let set = versions(&mut *guard);

        match edit.log_number {
            Some(n) => debug_assert!(n >= set.log_number && n < set.next_file_number),
            None => edit.set_log_number(set.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(set.prev_log_number);
        }
        edit.set_next_file_number(set.next_file_number);
        edit.set_last_sequence(set.last_sequence);

        let mut builder = VersionBuilder::new(set.current());
        builder.apply(&edit);
        let mut version = match builder.save_to(&set.icmp, Arc::clone(&set.config)) {
            Ok(version) => version,
            Err(e) => return (guard, Err(e)),
        };
        set.finalize(&mut version);
        for (level, key) in &edit.compact_pointers {
            set.compact_pointer[*level] = key.as_slice().to_vec();
        }

        // Rotate to a fresh descriptor when none is open, seeding it with
        // a snapshot of the current state as its first record.
        let mut created_manifest: Option<PathBuf> = None;
        {
            let mut descriptor = set
                .descriptor_log
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if descriptor.is_none() {
                let path = descriptor_file_name(&set.dir, set.manifest_file_number);
                let created = LogWriter::create(&path).and_then(|mut log| {
                    set.write_snapshot(&mut log)?;
                    Ok(log)
                });
                match created {
                    Ok(log) => {
                        *descriptor = Some(log);
                        created_manifest = Some(path);
                    }
                    Err(e) => {
                        drop(descriptor);
                        let _ = fs::remove_file(&path);
                        return (guard, Err(e));
                    }
                }
            }
        }

        let record = edit.encode();
        let log_number = edit.log_number.expect("log number filled");
        let prev_log_number = edit.prev_log_number.expect("prev log number filled");
        let manifest_number = set.manifest_file_number;
        let dir = set.dir.clone();
        let descriptor = Arc::clone(&set.descriptor_log);

        // Durability point: the caller's mutex is released around the
        // record write and sync so reads and writes proceed meanwhile.
        // The descriptor's own lock keeps its writes serialized.
        drop(guard);
        let mut write_result = {
            let mut descriptor = descriptor.lock().unwrap_or_else(|e| e.into_inner());
            let log = descriptor.as_mut().expect("descriptor log open");
            log.add_record(&record).and_then(|()| log.sync())
        };
        if write_result.is_ok() && created_manifest.is_some() {
            write_result = set_current_file(&dir, manifest_number);
        }

        // Re-acquire and install, or roll back.
        let mut guard = caller_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let set = versions(&mut *guard);
        let result = match write_result {
            Ok(()) => {
                set.log_number = log_number;
                set.prev_log_number = prev_log_number;
                set.install_version(version);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "descriptor write failed, discarding candidate version");
                if let Some(path) = created_manifest {
                    *set
                        .descriptor_log
                        .lock()
                        .unwrap_or_else(|p| p.into_inner()) = None;
                    let _ = fs::remove_file(&path);
                }
                Err(e)
            }
        };
        (guard, result)
    }

    /// Rebuilds the current version by replaying the descriptor named by
    /// CURRENT. Returns whether the caller must rotate to a new descriptor
    /// (i.e. the existing one was not reused).
    pub fn recover(&mut self) -> Result<bool> {
        let current_name = read_current_file(&self.dir)?;
        let descriptor_path = self.dir.join(&current_name);

        let base = Arc::new(Version::new(self.icmp.clone(), Arc::clone(&self.config)));
        let mut builder = VersionBuilder::new(base);

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        for record in LogReader::open(&descriptor_path)? {
            let edit = VersionEdit::decode(&record?)?;
            if let Some(name) = &edit.comparator {
                let expected = self.icmp.user_comparator().name().to_string();
                if *name != expected {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: descriptor uses {name}, options use {expected}"
                    )));
                }
            }
            builder.apply(&edit);
            for (level, key) in &edit.compact_pointers {
                self.compact_pointer[*level] = key.as_slice().to_vec();
            }
            if let Some(n) = edit.log_number {
                log_number = Some(n);
            }
            if let Some(n) = edit.prev_log_number {
                prev_log_number = Some(n);
            }
            if let Some(n) = edit.next_file_number {
                next_file_number = Some(n);
            }
            if let Some(n) = edit.last_sequence {
                last_sequence = Some(n);
            }
        }

        let next_file = next_file_number
            .ok_or_else(|| Error::Corruption("no next-file-number entry in descriptor".into()))?;
        let log_number = log_number
            .ok_or_else(|| Error::Corruption("no log-number entry in descriptor".into()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::Corruption("no last-sequence entry in descriptor".into()))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.next_file_number = next_file;
        self.manifest_file_number = self.new_file_number();
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        let mut version = builder.save_to(&self.icmp, Arc::clone(&self.config))?;
        self.finalize(&mut version);
        self.install_version(version);

        let reused = self.maybe_reuse_descriptor(&descriptor_path, &current_name);
        tracing::info!(
            descriptor = %current_name,
            reused,
            last_sequence,
            next_file_number = self.next_file_number,
            "recovered version set"
        );
        Ok(!reused)
    }

    /// Precomputes the candidate's next-compaction hints. Level 0 scores by
    /// file count since overlapping files inflate read amplification;
    /// deeper levels score by byte budget.
    pub fn finalize(&self, version: &mut Version) {
        let mut best_level = 0;
        let mut best_score = -1.0f64;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                version.num_files(0) as f64 / self.config.l0_compaction_trigger as f64
            } else {
                version.level_bytes(level) as f64 / self.config.max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }
        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    /// Emits the current state as a single edit: comparator name, compact
    /// pointers, and every live file.
    fn write_snapshot(&self, log: &mut LogWriter) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if !pointer.is_empty() {
                edit.set_compact_pointer(level, InternalKey::decode_from(pointer));
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                edit.add_file(
                    level,
                    file.number(),
                    file.file_size(),
                    file.smallest().clone(),
                    file.largest().clone(),
                );
            }
        }
        log.add_record(&edit.encode())
    }

    /// Picks the next compaction, preferring size-driven (score >= 1) over
    /// seek-driven candidates. Returns `None` when the tree is balanced.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let size_compaction = current.compaction_score() >= 1.0;
        let seek_compaction = current.file_to_compact();

        let mut c = if size_compaction {
            let level = current.compaction_level();
            debug_assert!(level + 1 < NUM_LEVELS);
            let mut c = Compaction::new(&self.config, self.icmp.clone(), level);
            // First file past the level's compact pointer, wrapping to the
            // start of the key space when the pointer is at the end.
            for file in current.files(level) {
                if self.compact_pointer[level].is_empty()
                    || self
                        .icmp
                        .compare(file.largest().as_slice(), &self.compact_pointer[level])
                        == Ordering::Greater
                {
                    c.inputs[0].push(Arc::clone(file));
                    break;
                }
            }
            if c.inputs[0].is_empty() {
                if let Some(file) = current.files(level).first() {
                    c.inputs[0].push(Arc::clone(file));
                }
            }
            c
        } else if let Some((file, level)) = seek_compaction {
            let mut c = Compaction::new(&self.config, self.icmp.clone(), level);
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        c.input_version = Some(Arc::clone(&current));

        if c.level() == 0 {
            // Level-0 files overlap: widen to every file touching the
            // chosen range so no older overlapping record is left behind.
            let (smallest, largest) = c.base_range();
            c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Builds a compaction for an explicit key range at `level`. For
    /// levels above 0 the input set is capped so one run produces a
    /// bounded amount of work.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        if level > 0 {
            let limit = self.config.max_file_size_for_level(level);
            let mut total = 0;
            for (i, file) in inputs.iter().enumerate() {
                total += file.file_size();
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(&self.config, self.icmp.clone(), level);
        c.input_version = Some(current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Completes a compaction's input selection: computes the level+1
    /// overlap, tries to grow the level-N set without growing level+1,
    /// records the grandparent overlap set, and advances the level's
    /// compact pointer.
    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = Arc::clone(c.input_version.as_ref().expect("input version set"));
        let level = c.level();

        self.add_boundary_inputs(current.files(level), &mut c.inputs[0]);
        let (smallest, mut largest) = c.base_range();

        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        self.add_boundary_inputs(current.files(level + 1), &mut c.inputs[1]);
        let (mut all_start, mut all_limit) = c.total_range();

        // Try to grow inputs[0] while the level+1 pick stays identical and
        // the total stays under the expansion budget.
        if !c.inputs[1].is_empty() {
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            self.add_boundary_inputs(current.files(level), &mut expanded0);
            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < self.config.expanded_compaction_byte_size_limit()
            {
                let (new_start, new_limit) = range_of(&self.icmp, expanded0.iter());
                let mut expanded1 =
                    current.get_overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                self.add_boundary_inputs(current.files(level + 1), &mut expanded1);
                if expanded1.len() == c.inputs[1].len() {
                    tracing::info!(
                        level,
                        from_files = c.inputs[0].len(),
                        to_files = expanded0.len(),
                        from_bytes = inputs0_size,
                        to_bytes = expanded0_size,
                        "expanding compaction inputs"
                    );
                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let total = c.total_range();
                    all_start = total.0;
                    all_limit = total.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Advance the cursor immediately rather than waiting for the edit
        // to apply: if the compaction fails we try a different range next
        // time.
        c.edit_mut().set_compact_pointer(level, largest.clone());
        self.compact_pointer[level] = largest.as_slice().to_vec();
    }

    /// Pulls in files whose smallest key shares a user key with the set's
    /// largest key, so every record of a user key compacts together. An
    /// older record left at the shallower level would otherwise shadow the
    /// newer one after the move.
    fn add_boundary_inputs(
        &self,
        level_files: &[Arc<FileMetadata>],
        compact_files: &mut Vec<Arc<FileMetadata>>,
    ) {
        if compact_files.is_empty() {
            return;
        }
        let mut largest_key = {
            let mut largest = Arc::clone(&compact_files[0]);
            for file in compact_files.iter().skip(1) {
                if self
                    .icmp
                    .compare(file.largest().as_slice(), largest.largest().as_slice())
                    == Ordering::Greater
                {
                    largest = Arc::clone(file);
                }
            }
            largest.largest().clone()
        };

        while let Some(boundary) = self.find_smallest_boundary_file(level_files, &largest_key) {
            largest_key = boundary.largest().clone();
            compact_files.push(boundary);
        }
    }

    /// The file in `level_files` with the smallest key that is greater
    /// than `largest_key` but shares its user key.
    fn find_smallest_boundary_file(
        &self,
        level_files: &[Arc<FileMetadata>],
        largest_key: &InternalKey,
    ) -> Option<Arc<FileMetadata>> {
        let ucmp = self.icmp.user_comparator();
        let mut smallest: Option<&Arc<FileMetadata>> = None;
        for file in level_files {
            if self
                .icmp
                .compare(file.smallest().as_slice(), largest_key.as_slice())
                == Ordering::Greater
                && ucmp.compare(file.smallest().user_key(), largest_key.user_key())
                    == Ordering::Equal
            {
                match smallest {
                    Some(s)
                        if self
                            .icmp
                            .compare(file.smallest().as_slice(), s.smallest().as_slice())
                            != Ordering::Less => {}
                    _ => smallest = Some(file),
                }
            }
        }
        smallest.cloned()
    }

    fn maybe_reuse_descriptor(&mut self, path: &std::path::Path, name: &str) -> bool {
        if !self.config.reuse_manifest {
            return false;
        }
        let Some((FileType::Descriptor, number)) = parse_file_name(name) else {
            return false;
        };
        let Ok(metadata) = fs::metadata(path) else {
            return false;
        };
        if metadata.len() >= self.config.max_file_size {
            return false;
        }
        match LogWriter::open_append(path) {
            Ok(log) => {
                tracing::info!(descriptor = name, "reusing descriptor");
                *self
                    .descriptor_log
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(log);
                self.manifest_file_number = number;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not reopen descriptor, rotating");
                false
            }
        }
    }

    fn install_version(&mut self, version: Version) {
        self.live.retain(|v| v.strong_count() > 0);
        let version = Arc::new(version);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }
}
