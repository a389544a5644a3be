use std::sync::Arc;
use std::time::Duration;

use crate::key::{BytewiseComparator, Comparator};
use crate::snapshot::Snapshot;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Configuration for the storage engine.
///
/// Groups the engine-construction parameters; defaults match the classic
/// leveled-compaction constants.
#[derive(Clone)]
pub struct Config {
    /// User-key ordering (default: lexicographic byte order).
    pub comparator: Arc<dyn Comparator>,

    /// Create the database directory if it does not exist (default: false).
    pub create_if_missing: bool,

    /// Memtable size that triggers rotation to an immutable memtable
    /// (default: 4MB).
    pub write_buffer_size: usize,

    /// Target size for sstables produced by flush and compaction
    /// (default: 2MB).
    pub max_file_size: u64,

    /// Number of level-0 files that triggers a size compaction (default: 4).
    pub l0_compaction_trigger: usize,

    /// Number of level-0 files at which writes are slowed (default: 8).
    pub l0_slowdown_writes_trigger: usize,

    /// Number of level-0 files at which writes stall (default: 12).
    pub l0_stop_writes_trigger: usize,

    /// Deepest level a freshly flushed memtable may be pushed to
    /// (default: 2).
    pub max_mem_compact_level: usize,

    /// Number of open table handles kept by the table cache (default: 990).
    pub table_cache_capacity: usize,

    /// Reuse an existing descriptor file on recovery instead of rotating to
    /// a fresh one (default: false).
    pub reuse_manifest: bool,

    /// Verify checksums aggressively on every read (default: false).
    pub paranoid_checks: bool,

    /// Scheduler configuration for background maintenance.
    pub scheduler: SchedulerConfig,
}

/// Per-read options.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Verify block checksums on every read touched by this operation.
    pub verify_checksums: bool,

    /// Read at this pinned sequence instead of the latest.
    pub snapshot: Option<Arc<Snapshot>>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for memtable flush opportunities (default: 1s).
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s).
    pub compaction_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            create_if_missing: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_file_size: 2 * 1024 * 1024,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            max_mem_compact_level: 2,
            table_cache_capacity: 990,
            reuse_manifest: false,
            paranoid_checks: false,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Set the user-key comparator.
    pub fn comparator(mut self, cmp: Arc<dyn Comparator>) -> Self {
        self.comparator = cmp;
        self
    }

    /// Create the database directory if missing.
    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    /// Set the memtable rotation threshold.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the target sstable size.
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Set the level-0 compaction trigger.
    pub fn l0_compaction_trigger(mut self, files: usize) -> Self {
        self.l0_compaction_trigger = files;
        self
    }

    /// Enable descriptor reuse on recovery.
    pub fn reuse_manifest(mut self, yes: bool) -> Self {
        self.reuse_manifest = yes;
        self
    }

    /// Enable paranoid checksum verification.
    pub fn paranoid_checks(mut self, yes: bool) -> Self {
        self.paranoid_checks = yes;
        self
    }

    /// Configure scheduler settings.
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Maximum bytes of grandparent (level+2) overlap a compaction output
    /// may carry before cutting a new file.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Ceiling on the total size of expanded level-N inputs when trying to
    /// grow a compaction without adding level-N+1 files.
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size
    }

    /// Byte budget for a level; level 1 holds 10MB, each deeper level ten
    /// times more. Level 0 is file-count limited, not byte limited.
    pub fn max_bytes_for_level(&self, mut level: usize) -> f64 {
        let mut result = 10.0 * 1048576.0;
        while level > 1 {
            result *= 10.0;
            level -= 1;
        }
        result
    }

    /// Largest single input file allowed for a manual compaction at `level`.
    pub fn max_file_size_for_level(&self, _level: usize) -> u64 {
        self.max_file_size
    }
}

impl SchedulerConfig {
    /// Set the flush check interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the compaction check interval.
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.max_file_size, 2 * 1024 * 1024);
        assert_eq!(config.l0_compaction_trigger, 4);
        assert_eq!(config.max_mem_compact_level, 2);
        assert!(!config.reuse_manifest);
        assert!(!config.paranoid_checks);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::default()
            .write_buffer_size(1 << 20)
            .max_file_size(1 << 20)
            .l0_compaction_trigger(2)
            .reuse_manifest(true)
            .scheduler(
                SchedulerConfig::default()
                    .flush_interval(Duration::from_millis(500))
                    .compaction_interval(Duration::from_secs(5)),
            );

        assert_eq!(config.write_buffer_size, 1 << 20);
        assert_eq!(config.l0_compaction_trigger, 2);
        assert!(config.reuse_manifest);
        assert_eq!(config.scheduler.flush_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.compaction_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_level_byte_budgets() {
        let config = Config::default();
        assert_eq!(config.max_bytes_for_level(1), 10.0 * 1048576.0);
        assert_eq!(config.max_bytes_for_level(2), 100.0 * 1048576.0);
        assert_eq!(config.max_bytes_for_level(3), 1000.0 * 1048576.0);
    }

    #[test]
    fn test_derived_limits_scale_with_file_size() {
        let config = Config::default().max_file_size(1 << 20);
        assert_eq!(config.max_grandparent_overlap_bytes(), 10 << 20);
        assert_eq!(config.expanded_compaction_byte_size_limit(), 25 << 20);
    }
}
