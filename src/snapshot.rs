//! Pinned read points.
//!
//! A snapshot pins a sequence number: while it is held, compaction must not
//! drop the newest record at or below that sequence for any user key. The
//! list keeps handles ordered oldest to newest; compaction consults
//! `oldest()` to compute the smallest sequence it must preserve.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::key::SequenceNumber;

/// A pinned sequence number. Obtained from [`SnapshotList::acquire`] and
/// meaningful until released.
#[derive(Debug)]
pub struct Snapshot {
    sequence: SequenceNumber,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

/// Ordered list of in-use snapshots, oldest at the front.
#[derive(Default)]
pub struct SnapshotList {
    snapshots: VecDeque<Arc<Snapshot>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Pins `sequence` and returns its handle. Sequences must be acquired
    /// in non-decreasing order.
    pub fn acquire(&mut self, sequence: SequenceNumber) -> Arc<Snapshot> {
        if let Some(newest) = self.snapshots.back() {
            assert!(sequence >= newest.sequence);
        }
        let snapshot = Arc::new(Snapshot { sequence });
        self.snapshots.push_back(Arc::clone(&snapshot));
        snapshot
    }

    /// Unpins a snapshot. Unknown handles are ignored.
    pub fn release(&mut self, snapshot: &Arc<Snapshot>) {
        self.snapshots.retain(|s| !Arc::ptr_eq(s, snapshot));
    }

    /// The smallest pinned sequence, if any snapshot is held.
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.snapshots.front().map(|s| s.sequence)
    }

    pub fn newest(&self) -> Option<SequenceNumber> {
        self.snapshots.back().map(|s| s.sequence)
    }
}
