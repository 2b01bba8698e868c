//! Page-source statistics.
//!
//! Counters are plain integers mutated under the partition lock and read by
//! value, so tests (and operators) can observe how often the allocator goes
//! to the OS.

/// Counts of page-source activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Commit calls issued to the page provider.
    pub commits: u64,
    /// Total bytes committed.
    pub commit_bytes: u64,
    /// Uncommit calls issued to the page provider.
    pub uncommits: u64,
    /// Total bytes uncommitted.
    pub uncommit_bytes: u64,
    /// Discard hints issued for freed page clusters.
    pub discards: u64,
    /// Partition slots claimed from the arena.
    pub partitions_claimed: u64,
    /// Partition slots returned to the arena.
    pub partitions_released: u64,
}

impl SourceStats {
    pub(crate) fn record_commit(&mut self, bytes: usize, partitions: usize) {
        self.commits += 1;
        self.commit_bytes += bytes as u64;
        self.partitions_claimed += partitions as u64;
    }

    pub(crate) fn record_uncommit(&mut self, bytes: usize, partitions: usize) {
        self.uncommits += 1;
        self.uncommit_bytes += bytes as u64;
        self.partitions_released += partitions as u64;
    }

    pub(crate) fn record_discard(&mut self) {
        self.discards += 1;
    }
}
