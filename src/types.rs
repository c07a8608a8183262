//! Core type definitions for the synchronization core.
//!
//! This module defines the fundamental identifier and time types shared by
//! every tier of the engine.

use serde::{Deserialize, Serialize};

/// Virtual-time tick. Monotonic, zero at simulation start.
///
/// All delivery times, latencies, and sync horizons use the same `SimTime`
/// representation, giving a unified timeline across threads and ranks.
pub type SimTime = u64;

/// Sentinel meaning "never" — no activity is ever scheduled at this time.
pub const MAX_SIM_TIME: SimTime = u64::MAX;

/// Opaque link identifier, globally unique across all ranks for a run.
pub type LinkId = u64;

/// Identifier of a user component, as seen by the termination detector.
pub type ComponentId = u64;

/// Activity priority. Higher priorities fire first among same-time activities.
pub type Priority = i32;

/// Identifies one worker in the parallel topology: the pair `(rank, thread)`.
///
/// A `RankInfo` is also used as a *size* (`num_ranks`): `rank` is then the
/// number of ranks in the run and `thread` the number of worker threads per
/// rank. The derived ordering is total, by rank then thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RankInfo {
    /// Process rank within the run
    pub rank: u32,
    /// Worker thread within the rank
    pub thread: u32,
}

impl RankInfo {
    /// Creates a new rank/thread pair.
    pub fn new(rank: u32, thread: u32) -> Self {
        Self { rank, thread }
    }

    /// Returns true if both identifiers name workers in the same rank.
    pub fn same_rank(&self, other: &RankInfo) -> bool {
        self.rank == other.rank
    }

    /// Total worker count when this value is used as a topology size.
    pub fn total_workers(&self) -> u64 {
        u64::from(self.rank) * u64::from(self.thread)
    }
}

impl std::fmt::Display for RankInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rank, self.thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_info_ordering() {
        let a = RankInfo::new(0, 3);
        let b = RankInfo::new(1, 0);
        let c = RankInfo::new(1, 2);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(RankInfo::new(2, 5), RankInfo::new(2, 5));
    }

    #[test]
    fn test_rank_info_same_rank() {
        let a = RankInfo::new(1, 0);
        let b = RankInfo::new(1, 3);
        let c = RankInfo::new(2, 0);

        assert!(a.same_rank(&b));
        assert!(!a.same_rank(&c));
    }

    #[test]
    fn test_topology_size() {
        let size = RankInfo::new(4, 8);
        assert_eq!(size.total_workers(), 32);
    }

    #[test]
    fn test_display() {
        assert_eq!(RankInfo::new(2, 7).to_string(), "2:7");
    }
}
