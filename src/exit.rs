//! Distributed termination detector.
//!
//! Components that still expect to produce events hold a reference on the
//! `Exit` object; a component that runs out of work drops its reference.
//! When the global count reaches zero — summed across all threads of all
//! ranks at a sync epoch — the simulation ends at the time of the last
//! decrement.
//!
//! Counts are sharded per thread to keep updates cheap; a spinlock covers
//! only the total and the component id set. The count may transiently
//! differ from the true in-flight work between epochs, but at every sync
//! epoch it equals the number of components that still expect to produce
//! events.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::barrier::Spinlock;
use crate::error::SyncResult;
use crate::simulation::Clock;
use crate::time::TimeConverter;
use crate::transport::Transport;
use crate::types::{ComponentId, SimTime};

struct ExitShards {
    total: u64,
    per_thread: Vec<u64>,
    ids: HashSet<ComponentId>,
}

/// Sharded reference count driving end-of-simulation.
pub struct Exit {
    shards: Spinlock<ExitShards>,
    /// Mirror of the locked total, for the non-blocking `ref_count` read.
    total: AtomicU64,
    end_time: AtomicU64,
    terminated: AtomicBool,
    single_rank: bool,
    check_period: TimeConverter,
    clocks: Vec<Arc<Clock>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Exit {
    /// Creates the detector for one rank.
    ///
    /// `clocks` holds the per-worker clocks of the rank (used to stamp the
    /// end time at the decrement that reaches zero); `transport` is present
    /// exactly when the run spans multiple ranks.
    pub fn new(
        num_threads: u32,
        check_period: TimeConverter,
        single_rank: bool,
        clocks: Vec<Arc<Clock>>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        assert_eq!(clocks.len(), num_threads as usize);
        Self {
            shards: Spinlock::new(ExitShards {
                total: 0,
                per_thread: vec![0; num_threads as usize],
                ids: HashSet::new(),
            }),
            total: AtomicU64::new(0),
            end_time: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            single_rank,
            check_period,
            clocks,
            transport,
        }
    }

    /// Registers that `component_id` (running on `thread`) expects to
    /// produce events.
    ///
    /// A second increment without a matching decrement is a bug and aborts.
    pub fn ref_inc(&self, component_id: ComponentId, thread: u32) {
        let mut shards = self.shards.lock();
        if !shards.ids.insert(component_id) {
            panic!(
                "component {component_id} incremented the exit reference count twice \
                 without a matching decrement"
            );
        }
        shards.per_thread[thread as usize] += 1;
        shards.total += 1;
        self.total.store(shards.total, Ordering::Release);
    }

    /// Drops `component_id`'s reference.
    ///
    /// The decrement that brings the total to zero stamps the end time from
    /// the calling thread's clock. Decrementing below zero or without a
    /// matching increment is fatal.
    pub fn ref_dec(&self, component_id: ComponentId, thread: u32) {
        let now = self.clocks[thread as usize].now();
        let mut shards = self.shards.lock();
        if !shards.ids.remove(&component_id) {
            panic!(
                "component {component_id} decremented the exit reference count \
                 without a matching increment"
            );
        }
        let slot = &mut shards.per_thread[thread as usize];
        if *slot == 0 {
            panic!("exit reference count underflow on thread {thread}");
        }
        *slot -= 1;
        shards.total -= 1;
        self.total.store(shards.total, Ordering::Release);
        if shards.total == 0 {
            self.end_time.fetch_max(now, Ordering::AcqRel);
            debug!(component_id, thread, end_time = now, "last exit reference dropped");
        }
    }

    /// Snapshot of the total count. Non-blocking; consistent at sync epochs.
    pub fn ref_count(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Per-thread count snapshot, for diagnostics and invariant checks.
    pub fn per_thread_counts(&self) -> Vec<u64> {
        self.shards.lock().per_thread.clone()
    }

    /// The published end-of-simulation time.
    pub fn end_time(&self) -> SimTime {
        self.end_time.load(Ordering::Acquire)
    }

    /// True once termination has been decided.
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// The cadence of the single-worker termination probe.
    pub fn check_period(&self) -> TimeConverter {
        self.check_period
    }

    /// Global termination check, run by thread 0 at a rank-sync epoch.
    ///
    /// Reduces `(count, end_time)` across all ranks; a zero sum publishes
    /// the global maximum end time and the termination decision. Workers
    /// are parked at the epoch barrier while this runs, so the local count
    /// cannot move underneath it.
    pub fn check(&self) -> SyncResult<()> {
        let local = self.ref_count();
        let local_end = self.end_time();
        let (sum, end) = match &self.transport {
            Some(transport) => transport.reduce(local, local_end)?,
            None => (local, local_end),
        };
        if sum == 0 {
            self.end_time.fetch_max(end, Ordering::AcqRel);
            self.publish_end();
        }
        Ok(())
    }

    /// Publishes the termination decision (local zero test paths).
    pub fn publish_end(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            info!(end_time = self.end_time(), "simulation termination published");
        }
    }

    /// True when the run spans a single rank.
    pub fn single_rank(&self) -> bool {
        self.single_rank
    }
}

impl std::fmt::Debug for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exit")
            .field("ref_count", &self.ref_count())
            .field("end_time", &self.end_time())
            .field("terminated", &self.terminated())
            .field("single_rank", &self.single_rank)
            .finish()
    }
}
