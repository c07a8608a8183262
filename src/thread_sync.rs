//! Intra-rank synchronization: flushing cross-thread queues.
//!
//! Each worker owns a `ThreadSync`. At a sync epoch its `before` phase
//! drains every drop-box peers have filled for this worker and reschedules
//! the events into the local time queue, so that all intra-rank traffic is
//! visible before any cross-rank exchange or horizon computation.
//!
//! The tier has its own barrier, distinct from the sync manager's: the
//! entry wait guarantees every producer of the rank has finished its epoch
//! before any consumer drains, and the exit wait holds consumers until all
//! drains are complete. THREAD epochs therefore leave the manager barrier's
//! generation untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::barrier::Barrier;
use crate::link::Link;
use crate::queue::{ActivityQueue, ThreadSyncQueue};
use crate::simulation::Clock;
use crate::time::TimeConverter;
use crate::types::{LinkId, SimTime, MAX_SIM_TIME};

/// Intra-rank sync tier for one worker.
///
/// `Empty` fills the slot on single-thread ranks: its horizon is "never"
/// and its queues are unreachable by construction.
#[derive(Debug)]
pub enum ThreadSync {
    /// Single-thread rank; nothing to flush
    Empty,
    /// Multi-thread rank
    Active(ActiveThreadSync),
}

impl ThreadSync {
    /// The next epoch this tier needs, or [`MAX_SIM_TIME`] for `Empty`.
    pub fn next_sync_time(&self) -> SimTime {
        match self {
            ThreadSync::Empty => MAX_SIM_TIME,
            ThreadSync::Active(sync) => sync.next_sync_time,
        }
    }

    /// Registers the receive side of a cross-thread link on this worker.
    pub fn register_link(&mut self, link_id: LinkId, link: Link) {
        match self {
            ThreadSync::Empty => {}
            ThreadSync::Active(sync) => sync.register_link(link_id, link),
        }
    }

    /// The inbox this worker offers to `sender_thread`.
    pub fn queue_for_thread(&self, sender_thread: u32) -> ActivityQueue {
        match self {
            ThreadSync::Empty => ActivityQueue::uninitialized(),
            ThreadSync::Active(sync) => {
                ActivityQueue::CrossThread(Arc::clone(&sync.queues[sender_thread as usize]))
            }
        }
    }

    /// Flush phase: drain all inboxes into the local time queue.
    pub fn before(&mut self) {
        if let ThreadSync::Active(sync) = self {
            sync.before();
        }
    }

    /// Post-rank-sync hook. Reserved; ordering is still enforced around it.
    pub fn after(&mut self) {
        if let ThreadSync::Active(sync) = self {
            sync.after();
        }
    }

    /// A full THREAD epoch: `before` then `after`, no cross-rank work.
    pub fn execute(&mut self) {
        self.before();
        self.after();
    }

    /// Drains init-phase events, counting moved messages into `msg_count`.
    pub fn process_link_init_data(&mut self, msg_count: &AtomicI64) {
        if let ThreadSync::Active(sync) = self {
            sync.process_link_init_data(msg_count);
        }
    }

    /// Freezes the link table; registration afterwards is a bug.
    pub fn finalize_link_configurations(&mut self) {
        if let ThreadSync::Active(sync) = self {
            sync.frozen = true;
        }
    }

    /// Number of events still parked in this worker's inboxes.
    pub fn pending_events(&self) -> usize {
        match self {
            ThreadSync::Empty => 0,
            ThreadSync::Active(sync) => sync.queues.iter().map(|q| q.len()).sum(),
        }
    }
}

/// The concrete tier for a multi-thread rank.
#[derive(Debug)]
pub struct ActiveThreadSync {
    thread: u32,
    links: HashMap<LinkId, Link>,
    /// Inbox offered to each sender thread, indexed by sender.
    queues: Vec<Arc<ThreadSyncQueue>>,
    next_sync_time: SimTime,
    max_period: TimeConverter,
    clock: Arc<Clock>,
    barrier: Arc<Barrier>,
    frozen: bool,
}

impl ActiveThreadSync {
    /// Creates the tier for `thread` of a `num_threads`-thread rank.
    ///
    /// `max_period` bounds the epoch spacing (the minimum inter-thread link
    /// latency); `barrier` is the rank's thread-tier barrier, shared by all
    /// workers of the rank.
    pub fn new(
        num_threads: u32,
        thread: u32,
        max_period: TimeConverter,
        clock: Arc<Clock>,
        barrier: Arc<Barrier>,
    ) -> Self {
        Self {
            thread,
            links: HashMap::new(),
            queues: (0..num_threads)
                .map(|_| Arc::new(ThreadSyncQueue::new(thread)))
                .collect(),
            next_sync_time: max_period.factor(),
            max_period,
            clock,
            barrier,
            frozen: false,
        }
    }

    fn register_link(&mut self, link_id: LinkId, link: Link) {
        if self.frozen {
            panic!("link {link_id} registered after the link table was frozen");
        }
        if self.links.insert(link_id, link).is_some() {
            panic!("link {link_id} registered twice with the thread sync tier");
        }
    }

    fn before(&mut self) {
        // Entry rendezvous: every producer of the rank has reached this
        // epoch, so everything sent before the horizon is in a drop-box.
        self.barrier.wait();

        let now = self.clock.now();
        let mut moved = 0u64;
        let mut fault: Option<String> = None;

        for queue in &self.queues {
            for event in queue.take_all() {
                let Some(link) = self.links.get(&event.link_id) else {
                    fault.get_or_insert_with(|| {
                        format!(
                            "event for unknown link {} in thread sync flush on thread {}",
                            event.link_id, self.thread
                        )
                    });
                    continue;
                };
                let Some(delay) = event.delivery_time.checked_sub(now) else {
                    fault.get_or_insert_with(|| {
                        format!(
                            "event on link {} scheduled in the past (delivery {}, now {now})",
                            event.link_id, event.delivery_time
                        )
                    });
                    continue;
                };
                link.send(delay, event);
                moved += 1;
            }
        }
        trace!(thread = self.thread, moved, now, "thread sync flush");

        // Exit rendezvous: no producer resumes until every drain is done.
        self.barrier.wait();

        // Faults found during the drain fail the run only after the barrier
        // has released, so peers leave the epoch cleanly first.
        if let Some(message) = fault {
            panic!("{message}");
        }

        self.next_sync_time = now + self.max_period.factor();
    }

    fn after(&mut self) {
        // Reserved for post-rank-sync bookkeeping.
    }

    fn process_link_init_data(&mut self, msg_count: &AtomicI64) {
        for queue in &self.queues {
            for event in queue.take_init() {
                let Some(link) = self.links.get(&event.link_id) else {
                    panic!(
                        "init data for unknown link {} on thread {}",
                        event.link_id, self.thread
                    );
                };
                link.send_init_data(event);
                msg_count.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}
