//! Delivery substrates for link traffic.
//!
//! An [`ActivityQueue`] is the endpoint a link deposits into; the variant
//! is chosen at wiring time from the topology of the two endpoints. A
//! [`ThreadSyncQueue`] is the cross-thread drop-box drained by the
//! destination worker at its sync epoch.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::{Activity, Event};
use crate::rank_sync::RankOutbox;
use crate::vortex::TimeVortex;

/// Diagnostic printed when a placeholder queue is touched.
pub const UNINITIALIZED_QUEUE_MSG: &str =
    "activity queue used before link configuration was finalized";

/// The substrate behind a link's destination.
///
/// Links are registered before their target queues are known; the
/// [`Uninitialized`](ActivityQueue::Uninitialized) placeholder fills the
/// gap and fails loudly if anything reaches it.
#[derive(Clone, Debug)]
pub enum ActivityQueue {
    /// Destination is on the sending worker: direct insert into its queue
    Local(Arc<Mutex<TimeVortex>>),
    /// Destination is a peer thread of the same rank: deposit in its drop-box
    CrossThread(Arc<ThreadSyncQueue>),
    /// Destination is on another rank: buffer for the next rank exchange
    CrossRank(Arc<RankOutbox>),
    /// Tripwire placeholder; any use aborts with the diagnostic
    Uninitialized(&'static str),
}

impl ActivityQueue {
    /// The tripwire placeholder with the standard diagnostic.
    pub fn uninitialized() -> Self {
        ActivityQueue::Uninitialized(UNINITIALIZED_QUEUE_MSG)
    }

    /// Deposits a timed event into the substrate.
    pub fn insert(&self, event: Event) {
        match self {
            ActivityQueue::Local(vortex) => {
                let (time, priority) = (event.delivery_time, event.priority);
                vortex.lock().insert(time, priority, Activity::Event(event));
            }
            ActivityQueue::CrossThread(queue) => queue.push(event),
            ActivityQueue::CrossRank(outbox) => outbox.push(event),
            ActivityQueue::Uninitialized(msg) => panic!("{msg}"),
        }
    }

    /// Deposits an init-phase event into the substrate.
    ///
    /// Init events surface to the destination handler at cycle 0, before
    /// any timed traffic.
    pub fn insert_init(&self, event: Event) {
        match self {
            ActivityQueue::Local(vortex) => {
                let priority = event.priority;
                vortex.lock().insert(0, priority, Activity::Event(event));
            }
            ActivityQueue::CrossThread(queue) => queue.push_init(event),
            ActivityQueue::CrossRank(outbox) => outbox.push_init(event),
            ActivityQueue::Uninitialized(msg) => panic!("{msg}"),
        }
    }

    /// Returns true if this is the tripwire placeholder.
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, ActivityQueue::Uninitialized(_))
    }
}

/// Single-producer drop-box for events bound for a peer thread.
///
/// Contract: the producer is pinned (one sender thread per box), and the
/// consumer drains only inside its own sync epoch while producers are
/// parked at the thread barrier — the lock is uncontended by construction.
#[derive(Debug)]
pub struct ThreadSyncQueue {
    dest_thread: u32,
    events: Mutex<Vec<Event>>,
    init_events: Mutex<Vec<Event>>,
}

impl ThreadSyncQueue {
    /// Creates a drop-box whose consumer is `dest_thread`.
    pub fn new(dest_thread: u32) -> Self {
        Self {
            dest_thread,
            events: Mutex::new(Vec::new()),
            init_events: Mutex::new(Vec::new()),
        }
    }

    /// The consumer thread of this box.
    pub fn dest_thread(&self) -> u32 {
        self.dest_thread
    }

    /// Producer side: appends a timed event.
    pub fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    /// Producer side: appends an init-phase event.
    pub fn push_init(&self, event: Event) {
        self.init_events.lock().push(event);
    }

    /// Consumer side: drains all timed events.
    pub fn take_all(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Consumer side: drains all init-phase events.
    pub fn take_init(&self) -> Vec<Event> {
        std::mem::take(&mut *self.init_events.lock())
    }

    /// Number of pending timed events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if no timed events are pending.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(link_id: u64, time: u64) -> Event {
        Event {
            link_id,
            delivery_time: time,
            priority: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_thread_sync_queue_push_take() {
        let queue = ThreadSyncQueue::new(1);
        assert!(queue.is_empty());
        assert_eq!(queue.dest_thread(), 1);

        queue.push(event(1, 10));
        queue.push(event(2, 20));
        assert_eq!(queue.len(), 2);

        let drained = queue.take_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].link_id, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_init_events_kept_separate() {
        let queue = ThreadSyncQueue::new(0);
        queue.push(event(1, 10));
        queue.push_init(event(2, 0));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_init().len(), 1);
        assert_eq!(queue.take_all().len(), 1);
    }

    #[test]
    fn test_local_queue_inserts_into_vortex() {
        let vortex = Arc::new(Mutex::new(TimeVortex::new()));
        let queue = ActivityQueue::Local(Arc::clone(&vortex));

        queue.insert(event(3, 25));
        let popped = vortex.lock().pop().unwrap();
        assert_eq!(popped.key.time, 25);
        assert_eq!(popped.activity.as_event().unwrap().link_id, 3);
    }

    #[test]
    fn test_local_init_delivers_at_cycle_zero() {
        let vortex = Arc::new(Mutex::new(TimeVortex::new()));
        let queue = ActivityQueue::Local(Arc::clone(&vortex));

        queue.insert_init(event(3, 0));
        assert_eq!(vortex.lock().peek_time(), Some(0));
    }

    #[test]
    #[should_panic(expected = "activity queue used before link configuration was finalized")]
    fn test_uninitialized_queue_aborts() {
        ActivityQueue::uninitialized().insert(event(1, 1));
    }
}
