//! Events and scheduled activities.
//!
//! An [`Event`] is a timestamped payload addressed to a link. An
//! [`Activity`] is anything a worker's time-ordered queue can hold: a
//! deliverable event, the sync tier armed as a scheduled item, or the
//! degenerate single-worker termination probe.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::{LinkId, Priority, SimTime};

/// Priority at which sync epochs fire: before any same-time event.
pub const SYNC_PRIORITY: Priority = Priority::MAX;

/// Priority at which the termination probe fires: after any same-time event.
pub const EXIT_PRIORITY: Priority = Priority::MIN;

/// Default priority for user events.
pub const DEFAULT_PRIORITY: Priority = 0;

/// A timestamped payload delivered to the handler registered on a link.
///
/// The payload is opaque bytes; components encode and decode as they wish.
/// `link_id` and `delivery_time` are stamped by [`Link::send`](crate::link::Link::send)
/// when the event enters a queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The link this event is addressed to
    pub link_id: LinkId,
    /// Absolute virtual time at which the event must be delivered
    pub delivery_time: SimTime,
    /// Tie-break priority among same-time activities (higher fires first)
    pub priority: Priority,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Event {
    /// Creates an unaddressed event carrying the given payload.
    ///
    /// The link id and delivery time are filled in on send.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            link_id: 0,
            delivery_time: 0,
            priority: DEFAULT_PRIORITY,
            payload: payload.into(),
        }
    }

    /// Sets the event priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Anything a [`TimeVortex`](crate::vortex::TimeVortex) can schedule.
///
/// The sync tier is "just another event": it arms itself in each worker's
/// queue as a [`Activity::SyncEpoch`] and fires in time order with the rest
/// of the simulation.
#[derive(Clone, Debug)]
pub enum Activity {
    /// A deliverable user event
    Event(Event),
    /// The sync manager's next epoch on this worker
    SyncEpoch,
    /// Periodic termination probe for a single-worker run
    ExitCheck,
}

impl Activity {
    /// Returns the contained event, if this is an event activity.
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Activity::Event(ev) => Some(ev),
            _ => None,
        }
    }

    /// Returns true if this activity is a sync epoch.
    pub fn is_sync(&self) -> bool {
        matches!(self, Activity::SyncEpoch)
    }
}

/// Ordering key of a scheduled activity.
///
/// Activities deliver in `(time asc, priority desc, order_tag asc)` order.
/// The order tag is a per-queue monotonic insertion counter, so no two keys
/// in one queue ever compare equal and pops are deterministic given the
/// same insertion schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivityKey {
    /// Delivery time
    pub time: SimTime,
    /// Tie-break priority (higher fires first)
    pub priority: Priority,
    /// Insertion counter assigned by the owning queue
    pub order_tag: u64,
}

impl Ord for ActivityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.order_tag.cmp(&other.order_tag))
    }
}

impl PartialOrd for ActivityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(time: SimTime, priority: Priority, order_tag: u64) -> ActivityKey {
        ActivityKey {
            time,
            priority,
            order_tag,
        }
    }

    #[test]
    fn test_event_creation() {
        let ev = Event::new(vec![1, 2, 3]).with_priority(5);
        assert_eq!(ev.payload, vec![1, 2, 3]);
        assert_eq!(ev.priority, 5);
        assert_eq!(ev.link_id, 0);
    }

    #[test]
    fn test_key_orders_by_time_first() {
        assert!(key(3, 0, 9) < key(5, 100, 0));
    }

    #[test]
    fn test_key_higher_priority_first_on_tie() {
        // Same time: priority 1 sorts before priority 0.
        assert!(key(3, 1, 9) < key(3, 0, 0));
    }

    #[test]
    fn test_key_order_tag_breaks_full_tie() {
        assert!(key(3, 0, 1) < key(3, 0, 2));
    }

    #[test]
    fn test_sync_fires_before_events_at_same_time() {
        assert!(key(50, SYNC_PRIORITY, 10) < key(50, DEFAULT_PRIORITY, 0));
        assert!(key(50, DEFAULT_PRIORITY, 10) < key(50, EXIT_PRIORITY, 0));
    }

    #[test]
    fn test_event_serialization() {
        let ev = Event {
            link_id: 7,
            delivery_time: 42,
            priority: -1,
            payload: b"abc".to_vec(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }
}
