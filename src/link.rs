//! Links: the delivery endpoints components send on.
//!
//! A link owns its destination substrate and a latency floor. Sending an
//! event with relative delay `d` stamps it for delivery at
//! `now + latency + d` and deposits it into the substrate; the variant of
//! the substrate decides whether that is a direct insert, a cross-thread
//! drop-box append, or a rank outbox append.

use std::sync::Arc;

use crate::event::Event;
use crate::queue::ActivityQueue;
use crate::simulation::Clock;
use crate::types::{LinkId, SimTime};

/// One directed delivery endpoint.
///
/// `send` is called only from the thread that owns the source component.
/// Latency is strictly positive for cross-thread and cross-rank links and
/// may be zero for links confined to one worker; the resulting delivery
/// time therefore always lies beyond the destination's sync horizon.
#[derive(Clone, Debug)]
pub struct Link {
    id: LinkId,
    latency: SimTime,
    queue: ActivityQueue,
    clock: Arc<Clock>,
}

impl Link {
    pub(crate) fn new(id: LinkId, latency: SimTime, queue: ActivityQueue, clock: Arc<Clock>) -> Self {
        Self {
            id,
            latency,
            queue,
            clock,
        }
    }

    /// The link's identifier.
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The link's latency floor.
    pub fn latency(&self) -> SimTime {
        self.latency
    }

    /// Sends `event` with a relative delay of `delay` ticks.
    ///
    /// Never blocks: all substrates accept the deposit immediately.
    pub fn send(&self, delay: SimTime, mut event: Event) {
        let now = self.clock.now();
        event.link_id = self.id;
        event.delivery_time = now + self.latency + delay;
        self.queue.insert(event);
    }

    /// Sends an init-phase event, delivered at cycle 0 before timed traffic.
    pub fn send_init_data(&self, mut event: Event) {
        event.link_id = self.id;
        event.delivery_time = 0;
        self.queue.insert_init(event);
    }
}
