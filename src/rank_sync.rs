//! Cross-rank synchronization: the serial-skip exchange.
//!
//! One `RankSync` exists per rank, shared by its workers. At a RANK epoch,
//! thread 0 serializes each peer outbox into one wire frame, exchanges
//! bidirectionally with every peer in ascending rank order (a single pass,
//! no overlapping communication), re-inserts inbound events by link id, and
//! computes the next global horizon. The other workers are parked at the
//! manager barrier for the duration.
//!
//! Skip-ahead: the new horizon is the cluster-wide minimum next event time
//! pulled in by half the minimum partition latency, floored at
//! `now + min_part`. Epochs move closer together only when events are
//! genuinely close in virtual time; quiet intervals cost no barriers.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::event::Event;
use crate::link::Link;
use crate::queue::ActivityQueue;
use crate::simulation::Clock;
use crate::time::TimeConverter;
use crate::transport::Transport;
use crate::types::{LinkId, RankInfo, SimTime, MAX_SIM_TIME};
use crate::vortex::TimeVortex;
use crate::wire::{self, WireHeader};

/// Outbound buffer toward one peer rank.
///
/// Worker threads append concurrently between epochs; thread 0 drains at
/// the exchange. Crossing the watermark is not an error: it trips the
/// pressure flag, which forces the next sync horizon down to the floor so
/// the buffer drains sooner.
#[derive(Debug)]
pub struct RankOutbox {
    peer: u32,
    events: Mutex<Vec<Event>>,
    init_events: Mutex<Vec<Event>>,
    watermark: usize,
    pressure: Arc<AtomicBool>,
}

impl RankOutbox {
    fn new(peer: u32, watermark: usize, pressure: Arc<AtomicBool>) -> Self {
        Self {
            peer,
            events: Mutex::new(Vec::new()),
            init_events: Mutex::new(Vec::new()),
            watermark,
            pressure,
        }
    }

    /// The peer rank this buffer feeds.
    pub fn peer(&self) -> u32 {
        self.peer
    }

    pub(crate) fn push(&self, event: Event) {
        let mut events = self.events.lock();
        events.push(event);
        if events.len() >= self.watermark && !self.pressure.swap(true, Ordering::AcqRel) {
            warn!(
                peer = self.peer,
                buffered = events.len(),
                "rank outbox past watermark; next sync horizon pulled to the floor"
            );
        }
    }

    pub(crate) fn push_init(&self, event: Event) {
        self.init_events.lock().push(event);
    }

    fn take_all(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    fn take_init(&self) -> Vec<Event> {
        std::mem::take(&mut *self.init_events.lock())
    }

    /// Bytes currently buffered toward the peer.
    pub fn data_size(&self) -> u64 {
        self.events
            .lock()
            .iter()
            .map(|ev| 24 + ev.payload.len() as u64)
            .sum()
    }

    /// Earliest delivery time among buffered events, or "never".
    fn next_event_time(&self) -> SimTime {
        self.events
            .lock()
            .iter()
            .map(|ev| ev.delivery_time)
            .min()
            .unwrap_or(MAX_SIM_TIME)
    }
}

/// Cross-rank sync tier of one rank.
///
/// Owned by the engine bootstrap and handed to every worker's sync manager
/// by reference; there is exactly one per rank.
#[derive(Debug)]
pub struct RankSync {
    kind: RankSyncKind,
    /// Faults discovered inside a barrier region park here until the
    /// barriers have released.
    fault: Mutex<Option<SyncError>>,
}

#[derive(Debug)]
enum RankSyncKind {
    /// Single-rank run; the horizon is "never" and registration is
    /// unreachable by construction.
    Empty,
    SerialSkip(SerialSkip),
}

impl RankSync {
    /// The tier for a single-rank run.
    pub fn empty() -> Self {
        Self {
            kind: RankSyncKind::Empty,
            fault: Mutex::new(None),
        }
    }

    /// The concrete serial-skip tier for a multi-rank run.
    ///
    /// `vortices` and `clock` are the rank's worker queues and the thread-0
    /// clock; `min_part` is the minimum partition latency across any rank
    /// boundary of the run and must be identical on every rank.
    pub fn serial_skip(
        rank: u32,
        transport: Arc<dyn Transport>,
        vortices: Vec<Arc<Mutex<TimeVortex>>>,
        clock: Arc<Clock>,
        min_part: TimeConverter,
        outbox_watermark: usize,
    ) -> Self {
        Self {
            kind: RankSyncKind::SerialSkip(SerialSkip::new(
                rank,
                transport,
                vortices,
                clock,
                min_part,
                outbox_watermark,
            )),
            fault: Mutex::new(None),
        }
    }

    /// The next epoch this tier needs, or [`MAX_SIM_TIME`] for `Empty`.
    pub fn next_sync_time(&self) -> SimTime {
        match &self.kind {
            RankSyncKind::Empty => MAX_SIM_TIME,
            RankSyncKind::SerialSkip(sync) => sync.next_sync_time.load(Ordering::Acquire),
        }
    }

    /// Registers a link that crosses a rank boundary.
    ///
    /// When `from.rank` is this rank the returned queue is the outbound
    /// buffer toward `to.rank`; when `to.rank` is this rank, `link` (the
    /// receive-side endpoint) is recorded for inbound delivery and the
    /// returned queue is the tripwire.
    pub fn register_link(
        &self,
        to: RankInfo,
        from: RankInfo,
        link_id: LinkId,
        link: Option<Link>,
    ) -> ActivityQueue {
        match &self.kind {
            RankSyncKind::Empty => ActivityQueue::uninitialized(),
            RankSyncKind::SerialSkip(sync) => sync.register_link(to, from, link_id, link),
        }
    }

    /// Performs the rank exchange. Only thread 0 touches the wire.
    pub fn execute(&self, thread: u32) -> SyncResult<()> {
        match &self.kind {
            RankSyncKind::Empty => Ok(()),
            RankSyncKind::SerialSkip(sync) => {
                if thread != 0 {
                    return Ok(());
                }
                sync.execute()
            }
        }
    }

    /// Phase-0 exchange of link init data.
    ///
    /// `msg_count` already carries the intra-rank messages moved this
    /// round; the call folds in the cross-rank traffic and replaces the
    /// value with the cluster-wide total, so a zero after the epoch means
    /// global quiescence.
    pub fn exchange_link_init_data(&self, thread: u32, msg_count: &AtomicI64) -> SyncResult<()> {
        match &self.kind {
            RankSyncKind::Empty => Ok(()),
            RankSyncKind::SerialSkip(sync) => {
                if thread != 0 {
                    return Ok(());
                }
                sync.exchange_link_init_data(msg_count)
            }
        }
    }

    /// Freezes the link topology.
    pub fn finalize_link_configurations(&self) {
        if let RankSyncKind::SerialSkip(sync) = &self.kind {
            sync.frozen.store(true, Ordering::Release);
        }
    }

    /// Completed rank epochs.
    pub fn epochs(&self) -> u64 {
        match &self.kind {
            RankSyncKind::Empty => 0,
            RankSyncKind::SerialSkip(sync) => sync.epoch.load(Ordering::Acquire),
        }
    }

    /// Events shipped to peers over the run.
    pub fn events_sent(&self) -> u64 {
        match &self.kind {
            RankSyncKind::Empty => 0,
            RankSyncKind::SerialSkip(sync) => sync.events_sent.load(Ordering::Acquire),
        }
    }

    /// Events received from peers over the run.
    pub fn events_received(&self) -> u64 {
        match &self.kind {
            RankSyncKind::Empty => 0,
            RankSyncKind::SerialSkip(sync) => sync.events_received.load(Ordering::Acquire),
        }
    }

    /// Bytes currently buffered in the outboxes.
    pub fn data_size(&self) -> u64 {
        match &self.kind {
            RankSyncKind::Empty => 0,
            RankSyncKind::SerialSkip(sync) => sync
                .outboxes
                .iter()
                .flatten()
                .map(|outbox| outbox.data_size())
                .sum(),
        }
    }

    /// Parks a fault discovered inside a barrier region.
    pub fn park_fault(&self, error: SyncError) {
        let mut slot = self.fault.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// The parked fault, if any. Left in place: once faulted, the run is
    /// over everywhere.
    pub fn fault_snapshot(&self) -> Option<SyncError> {
        self.fault.lock().clone()
    }
}

#[derive(Debug)]
struct SerialSkip {
    rank: u32,
    num_ranks: u32,
    transport: Arc<dyn Transport>,
    /// Outbound buffer per peer, `None` at this rank's own index.
    outboxes: Vec<Option<Arc<RankOutbox>>>,
    /// Receive-side endpoints of inbound links, by link id.
    links: Mutex<std::collections::HashMap<LinkId, Link>>,
    /// The rank's worker queues, probed for the local event horizon.
    vortices: Vec<Arc<Mutex<TimeVortex>>>,
    clock: Arc<Clock>,
    next_sync_time: AtomicU64,
    epoch: AtomicU64,
    min_part: TimeConverter,
    pressure: Arc<AtomicBool>,
    frozen: AtomicBool,
    events_sent: AtomicU64,
    events_received: AtomicU64,
}

impl SerialSkip {
    fn new(
        rank: u32,
        transport: Arc<dyn Transport>,
        vortices: Vec<Arc<Mutex<TimeVortex>>>,
        clock: Arc<Clock>,
        min_part: TimeConverter,
        outbox_watermark: usize,
    ) -> Self {
        let num_ranks = transport.num_ranks();
        let pressure = Arc::new(AtomicBool::new(false));
        let outboxes = (0..num_ranks)
            .map(|peer| {
                (peer != rank).then(|| {
                    Arc::new(RankOutbox::new(
                        peer,
                        outbox_watermark,
                        Arc::clone(&pressure),
                    ))
                })
            })
            .collect();

        Self {
            rank,
            num_ranks,
            transport,
            outboxes,
            links: Mutex::new(std::collections::HashMap::new()),
            vortices,
            clock,
            next_sync_time: AtomicU64::new(min_part.factor()),
            epoch: AtomicU64::new(0),
            min_part,
            pressure,
            frozen: AtomicBool::new(false),
            events_sent: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
        }
    }

    fn half_window(&self) -> SimTime {
        self.min_part.factor() / 2
    }

    fn register_link(
        &self,
        to: RankInfo,
        from: RankInfo,
        link_id: LinkId,
        link: Option<Link>,
    ) -> ActivityQueue {
        if self.frozen.load(Ordering::Acquire) {
            panic!("link {link_id} registered after the link topology was frozen");
        }
        if to.rank == self.rank {
            let link = link.unwrap_or_else(|| {
                panic!("inbound link {link_id} registered without its receive-side endpoint")
            });
            if self.links.lock().insert(link_id, link).is_some() {
                panic!("link {link_id} registered twice with the rank sync tier");
            }
            return ActivityQueue::uninitialized();
        }
        debug_assert_eq!(from.rank, self.rank);
        match self.outboxes.get(to.rank as usize).and_then(|o| o.as_ref()) {
            Some(outbox) => ActivityQueue::CrossRank(Arc::clone(outbox)),
            None => panic!("link {link_id} targets rank {} outside this fabric", to.rank),
        }
    }

    /// The earliest pending event anywhere on this rank: in a worker's
    /// time queue or still buffered in an outbox. Workers are parked, so
    /// the locks are free. Outbox events count even though this epoch
    /// ships them — the peer's advertisement cannot know about them yet.
    fn local_event_horizon(&self) -> SimTime {
        let vortex_min = self
            .vortices
            .iter()
            .map(|vortex| vortex.lock().next_event_time())
            .min()
            .unwrap_or(MAX_SIM_TIME);
        let outbox_min = self
            .outboxes
            .iter()
            .flatten()
            .map(|outbox| outbox.next_event_time())
            .min()
            .unwrap_or(MAX_SIM_TIME);
        vortex_min.min(outbox_min)
    }

    fn execute(&self) -> SyncResult<()> {
        let now = self.clock.now();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let floor = now + self.min_part.factor();

        let local_next = self.local_event_horizon();
        let pressured = self.pressure.swap(false, Ordering::AcqRel);
        // A pressured rank advertises a capped horizon so every rank lands
        // on the floored epoch, keeping the cluster's schedule identical.
        let advertised = if pressured {
            local_next.min(floor + self.half_window())
        } else {
            local_next
        };

        let links = self.links.lock();
        let mut horizon = advertised;
        let mut fault: Option<SyncError> = None;
        let mut sent = 0u64;
        let mut received = 0u64;

        for peer in 0..self.num_ranks {
            let Some(outbox) = self.outboxes[peer as usize].as_ref() else {
                continue;
            };
            let outbound = outbox.take_all();
            sent += outbound.len() as u64;

            let frame = wire::encode(
                &WireHeader {
                    sender_rank: self.rank,
                    epoch,
                    next_event_time: advertised,
                    event_count: outbound.len() as u32,
                },
                &outbound,
            );
            let reply = self.transport.sendrecv(peer, frame)?;
            let (header, events) = wire::decode(&reply)?;
            if header.epoch != epoch {
                return Err(SyncError::EpochMismatch {
                    peer,
                    expected: epoch,
                    got: header.epoch,
                });
            }
            horizon = horizon.min(header.next_event_time);

            for event in events {
                let Some(link) = links.get(&event.link_id) else {
                    fault.get_or_insert(SyncError::UnknownLink(event.link_id));
                    continue;
                };
                let Some(delay) = event.delivery_time.checked_sub(now) else {
                    fault.get_or_insert(SyncError::PastDelivery {
                        link: event.link_id,
                        delivery: event.delivery_time,
                        now,
                    });
                    continue;
                };
                link.send(delay, event);
                received += 1;
            }
            trace!(peer, epoch, "rank pair exchanged");
        }
        drop(links);

        self.events_sent.fetch_add(sent, Ordering::AcqRel);
        self.events_received.fetch_add(received, Ordering::AcqRel);

        let next = if horizon == MAX_SIM_TIME {
            MAX_SIM_TIME
        } else {
            floor.max(horizon.saturating_sub(self.half_window()))
        };
        self.next_sync_time.store(next, Ordering::Release);
        debug!(
            rank = self.rank,
            epoch, now, sent, received, next, "rank sync epoch complete"
        );

        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn exchange_link_init_data(&self, msg_count: &AtomicI64) -> SyncResult<()> {
        let links = self.links.lock();
        let mut moved = 0i64;
        let mut fault: Option<SyncError> = None;

        for peer in 0..self.num_ranks {
            let Some(outbox) = self.outboxes[peer as usize].as_ref() else {
                continue;
            };
            let outbound = outbox.take_init();
            moved += outbound.len() as i64;

            let frame = wire::encode(
                &WireHeader {
                    sender_rank: self.rank,
                    epoch: 0,
                    next_event_time: MAX_SIM_TIME,
                    event_count: outbound.len() as u32,
                },
                &outbound,
            );
            let reply = self.transport.sendrecv(peer, frame)?;
            let (_, events) = wire::decode(&reply)?;

            for event in events {
                let Some(link) = links.get(&event.link_id) else {
                    fault.get_or_insert(SyncError::UnknownLink(event.link_id));
                    continue;
                };
                link.send_init_data(event);
                moved += 1;
            }
        }
        drop(links);

        // Replace the rank-local tally with the cluster-wide total; zero
        // after this epoch means no rank moved anything.
        let local = msg_count.load(Ordering::Acquire) + moved;
        let (global, _) = self.transport.reduce(local as u64, 0)?;
        msg_count.store(global as i64, Ordering::Release);

        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
