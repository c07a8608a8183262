//! Engine bootstrap: workers, wiring, and the run loop.
//!
//! One [`Engine`] is one rank. It builds the per-worker state (clock, time
//! queue, sync manager), wires links through the right substrate from the
//! partitioner's placement, and drives the run: one OS thread per worker,
//! an init-data exchange to quiescence, link-table freeze, then the event
//! loop until termination is published, the queue drains, or the horizon
//! passes `max_time`.
//!
//! Multi-rank runs construct one `Engine` per rank over a shared
//! [`Transport`](crate::transport::Transport); the rank tier singleton is
//! owned here and handed to every worker by reference.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::barrier::Barrier;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{Activity, Event, EXIT_PRIORITY};
use crate::exit::Exit;
use crate::link::Link;
use crate::queue::ActivityQueue;
use crate::rank_sync::RankSync;
use crate::sync_manager::SyncManager;
use crate::time::TimeConverter;
use crate::transport::Transport;
use crate::types::{LinkId, Priority, RankInfo, SimTime};
use crate::vortex::TimeVortex;

/// Per-worker virtual-time cell.
///
/// Advanced only by its owning worker as it pops activities; read by the
/// sync tiers and by links stamping delivery times.
#[derive(Debug, Default)]
pub struct Clock(AtomicU64);

impl Clock {
    /// A clock at cycle zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// The current virtual time.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.0.load(Ordering::Acquire)
    }

    /// Advances the clock. Virtual time never moves backwards.
    pub fn advance_to(&self, time: SimTime) {
        debug_assert!(time >= self.now(), "virtual time moved backwards");
        self.0.store(time, Ordering::Release);
    }
}

/// Per-worker simulation handle: the surface the sync core consumes.
#[derive(Clone, Debug)]
pub struct Simulation {
    rank: RankInfo,
    clock: Arc<Clock>,
    vortex: Arc<Mutex<TimeVortex>>,
    exit: Arc<Exit>,
}

impl Simulation {
    /// Bundles the worker's shared state into a handle.
    pub fn new(
        rank: RankInfo,
        clock: Arc<Clock>,
        vortex: Arc<Mutex<TimeVortex>>,
        exit: Arc<Exit>,
    ) -> Self {
        Self {
            rank,
            clock,
            vortex,
            exit,
        }
    }

    /// The worker this handle belongs to.
    pub fn rank(&self) -> RankInfo {
        self.rank
    }

    /// The worker's current virtual time.
    pub fn current_cycle(&self) -> SimTime {
        self.clock.now()
    }

    /// Schedules an activity in the worker's time queue.
    pub fn insert_activity(&self, time: SimTime, priority: Priority, activity: Activity) {
        self.vortex.lock().insert(time, priority, activity);
    }

    /// The rank's termination detector.
    pub fn exit(&self) -> &Arc<Exit> {
        &self.exit
    }

    pub(crate) fn clock(&self) -> Arc<Clock> {
        Arc::clone(&self.clock)
    }

    pub(crate) fn vortex(&self) -> &Arc<Mutex<TimeVortex>> {
        &self.vortex
    }
}

/// Handler invoked when an event reaches its destination link.
pub type EventHandler = Box<dyn FnMut(Event) + Send>;

/// A link in the partitioned graph: endpoints placed by the partitioner.
#[derive(Clone, Copy, Debug)]
pub struct LinkSpec {
    /// Globally unique link id
    pub id: LinkId,
    /// Sending worker
    pub from: RankInfo,
    /// Receiving worker
    pub to: RankInfo,
    /// Latency floor; strictly positive when the endpoints differ
    pub latency: SimTime,
}

impl LinkSpec {
    /// Creates a link spec.
    pub fn new(id: LinkId, from: RankInfo, to: RankInfo, latency: SimTime) -> Self {
        Self {
            id,
            from,
            to,
            latency,
        }
    }
}

/// Result of a completed run on one rank.
#[derive(Clone, Debug, Default)]
pub struct EngineReport {
    /// The rank this report belongs to
    pub rank: u32,
    /// Published end-of-simulation time, if the run terminated
    pub end_time: Option<SimTime>,
    /// Largest virtual time any worker reached
    pub final_time: SimTime,
    /// Events delivered to handlers across all workers
    pub events_delivered: u64,
    /// Completed rank-sync epochs
    pub rank_epochs: u64,
    /// Events shipped to peer ranks
    pub rank_events_sent: u64,
    /// Events received from peer ranks
    pub rank_events_received: u64,
    /// Final generation of the sync manager's barrier
    pub barrier_generation: u64,
}

impl EngineReport {
    /// Exports the report as JSON.
    pub fn export_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "engine": {
                "rank": self.rank,
                "end_time": self.end_time,
                "final_time": self.final_time,
                "events_delivered": self.events_delivered,
            },
            "rank_sync": {
                "epochs": self.rank_epochs,
                "events_sent": self.rank_events_sent,
                "events_received": self.rank_events_received,
            },
            "barrier_generation": self.barrier_generation,
        })
    }
}

/// One rank of the parallel simulation.
pub struct Engine {
    rank: u32,
    num_ranks: RankInfo,
    config: EngineConfig,
    clocks: Vec<Arc<Clock>>,
    vortices: Vec<Arc<Mutex<TimeVortex>>>,
    exit: Arc<Exit>,
    barrier: Arc<Barrier>,
    thread_barrier: Arc<Barrier>,
    rank_sync: Arc<RankSync>,
    managers: Vec<SyncManager>,
    handlers: Vec<HashMap<LinkId, EventHandler>>,
    registered_links: HashSet<LinkId>,
    init_msg: Arc<AtomicI64>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rank", &self.rank)
            .field("num_ranks", &self.num_ranks)
            .field("config", &self.config)
            .field("registered_links", &self.registered_links)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds the rank's workers and sync tiers.
    ///
    /// `transport` is required exactly when the run spans multiple ranks;
    /// a `None` transport means a single-rank run.
    pub fn new(
        rank: u32,
        config: EngineConfig,
        transport: Option<Arc<dyn Transport>>,
    ) -> SyncResult<Self> {
        config
            .validate()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        let threads = config.threads;
        let ranks = transport.as_ref().map(|t| t.num_ranks()).unwrap_or(1);
        let num_ranks = RankInfo::new(ranks, threads);
        if rank >= ranks {
            return Err(SyncError::RankOutOfRange {
                rank,
                num_ranks: ranks,
            });
        }
        let multi_rank = ranks > 1;

        let clocks: Vec<Arc<Clock>> = (0..threads).map(|_| Arc::new(Clock::new())).collect();
        let vortices: Vec<Arc<Mutex<TimeVortex>>> = (0..threads)
            .map(|_| Arc::new(Mutex::new(TimeVortex::new())))
            .collect();

        let exit = Arc::new(Exit::new(
            threads,
            TimeConverter::new(config.exit_check_period),
            !multi_rank,
            clocks.clone(),
            if multi_rank { transport.clone() } else { None },
        ));

        let barrier = Arc::new(Barrier::new(threads as usize));
        let thread_barrier = Arc::new(Barrier::new(threads as usize));

        let rank_sync = Arc::new(if multi_rank {
            RankSync::serial_skip(
                rank,
                transport.expect("multi-rank runs carry a transport"),
                vortices.clone(),
                Arc::clone(&clocks[0]),
                TimeConverter::new(config.min_cross_rank_latency),
                config.outbox_watermark,
            )
        } else {
            RankSync::empty()
        });

        let managers = (0..threads)
            .map(|thread| {
                let worker = RankInfo::new(rank, thread);
                let sim = Simulation::new(
                    worker,
                    Arc::clone(&clocks[thread as usize]),
                    Arc::clone(&vortices[thread as usize]),
                    Arc::clone(&exit),
                );
                SyncManager::new(
                    worker,
                    num_ranks,
                    Arc::clone(&barrier),
                    Arc::clone(&thread_barrier),
                    &config.inter_thread_latencies,
                    Arc::clone(&rank_sync),
                    Arc::clone(&exit),
                    sim,
                )
            })
            .collect();

        Ok(Self {
            rank,
            num_ranks,
            config,
            clocks,
            vortices,
            exit,
            barrier,
            thread_barrier,
            rank_sync,
            managers,
            handlers: (0..threads).map(|_| HashMap::new()).collect(),
            registered_links: HashSet::new(),
            init_msg: Arc::new(AtomicI64::new(0)),
        })
    }

    /// This engine's rank.
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// The run topology.
    pub fn num_ranks(&self) -> RankInfo {
        self.num_ranks
    }

    /// The configuration this engine was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The rank's termination detector, for component registration.
    pub fn exit(&self) -> Arc<Exit> {
        Arc::clone(&self.exit)
    }

    /// The sync manager's barrier; its generation is observable for
    /// validating the epoch protocol.
    pub fn manager_barrier(&self) -> Arc<Barrier> {
        Arc::clone(&self.barrier)
    }

    /// A simulation handle for `thread`, for scheduling initial activity.
    pub fn simulation(&self, thread: u32) -> Simulation {
        assert!(thread < self.num_ranks.thread, "thread out of range");
        Simulation::new(
            RankInfo::new(self.rank, thread),
            Arc::clone(&self.clocks[thread as usize]),
            Arc::clone(&self.vortices[thread as usize]),
            Arc::clone(&self.exit),
        )
    }

    /// Wires one link of the partitioned graph through the right substrate.
    ///
    /// Every rank processes the full link table; the call returns the
    /// send-side [`Link`] when the sending endpoint lives on this rank and
    /// `None` otherwise. Links whose endpoints both live elsewhere are
    /// recorded for duplicate detection only.
    pub fn connect(&mut self, spec: LinkSpec) -> SyncResult<Option<Arc<Link>>> {
        if !self.registered_links.insert(spec.id) {
            return Err(SyncError::DuplicateLink(spec.id));
        }

        let crossing = spec.from != spec.to;
        if crossing && spec.latency == 0 {
            return Err(SyncError::ZeroLatencyLink(spec.id));
        }
        for endpoint in [spec.from, spec.to] {
            if endpoint.rank == self.rank && endpoint.thread >= self.num_ranks.thread {
                return Err(SyncError::ThreadOutOfRange {
                    thread: endpoint.thread,
                    threads: self.num_ranks.thread,
                });
            }
        }

        let mine_from = spec.from.rank == self.rank;
        let mine_to = spec.to.rank == self.rank;
        if !mine_from && !mine_to {
            return Ok(None);
        }

        if spec.from.rank == spec.to.rank {
            if spec.from.thread == spec.to.thread {
                // Both endpoints on one worker: direct insert.
                let queue = ActivityQueue::Local(Arc::clone(&self.vortices[spec.to.thread as usize]));
                let link = Link::new(
                    spec.id,
                    spec.latency,
                    queue,
                    Arc::clone(&self.clocks[spec.from.thread as usize]),
                );
                debug!(link = spec.id, "local link wired");
                return Ok(Some(Arc::new(link)));
            }

            // Same rank, different thread: register the receive side with
            // the destination worker's thread tier, send into the inbox it
            // offers the sending thread.
            let receive = Link::new(
                spec.id,
                0,
                ActivityQueue::Local(Arc::clone(&self.vortices[spec.to.thread as usize])),
                Arc::clone(&self.clocks[spec.to.thread as usize]),
            );
            let dest = &mut self.managers[spec.to.thread as usize];
            dest.thread_sync_mut().register_link(spec.id, receive);
            let queue = dest.thread_sync().queue_for_thread(spec.from.thread);

            let link = Link::new(
                spec.id,
                spec.latency,
                queue,
                Arc::clone(&self.clocks[spec.from.thread as usize]),
            );
            debug!(link = spec.id, "cross-thread link wired");
            return Ok(Some(Arc::new(link)));
        }

        // Crossing ranks: exactly one endpoint is local.
        if mine_from {
            let queue = self.rank_sync.register_link(spec.to, spec.from, spec.id, None);
            let link = Link::new(
                spec.id,
                spec.latency,
                queue,
                Arc::clone(&self.clocks[spec.from.thread as usize]),
            );
            debug!(link = spec.id, to_rank = spec.to.rank, "cross-rank link wired (outbound)");
            Ok(Some(Arc::new(link)))
        } else {
            let receive = Link::new(
                spec.id,
                0,
                ActivityQueue::Local(Arc::clone(&self.vortices[spec.to.thread as usize])),
                Arc::clone(&self.clocks[spec.to.thread as usize]),
            );
            self.rank_sync
                .register_link(spec.to, spec.from, spec.id, Some(receive));
            debug!(link = spec.id, from_rank = spec.from.rank, "cross-rank link wired (inbound)");
            Ok(None)
        }
    }

    /// Installs the delivery handler for a link owned by `thread`.
    pub fn register_handler(
        &mut self,
        thread: u32,
        link_id: LinkId,
        handler: impl FnMut(Event) + Send + 'static,
    ) -> SyncResult<()> {
        if thread >= self.num_ranks.thread {
            return Err(SyncError::ThreadOutOfRange {
                thread,
                threads: self.num_ranks.thread,
            });
        }
        let slot = self.handlers[thread as usize].entry(link_id);
        match slot {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(SyncError::DuplicateHandler(link_id))
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    /// Runs the simulation until termination or `max_time`.
    ///
    /// Spawns one OS thread per worker. Init data is exchanged to global
    /// quiescence, link configuration is frozen, and then each worker
    /// drives its event loop. Consumes the engine; all sync state is torn
    /// down when the run ends.
    pub fn run(self, max_time: SimTime) -> SyncResult<EngineReport> {
        let single_worker = self.num_ranks.rank == 1 && self.num_ranks.thread == 1;
        let exit_period = self.exit.check_period().factor();

        let workers: Vec<WorkerState> = self
            .managers
            .into_iter()
            .zip(self.handlers)
            .enumerate()
            .map(|(thread, (manager, handlers))| WorkerState {
                thread: thread as u32,
                manager,
                handlers,
                sim: Simulation::new(
                    RankInfo::new(self.rank, thread as u32),
                    Arc::clone(&self.clocks[thread]),
                    Arc::clone(&self.vortices[thread]),
                    Arc::clone(&self.exit),
                ),
                barrier: Arc::clone(&self.barrier),
                thread_barrier: Arc::clone(&self.thread_barrier),
                init_msg: Arc::clone(&self.init_msg),
                max_time,
                single_worker,
                exit_period,
            })
            .collect();

        let results: Vec<SyncResult<WorkerReport>> = std::thread::scope(|scope| {
            let handles: Vec<_> = workers
                .into_iter()
                .map(|worker| scope.spawn(move || worker_main(worker)))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        });

        let mut report = EngineReport {
            rank: self.rank,
            rank_epochs: self.rank_sync.epochs(),
            rank_events_sent: self.rank_sync.events_sent(),
            rank_events_received: self.rank_sync.events_received(),
            barrier_generation: self.barrier.generation(),
            ..EngineReport::default()
        };
        for result in results {
            let worker = result?;
            report.events_delivered += worker.delivered;
            report.final_time = report.final_time.max(worker.final_time);
            if let Some(end) = worker.end_time {
                report.end_time = Some(report.end_time.map_or(end, |t: SimTime| t.max(end)));
            }
        }
        info!(
            rank = self.rank,
            end_time = ?report.end_time,
            events = report.events_delivered,
            "run complete"
        );
        Ok(report)
    }
}

struct WorkerState {
    thread: u32,
    manager: SyncManager,
    handlers: HashMap<LinkId, EventHandler>,
    sim: Simulation,
    barrier: Arc<Barrier>,
    thread_barrier: Arc<Barrier>,
    init_msg: Arc<AtomicI64>,
    max_time: SimTime,
    single_worker: bool,
    exit_period: SimTime,
}

struct WorkerReport {
    delivered: u64,
    end_time: Option<SimTime>,
    final_time: SimTime,
}

/// Aborts the worker's barriers when the worker unwinds, so peers parked in
/// a wait unwind too instead of spinning forever.
struct PoisonGuard {
    barriers: [Arc<Barrier>; 2],
}

impl Drop for PoisonGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            for barrier in &self.barriers {
                barrier.abort();
            }
        }
    }
}

fn worker_main(mut state: WorkerState) -> SyncResult<WorkerReport> {
    let _poison = PoisonGuard {
        barriers: [
            Arc::clone(&state.barrier),
            Arc::clone(&state.thread_barrier),
        ],
    };

    // Init phase: exchange link init data until no rank moves a message.
    loop {
        state.init_msg.store(0, Ordering::Release);
        state.manager.exchange_link_init_data(&state.init_msg)?;
        let quiescent = state.init_msg.load(Ordering::Acquire) == 0;
        // Everyone samples the round's tally before anyone resets it.
        state.barrier.wait();
        if quiescent {
            break;
        }
    }

    state.manager.finalize_link_configurations();
    if state.single_worker {
        state
            .sim
            .insert_activity(state.exit_period, EXIT_PRIORITY, Activity::ExitCheck);
    }

    let clock = state.sim.clock();
    let exit = Arc::clone(state.sim.exit());
    let mut delivered = 0u64;
    let mut end_time = None;

    loop {
        if exit.terminated() {
            end_time = Some(exit.end_time());
            break;
        }

        let next = {
            let vortex = state.sim.vortex();
            let mut vortex = vortex.lock();
            match vortex.peek_time() {
                Some(time) if time <= state.max_time => vortex.pop(),
                _ => None,
            }
        };
        let Some(scheduled) = next else {
            break;
        };
        clock.advance_to(scheduled.key.time);

        match scheduled.activity {
            Activity::Event(event) => {
                let Some(handler) = state.handlers.get_mut(&event.link_id) else {
                    panic!(
                        "event delivered on link {} with no registered handler",
                        event.link_id
                    );
                };
                handler(event);
                delivered += 1;
            }
            Activity::SyncEpoch => {
                if let Some(end) = state.manager.execute()? {
                    end_time = Some(end);
                    break;
                }
            }
            Activity::ExitCheck => {
                if exit.ref_count() == 0 {
                    exit.publish_end();
                    end_time = Some(exit.end_time());
                    break;
                }
                let now = clock.now();
                state
                    .sim
                    .insert_activity(now + state.exit_period, EXIT_PRIORITY, Activity::ExitCheck);
            }
        }
    }

    debug!(thread = state.thread, delivered, ?end_time, "worker finished");
    Ok(WorkerReport {
        delivered,
        end_time,
        final_time: clock.now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_monotonically() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);
        clock.advance_to(10);
        clock.advance_to(10);
        clock.advance_to(25);
        assert_eq!(clock.now(), 25);
    }

    #[test]
    fn test_engine_rejects_out_of_range_rank() {
        let err = Engine::new(3, EngineConfig::single_thread(), None).unwrap_err();
        assert!(matches!(err, SyncError::RankOutOfRange { rank: 3, .. }));
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let config = EngineConfig {
            threads: 2,
            inter_thread_latencies: Vec::new(),
            ..EngineConfig::default()
        };
        let err = Engine::new(0, config, None).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[test]
    fn test_connect_skips_foreign_links() {
        let mut engine = Engine::new(0, EngineConfig::single_thread(), None).unwrap();
        let elsewhere = engine
            .connect(LinkSpec::new(
                5,
                RankInfo::new(2, 0),
                RankInfo::new(3, 0),
                10,
            ))
            .unwrap();
        assert!(elsewhere.is_none());

        // Still recorded for duplicate detection.
        let err = engine
            .connect(LinkSpec::new(
                5,
                RankInfo::new(0, 0),
                RankInfo::new(0, 0),
                0,
            ))
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateLink(5)));
    }

    #[test]
    fn test_report_stats_export() {
        let report = EngineReport {
            rank: 1,
            end_time: Some(250),
            final_time: 300,
            events_delivered: 12,
            ..EngineReport::default()
        };
        let stats = report.export_stats();
        assert_eq!(stats["engine"]["rank"], 1);
        assert_eq!(stats["engine"]["end_time"], 250);
        assert_eq!(stats["engine"]["events_delivered"], 12);
    }
}
