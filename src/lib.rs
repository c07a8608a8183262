//! # Lockstep
//!
//! The conservative two-tier synchronization core of a parallel
//! discrete-event simulator. Components exchange timestamped events over
//! links; the engine advances a global virtual clock while preserving
//! causal ordering across all components, whether they share a worker
//! thread, a rank, or neither.
//!
//! ## Design
//!
//! - **Two tiers**: a thread tier flushes cross-thread queues inside one
//!   rank; a rank tier exchanges events across the message-passing fabric
//!   and computes the global horizon.
//! - **Sync as an event**: each worker's [`SyncManager`] arms itself in the
//!   worker's own time-ordered queue and fires in order with simulation
//!   activity, so epochs interleave naturally with event delivery.
//! - **Skip-ahead**: link-latency floors prove intervals empty of events,
//!   letting virtual time jump past them without barriers.
//! - **Termination**: a distributed reference count ([`Exit`]) that cannot
//!   fire while events remain undelivered, checked at sync epochs.

pub mod barrier;
pub mod config;
pub mod error;
pub mod event;
pub mod exit;
pub mod link;
pub mod queue;
pub mod rank_sync;
pub mod simulation;
pub mod sync_manager;
pub mod thread_sync;
pub mod time;
pub mod transport;
pub mod types;
pub mod vortex;
pub mod wire;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{SyncError, SyncResult};
pub use event::{Activity, Event, DEFAULT_PRIORITY, EXIT_PRIORITY, SYNC_PRIORITY};
pub use exit::Exit;
pub use link::Link;
pub use simulation::{Clock, Engine, EngineReport, EventHandler, LinkSpec, Simulation};
pub use sync_manager::{SyncKind, SyncManager};
pub use time::TimeConverter;
pub use transport::{MemoryTransport, Transport};
pub use types::{ComponentId, LinkId, Priority, RankInfo, SimTime, MAX_SIM_TIME};
pub use vortex::TimeVortex;
