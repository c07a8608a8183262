//! Inter-rank message-passing fabric.
//!
//! The rank tier talks to its peers through the [`Transport`] trait: a
//! bidirectional per-peer exchange plus the global reduction the
//! termination detector needs. Calls have no timeout — a stuck peer stalls
//! the run, which is a documented limitation of the conservative protocol.
//!
//! [`MemoryTransport`] wires a cluster of in-process ranks together over
//! channels, which is how multi-rank runs are built in one process and how
//! the integration tests exercise the rank tier.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::types::SimTime;

/// Fabric faults. All of them are fatal for the run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer rank {0} is not part of this fabric")]
    UnknownPeer(u32),

    #[error("connection to peer rank {0} closed mid-exchange")]
    Disconnected(u32),
}

/// One rank's view of the message-passing fabric.
pub trait Transport: Send + Sync {
    /// This rank's id within the fabric.
    fn rank(&self) -> u32;

    /// Number of ranks in the fabric.
    fn num_ranks(&self) -> u32;

    /// Sends `frame` to `peer` and returns the frame `peer` sent back.
    ///
    /// Both sides of a pair call this for each other during the same epoch;
    /// the send is posted before the receive so the pairwise exchange
    /// cannot deadlock regardless of arrival order.
    fn sendrecv(&self, peer: u32, frame: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// Global `(sum, max)` reduction.
    ///
    /// Used by the termination check (reference counts and end times) and
    /// by the init-data quiescence loop. Every rank contributes exactly
    /// once per call site; the result is identical on all ranks.
    fn reduce(&self, count: u64, end_time: SimTime) -> Result<(u64, SimTime), TransportError>;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport(rank {}/{})", self.rank(), self.num_ranks())
    }
}

/// In-process fabric connecting the ranks of one cluster over channels.
pub struct MemoryTransport {
    rank: u32,
    num_ranks: u32,
    senders: Vec<Option<Sender<Vec<u8>>>>,
    receivers: Vec<Option<Receiver<Vec<u8>>>>,
    reducer: Arc<ExitReducer>,
}

impl MemoryTransport {
    /// Builds a fully connected cluster of `num_ranks` transports.
    pub fn cluster(num_ranks: u32) -> Vec<Arc<MemoryTransport>> {
        assert!(num_ranks > 0, "a cluster needs at least one rank");
        let n = num_ranks as usize;
        let reducer = Arc::new(ExitReducer::new(num_ranks));

        let mut senders: Vec<Vec<Option<Sender<Vec<u8>>>>> = (0..n)
            .map(|_| (0..n).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Receiver<Vec<u8>>>>> = (0..n)
            .map(|_| (0..n).map(|_| None).collect())
            .collect();

        for from in 0..n {
            for to in 0..n {
                if from == to {
                    continue;
                }
                let (tx, rx) = unbounded();
                senders[from][to] = Some(tx);
                receivers[to][from] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| {
                Arc::new(MemoryTransport {
                    rank: rank as u32,
                    num_ranks,
                    senders,
                    receivers,
                    reducer: Arc::clone(&reducer),
                })
            })
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn num_ranks(&self) -> u32 {
        self.num_ranks
    }

    fn sendrecv(&self, peer: u32, frame: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let tx = self
            .senders
            .get(peer as usize)
            .and_then(|s| s.as_ref())
            .ok_or(TransportError::UnknownPeer(peer))?;
        let rx = self
            .receivers
            .get(peer as usize)
            .and_then(|r| r.as_ref())
            .ok_or(TransportError::UnknownPeer(peer))?;

        tx.send(frame)
            .map_err(|_| TransportError::Disconnected(peer))?;
        rx.recv().map_err(|_| TransportError::Disconnected(peer))
    }

    fn reduce(&self, count: u64, end_time: SimTime) -> Result<(u64, SimTime), TransportError> {
        Ok(self.reducer.reduce(count, end_time))
    }
}

/// Rendezvous cell implementing the cluster-wide `(sum, max)` reduction.
struct ExitReducer {
    parties: u32,
    state: Mutex<ReduceState>,
    all_arrived: Condvar,
}

#[derive(Default)]
struct ReduceState {
    arrived: u32,
    sum: u64,
    max_end: SimTime,
    round: u64,
    result_sum: u64,
    result_max: SimTime,
}

impl ExitReducer {
    fn new(parties: u32) -> Self {
        Self {
            parties,
            state: Mutex::new(ReduceState::default()),
            all_arrived: Condvar::new(),
        }
    }

    fn reduce(&self, count: u64, end_time: SimTime) -> (u64, SimTime) {
        let mut state = self.state.lock();
        state.sum += count;
        state.max_end = state.max_end.max(end_time);
        state.arrived += 1;

        let round = state.round;
        if state.arrived == self.parties {
            state.result_sum = state.sum;
            state.result_max = state.max_end;
            state.sum = 0;
            state.max_end = 0;
            state.arrived = 0;
            state.round += 1;
            self.all_arrived.notify_all();
            (state.result_sum, state.result_max)
        } else {
            while state.round == round {
                self.all_arrived.wait(&mut state);
            }
            (state.result_sum, state.result_max)
        }
    }
}
