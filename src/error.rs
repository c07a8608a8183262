//! Error taxonomy of the synchronization core.
//!
//! Configuration-time mistakes surface as `Result`s from the bootstrap
//! APIs. Mistakes detected on the epoch hot path — an unknown link during a
//! flush, a tripwire queue touched, a reference-count underflow — are
//! programmer errors and abort with a diagnostic instead. Transport faults
//! discovered inside a barrier region are parked until the barriers have
//! released and then fail the run through these types.

use thiserror::Error;

use crate::transport::TransportError;
use crate::types::{LinkId, SimTime};
use crate::wire::WireError;

/// Errors surfaced by the synchronization core.
#[derive(Clone, Debug, Error)]
pub enum SyncError {
    #[error("link {0} is already registered")]
    DuplicateLink(LinkId),

    #[error("a handler for link {0} is already registered")]
    DuplicateHandler(LinkId),

    #[error("link table is frozen; links must be connected before the run starts")]
    LinkTableFrozen,

    #[error("link {0} crosses a thread or rank boundary and must have a positive latency")]
    ZeroLatencyLink(LinkId),

    #[error("rank {rank} is out of range for a {num_ranks}-rank run")]
    RankOutOfRange { rank: u32, num_ranks: u32 },

    #[error("thread {thread} is out of range for a {threads}-thread rank")]
    ThreadOutOfRange { thread: u32, threads: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sync epoch mismatch: expected epoch {expected} from rank {peer}, got {got}")]
    EpochMismatch { peer: u32, expected: u64, got: u64 },

    #[error("inbound event addressed to unknown link {0}")]
    UnknownLink(LinkId),

    #[error("event on link {link} arrived in the past (delivery {delivery}, now {now})")]
    PastDelivery {
        link: LinkId,
        delivery: SimTime,
        now: SimTime,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed sync frame: {0}")]
    Wire(#[from] WireError),
}

/// Result alias for sync-core operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = SyncError::DuplicateLink(42);
        assert_eq!(err.to_string(), "link 42 is already registered");

        let err = SyncError::EpochMismatch {
            peer: 3,
            expected: 10,
            got: 9,
        };
        assert!(err.to_string().contains("rank 3"));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_transport_error_converts() {
        let err: SyncError = TransportError::Disconnected(2).into();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
