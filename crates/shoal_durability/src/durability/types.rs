//! Shared types for the durability engine.
//!
//! These are kept in a small, dependency-light module because they are
//! used by both the monitor itself and the store-side write path that
//! feeds it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Tracking discipline for node acknowledgements.
///
/// A node acknowledges seqnos separately for what it has received in
/// memory and for what it has written to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tracking {
    Memory,
    Disk,
}

impl fmt::Display for Tracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tracking::Memory => f.write_str("memory"),
            Tracking::Disk => f.write_str("disk"),
        }
    }
}

/// Durability level requested for a synchronous write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DurabilityLevel {
    /// Commit once a majority of chain nodes hold the write in memory.
    Majority,
    /// Commit once the active and a majority of the replicas have
    /// written the write to disk.
    PersistToMajority,
}

/// Durability requirement carried by a mutation.
///
/// The timeout is accepted and stored; its expiry runner lives outside
/// the engine and drives [`DurabilityMonitor::abort`] when it fires.
///
/// [`DurabilityMonitor::abort`]: super::DurabilityMonitor::abort
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Requirements {
    pub level: DurabilityLevel,
    pub timeout: Option<Duration>,
}

impl Requirements {
    pub fn majority() -> Self {
        Self {
            level: DurabilityLevel::Majority,
            timeout: None,
        }
    }

    pub fn persist_to_majority() -> Self {
        Self {
            level: DurabilityLevel::PersistToMajority,
            timeout: None,
        }
    }
}

/// Cause of an externally-driven abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// The outcome of the write is unknown (e.g. the owning partition
    /// died while the write was in flight).
    Ambiguous,
    /// The requirement can no longer be met (e.g. the topology shrank
    /// below the requested quorum).
    Impossible,
}

/// How a tracked write was finalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionKind {
    Commit,
    Abort(AbortReason),
}

/// Terminal outcome of a tracked write, handed back to the caller.
///
/// The monitor never invokes client-visible callbacks itself: callers
/// apply resolutions after dropping every lock they hold.
#[derive(Debug)]
pub struct Resolution<C> {
    pub key: Vec<u8>,
    pub seqno: u64,
    pub cookie: Option<C>,
    pub kind: ResolutionKind,
}

/// Internal protocol/invariant violations.
///
/// These are programmer or peer errors, not client-visible statuses:
/// the owning partition treats most of them as fatal for itself.
#[derive(Debug, Error)]
pub enum DurabilityError {
    #[error("empty replication chain")]
    EmptyChain,
    #[error("too many nodes in chain: {0}")]
    TooManyNodes(usize),
    #[error("duplicate node in chain: {0}")]
    DuplicateNode(String),
    #[error("no replication chain registered")]
    NoChain,
    #[error("no tracked sync write: ack from {node} (memory {memory_seqno}, disk {disk_seqno})")]
    NoTrackedSyncWrite {
        node: String,
        memory_seqno: u64,
        disk_seqno: u64,
    },
    #[error("unknown node in ack: {0}")]
    UnknownNode(String),
    #[error("monotonic {tracking} ack violated for {node}: last {last}, received {received}")]
    NonMonotonicAck {
        node: String,
        tracking: Tracking,
        last: u64,
        received: u64,
    },
    #[error("ack from {node} has memory seqno {memory_seqno} < disk seqno {disk_seqno}")]
    MemoryBelowDisk {
        node: String,
        memory_seqno: u64,
        disk_seqno: u64,
    },
    #[error("prepare seqno {seqno} does not exceed last tracked seqno {last}")]
    NonMonotonicPrepare { seqno: u64, last: u64 },
    #[error("no tracked sync write at seqno {0}")]
    NoSuchPrepare(u64),
}
