//! Synchronous-write durability engine.
//!
//! Tracks pending synchronous writes and per-replica acknowledgement
//! positions, and decides when each write's durability requirement is
//! satisfied over the registered replication chain(s).

mod chain;
mod monitor;
mod types;

pub use chain::{ReplicationChain, MAX_CHAIN_NODES};
pub use monitor::{DurabilityMonitor, NodeSeqnos};
pub use types::{
    AbortReason, DurabilityError, DurabilityLevel, Requirements, Resolution, ResolutionKind,
    Tracking,
};
