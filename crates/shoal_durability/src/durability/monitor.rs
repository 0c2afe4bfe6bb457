//! The durability monitor: tracked prepares and per-node ack positions.
//!
//! The monitor holds the append-only list of pending synchronous writes
//! for one partition, in strictly ascending seqno, plus one position per
//! chain node and tracking discipline. Acknowledgements advance
//! positions; whenever the head of the list satisfies its durability
//! requirement on every registered chain, it is removed and returned to
//! the caller as a commit [`Resolution`].
//!
//! All state changes happen under one internal mutex. The monitor never
//! invokes client callbacks: resolutions are applied by the caller after
//! it has dropped its own locks.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::chain::ReplicationChain;
use super::types::{
    AbortReason, DurabilityError, DurabilityLevel, Resolution, ResolutionKind, Tracking,
};

/// Per-discipline position of one node over the tracked list.
#[derive(Clone, Copy, Debug, Default)]
struct Position {
    /// Seqno of the last tracked write at or below the node's ack.
    write_seqno: u64,
    /// Last raw seqno acknowledged by the node.
    ack_seqno: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct NodePositions {
    memory: Position,
    disk: Position,
}

/// The `{memory, disk}` seqno pair reported by the introspection
/// accessors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeSeqnos {
    pub memory: u64,
    pub disk: u64,
}

/// A pending synchronous write awaiting quorum.
#[derive(Debug)]
struct TrackedWrite<C> {
    key: Vec<u8>,
    seqno: u64,
    level: DurabilityLevel,
    cookie: Option<C>,
}

/// One registered chain plus its per-node tracking state.
#[derive(Debug)]
struct ChainState {
    chain: ReplicationChain,
    positions: HashMap<String, NodePositions>,
}

impl ChainState {
    fn new(chain: ReplicationChain) -> Self {
        let positions = chain
            .nodes()
            .iter()
            .map(|n| (n.clone(), NodePositions::default()))
            .collect();
        Self { chain, positions }
    }
}

#[derive(Debug)]
struct MonitorState<C> {
    first_chain: Option<ChainState>,
    second_chain: Option<ChainState>,
    tracked: VecDeque<TrackedWrite<C>>,
}

impl<C> MonitorState<C> {
    /// Seqno of the last tracked write at or below `seqno`, 0 if none.
    fn last_tracked_at_or_below(&self, seqno: u64) -> u64 {
        self.tracked
            .iter()
            .take_while(|w| w.seqno <= seqno)
            .last()
            .map(|w| w.seqno)
            .unwrap_or(0)
    }

    fn chains(&self) -> impl Iterator<Item = &ChainState> {
        self.first_chain.iter().chain(self.second_chain.iter())
    }

    fn chains_mut(&mut self) -> impl Iterator<Item = &mut ChainState> {
        self.first_chain
            .iter_mut()
            .chain(self.second_chain.iter_mut())
    }

    /// True when `write` satisfies its durability requirement on every
    /// registered chain.
    fn is_committable(&self, write: &TrackedWrite<C>) -> bool {
        let mut any = false;
        for chain_state in self.chains() {
            any = true;
            if !Self::committable_on_chain(chain_state, write) {
                return false;
            }
        }
        any
    }

    fn committable_on_chain(chain_state: &ChainState, write: &TrackedWrite<C>) -> bool {
        match write.level {
            DurabilityLevel::Majority => {
                let acked = chain_state
                    .positions
                    .values()
                    .filter(|p| p.memory.ack_seqno >= write.seqno)
                    .count();
                acked >= chain_state.chain.quorum()
            }
            DurabilityLevel::PersistToMajority => {
                // The active must have persisted, and so must a
                // majority of the replicas (not of the whole chain).
                let active = chain_state.chain.active();
                let active_acked = chain_state
                    .positions
                    .get(active)
                    .map(|p| p.disk.ack_seqno >= write.seqno)
                    .unwrap_or(false);
                let replicas = chain_state.chain.size() - 1;
                let required = if replicas == 0 { 0 } else { replicas / 2 + 1 };
                let acked = chain_state
                    .positions
                    .iter()
                    .filter(|(node, p)| *node != active && p.disk.ack_seqno >= write.seqno)
                    .count();
                active_acked && acked >= required
            }
        }
    }

    /// Remove every committable write from the head of the list and
    /// return the corresponding commit resolutions, in seqno order.
    fn sweep_commits(&mut self) -> Vec<Resolution<C>> {
        let mut out = Vec::new();
        while let Some(head) = self.tracked.front() {
            if !self.is_committable(head) {
                break;
            }
            let write = self.tracked.pop_front().expect("head checked above");
            out.push(Resolution {
                key: write.key,
                seqno: write.seqno,
                cookie: write.cookie,
                kind: ResolutionKind::Commit,
            });
        }
        out
    }
}

/// Tracks pending synchronous writes for one partition and decides when
/// each one's durability requirement is satisfied.
///
/// `C` is the caller's opaque completion token, handed back inside the
/// [`Resolution`] when the write finalizes.
#[derive(Debug)]
pub struct DurabilityMonitor<C> {
    state: Mutex<MonitorState<C>>,
}

impl<C> Default for DurabilityMonitor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DurabilityMonitor<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                first_chain: None,
                second_chain: None,
                tracked: VecDeque::new(),
            }),
        }
    }

    /// Registers (or replaces) the first replication chain.
    ///
    /// Per-node positions are reset to the head of the tracked list with
    /// ack seqno 0.
    pub fn register_replication_chain(&self, nodes: Vec<String>) -> Result<(), DurabilityError> {
        let chain = ReplicationChain::new(nodes)?;
        tracing::debug!(nodes = ?chain.nodes(), "replication chain registered");
        let mut state = self.state.lock().expect("durability monitor poisoned");
        state.first_chain = Some(ChainState::new(chain));
        Ok(())
    }

    /// Registers or clears the second chain used during topology change.
    ///
    /// While a second chain is registered, commit requires quorum on
    /// both chains.
    pub fn register_second_chain(
        &self,
        nodes: Option<Vec<String>>,
    ) -> Result<(), DurabilityError> {
        let chain_state = match nodes {
            Some(nodes) => Some(ChainState::new(ReplicationChain::new(nodes)?)),
            None => None,
        };
        let mut state = self.state.lock().expect("durability monitor poisoned");
        state.second_chain = chain_state;
        Ok(())
    }

    /// Starts tracking a new synchronous write.
    ///
    /// Expected to be called after the prepare has been inserted into
    /// the partition's in-memory index and enqueued into its checkpoint
    /// queue. Because of that ordering the active has, by construction,
    /// the write in memory already: its memory position is advanced to
    /// the new seqno on every registered chain. The disk position is
    /// only advanced by [`notify_persisted`].
    ///
    /// [`notify_persisted`]: Self::notify_persisted
    pub fn add_sync_write(
        &self,
        cookie: Option<C>,
        key: Vec<u8>,
        seqno: u64,
        level: DurabilityLevel,
    ) -> Result<(), DurabilityError> {
        let mut state = self.state.lock().expect("durability monitor poisoned");
        if state.first_chain.is_none() {
            return Err(DurabilityError::NoChain);
        }
        if let Some(last) = state.tracked.back() {
            if seqno <= last.seqno {
                return Err(DurabilityError::NonMonotonicPrepare {
                    seqno,
                    last: last.seqno,
                });
            }
        }
        state.tracked.push_back(TrackedWrite {
            key,
            seqno,
            level,
            cookie,
        });
        for chain_state in state.chains_mut() {
            let active = chain_state.chain.active().to_string();
            let pos = chain_state.positions.entry(active).or_default();
            pos.memory.write_seqno = seqno;
            pos.memory.ack_seqno = seqno;
        }
        Ok(())
    }

    /// Records a replica acknowledgement at both tracking disciplines
    /// and returns the writes committed as a consequence.
    pub fn seqno_ack_received(
        &self,
        node: &str,
        memory_seqno: u64,
        disk_seqno: u64,
    ) -> Result<Vec<Resolution<C>>, DurabilityError> {
        let mut state = self.state.lock().expect("durability monitor poisoned");
        if state.tracked.is_empty() {
            return Err(DurabilityError::NoTrackedSyncWrite {
                node: node.to_string(),
                memory_seqno,
                disk_seqno,
            });
        }
        if memory_seqno < disk_seqno {
            return Err(DurabilityError::MemoryBelowDisk {
                node: node.to_string(),
                memory_seqno,
                disk_seqno,
            });
        }

        // Validate before mutating so a rejected ack leaves no trace.
        let mut known = false;
        for chain_state in state.chains() {
            let Some(pos) = chain_state.positions.get(node) else {
                continue;
            };
            known = true;
            for (tracking, seqno, current) in [
                (Tracking::Memory, memory_seqno, pos.memory.ack_seqno),
                (Tracking::Disk, disk_seqno, pos.disk.ack_seqno),
            ] {
                if seqno < current {
                    return Err(DurabilityError::NonMonotonicAck {
                        node: node.to_string(),
                        tracking,
                        last: current,
                        received: seqno,
                    });
                }
            }
        }
        if !known {
            return Err(DurabilityError::UnknownNode(node.to_string()));
        }

        let memory_write = state.last_tracked_at_or_below(memory_seqno);
        let disk_write = state.last_tracked_at_or_below(disk_seqno);
        for chain_state in state.chains_mut() {
            let Some(pos) = chain_state.positions.get_mut(node) else {
                continue;
            };
            pos.memory.ack_seqno = memory_seqno;
            pos.memory.write_seqno = pos.memory.write_seqno.max(memory_write);
            pos.disk.ack_seqno = disk_seqno;
            pos.disk.write_seqno = pos.disk.write_seqno.max(disk_write);
        }

        Ok(state.sweep_commits())
    }

    /// Persistence hook: the local store has made every seqno up to
    /// `seqno` durable. Advances the active's disk position on every
    /// registered chain and returns the writes committed as a
    /// consequence.
    pub fn notify_persisted(&self, seqno: u64) -> Vec<Resolution<C>> {
        let mut state = self.state.lock().expect("durability monitor poisoned");
        let disk_write = state.last_tracked_at_or_below(seqno);
        for chain_state in state.chains_mut() {
            let active = chain_state.chain.active().to_string();
            let pos = chain_state.positions.entry(active).or_default();
            pos.disk.ack_seqno = pos.disk.ack_seqno.max(seqno);
            pos.disk.write_seqno = pos.disk.write_seqno.max(disk_write);
        }
        state.sweep_commits()
    }

    /// Stops tracking the write at `seqno` and returns its abort
    /// resolution. Driven by the external timeout/teardown policy.
    pub fn abort(&self, seqno: u64, reason: AbortReason) -> Result<Resolution<C>, DurabilityError> {
        let mut state = self.state.lock().expect("durability monitor poisoned");
        let idx = state
            .tracked
            .iter()
            .position(|w| w.seqno == seqno)
            .ok_or(DurabilityError::NoSuchPrepare(seqno))?;
        let write = state.tracked.remove(idx).expect("index from position");
        Ok(Resolution {
            key: write.key,
            seqno: write.seqno,
            cookie: write.cookie,
            kind: ResolutionKind::Abort(reason),
        })
    }

    /// Aborts every tracked write (partition teardown).
    pub fn abort_all(&self, reason: AbortReason) -> Vec<Resolution<C>> {
        let mut state = self.state.lock().expect("durability monitor poisoned");
        if !state.tracked.is_empty() {
            tracing::debug!(count = state.tracked.len(), "aborting all tracked writes");
        }
        state
            .tracked
            .drain(..)
            .map(|write| Resolution {
                key: write.key,
                seqno: write.seqno,
                cookie: write.cookie,
                kind: ResolutionKind::Abort(reason),
            })
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.state
            .lock()
            .expect("durability monitor poisoned")
            .tracked
            .len()
    }

    /// Size of the first chain, 0 when none is registered.
    pub fn chain_size(&self) -> usize {
        self.state
            .lock()
            .expect("durability monitor poisoned")
            .first_chain
            .as_ref()
            .map(|c| c.chain.size())
            .unwrap_or(0)
    }

    /// Seqnos of the tracked writes currently pointed at by `node`'s
    /// positions on the first chain.
    pub fn node_write_seqnos(&self, node: &str) -> Option<NodeSeqnos> {
        let state = self.state.lock().expect("durability monitor poisoned");
        let pos = state.first_chain.as_ref()?.positions.get(node)?;
        Some(NodeSeqnos {
            memory: pos.memory.write_seqno,
            disk: pos.disk.write_seqno,
        })
    }

    /// Last seqnos acknowledged by `node` on the first chain.
    pub fn node_ack_seqnos(&self, node: &str) -> Option<NodeSeqnos> {
        let state = self.state.lock().expect("durability monitor poisoned");
        let pos = state.first_chain.as_ref()?.positions.get(node)?;
        Some(NodeSeqnos {
            memory: pos.memory.ack_seqno,
            disk: pos.disk.ack_seqno,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVE: &str = "active";
    const REPLICA: &str = "replica";

    fn monitor_with(nodes: &[&str]) -> DurabilityMonitor<u64> {
        let monitor = DurabilityMonitor::new();
        monitor
            .register_replication_chain(nodes.iter().map(|n| n.to_string()).collect())
            .expect("register chain");
        monitor
    }

    fn monitor() -> DurabilityMonitor<u64> {
        monitor_with(&[ACTIVE, REPLICA])
    }

    fn add(monitor: &DurabilityMonitor<u64>, seqno: u64, level: DurabilityLevel) {
        let key = format!("key{seqno}").into_bytes();
        monitor
            .add_sync_write(Some(seqno), key, seqno, level)
            .expect("add sync write");
    }

    fn add_majority(monitor: &DurabilityMonitor<u64>, seqnos: &[u64]) {
        for &seqno in seqnos {
            add(monitor, seqno, DurabilityLevel::Majority);
        }
        assert_eq!(seqnos.len(), monitor.tracked_count());
    }

    fn committed_seqnos(resolutions: &[Resolution<u64>]) -> Vec<u64> {
        resolutions
            .iter()
            .map(|r| {
                assert_eq!(ResolutionKind::Commit, r.kind);
                r.seqno
            })
            .collect()
    }

    #[test]
    fn add_sync_write_tracks_in_order() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 2, 3]);

        // The active implicitly acks memory at admission.
        let ack = monitor.node_ack_seqnos(ACTIVE).expect("active tracked");
        assert_eq!(3, ack.memory);
        assert_eq!(0, ack.disk);
    }

    #[test]
    fn add_sync_write_rejects_non_monotonic_seqno() {
        let monitor = monitor();
        add_majority(&monitor, &[5]);
        let err = monitor
            .add_sync_write(None, b"key".to_vec(), 5, DurabilityLevel::Majority)
            .unwrap_err();
        assert!(matches!(err, DurabilityError::NonMonotonicPrepare { .. }));
    }

    #[test]
    fn add_sync_write_requires_a_chain() {
        let monitor: DurabilityMonitor<u64> = DurabilityMonitor::new();
        let err = monitor
            .add_sync_write(None, b"key".to_vec(), 1, DurabilityLevel::Majority)
            .unwrap_err();
        assert!(matches!(err, DurabilityError::NoChain));
    }

    #[test]
    fn ack_without_tracked_writes_fails() {
        let monitor = monitor();
        let err = monitor.seqno_ack_received(REPLICA, 1, 0).unwrap_err();
        assert!(
            err.to_string().contains("no tracked sync write"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn ack_below_last_ack_fails_without_committing() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 2]);

        // Commits seqno 1 (active + replica = quorum of 2).
        let committed = monitor
            .seqno_ack_received(REPLICA, 1, 0)
            .expect("first ack");
        assert_eq!(vec![1], committed_seqnos(&committed));
        assert_eq!(1, monitor.tracked_count());
        assert_eq!(1, monitor.node_write_seqnos(REPLICA).unwrap().memory);
        assert_eq!(1, monitor.node_ack_seqnos(REPLICA).unwrap().memory);

        let err = monitor.seqno_ack_received(REPLICA, 0, 0).unwrap_err();
        assert!(
            err.to_string().contains("monotonic"),
            "unexpected error: {err}"
        );
        // The rejected ack must not have committed anything.
        assert_eq!(1, monitor.tracked_count());
    }

    #[test]
    fn ack_equal_to_pending_commits_one_at_a_time() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 2, 3]);
        assert_eq!(0, monitor.node_write_seqnos(REPLICA).unwrap().memory);

        for seqno in 1..=3 {
            let committed = monitor.seqno_ack_received(REPLICA, seqno, 0).expect("ack");
            assert_eq!(vec![seqno], committed_seqnos(&committed));
            // Seqno tracking is not lost after commit and removal.
            assert_eq!(seqno, monitor.node_write_seqnos(REPLICA).unwrap().memory);
            assert_eq!(seqno, monitor.node_ack_seqnos(REPLICA).unwrap().memory);
        }
        assert_eq!(0, monitor.tracked_count());

        let err = monitor.seqno_ack_received(REPLICA, 4, 0).unwrap_err();
        assert!(matches!(err, DurabilityError::NoTrackedSyncWrite { .. }));
    }

    #[test]
    fn ack_midway_commits_prefix_continuous_seqnos() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 2, 3]);

        let committed = monitor.seqno_ack_received(REPLICA, 2, 0).expect("ack");
        assert_eq!(vec![1, 2], committed_seqnos(&committed));
        assert_eq!(1, monitor.tracked_count());
        assert_eq!(2, monitor.node_write_seqnos(REPLICA).unwrap().memory);
        assert_eq!(2, monitor.node_ack_seqnos(REPLICA).unwrap().memory);
    }

    #[test]
    fn ack_midway_commits_prefix_sparse_seqnos() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 3, 5]);

        // The ack seqno falls between tracked seqnos: the position lands
        // on the last tracked write at or below it.
        let committed = monitor.seqno_ack_received(REPLICA, 4, 0).expect("ack");
        assert_eq!(vec![1, 3], committed_seqnos(&committed));
        assert_eq!(1, monitor.tracked_count());
        assert_eq!(3, monitor.node_write_seqnos(REPLICA).unwrap().memory);
        assert_eq!(4, monitor.node_ack_seqnos(REPLICA).unwrap().memory);
    }

    #[test]
    fn ack_beyond_last_tracked_continuous_seqnos() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 2, 3]);

        let committed = monitor.seqno_ack_received(REPLICA, 4, 0).expect("ack");
        assert_eq!(vec![1, 2, 3], committed_seqnos(&committed));
        assert_eq!(0, monitor.tracked_count());
        assert_eq!(3, monitor.node_write_seqnos(REPLICA).unwrap().memory);
        assert_eq!(4, monitor.node_ack_seqnos(REPLICA).unwrap().memory);

        let err = monitor.seqno_ack_received(REPLICA, 20, 0).unwrap_err();
        assert!(matches!(err, DurabilityError::NoTrackedSyncWrite { .. }));
    }

    #[test]
    fn ack_beyond_last_tracked_sparse_seqnos() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 3, 5]);

        let committed = monitor.seqno_ack_received(REPLICA, 10, 0).expect("ack");
        assert_eq!(vec![1, 3, 5], committed_seqnos(&committed));
        assert_eq!(5, monitor.node_write_seqnos(REPLICA).unwrap().memory);
        assert_eq!(10, monitor.node_ack_seqnos(REPLICA).unwrap().memory);
    }

    #[test]
    fn ack_with_memory_below_disk_is_rejected() {
        let monitor = monitor();
        add_majority(&monitor, &[1]);
        let err = monitor.seqno_ack_received(REPLICA, 0, 1).unwrap_err();
        assert!(matches!(err, DurabilityError::MemoryBelowDisk { .. }));
    }

    #[test]
    fn ack_from_unknown_node_is_rejected() {
        let monitor = monitor();
        add_majority(&monitor, &[1]);
        let err = monitor.seqno_ack_received("stranger", 1, 0).unwrap_err();
        assert!(matches!(err, DurabilityError::UnknownNode(_)));
    }

    #[test]
    fn persist_to_majority_gates_on_active_disk_ack() {
        let monitor = monitor_with(&[ACTIVE, "r1", "r2"]);
        add(&monitor, 5, DurabilityLevel::PersistToMajority);

        // Both replicas have persisted: disk quorum is met, but the
        // active's own persistence signal has not arrived.
        assert!(monitor
            .seqno_ack_received("r1", 5, 5)
            .expect("r1 ack")
            .is_empty());
        assert!(monitor
            .seqno_ack_received("r2", 5, 5)
            .expect("r2 ack")
            .is_empty());
        assert_eq!(1, monitor.tracked_count());
        assert_eq!(0, monitor.node_ack_seqnos(ACTIVE).unwrap().disk);

        let committed = monitor.notify_persisted(5);
        assert_eq!(vec![5], committed_seqnos(&committed));
        assert_eq!(0, monitor.tracked_count());
        assert_eq!(5, monitor.node_ack_seqnos(ACTIVE).unwrap().disk);
        assert_eq!(5, monitor.node_write_seqnos(ACTIVE).unwrap().disk);
    }

    #[test]
    fn persist_to_majority_requires_a_replica_majority() {
        let monitor = monitor_with(&[ACTIVE, "r1", "r2"]);
        add(&monitor, 5, DurabilityLevel::PersistToMajority);

        // Active persisted plus one of two replicas is not enough: the
        // disk majority is computed over the replicas alone.
        assert!(monitor
            .seqno_ack_received("r1", 5, 5)
            .expect("r1 ack")
            .is_empty());
        assert!(monitor.notify_persisted(5).is_empty());
        assert_eq!(1, monitor.tracked_count());

        let committed = monitor.seqno_ack_received("r2", 5, 5).expect("r2 ack");
        assert_eq!(vec![5], committed_seqnos(&committed));
        assert_eq!(0, monitor.tracked_count());
    }

    #[test]
    fn persist_to_majority_sparse_tracking() {
        let monitor = monitor();
        for seqno in [1, 3, 5] {
            add(&monitor, seqno, DurabilityLevel::PersistToMajority);
        }
        assert_eq!(0, monitor.node_write_seqnos(REPLICA).unwrap().disk);

        let committed = monitor
            .seqno_ack_received(REPLICA, 10, 10)
            .expect("replica ack");
        assert!(committed.is_empty());
        assert_eq!(3, monitor.tracked_count());
        assert_eq!(5, monitor.node_write_seqnos(REPLICA).unwrap().disk);
        assert_eq!(10, monitor.node_ack_seqnos(REPLICA).unwrap().disk);

        let committed = monitor.notify_persisted(10);
        assert_eq!(vec![1, 3, 5], committed_seqnos(&committed));
        assert_eq!(0, monitor.tracked_count());
    }

    #[test]
    fn multiple_replica_quorum() {
        let monitor = monitor_with(&[ACTIVE, "r1", "r2", "r3"]);
        assert_eq!(4, monitor.chain_size());
        add_majority(&monitor, &[1, 2, 3]);

        // Active has implicitly acked; nothing from the replicas yet.
        assert_eq!(3, monitor.node_ack_seqnos(ACTIVE).unwrap().memory);
        for replica in ["r1", "r2", "r3"] {
            assert_eq!(0, monitor.node_ack_seqnos(replica).unwrap().memory);
        }

        // active + r2: two of the required three.
        assert!(monitor
            .seqno_ack_received("r2", 1, 0)
            .expect("r2 ack")
            .is_empty());
        assert_eq!(3, monitor.tracked_count());

        // r3 completes the quorum for seqno 1 only.
        let committed = monitor.seqno_ack_received("r3", 1, 0).expect("r3 ack");
        assert_eq!(vec![1], committed_seqnos(&committed));
        assert_eq!(2, monitor.tracked_count());

        // active + r2 have seqno 3; still one short of the quorum.
        assert!(monitor
            .seqno_ack_received("r2", 3, 0)
            .expect("r2 re-ack")
            .is_empty());
        assert_eq!(2, monitor.tracked_count());

        // r1 catches up: seqnos 2 and 3 commit in order.
        let committed = monitor.seqno_ack_received("r1", 3, 0).expect("r1 ack");
        assert_eq!(vec![2, 3], committed_seqnos(&committed));
        assert_eq!(0, monitor.tracked_count());
    }

    #[test]
    fn second_chain_requires_quorum_on_both() {
        let monitor = monitor_with(&[ACTIVE, "r1"]);
        monitor
            .register_second_chain(Some(vec![ACTIVE.to_string(), "r2".to_string()]))
            .expect("second chain");
        add_majority(&monitor, &[1]);

        // Quorum on the first chain alone is not enough.
        assert!(monitor
            .seqno_ack_received("r1", 1, 0)
            .expect("r1 ack")
            .is_empty());
        assert_eq!(1, monitor.tracked_count());

        let committed = monitor.seqno_ack_received("r2", 1, 0).expect("r2 ack");
        assert_eq!(vec![1], committed_seqnos(&committed));
        assert_eq!(0, monitor.tracked_count());
    }

    #[test]
    fn abort_removes_tracked_write() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 2]);

        let resolution = monitor
            .abort(1, AbortReason::Ambiguous)
            .expect("abort tracked write");
        assert_eq!(1, resolution.seqno);
        assert_eq!(
            ResolutionKind::Abort(AbortReason::Ambiguous),
            resolution.kind
        );
        assert_eq!(1, monitor.tracked_count());

        let err = monitor.abort(7, AbortReason::Impossible).unwrap_err();
        assert!(matches!(err, DurabilityError::NoSuchPrepare(7)));
    }

    #[test]
    fn abort_all_drains_in_order() {
        let monitor = monitor();
        add_majority(&monitor, &[1, 3, 5]);

        let resolutions = monitor.abort_all(AbortReason::Ambiguous);
        let seqnos: Vec<u64> = resolutions.iter().map(|r| r.seqno).collect();
        assert_eq!(vec![1, 3, 5], seqnos);
        assert!(resolutions
            .iter()
            .all(|r| r.kind == ResolutionKind::Abort(AbortReason::Ambiguous)));
        assert_eq!(0, monitor.tracked_count());
    }

    #[test]
    fn resolutions_carry_cookie_and_key() {
        let monitor = monitor();
        add_majority(&monitor, &[1]);
        let committed = monitor.seqno_ack_received(REPLICA, 1, 0).expect("ack");
        assert_eq!(1, committed.len());
        assert_eq!(Some(1), committed[0].cookie);
        assert_eq!(b"key1".to_vec(), committed[0].key);
    }
}
