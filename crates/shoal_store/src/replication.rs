//! Interfaces to the out-of-scope collaborators.
//!
//! The engine is transport- and storage-agnostic: the replication
//! stream that carries prepares to replicas and the store that makes
//! them durable are supplied by the embedding node. Concrete
//! implementations can use gRPC, in-memory channels, or test
//! harnesses.

use async_trait::async_trait;

use crate::checkpoint::SnapshotRange;
use crate::item::Item;
use crate::vbstate::PersistedVbState;
use crate::vbucket::Vbid;

/// Outbound replication transport.
///
/// A producer drains a VBucket's checkpoint cursor and pushes the
/// entries to one replica; seqno acknowledgements flow back through
/// `VBucket::seqno_acknowledged`.
#[async_trait]
pub trait ReplicationTransport: Send + Sync + 'static {
    /// Announces the snapshot the following entries belong to.
    async fn snapshot_marker(
        &self,
        target: &str,
        vb: Vbid,
        range: SnapshotRange,
    ) -> anyhow::Result<()>;

    async fn mutation(&self, target: &str, vb: Vbid, item: Item) -> anyhow::Result<()>;

    async fn prepare(&self, target: &str, vb: Vbid, item: Item) -> anyhow::Result<()>;

    async fn commit(&self, target: &str, vb: Vbid, key: Vec<u8>, seqno: u64)
        -> anyhow::Result<()>;

    async fn abort(&self, target: &str, vb: Vbid, key: Vec<u8>, seqno: u64) -> anyhow::Result<()>;
}

/// Durable store the flusher writes into.
///
/// Implementations persist batches drained from the persistence cursor
/// and report the highest seqno made durable; the flusher then calls
/// `VBucket::notify_persisted` with that seqno.
pub trait PersistenceBackend: Send + Sync + 'static {
    /// Persists a batch of items; returns the highest durable seqno.
    fn persist_items(&self, vb: Vbid, items: &[Item]) -> anyhow::Result<u64>;

    /// Persists the vbstate metadata blob.
    fn persist_vbstate(&self, vb: Vbid, state: &PersistedVbState) -> anyhow::Result<()> {
        let _ = (vb, state);
        Ok(())
    }
}
