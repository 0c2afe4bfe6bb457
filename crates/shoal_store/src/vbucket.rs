//! Per-VBucket state and write arbitration.
//!
//! A VBucket owns the hash table, the checkpoint queue and the
//! durability monitor for one key partition, and arbitrates every
//! operation against its state, its pending-op queue and the item's
//! expiry/lock/CAS preconditions.
//!
//! Lock order, outermost first: VBucket state lock, collections
//! manifest lock, durability monitor mutex, checkpoint manager mutex,
//! hash-table bucket lock. A thread holding a deeper lock never takes
//! a shallower one, and no client-visible callback runs under any of
//! them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use shoal_durability::{
    AbortReason, DurabilityError, DurabilityMonitor, Resolution, ResolutionKind,
};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, SnapshotRange};
use crate::collections::CollectionsManifest;
use crate::config::StoreConfig;
use crate::failover::FailoverTable;
use crate::hash_table::{BucketGuard, HashTable};
use crate::item::{
    datatype, is_valid_cas, now_unix, ConflictMeta, DocKey, Item, Operation, QueueOp,
    CAS_LOCKED_MARKER, CAS_WILDCARD,
};
use crate::status::{ClientCookie, Status};
use crate::vbstate::{PersistedVbState, HLC_EPOCH_UNINITIALISED};

/// VBucket identifier: a small unsigned index into the registry.
pub type Vbid = u16;

/// Ownership state of a VBucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VBucketState::Active => f.write_str("active"),
            VBucketState::Replica => f.write_str("replica"),
            VBucketState::Pending => f.write_str("pending"),
            VBucketState::Dead => f.write_str("dead"),
        }
    }
}

/// Replication topology handed to [`VBucket::set_state`]: the first
/// chain, plus a second chain while a topology change is in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub first: Vec<String>,
    pub second: Option<Vec<String>>,
}

/// Outcome of an accepted (non-durable) mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub cas: u64,
    pub seqno: u64,
}

/// Read-path options.
#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    pub wants_deleted: bool,
}

/// Read-path result.
#[derive(Clone, Debug)]
pub struct GetResult {
    pub value: Option<bytes::Bytes>,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub datatype: u8,
    pub by_seqno: u64,
    pub deleted: bool,
}

/// Per-key metadata snapshot.
#[derive(Clone, Debug)]
pub struct KeyStats {
    pub by_seqno: u64,
    pub cas: u64,
    pub expiry: u32,
    pub datatype: u8,
    pub deleted: bool,
    pub resident: bool,
    pub logically_locked: bool,
    pub vb_state: VBucketState,
}

#[derive(Default)]
struct VBucketStats {
    ops_create: AtomicU64,
    ops_update: AtomicU64,
    ops_delete: AtomicU64,
    ops_reject: AtomicU64,
    pending_ops_total: AtomicU64,
    pending_ops_max: AtomicU64,
    sync_writes_committed: AtomicU64,
    sync_writes_aborted: AtomicU64,
}

/// Point-in-time copy of the per-VBucket counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct VBucketStatsSnapshot {
    pub ops_create: u64,
    pub ops_update: u64,
    pub ops_delete: u64,
    pub ops_reject: u64,
    pub pending_ops_total: u64,
    pub pending_ops_max: u64,
    pub sync_writes_committed: u64,
    pub sync_writes_aborted: u64,
}

/// Options for the withMeta ingest family.
#[derive(Clone, Copy, Debug)]
pub struct WithMetaOptions {
    /// Accept the item even when a committed value already exists,
    /// bypassing local CAS rules.
    pub allow_existing: bool,
    /// Run `(rev_seqno, cas, expiry)` conflict resolution against any
    /// existing value.
    pub check_conflicts: bool,
    /// Manifest uid the incoming data was tagged with.
    pub manifest_uid: u64,
}

struct PriorValue {
    cas: u64,
    rev_seqno: u64,
    locked: bool,
    alive: bool,
    deleted: bool,
    resident: bool,
    meta: ConflictMeta,
}

fn prior_value(bucket: &BucketGuard<'_>, key: &DocKey, now: u32) -> Option<PriorValue> {
    bucket.read(key).map(|sv| PriorValue {
        cas: sv.cas,
        rev_seqno: sv.rev_seqno,
        locked: sv.is_locked(Instant::now()),
        alive: sv.is_alive(now),
        deleted: sv.deleted,
        resident: sv.is_resident(),
        meta: ConflictMeta {
            rev_seqno: sv.rev_seqno,
            cas: sv.cas,
            expiry: sv.expiry,
        },
    })
}

/// One key partition: state holder and write arbiter.
pub struct VBucket {
    id: Vbid,
    state: RwLock<VBucketState>,
    ht: HashTable,
    checkpoints: CheckpointManager,
    durability: DurabilityMonitor<ClientCookie>,
    failover: Mutex<FailoverTable>,
    pending_ops: Mutex<Vec<ClientCookie>>,
    takeover_backed_up: AtomicBool,
    max_cas: AtomicU64,
    max_deleted_seqno: AtomicU64,
    purge_seqno: AtomicU64,
    hlc_epoch_seqno: AtomicI64,
    might_contain_xattrs: AtomicBool,
    supports_collections: bool,
    manifest: Arc<CollectionsManifest>,
    config: Arc<StoreConfig>,
    stats: VBucketStats,
}

impl VBucket {
    pub fn new(
        id: Vbid,
        initial_state: VBucketState,
        config: Arc<StoreConfig>,
        manifest: Arc<CollectionsManifest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: RwLock::new(initial_state),
            ht: HashTable::new(config.ht_buckets, config.ht_quota_bytes),
            checkpoints: CheckpointManager::new(config.checkpoint_max_items, 0),
            durability: DurabilityMonitor::new(),
            failover: Mutex::new(FailoverTable::new(config.failover_max_entries)),
            pending_ops: Mutex::new(Vec::new()),
            takeover_backed_up: AtomicBool::new(false),
            max_cas: AtomicU64::new(0),
            max_deleted_seqno: AtomicU64::new(0),
            purge_seqno: AtomicU64::new(0),
            hlc_epoch_seqno: AtomicI64::new(HLC_EPOCH_UNINITIALISED),
            might_contain_xattrs: AtomicBool::new(false),
            supports_collections: true,
            manifest,
            config,
            stats: VBucketStats::default(),
        })
    }

    pub fn id(&self) -> Vbid {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read().expect("vbucket state lock poisoned")
    }

    pub fn high_seqno(&self) -> u64 {
        self.checkpoints.high_seqno()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn hash_table(&self) -> &HashTable {
        &self.ht
    }

    pub fn durability_monitor(&self) -> &DurabilityMonitor<ClientCookie> {
        &self.durability
    }

    pub fn set_takeover_backed_up(&self, backed_up: bool) {
        self.takeover_backed_up.store(backed_up, Ordering::Relaxed);
    }

    pub fn is_takeover_backed_up(&self) -> bool {
        self.takeover_backed_up.load(Ordering::Relaxed)
    }

    pub fn stats_snapshot(&self) -> VBucketStatsSnapshot {
        VBucketStatsSnapshot {
            ops_create: self.stats.ops_create.load(Ordering::Relaxed),
            ops_update: self.stats.ops_update.load(Ordering::Relaxed),
            ops_delete: self.stats.ops_delete.load(Ordering::Relaxed),
            ops_reject: self.stats.ops_reject.load(Ordering::Relaxed),
            pending_ops_total: self.stats.pending_ops_total.load(Ordering::Relaxed),
            pending_ops_max: self.stats.pending_ops_max.load(Ordering::Relaxed),
            sync_writes_committed: self.stats.sync_writes_committed.load(Ordering::Relaxed),
            sync_writes_aborted: self.stats.sync_writes_aborted.load(Ordering::Relaxed),
        }
    }

    // ---- state transitions -------------------------------------------------

    /// Changes the VBucket state, registering the replication topology
    /// when one is supplied.
    ///
    /// `pending -> active` releases every parked client token with
    /// `success`; a transition to `dead` cancels: parked tokens get
    /// `not-my-vbucket`, tracked prepares abort as ambiguous and every
    /// checkpoint cursor is invalidated.
    pub fn set_state(
        &self,
        new: VBucketState,
        topology: Option<Topology>,
    ) -> Result<(), DurabilityError> {
        if let Some(topology) = &topology {
            self.durability
                .register_replication_chain(topology.first.clone())?;
            self.durability
                .register_second_chain(topology.second.clone())?;
        }

        let old;
        let parked;
        let mut aborted = Vec::new();
        {
            let mut state = self.state.write().expect("vbucket state lock poisoned");
            old = *state;
            *state = new;
            self.checkpoints.queue_vbucket_state_meta();
            if new == VBucketState::Active && old != VBucketState::Active {
                let entry = self
                    .failover
                    .lock()
                    .expect("failover table lock poisoned")
                    .create_entry(self.high_seqno());
                info!(
                    vb = self.id,
                    uuid = entry.uuid,
                    seq = entry.seq,
                    "created new failover entry"
                );
            }
            info!(vb = self.id, from = %old, to = %new, "vbucket state change");

            parked = std::mem::take(
                &mut *self.pending_ops.lock().expect("pending ops lock poisoned"),
            );
            if new == VBucketState::Dead {
                aborted = self.durability.abort_all(AbortReason::Ambiguous);
                self.checkpoints.remove_all_cursors();
            } else if !(old == VBucketState::Pending && new == VBucketState::Active) {
                // Parked ops are only released by pending -> active or
                // by death; put them back for any other transition.
                let mut pending = self.pending_ops.lock().expect("pending ops lock poisoned");
                *pending = parked;
                drop(pending);
                return Ok(());
            }
        }

        if new == VBucketState::Dead {
            self.apply_resolutions(aborted);
            for cookie in parked {
                cookie.notify(Status::NotMyVbucket);
            }
            return Ok(());
        }

        // pending -> active: a background notifier releases the parked
        // clients so they retry against the now-active VBucket.
        if !parked.is_empty() {
            let vb = self.id;
            let spawn = thread::Builder::new()
                .name(format!("vb-{vb}-notify"))
                .spawn(move || {
                    for cookie in parked {
                        cookie.notify(Status::Success);
                    }
                });
            if let Err(err) = spawn {
                error!(vb = self.id, error = ?err, "spawn pending-op notifier failed");
            }
        }
        Ok(())
    }

    fn park_pending_op(&self, cookie: &ClientCookie) {
        let mut pending = self.pending_ops.lock().expect("pending ops lock poisoned");
        pending.push(cookie.clone());
        self.stats.pending_ops_total.fetch_add(1, Ordering::Relaxed);
        self.stats
            .pending_ops_max
            .fetch_max(pending.len() as u64, Ordering::Relaxed);
    }

    /// Front-line gate for client-originated writes. Returns the
    /// early-exit status, parking the cookie when the state is
    /// `pending`.
    fn gate_client_write(
        &self,
        state: VBucketState,
        cookie: Option<&ClientCookie>,
        check_takeover: bool,
    ) -> Option<Status> {
        match state {
            VBucketState::Dead | VBucketState::Replica => {
                self.stats.ops_reject.fetch_add(1, Ordering::Relaxed);
                Some(Status::NotMyVbucket)
            }
            VBucketState::Pending => {
                if let Some(cookie) = cookie {
                    self.park_pending_op(cookie);
                }
                Some(Status::WouldBlock)
            }
            VBucketState::Active => {
                if check_takeover && self.is_takeover_backed_up() {
                    debug!(vb = self.id, "takeover is lagging, rejecting mutation");
                    Some(Status::TemporaryFailure)
                } else {
                    None
                }
            }
        }
    }

    fn next_cas(&self) -> u64 {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64;
        // Hybrid logical clock: physical time in the upper bits, a
        // logical counter below when time stands still or runs behind.
        let candidate = now_ns & !0xffff;
        loop {
            let current = self.max_cas.load(Ordering::Relaxed);
            let next = if candidate > current {
                candidate
            } else {
                current + 1
            };
            if self
                .max_cas
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }

    // ---- client write family ----------------------------------------------

    /// Unconditional store (CAS-checked when the item carries one).
    pub fn set(&self, item: Item, cookie: Option<&ClientCookie>) -> Result<Mutation, Status> {
        self.store_mutation(item, cookie, Operation::Set)
    }

    /// Store that fails with `key-exists` when any committed value is
    /// alive.
    pub fn add(&self, item: Item, cookie: Option<&ClientCookie>) -> Result<Mutation, Status> {
        if item.cas != CAS_WILDCARD {
            // Adding with a CAS does not make sense.
            return Err(Status::KeyExists);
        }
        self.store_mutation(item, cookie, Operation::Add)
    }

    /// Store that fails with `key-not-found` unless a committed value
    /// is alive.
    pub fn replace(&self, item: Item, cookie: Option<&ClientCookie>) -> Result<Mutation, Status> {
        self.store_mutation(item, cookie, Operation::Replace)
    }

    fn store_mutation(
        &self,
        mut item: Item,
        cookie: Option<&ClientCookie>,
        operation: Operation,
    ) -> Result<Mutation, Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, cookie, true) {
            return Err(status);
        }
        if item.size_in_bytes() > self.config.max_item_size_bytes {
            return Err(Status::TooBig);
        }
        let handle = self
            .manifest
            .lock(item.key.collection)
            .ok_or(Status::UnknownCollection)?;
        handle.process_expiry(&mut item, self.config.max_ttl);

        let now = now_unix();
        let durable = item.durability;
        if durable.is_some() && self.durability.chain_size() == 0 {
            // No topology yet: the requirement can never be met.
            return Err(Status::DurabilityImpossible);
        }

        let mut cm = self.checkpoints.lock();
        let mut bucket = self.ht.lock_bucket(&item.key);

        if bucket.pending(&item.key).is_some() {
            return Err(Status::SyncWriteInProgress);
        }
        let prior = prior_value(&bucket, &item.key, now);
        let existed = prior.as_ref().map(|p| p.alive).unwrap_or(false);
        match operation {
            Operation::Add => {
                if existed {
                    return Err(Status::KeyExists);
                }
            }
            Operation::Replace => {
                if !existed {
                    return Err(Status::KeyNotFound);
                }
            }
            _ => {}
        }
        if let Some(prior) = &prior {
            if prior.locked && item.cas != prior.cas {
                return Err(Status::Locked);
            }
            if item.cas != CAS_WILDCARD {
                if !prior.alive {
                    return Err(Status::KeyNotFound);
                }
                if prior.cas != item.cas {
                    return Err(Status::KeyExists);
                }
            }
            item.rev_seqno = prior.rev_seqno + 1;
        } else if item.cas != CAS_WILDCARD {
            return Err(Status::KeyNotFound);
        }

        if !bucket.has_capacity_for(&item.key, &item, durable.is_none()) {
            return Err(Status::NoMemory);
        }

        item.operation = operation;
        item.cas = self.next_cas();
        if item.datatype & datatype::XATTR != 0 {
            self.might_contain_xattrs.store(true, Ordering::Relaxed);
        }

        match durable {
            Some(requirements) => {
                let seqno = cm
                    .queue_dirty(QueueOp::PendingSyncWrite, &mut item)
                    .map_err(|_| Status::InvalidArguments)?;
                bucket.set_pending(&item, seqno)?;
                drop(bucket);
                drop(cm);
                self.track_sync_write(cookie.cloned(), &item.key, seqno, requirements)?;
                Err(Status::WouldBlock)
            }
            None => {
                let seqno = cm
                    .queue_dirty(QueueOp::Mutation, &mut item)
                    .map_err(|_| Status::InvalidArguments)?;
                bucket.set_committed(&item, seqno)?;
                drop(bucket);
                drop(cm);
                if existed {
                    self.stats.ops_update.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.ops_create.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Mutation {
                    cas: item.cas,
                    seqno,
                })
            }
        }
    }

    /// Deletes `key`, optionally as a synchronous write.
    pub fn delete(
        &self,
        key: DocKey,
        cas: u64,
        cookie: Option<&ClientCookie>,
        durability: Option<shoal_durability::Requirements>,
    ) -> Result<Mutation, Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, cookie, true) {
            return Err(status);
        }
        let _handle = self
            .manifest
            .lock(key.collection)
            .ok_or(Status::UnknownCollection)?;
        if durability.is_some() && self.durability.chain_size() == 0 {
            return Err(Status::DurabilityImpossible);
        }

        let now = now_unix();
        let mut cm = self.checkpoints.lock();
        let mut bucket = self.ht.lock_bucket(&key);

        if bucket.pending(&key).is_some() {
            return Err(Status::SyncWriteInProgress);
        }
        let Some(prior) = prior_value(&bucket, &key, now) else {
            return Err(Status::KeyNotFound);
        };
        if !prior.alive {
            return Err(Status::KeyNotFound);
        }
        if prior.locked && cas != prior.cas {
            return Err(Status::Locked);
        }
        if cas != CAS_WILDCARD && prior.cas != cas {
            return Err(Status::KeyExists);
        }

        let mut tombstone = Item::deletion(key.clone());
        tombstone.rev_seqno = prior.rev_seqno + 1;
        tombstone.cas = self.next_cas();

        match durability {
            Some(requirements) => {
                tombstone.durability = Some(requirements);
                let seqno = cm
                    .queue_dirty(QueueOp::PendingSyncWrite, &mut tombstone)
                    .map_err(|_| Status::InvalidArguments)?;
                bucket.set_pending(&tombstone, seqno)?;
                drop(bucket);
                drop(cm);
                self.track_sync_write(cookie.cloned(), &key, seqno, requirements)?;
                Err(Status::WouldBlock)
            }
            None => {
                let seqno = cm
                    .queue_dirty(QueueOp::Mutation, &mut tombstone)
                    .map_err(|_| Status::InvalidArguments)?;
                bucket.delete_committed(&key, seqno, tombstone.cas);
                drop(bucket);
                drop(cm);
                self.max_deleted_seqno.fetch_max(seqno, Ordering::Relaxed);
                self.stats.ops_delete.fetch_add(1, Ordering::Relaxed);
                Ok(Mutation {
                    cas: tombstone.cas,
                    seqno,
                })
            }
        }
    }

    fn track_sync_write(
        &self,
        cookie: Option<ClientCookie>,
        key: &DocKey,
        seqno: u64,
        requirements: shoal_durability::Requirements,
    ) -> Result<(), Status> {
        if let Err(err) = self
            .durability
            .add_sync_write(cookie, key.encode(), seqno, requirements.level)
        {
            // Admission after a successful enqueue can only fail on an
            // internal invariant violation.
            error!(vb = self.id, seqno, error = %err, "sync write admission failed");
            return Err(Status::InvalidArguments);
        }
        Ok(())
    }

    // ---- replica ingest ----------------------------------------------------

    /// Applies a mutation carrying externally-chosen seqno and CAS
    /// (replication-stream ingest).
    pub fn set_with_meta(
        &self,
        item: Item,
        options: WithMetaOptions,
        cookie: Option<&ClientCookie>,
    ) -> Result<(), Status> {
        self.ingest_with_meta(item, options, cookie)
    }

    /// Deletion variant of [`set_with_meta`]: the item must be a
    /// tombstone.
    ///
    /// [`set_with_meta`]: Self::set_with_meta
    pub fn delete_with_meta(
        &self,
        mut item: Item,
        options: WithMetaOptions,
        cookie: Option<&ClientCookie>,
    ) -> Result<(), Status> {
        item.deleted = true;
        item.value = None;
        item.operation = Operation::Delete;
        self.ingest_with_meta(item, options, cookie)
    }

    fn ingest_with_meta(
        &self,
        mut item: Item,
        options: WithMetaOptions,
        cookie: Option<&ClientCookie>,
    ) -> Result<(), Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        match *state {
            VBucketState::Dead => {
                self.stats.ops_reject.fetch_add(1, Ordering::Relaxed);
                return Err(Status::NotMyVbucket);
            }
            VBucketState::Pending => {
                if let Some(cookie) = cookie {
                    self.park_pending_op(cookie);
                }
                return Err(Status::WouldBlock);
            }
            VBucketState::Active | VBucketState::Replica => {
                if self.is_takeover_backed_up() {
                    debug!(vb = self.id, "takeover is lagging, rejecting meta ingest");
                    return Err(Status::TemporaryFailure);
                }
            }
        }

        // CAS 0 is a wildcard only for client writes; meta ingest must
        // carry the origin's real CAS.
        if item.cas == CAS_WILDCARD {
            return Err(Status::InvalidArguments);
        }
        if !is_valid_cas(item.cas) {
            return Err(Status::KeyExists);
        }
        let Some(seqno) = item.by_seqno else {
            return Err(Status::InvalidArguments);
        };

        let handle = self
            .manifest
            .lock(item.key.collection)
            .ok_or(Status::UnknownCollection)?;
        if handle.is_ahead(options.manifest_uid) {
            return Err(Status::CollectionsManifestAhead);
        }

        let now = now_unix();
        let mut cm = self.checkpoints.lock();
        let mut bucket = self.ht.lock_bucket(&item.key);

        if bucket.pending(&item.key).is_some() {
            return Err(Status::SyncWriteInProgress);
        }
        if let Some(prior) = prior_value(&bucket, &item.key, now) {
            if prior.locked {
                return Err(Status::Locked);
            }
            if options.check_conflicts && !ConflictMeta::of(&item).wins_over(&prior.meta) {
                return Err(Status::KeyExists);
            }
            if !options.allow_existing && prior.alive {
                return Err(Status::KeyExists);
            }
        }

        if !bucket.has_capacity_for(&item.key, &item, true) {
            return Err(Status::NoMemory);
        }

        // On a replica the stream-announced snapshot binds; an active
        // ingest advances its own snapshot instead.
        let queued = if *state == VBucketState::Replica {
            cm.queue_dirty_bounded(QueueOp::Mutation, &mut item)
        } else {
            cm.queue_dirty(QueueOp::Mutation, &mut item)
        };
        if let Err(err) = queued {
            warn!(vb = self.id, seqno, error = %err, "meta ingest rejected by checkpoint");
            return Err(Status::InvalidArguments);
        }
        bucket.set_committed(&item, seqno)?;
        if item.deleted {
            self.max_deleted_seqno.fetch_max(seqno, Ordering::Relaxed);
        }
        drop(bucket);
        drop(cm);

        self.max_cas.fetch_max(item.cas, Ordering::Relaxed);
        if item.datatype & datatype::XATTR != 0 {
            self.might_contain_xattrs.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Replica-side bulk ingest from a disk snapshot. Never generates
    /// a seqno and is rejected on active VBuckets.
    pub fn add_backfill_item(&self, mut item: Item) -> Result<(), Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        match *state {
            VBucketState::Active | VBucketState::Dead => {
                self.stats.ops_reject.fetch_add(1, Ordering::Relaxed);
                return Err(Status::NotMyVbucket);
            }
            VBucketState::Replica | VBucketState::Pending => {}
        }
        if !is_valid_cas(item.cas) {
            return Err(Status::KeyExists);
        }
        let Some(seqno) = item.by_seqno else {
            return Err(Status::InvalidArguments);
        };
        let _handle = self
            .manifest
            .lock(item.key.collection)
            .ok_or(Status::UnknownCollection)?;

        let mut cm = self.checkpoints.lock();
        let mut bucket = self.ht.lock_bucket(&item.key);
        if !bucket.has_capacity_for(&item.key, &item, true) {
            return Err(Status::NoMemory);
        }
        if let Err(err) = cm.queue_dirty_bounded(QueueOp::Mutation, &mut item) {
            warn!(vb = self.id, seqno, error = %err, "backfill item rejected by checkpoint");
            return Err(Status::InvalidArguments);
        }
        bucket.set_committed(&item, seqno)?;
        Ok(())
    }

    /// Installs the snapshot bounds announced by the replication
    /// stream.
    pub fn receive_snapshot_marker(&self, start: u64, end: u64) -> Result<(), Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        match *state {
            VBucketState::Replica | VBucketState::Pending => {
                self.checkpoints.create_snapshot(start, end);
                Ok(())
            }
            _ => Err(Status::NotMyVbucket),
        }
    }

    // ---- read family -------------------------------------------------------

    pub fn get(
        &self,
        key: &DocKey,
        cookie: Option<&ClientCookie>,
        options: GetOptions,
    ) -> Result<GetResult, Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, cookie, false) {
            return Err(status);
        }
        let _handle = self
            .manifest
            .lock(key.collection)
            .ok_or(Status::UnknownCollection)?;

        let now = now_unix();
        let Some(sv) = self.ht.find_for_read(key, options.wants_deleted) else {
            return Err(Status::KeyNotFound);
        };
        if sv.is_expired(now) && !options.wants_deleted {
            return Err(Status::KeyNotFound);
        }
        let cas = if sv.is_locked(Instant::now()) {
            // A locked document hides its CAS from plain readers.
            CAS_LOCKED_MARKER
        } else {
            sv.cas
        };
        Ok(GetResult {
            value: sv.value.clone(),
            cas,
            flags: sv.flags,
            expiry: sv.expiry,
            datatype: sv.datatype,
            by_seqno: sv.by_seqno,
            deleted: sv.deleted,
        })
    }

    /// Reads the value while updating its expiry (touch).
    pub fn get_and_update_ttl(
        &self,
        key: &DocKey,
        expiry: u32,
        cookie: Option<&ClientCookie>,
    ) -> Result<GetResult, Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, cookie, false) {
            return Err(status);
        }
        let handle = self
            .manifest
            .lock(key.collection)
            .ok_or(Status::UnknownCollection)?;

        let now = now_unix();
        let mut cm = self.checkpoints.lock();
        let mut bucket = self.ht.lock_bucket(key);
        if bucket.pending(key).is_some() {
            return Err(Status::SyncWriteInProgress);
        }
        let Some(prior) = prior_value(&bucket, key, now) else {
            return Err(Status::KeyNotFound);
        };
        if !prior.alive {
            return Err(Status::KeyNotFound);
        }
        if prior.locked {
            return Err(Status::Locked);
        }

        let Some(sv) = bucket.read(key).cloned() else {
            return Err(Status::KeyNotFound);
        };
        let mut touched = Item {
            key: key.clone(),
            value: sv.value.clone(),
            cas: self.next_cas(),
            flags: sv.flags,
            expiry,
            datatype: sv.datatype,
            operation: Operation::Set,
            rev_seqno: sv.rev_seqno + 1,
            by_seqno: None,
            durability: None,
            deleted: false,
        };
        handle.process_expiry(&mut touched, self.config.max_ttl);
        let seqno = cm
            .queue_dirty(QueueOp::Mutation, &mut touched)
            .map_err(|_| Status::InvalidArguments)?;
        bucket.update_expiry(key, touched.expiry, touched.cas, seqno);
        drop(bucket);
        drop(cm);
        self.stats.ops_update.fetch_add(1, Ordering::Relaxed);

        Ok(GetResult {
            value: sv.value,
            cas: touched.cas,
            flags: sv.flags,
            expiry: touched.expiry,
            datatype: sv.datatype,
            by_seqno: seqno,
            deleted: false,
        })
    }

    /// Reads the value and locks it until the window elapses or the
    /// holder mutates/unlocks with the returned CAS.
    pub fn get_locked(
        &self,
        key: &DocKey,
        lock_window: Option<Duration>,
        cookie: Option<&ClientCookie>,
    ) -> Result<GetResult, Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, cookie, false) {
            return Err(status);
        }
        let _handle = self
            .manifest
            .lock(key.collection)
            .ok_or(Status::UnknownCollection)?;

        let now = now_unix();
        let mut bucket = self.ht.lock_bucket(key);
        if bucket.pending(key).is_some() {
            return Err(Status::SyncWriteInProgress);
        }
        let Some(prior) = prior_value(&bucket, key, now) else {
            return Err(Status::KeyNotFound);
        };
        if !prior.alive {
            return Err(Status::KeyNotFound);
        }
        if prior.locked {
            return Err(Status::LockedTemporaryFailure);
        }

        let cas = self.next_cas();
        let window = lock_window.unwrap_or(self.config.lock_window);
        bucket.set_lock(key, Some(Instant::now() + window), cas);
        let sv = bucket.read(key).cloned();
        drop(bucket);

        let sv = sv.ok_or(Status::KeyNotFound)?;
        Ok(GetResult {
            value: sv.value,
            cas,
            flags: sv.flags,
            expiry: sv.expiry,
            datatype: sv.datatype,
            by_seqno: sv.by_seqno,
            deleted: false,
        })
    }

    /// Releases a lock taken by [`get_locked`].
    ///
    /// [`get_locked`]: Self::get_locked
    pub fn unlock_key(&self, key: &DocKey, cas: u64) -> Result<(), Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, None, false) {
            return Err(status);
        }

        let now = now_unix();
        let mut bucket = self.ht.lock_bucket(key);
        let Some(prior) = prior_value(&bucket, key, now) else {
            return Err(Status::KeyNotFound);
        };
        if !prior.alive {
            return Err(Status::KeyNotFound);
        }
        if !prior.locked {
            return Err(Status::TemporaryFailure);
        }
        if prior.cas != cas {
            return Err(Status::Locked);
        }
        bucket.set_lock(key, None, prior.cas);
        Ok(())
    }

    pub fn get_key_stats(&self, key: &DocKey) -> Result<KeyStats, Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, None, false) {
            return Err(status);
        }
        let Some(sv) = self.ht.find_for_read(key, true) else {
            return Err(Status::KeyNotFound);
        };
        Ok(KeyStats {
            by_seqno: sv.by_seqno,
            cas: sv.cas,
            expiry: sv.expiry,
            datatype: sv.datatype,
            deleted: sv.deleted,
            resident: sv.is_resident(),
            logically_locked: sv.is_locked(Instant::now()),
            vb_state: *state,
        })
    }

    /// Ejects a resident committed value's payload. Pending items are
    /// not evictable.
    pub fn evict_key(&self, key: &DocKey) -> Result<(), Status> {
        let state = self.state.read().expect("vbucket state lock poisoned");
        if let Some(status) = self.gate_client_write(*state, None, false) {
            return Err(status);
        }

        let now = now_unix();
        let mut bucket = self.ht.lock_bucket(key);
        if bucket.pending(key).is_some() {
            return Err(Status::SyncWriteInProgress);
        }
        let Some(prior) = prior_value(&bucket, key, now) else {
            return Err(Status::KeyNotFound);
        };
        if prior.deleted {
            return Err(Status::KeyNotFound);
        }
        if prior.locked {
            return Err(Status::Locked);
        }
        if !prior.resident {
            // Already ejected.
            return Ok(());
        }
        bucket.eject_value(key);
        Ok(())
    }

    // ---- durability plumbing ----------------------------------------------

    /// Processes a replica's seqno acknowledgement and applies any
    /// resulting commits.
    ///
    /// A monotonicity or unknown-replica violation is a protocol
    /// error: it takes this VBucket (not the process) out of service.
    pub fn seqno_acknowledged(
        self: &Arc<Self>,
        replica: &str,
        memory_seqno: u64,
        disk_seqno: u64,
    ) -> Result<(), Status> {
        let resolutions = {
            let _state = self.state.read().expect("vbucket state lock poisoned");
            match self
                .durability
                .seqno_ack_received(replica, memory_seqno, disk_seqno)
            {
                Ok(resolutions) => resolutions,
                Err(err @ DurabilityError::NoTrackedSyncWrite { .. }) => {
                    warn!(vb = self.id, error = %err, "dropping seqno ack");
                    return Err(Status::InvalidArguments);
                }
                Err(err) => {
                    error!(vb = self.id, error = %err, "durability protocol violation, failing vbucket");
                    self.fail_deferred();
                    return Err(Status::InvalidArguments);
                }
            }
        };
        self.apply_resolutions(resolutions);
        Ok(())
    }

    /// Kills this VBucket from a context that may hold its state read
    /// lock; the transition runs on a detached thread.
    fn fail_deferred(self: &Arc<Self>) {
        let vb = Arc::clone(self);
        let spawn = thread::Builder::new()
            .name(format!("vb-{}-fail", self.id))
            .spawn(move || {
                if let Err(err) = vb.set_state(VBucketState::Dead, None) {
                    error!(vb = vb.id, error = %err, "dead transition failed");
                }
            });
        if let Err(err) = spawn {
            error!(vb = self.id, error = ?err, "spawn vbucket fail thread");
        }
    }

    /// Persistence hook: everything up to `seqno` is durable locally.
    pub fn notify_persisted(&self, seqno: u64) {
        let resolutions = {
            let _state = self.state.read().expect("vbucket state lock poisoned");
            self.durability.notify_persisted(seqno)
        };
        self.apply_resolutions(resolutions);
    }

    /// Aborts one tracked synchronous write (external timeout policy).
    pub fn abort_sync_write(&self, seqno: u64, reason: AbortReason) -> Result<(), Status> {
        let resolution = {
            let _state = self.state.read().expect("vbucket state lock poisoned");
            self.durability
                .abort(seqno, reason)
                .map_err(|_| Status::KeyNotFound)?
        };
        self.apply_resolutions(vec![resolution]);
        Ok(())
    }

    /// Applies commit/abort resolutions: retag or drop the pending
    /// value, append the commit/abort record, then notify the cookie
    /// strictly after every lock has been released.
    fn apply_resolutions(&self, resolutions: Vec<Resolution<ClientCookie>>) {
        for resolution in resolutions {
            let Some(key) = DocKey::decode(&resolution.key) else {
                error!(vb = self.id, seqno = resolution.seqno, "undecodable resolution key");
                continue;
            };
            let status = match resolution.kind {
                ResolutionKind::Commit => {
                    self.apply_commit(&key, resolution.seqno);
                    self.stats
                        .sync_writes_committed
                        .fetch_add(1, Ordering::Relaxed);
                    Status::Success
                }
                ResolutionKind::Abort(reason) => {
                    self.apply_abort(&key, resolution.seqno);
                    self.stats
                        .sync_writes_aborted
                        .fetch_add(1, Ordering::Relaxed);
                    match reason {
                        AbortReason::Ambiguous => Status::SyncWriteAmbiguous,
                        AbortReason::Impossible => Status::DurabilityImpossible,
                    }
                }
            };
            if let Some(cookie) = resolution.cookie {
                cookie.notify(status);
            }
        }
    }

    fn apply_commit(&self, key: &DocKey, prepare_seqno: u64) {
        let mut cm = self.checkpoints.lock();
        let mut bucket = self.ht.lock_bucket(key);
        let Some(pending) = bucket.pending(key).cloned() else {
            warn!(vb = self.id, prepare_seqno, "commit without a pending value");
            return;
        };
        let mut commit_item = Item {
            key: key.clone(),
            value: pending.value.clone(),
            cas: pending.cas,
            flags: pending.flags,
            expiry: pending.expiry,
            datatype: pending.datatype,
            operation: if pending.deleted {
                Operation::Delete
            } else {
                Operation::Set
            },
            rev_seqno: pending.rev_seqno,
            by_seqno: None,
            durability: None,
            deleted: pending.deleted,
        };
        match cm.queue_dirty(QueueOp::CommitSyncWrite, &mut commit_item) {
            Ok(commit_seqno) => {
                bucket.commit_pending(key, commit_seqno);
                if pending.deleted {
                    bucket.delete_committed(key, commit_seqno, pending.cas);
                    self.max_deleted_seqno
                        .fetch_max(commit_seqno, Ordering::Relaxed);
                }
                debug!(vb = self.id, prepare_seqno, commit_seqno, "sync write committed");
            }
            Err(err) => {
                error!(vb = self.id, prepare_seqno, error = %err, "commit enqueue failed");
            }
        }
    }

    fn apply_abort(&self, key: &DocKey, prepare_seqno: u64) {
        let mut cm = self.checkpoints.lock();
        let mut bucket = self.ht.lock_bucket(key);
        if !bucket.abort_pending(key) {
            debug!(vb = self.id, prepare_seqno, "abort without a pending value");
            return;
        }
        let mut abort_item = Item::deletion(key.clone());
        if let Err(err) = cm.queue_dirty(QueueOp::AbortSyncWrite, &mut abort_item) {
            error!(vb = self.id, prepare_seqno, error = %err, "abort enqueue failed");
        }
        debug!(vb = self.id, prepare_seqno, "sync write aborted");
    }

    // ---- metadata ----------------------------------------------------------

    /// Point-in-time vbstate blob for persistence.
    pub fn snapshot_vbstate(&self) -> PersistedVbState {
        let state = self.state();
        let snapshot: SnapshotRange = self.checkpoints.snapshot_range();
        PersistedVbState {
            state,
            checkpoint_id: self.checkpoints.checkpoint_id(),
            max_deleted_seqno: self.max_deleted_seqno.load(Ordering::Relaxed),
            high_seqno: self.high_seqno().min(i64::MAX as u64) as i64,
            purge_seqno: self.purge_seqno.load(Ordering::Relaxed),
            snap_start: snapshot.start,
            snap_end: snapshot.end,
            max_cas: self.max_cas.load(Ordering::Relaxed),
            hlc_cas_epoch_seqno: self.hlc_epoch_seqno.load(Ordering::Relaxed),
            might_contain_xattrs: self.might_contain_xattrs.load(Ordering::Relaxed),
            failover_table: self
                .failover
                .lock()
                .expect("failover table lock poisoned")
                .entries()
                .to_vec(),
            supports_collections: self.supports_collections,
        }
    }

    /// Rollback decision for a re-attaching replica.
    pub fn failover_rollback(&self, remote_uuid: u64, remote_seqno: u64) -> Option<u64> {
        self.failover
            .lock()
            .expect("failover table lock poisoned")
            .needs_rollback(remote_uuid, remote_seqno, self.high_seqno())
    }

    /// Drops all in-memory content (teardown path).
    pub fn clear(&self) {
        self.ht.clear();
        self.checkpoints.clear(0);
    }
}
