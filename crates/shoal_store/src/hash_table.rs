//! Sharded in-memory index from key to stored values.
//!
//! The table is split into independently-locked shards. Within one
//! shard, each key owns a slot with room for at most one committed and
//! one pending value, which encodes the write-path invariant directly:
//! a second in-flight synchronous write can never be stored.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;

use crate::item::{DocKey, Item};
use crate::status::Status;

/// Commit-state tag of a stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommittedState {
    /// Result of a plain mutation.
    CommittedViaMutation,
    /// Result of a committed synchronous write.
    CommittedViaPrepare,
    /// A prepare awaiting its durability verdict.
    Pending,
}

/// In-memory representation of one key version.
#[derive(Clone, Debug)]
pub struct StoredValue {
    pub key: DocKey,
    /// `None` when the value has been ejected or this is a tombstone.
    pub value: Option<Bytes>,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub datatype: u8,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub lock_deadline: Option<Instant>,
    pub committed: CommittedState,
    pub deleted: bool,
}

impl StoredValue {
    fn from_item(item: &Item, by_seqno: u64, committed: CommittedState) -> Self {
        Self {
            key: item.key.clone(),
            value: item.value.clone(),
            cas: item.cas,
            flags: item.flags,
            expiry: item.expiry,
            datatype: item.datatype,
            by_seqno,
            rev_seqno: item.rev_seqno,
            lock_deadline: None,
            committed,
            deleted: item.deleted,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_locked(&self, now: Instant) -> bool {
        self.lock_deadline.map(|d| d > now).unwrap_or(false)
    }

    pub fn is_expired(&self, now_unix: u32) -> bool {
        self.expiry != 0 && self.expiry <= now_unix
    }

    /// Alive = neither deleted nor expired.
    pub fn is_alive(&self, now_unix: u32) -> bool {
        !self.deleted && !self.is_expired(now_unix)
    }

    fn size_in_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.key.len()
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Default)]
struct KeySlot {
    committed: Option<StoredValue>,
    pending: Option<StoredValue>,
}

impl KeySlot {
    fn is_empty(&self) -> bool {
        self.committed.is_none() && self.pending.is_none()
    }
}

/// Sharded key index with byte accounting against an optional quota.
pub struct HashTable {
    shards: Vec<Mutex<HashMap<DocKey, KeySlot>>>,
    mem_used: AtomicUsize,
    num_items: AtomicUsize,
    quota_bytes: usize,
}

fn hash_key(key: &DocKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl HashTable {
    /// `quota_bytes` of 0 disables the quota.
    pub fn new(shards: usize, quota_bytes: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            mem_used: AtomicUsize::new(0),
            num_items: AtomicUsize::new(0),
            quota_bytes,
        }
    }

    /// Locks the shard owning `key` for the duration of an operation.
    pub fn lock_bucket(&self, key: &DocKey) -> BucketGuard<'_> {
        let idx = (hash_key(key) % self.shards.len() as u64) as usize;
        BucketGuard {
            table: self,
            map: self.shards[idx].lock().expect("hash table lock poisoned"),
        }
    }

    /// Committed value for `key`, skipping any pending prepare.
    pub fn find_for_read(&self, key: &DocKey, wants_deleted: bool) -> Option<StoredValue> {
        let guard = self.lock_bucket(key);
        let sv = guard.read(key)?;
        if sv.deleted && !wants_deleted {
            return None;
        }
        Some(sv.clone())
    }

    /// Pending prepare if one exists, the committed value otherwise.
    pub fn find_for_write(&self, key: &DocKey) -> Option<StoredValue> {
        let guard = self.lock_bucket(key);
        guard.write(key).cloned()
    }

    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// Drops every entry and resets accounting.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().expect("hash table lock poisoned").clear();
        }
        self.mem_used.store(0, Ordering::Relaxed);
        self.num_items.store(0, Ordering::Relaxed);
    }

    fn admit(&self, old_bytes: usize, new_bytes: usize) -> Result<(), Status> {
        if self.quota_bytes > 0 {
            let used = self.mem_used.load(Ordering::Relaxed);
            if used.saturating_sub(old_bytes).saturating_add(new_bytes) > self.quota_bytes {
                return Err(Status::NoMemory);
            }
        }
        Ok(())
    }

    fn account(&self, old_bytes: usize, new_bytes: usize, old_count: usize, new_count: usize) {
        if new_bytes >= old_bytes {
            self.mem_used.fetch_add(new_bytes - old_bytes, Ordering::Relaxed);
        } else {
            self.mem_used.fetch_sub(old_bytes - new_bytes, Ordering::Relaxed);
        }
        if new_count >= old_count {
            self.num_items.fetch_add(new_count - old_count, Ordering::Relaxed);
        } else {
            self.num_items.fetch_sub(old_count - new_count, Ordering::Relaxed);
        }
    }
}

/// Exclusive access to one shard; all mutations go through here so the
/// caller can hold the lock across its precondition checks.
pub struct BucketGuard<'a> {
    table: &'a HashTable,
    map: MutexGuard<'a, HashMap<DocKey, KeySlot>>,
}

impl BucketGuard<'_> {
    /// Committed value, pending prepares skipped.
    pub fn read(&self, key: &DocKey) -> Option<&StoredValue> {
        self.map.get(key)?.committed.as_ref()
    }

    /// Pending prepare for `key`, if any.
    pub fn pending(&self, key: &DocKey) -> Option<&StoredValue> {
        self.map.get(key)?.pending.as_ref()
    }

    /// Write-path view: the pending prepare shadows the committed
    /// value.
    pub fn write(&self, key: &DocKey) -> Option<&StoredValue> {
        let slot = self.map.get(key)?;
        slot.pending.as_ref().or(slot.committed.as_ref())
    }

    /// Quota pre-check for an insert of `item`, replacing the current
    /// committed value when `replacing` is set. Used by write paths
    /// that must fail before the item has been enqueued anywhere.
    pub fn has_capacity_for(&self, key: &DocKey, item: &Item, replacing: bool) -> bool {
        let probe = StoredValue::from_item(item, 0, CommittedState::Pending);
        let old_bytes = if replacing {
            self.map
                .get(key)
                .and_then(|slot| slot.committed.as_ref())
                .map(|sv| sv.size_in_bytes())
                .unwrap_or(0)
        } else {
            0
        };
        self.table.admit(old_bytes, probe.size_in_bytes()).is_ok()
    }

    /// Inserts or replaces the committed value from `item`.
    pub fn set_committed(&mut self, item: &Item, by_seqno: u64) -> Result<(), Status> {
        let sv = StoredValue::from_item(item, by_seqno, CommittedState::CommittedViaMutation);
        let new_bytes = sv.size_in_bytes();
        let slot = self.map.entry(item.key.clone()).or_default();
        let (old_bytes, old_count) = match &slot.committed {
            Some(old) => (old.size_in_bytes(), 1),
            None => (0, 0),
        };
        self.table.admit(old_bytes, new_bytes)?;
        slot.committed = Some(sv);
        self.table.account(old_bytes, new_bytes, old_count, 1);
        Ok(())
    }

    /// Inserts the pending prepare for a synchronous write.
    ///
    /// The caller must have verified no pending prepare exists; a slot
    /// can hold only one.
    pub fn set_pending(&mut self, item: &Item, by_seqno: u64) -> Result<(), Status> {
        let sv = StoredValue::from_item(item, by_seqno, CommittedState::Pending);
        let new_bytes = sv.size_in_bytes();
        self.table.admit(0, new_bytes)?;
        let slot = self.map.entry(item.key.clone()).or_default();
        debug_assert!(slot.pending.is_none(), "second pending prepare for key");
        slot.pending = Some(sv);
        self.table.account(0, new_bytes, 0, 1);
        Ok(())
    }

    /// Moves the pending prepare into the committed position, retagged
    /// `CommittedViaPrepare`. Returns the committed value's seqno.
    pub fn commit_pending(&mut self, key: &DocKey, commit_seqno: u64) -> Option<u64> {
        let slot = self.map.get_mut(key)?;
        let mut sv = slot.pending.take()?;
        let pending_bytes = sv.size_in_bytes();
        sv.committed = CommittedState::CommittedViaPrepare;
        sv.by_seqno = commit_seqno;
        let new_bytes = sv.size_in_bytes();
        let (old_bytes, old_count) = match &slot.committed {
            Some(old) => (old.size_in_bytes(), 1),
            None => (0, 0),
        };
        slot.committed = Some(sv);
        // The pending entry moved, the previous committed entry (if
        // any) was replaced.
        self.table
            .account(old_bytes + pending_bytes, new_bytes, old_count + 1, 1);
        Some(commit_seqno)
    }

    /// Drops the pending prepare (abort path).
    pub fn abort_pending(&mut self, key: &DocKey) -> bool {
        let Some(slot) = self.map.get_mut(key) else {
            return false;
        };
        let Some(sv) = slot.pending.take() else {
            return false;
        };
        let bytes = sv.size_in_bytes();
        if slot.is_empty() {
            self.map.remove(key);
        }
        self.table.account(bytes, 0, 1, 0);
        true
    }

    /// Turns the committed value into a deletion tombstone.
    pub fn delete_committed(&mut self, key: &DocKey, by_seqno: u64, cas: u64) -> bool {
        let Some(slot) = self.map.get_mut(key) else {
            return false;
        };
        let Some(sv) = slot.committed.as_mut() else {
            return false;
        };
        let old_bytes = sv.size_in_bytes();
        sv.value = None;
        sv.deleted = true;
        sv.by_seqno = by_seqno;
        sv.cas = cas;
        sv.lock_deadline = None;
        let new_bytes = sv.size_in_bytes();
        self.table.account(old_bytes, new_bytes, 1, 1);
        true
    }

    /// Ejects the committed value's payload, keeping the metadata.
    pub fn eject_value(&mut self, key: &DocKey) -> bool {
        let Some(slot) = self.map.get_mut(key) else {
            return false;
        };
        let Some(sv) = slot.committed.as_mut() else {
            return false;
        };
        if !sv.is_resident() {
            return false;
        }
        let old_bytes = sv.size_in_bytes();
        sv.value = None;
        let new_bytes = sv.size_in_bytes();
        self.table.account(old_bytes, new_bytes, 1, 1);
        true
    }

    /// Sets or clears the committed value's lock.
    pub fn set_lock(&mut self, key: &DocKey, deadline: Option<Instant>, cas: u64) -> bool {
        let Some(slot) = self.map.get_mut(key) else {
            return false;
        };
        let Some(sv) = slot.committed.as_mut() else {
            return false;
        };
        sv.lock_deadline = deadline;
        sv.cas = cas;
        true
    }

    /// Updates the committed value's expiry (touch path).
    pub fn update_expiry(&mut self, key: &DocKey, expiry: u32, cas: u64, by_seqno: u64) -> bool {
        let Some(slot) = self.map.get_mut(key) else {
            return false;
        };
        let Some(sv) = slot.committed.as_mut() else {
            return false;
        };
        sv.expiry = expiry;
        sv.cas = cas;
        sv.by_seqno = by_seqno;
        true
    }

    /// Removes the whole slot (tombstone purge).
    pub fn erase(&mut self, key: &DocKey) -> bool {
        let Some(slot) = self.map.remove(key) else {
            return false;
        };
        let mut bytes = 0;
        let mut count = 0;
        if let Some(sv) = &slot.committed {
            bytes += sv.size_in_bytes();
            count += 1;
        }
        if let Some(sv) = &slot.pending {
            bytes += sv.size_in_bytes();
            count += 1;
        }
        self.table.account(bytes, 0, count, 0);
        true
    }
}
