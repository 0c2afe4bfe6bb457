//! Ordered, snapshot-bounded queues of outgoing mutations.
//!
//! Every mutation a VBucket accepts is appended to the open checkpoint
//! in seqno order. Named cursors (replication, persistence) drain the
//! queue at their own pace and retain the checkpoints they still
//! reference; closed checkpoints nobody references are collected.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::item::{Item, QueueOp};

/// Strictly monotonic seqno allocator for one VBucket.
///
/// Allocation happens under the checkpoint manager lock, which is what
/// makes allocation order and queue order the same order.
#[derive(Debug)]
pub struct SeqnoCounter {
    high: u64,
}

impl SeqnoCounter {
    pub fn new(high: u64) -> Self {
        Self { high }
    }

    pub fn allocate(&mut self) -> u64 {
        self.high += 1;
        self.high
    }

    /// Last seqno handed out (or adopted from a replication stream).
    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn advance_to(&mut self, seqno: u64) {
        self.high = self.high.max(seqno);
    }

    pub fn reset(&mut self, high: u64) {
        self.high = high;
    }
}

/// `[start, end]` seqno bounds of the open logical snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotRange {
    pub start: u64,
    pub end: u64,
}

impl SnapshotRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, seqno: u64) -> bool {
        self.start <= seqno && seqno <= self.end
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("seqno {got} below the last queued seqno {last}")]
    NonMonotonicSeqno { last: u64, got: u64 },
    #[error("seqno {seqno} outside the open snapshot [{start}, {end}]")]
    OutsideSnapshot { seqno: u64, start: u64, end: u64 },
    #[error("unknown cursor: {0}")]
    UnknownCursor(String),
}

/// One entry in a checkpoint. Meta entries carry no document.
#[derive(Clone, Debug)]
pub struct QueuedItem {
    pub op: QueueOp,
    pub seqno: u64,
    pub item: Option<Item>,
}

impl QueuedItem {
    fn size_in_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .item
                .as_ref()
                .map(|item| item.size_in_bytes())
                .unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CheckpointPhase {
    Open,
    Closed,
}

#[derive(Debug)]
struct Checkpoint {
    id: u64,
    phase: CheckpointPhase,
    snapshot: SnapshotRange,
    entries: Vec<QueuedItem>,
    bytes: usize,
}

impl Checkpoint {
    fn new(id: u64, snapshot: SnapshotRange, seqno: u64) -> Self {
        let start = QueuedItem {
            op: QueueOp::CheckpointStart,
            seqno,
            item: None,
        };
        let bytes = start.size_in_bytes();
        Self {
            id,
            phase: CheckpointPhase::Open,
            snapshot,
            entries: vec![start],
            bytes,
        }
    }

    fn push(&mut self, entry: QueuedItem) {
        self.bytes += entry.size_in_bytes();
        self.entries.push(entry);
    }

    fn close(&mut self, seqno: u64) {
        self.push(QueuedItem {
            op: QueueOp::CheckpointEnd,
            seqno,
            item: None,
        });
        self.phase = CheckpointPhase::Closed;
    }

    fn num_items(&self) -> usize {
        self.entries.iter().filter(|e| !e.op.is_meta()).count()
    }
}

#[derive(Clone, Debug)]
struct Cursor {
    checkpoint_id: u64,
    /// Index of the next entry to hand out.
    index: usize,
}

#[derive(Debug)]
struct ManagerState {
    seqnos: SeqnoCounter,
    snapshot: SnapshotRange,
    checkpoints: VecDeque<Checkpoint>,
    next_checkpoint_id: u64,
    cursors: HashMap<String, Cursor>,
    max_items: usize,
}

impl ManagerState {
    fn open_checkpoint(&mut self) -> &mut Checkpoint {
        self.checkpoints
            .back_mut()
            .expect("manager always holds an open checkpoint")
    }

    fn close_open_and_begin_new(&mut self) {
        let high = self.seqnos.high();
        let snapshot = self.snapshot;
        self.open_checkpoint().close(high);
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        self.checkpoints.push_back(Checkpoint::new(id, snapshot, high));
    }

    fn queue(
        &mut self,
        op: QueueOp,
        item: &mut Item,
        enforce_snapshot: bool,
    ) -> Result<u64, CheckpointError> {
        let seqno = match item.by_seqno {
            None => {
                let seqno = self.seqnos.allocate();
                // The mutation path advances the open snapshot as it
                // generates seqnos.
                self.snapshot.end = self.snapshot.end.max(seqno);
                item.by_seqno = Some(seqno);
                seqno
            }
            Some(seqno) => {
                let last = self.seqnos.high();
                if seqno < last {
                    return Err(CheckpointError::NonMonotonicSeqno { last, got: seqno });
                }
                if enforce_snapshot {
                    // Replica side: the transport announced the range
                    // and every entry must fall inside it.
                    if !self.snapshot.contains(seqno) {
                        return Err(CheckpointError::OutsideSnapshot {
                            seqno,
                            start: self.snapshot.start,
                            end: self.snapshot.end,
                        });
                    }
                } else {
                    self.snapshot.end = self.snapshot.end.max(seqno);
                }
                self.seqnos.advance_to(seqno);
                seqno
            }
        };

        if self.open_checkpoint().num_items() >= self.max_items {
            self.close_open_and_begin_new();
        }
        let snapshot = self.snapshot;
        let open = self.open_checkpoint();
        open.snapshot = snapshot;
        open.push(QueuedItem {
            op,
            seqno,
            item: Some(item.clone()),
        });
        Ok(seqno)
    }

    fn checkpoint_index(&self, id: u64) -> Option<usize> {
        self.checkpoints.iter().position(|c| c.id == id)
    }

    /// Drops closed checkpoints from the front while no cursor
    /// references them. Returns the count removed.
    fn remove_closed_unreferenced(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let Some(front) = self.checkpoints.front() else {
                break;
            };
            if front.phase != CheckpointPhase::Closed {
                break;
            }
            let referenced = self
                .cursors
                .values()
                .any(|cursor| cursor.checkpoint_id == front.id);
            if referenced {
                break;
            }
            self.checkpoints.pop_front();
            removed += 1;
        }
        removed
    }

    fn oldest_position(&self) -> Cursor {
        let front = self
            .checkpoints
            .front()
            .expect("manager always holds an open checkpoint");
        Cursor {
            checkpoint_id: front.id,
            index: 0,
        }
    }
}

/// Ordered sequence of checkpoints plus the cursors draining them.
pub struct CheckpointManager {
    state: Mutex<ManagerState>,
}

impl CheckpointManager {
    pub fn new(max_items: usize, initial_high_seqno: u64) -> Self {
        let snapshot = SnapshotRange::new(initial_high_seqno, initial_high_seqno);
        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(Checkpoint::new(1, snapshot, initial_high_seqno));
        Self {
            state: Mutex::new(ManagerState {
                seqnos: SeqnoCounter::new(initial_high_seqno),
                snapshot,
                checkpoints,
                next_checkpoint_id: 2,
                cursors: HashMap::new(),
                max_items: max_items.max(1),
            }),
        }
    }

    /// Locks the manager for a write-path admission: seqno allocation
    /// and enqueueing stay one atomic step while the caller also holds
    /// the hash-table bucket lock.
    pub fn lock(&self) -> CheckpointWriteGuard<'_> {
        CheckpointWriteGuard {
            state: self.state.lock().expect("checkpoint manager poisoned"),
        }
    }

    /// Appends an entry, allocating a seqno when the item has none.
    /// A provided seqno advances the open snapshot (active side).
    pub fn queue_dirty(&self, op: QueueOp, item: &mut Item) -> Result<u64, CheckpointError> {
        self.lock().queue_dirty(op, item)
    }

    /// Appends an entry whose provided seqno must fall inside the
    /// announced snapshot (replica side).
    pub fn queue_dirty_bounded(
        &self,
        op: QueueOp,
        item: &mut Item,
    ) -> Result<u64, CheckpointError> {
        self.lock().queue_dirty_bounded(op, item)
    }

    /// Opens a new snapshot `[start, end]`; subsequent provided-seqno
    /// entries must fall inside it. A non-empty open checkpoint is
    /// closed first.
    pub fn create_snapshot(&self, start: u64, end: u64) {
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        state.snapshot = SnapshotRange::new(start, end);
        if state.open_checkpoint().num_items() > 0 {
            state.close_open_and_begin_new();
        } else {
            let snapshot = state.snapshot;
            state.open_checkpoint().snapshot = snapshot;
        }
    }

    /// Queues a vbstate meta entry into the open checkpoint.
    pub fn queue_vbucket_state_meta(&self) {
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        let seqno = state.seqnos.high();
        state.open_checkpoint().push(QueuedItem {
            op: QueueOp::SetVBucketState,
            seqno,
            item: None,
        });
    }

    /// Registers a cursor at the oldest retained position.
    pub fn register_cursor(&self, name: &str) {
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        let position = state.oldest_position();
        state.cursors.insert(name.to_string(), position);
    }

    /// Drops a cursor, releasing whatever it retained.
    pub fn remove_cursor(&self, name: &str) -> bool {
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        let removed = state.cursors.remove(name).is_some();
        if removed {
            state.remove_closed_unreferenced();
        }
        removed
    }

    pub fn remove_all_cursors(&self) {
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        state.cursors.clear();
        state.remove_closed_unreferenced();
    }

    /// Returns up to `limit` entries at the cursor and advances it.
    pub fn get_items(&self, name: &str, limit: usize) -> Result<Vec<QueuedItem>, CheckpointError> {
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        let mut cursor = state
            .cursors
            .get(name)
            .cloned()
            .ok_or_else(|| CheckpointError::UnknownCursor(name.to_string()))?;

        let mut out = Vec::new();
        while out.len() < limit {
            let Some(idx) = state.checkpoint_index(cursor.checkpoint_id) else {
                break;
            };
            let checkpoint = &state.checkpoints[idx];
            if cursor.index < checkpoint.entries.len() {
                out.push(checkpoint.entries[cursor.index].clone());
                cursor.index += 1;
                continue;
            }
            if checkpoint.phase == CheckpointPhase::Open {
                break;
            }
            match state.checkpoints.get(idx + 1) {
                Some(next) => {
                    cursor = Cursor {
                        checkpoint_id: next.id,
                        index: 0,
                    };
                }
                None => break,
            }
        }

        state.cursors.insert(name.to_string(), cursor);
        state.remove_closed_unreferenced();
        Ok(out)
    }

    /// Atomically migrates every cursor registered on `other` onto this
    /// manager's oldest position (VBucket reset path).
    pub fn take_and_reset_cursors(&self, other: &CheckpointManager) {
        let names: Vec<String> = {
            let mut other_state = other.state.lock().expect("checkpoint manager poisoned");
            let names = other_state.cursors.keys().cloned().collect();
            other_state.cursors.clear();
            other_state.remove_closed_unreferenced();
            names
        };
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        let position = state.oldest_position();
        for name in names {
            state.cursors.insert(name, position.clone());
        }
    }

    /// Drops every checkpoint and starts fresh at `last_by_seqno`.
    /// Registered cursors are repositioned onto the new checkpoint.
    pub fn clear(&self, last_by_seqno: u64) {
        let mut state = self.state.lock().expect("checkpoint manager poisoned");
        state.seqnos.reset(last_by_seqno);
        state.snapshot = SnapshotRange::new(last_by_seqno, last_by_seqno);
        let id = state.next_checkpoint_id;
        state.next_checkpoint_id += 1;
        let snapshot = state.snapshot;
        state.checkpoints.clear();
        state
            .checkpoints
            .push_back(Checkpoint::new(id, snapshot, last_by_seqno));
        let position = state.oldest_position();
        for cursor in state.cursors.values_mut() {
            *cursor = position.clone();
        }
    }

    /// Explicit collection entry point for the eviction pager.
    pub fn remove_closed_unreferenced(&self) -> usize {
        self.state
            .lock()
            .expect("checkpoint manager poisoned")
            .remove_closed_unreferenced()
    }

    pub fn high_seqno(&self) -> u64 {
        self.state
            .lock()
            .expect("checkpoint manager poisoned")
            .seqnos
            .high()
    }

    pub fn snapshot_range(&self) -> SnapshotRange {
        self.state
            .lock()
            .expect("checkpoint manager poisoned")
            .snapshot
    }

    /// Id of the open checkpoint.
    pub fn checkpoint_id(&self) -> u64 {
        let state = self.state.lock().expect("checkpoint manager poisoned");
        state
            .checkpoints
            .back()
            .map(|c| c.id)
            .unwrap_or(0)
    }

    pub fn num_checkpoints(&self) -> usize {
        self.state
            .lock()
            .expect("checkpoint manager poisoned")
            .checkpoints
            .len()
    }

    /// Non-meta entries across every retained checkpoint.
    pub fn num_items(&self) -> usize {
        self.state
            .lock()
            .expect("checkpoint manager poisoned")
            .checkpoints
            .iter()
            .map(|c| c.num_items())
            .sum()
    }

    /// Entry bytes across every retained checkpoint.
    pub fn used_bytes(&self) -> usize {
        self.state
            .lock()
            .expect("checkpoint manager poisoned")
            .checkpoints
            .iter()
            .map(|c| c.bytes)
            .sum()
    }

    /// Bytes held only by closed checkpoints no cursor references;
    /// reclaimable by [`remove_closed_unreferenced`].
    ///
    /// [`remove_closed_unreferenced`]: Self::remove_closed_unreferenced
    pub fn unreferenced_bytes(&self) -> usize {
        let state = self.state.lock().expect("checkpoint manager poisoned");
        let mut bytes = 0;
        for checkpoint in &state.checkpoints {
            if checkpoint.phase != CheckpointPhase::Closed {
                break;
            }
            let referenced = state
                .cursors
                .values()
                .any(|cursor| cursor.checkpoint_id == checkpoint.id);
            if referenced {
                break;
            }
            bytes += checkpoint.bytes;
        }
        bytes
    }

    /// Bookkeeping overhead estimate: checkpoint and cursor structures,
    /// excluding entry payloads.
    pub fn overhead_bytes(&self) -> usize {
        let state = self.state.lock().expect("checkpoint manager poisoned");
        state.checkpoints.len() * std::mem::size_of::<Checkpoint>()
            + state.cursors.len() * (std::mem::size_of::<Cursor>() + 16)
    }

    /// Seqnos of the non-meta entries, oldest first. Test hook.
    #[cfg(test)]
    fn non_meta_seqnos(&self) -> Vec<u64> {
        let state = self.state.lock().expect("checkpoint manager poisoned");
        state
            .checkpoints
            .iter()
            .flat_map(|c| c.entries.iter())
            .filter(|e| !e.op.is_meta())
            .map(|e| e.seqno)
            .collect()
    }
}

/// Write-path admission guard; see [`CheckpointManager::lock`].
pub struct CheckpointWriteGuard<'a> {
    state: MutexGuard<'a, ManagerState>,
}

impl CheckpointWriteGuard<'_> {
    pub fn queue_dirty(&mut self, op: QueueOp, item: &mut Item) -> Result<u64, CheckpointError> {
        self.state.queue(op, item, false)
    }

    pub fn queue_dirty_bounded(
        &mut self,
        op: QueueOp,
        item: &mut Item,
    ) -> Result<u64, CheckpointError> {
        self.state.queue(op, item, true)
    }

    pub fn high_seqno(&self) -> u64 {
        self.state.seqnos.high()
    }

    pub fn snapshot_range(&self) -> SnapshotRange {
        self.state.snapshot
    }
}
