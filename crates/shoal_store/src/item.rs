//! Self-describing mutations flowing through the write path.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use shoal_durability::Requirements;

/// Collection identifier within a bucket.
pub type CollectionId = u32;

/// The default collection every bucket starts with.
pub const DEFAULT_COLLECTION: CollectionId = 0;

/// CAS value treated as a wildcard on client writes.
pub const CAS_WILDCARD: u64 = 0;

/// Reserved CAS marker; never a valid stored CAS.
pub const CAS_LOCKED_MARKER: u64 = u64::MAX;

pub fn is_valid_cas(cas: u64) -> bool {
    cas != CAS_LOCKED_MARKER
}

/// Seconds since the epoch, the granularity document expiries use.
pub fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .min(u64::from(u32::MAX)) as u32
}

/// Document key scoped to a collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub collection: CollectionId,
    pub key: Bytes,
}

impl DocKey {
    pub fn new(collection: CollectionId, key: impl Into<Bytes>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    /// Key in the default collection.
    pub fn app(key: impl Into<Bytes>) -> Self {
        Self::new(DEFAULT_COLLECTION, key)
    }

    /// Flat encoding (collection prefix + key bytes) used where keys
    /// travel as plain byte strings.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.key.len());
        out.extend_from_slice(&self.collection.to_be_bytes());
        out.extend_from_slice(&self.key);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&bytes[..4]);
        Some(Self {
            collection: CollectionId::from_be_bytes(prefix),
            key: Bytes::copy_from_slice(&bytes[4..]),
        })
    }
}

/// Value datatype bits.
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

/// Operation requested by a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Set,
    Add,
    Replace,
    Delete,
}

/// Kind of entry queued into a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOp {
    Mutation,
    PendingSyncWrite,
    CommitSyncWrite,
    AbortSyncWrite,
    CheckpointStart,
    CheckpointEnd,
    SetVBucketState,
}

impl QueueOp {
    /// Meta entries bracket checkpoints and carry no document payload;
    /// they are excluded from item counts and seqno ordering checks.
    pub fn is_meta(self) -> bool {
        matches!(
            self,
            QueueOp::CheckpointStart | QueueOp::CheckpointEnd | QueueOp::SetVBucketState
        )
    }
}

/// A self-describing mutation.
#[derive(Clone, Debug)]
pub struct Item {
    pub key: DocKey,
    /// `None` for deletions.
    pub value: Option<Bytes>,
    pub cas: u64,
    pub flags: u32,
    /// Absolute expiry in unix seconds; 0 means never.
    pub expiry: u32,
    pub datatype: u8,
    pub operation: Operation,
    pub rev_seqno: u64,
    /// Assigned at checkpoint admission on active VBuckets; fixed by
    /// the replication stream on replicas.
    pub by_seqno: Option<u64>,
    pub durability: Option<Requirements>,
    pub deleted: bool,
}

impl Item {
    pub fn set(key: DocKey, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: Some(value.into()),
            cas: CAS_WILDCARD,
            flags: 0,
            expiry: 0,
            datatype: datatype::RAW,
            operation: Operation::Set,
            rev_seqno: 1,
            by_seqno: None,
            durability: None,
            deleted: false,
        }
    }

    pub fn deletion(key: DocKey) -> Self {
        Self {
            key,
            value: None,
            cas: CAS_WILDCARD,
            flags: 0,
            expiry: 0,
            datatype: datatype::RAW,
            operation: Operation::Delete,
            rev_seqno: 1,
            by_seqno: None,
            durability: None,
            deleted: true,
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_durability(mut self, requirements: Requirements) -> Self {
        self.durability = Some(requirements);
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    /// Estimated heap footprint, used for queue and index accounting.
    pub fn size_in_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.key.len()
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

/// Metadata tuple used for replica-side conflict resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConflictMeta {
    pub rev_seqno: u64,
    pub cas: u64,
    pub expiry: u32,
}

impl ConflictMeta {
    pub fn of(item: &Item) -> Self {
        Self {
            rev_seqno: item.rev_seqno,
            cas: item.cas,
            expiry: item.expiry,
        }
    }

    /// Lexicographic `(rev_seqno, cas, expiry)` winner selection.
    pub fn wins_over(&self, other: &ConflictMeta) -> bool {
        (self.rev_seqno, self.cas, self.expiry) > (other.rev_seqno, other.cas, other.expiry)
    }
}
