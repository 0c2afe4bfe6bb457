//! Engine configuration with environment overrides.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_VBUCKETS: usize = 1024;
const DEFAULT_HT_BUCKETS: usize = 769;
const DEFAULT_CHECKPOINT_MAX_ITEMS: usize = 10_000;
const DEFAULT_FAILOVER_MAX_ENTRIES: usize = 25;
const DEFAULT_LOCK_WINDOW_SECS: u64 = 15;
const DEFAULT_MAX_ITEM_SIZE_BYTES: usize = 20 * 1024 * 1024;

/// Tunables shared by every VBucket in the bucket.
///
/// Values come from defaults and may be overridden through `SHOAL_*`
/// environment variables at construction time.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Number of VBucket slots in the registry.
    pub max_vbuckets: usize,
    /// Hash table shard count per VBucket.
    pub ht_buckets: usize,
    /// Per-VBucket hash table memory quota in bytes; 0 disables the
    /// quota.
    pub ht_quota_bytes: usize,
    /// Non-meta items after which an open checkpoint is closed.
    pub checkpoint_max_items: usize,
    /// Bucket-wide ceiling applied to document expiries.
    pub max_ttl: Option<Duration>,
    /// Bound on the failover table length.
    pub failover_max_entries: usize,
    /// Default duration of a `get_locked` lock.
    pub lock_window: Duration,
    /// Largest accepted document (key plus value).
    pub max_item_size_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_vbuckets: DEFAULT_MAX_VBUCKETS,
            ht_buckets: DEFAULT_HT_BUCKETS,
            ht_quota_bytes: 0,
            checkpoint_max_items: DEFAULT_CHECKPOINT_MAX_ITEMS,
            max_ttl: None,
            failover_max_entries: DEFAULT_FAILOVER_MAX_ENTRIES,
            lock_window: Duration::from_secs(DEFAULT_LOCK_WINDOW_SECS),
            max_item_size_bytes: DEFAULT_MAX_ITEM_SIZE_BYTES,
        }
    }
}

impl StoreConfig {
    /// Defaults with `SHOAL_*` environment overrides applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_vbuckets: read_env_usize("SHOAL_MAX_VBUCKETS", defaults.max_vbuckets).max(1),
            ht_buckets: read_env_usize("SHOAL_HT_BUCKETS", defaults.ht_buckets).max(1),
            ht_quota_bytes: read_env_usize("SHOAL_HT_QUOTA_BYTES", defaults.ht_quota_bytes),
            checkpoint_max_items: read_env_usize(
                "SHOAL_CHECKPOINT_MAX_ITEMS",
                defaults.checkpoint_max_items,
            )
            .max(1),
            max_ttl: match read_env_u64("SHOAL_MAX_TTL_SECS", 0) {
                0 => defaults.max_ttl,
                secs => Some(Duration::from_secs(secs)),
            },
            failover_max_entries: read_env_usize(
                "SHOAL_FAILOVER_MAX_ENTRIES",
                defaults.failover_max_entries,
            )
            .max(1),
            lock_window: Duration::from_secs(
                read_env_u64("SHOAL_LOCK_WINDOW_SECS", DEFAULT_LOCK_WINDOW_SECS).max(1),
            ),
            max_item_size_bytes: read_env_usize(
                "SHOAL_MAX_ITEM_SIZE_BYTES",
                defaults.max_item_size_bytes,
            )
            .max(1),
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}
