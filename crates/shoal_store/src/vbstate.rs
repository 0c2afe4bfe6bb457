//! Persisted per-VBucket state blob and its file-backed store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::failover::FailoverEntry;
use crate::vbucket::{VBucketState, Vbid};

/// Sentinel for an uninitialised HLC epoch.
pub const HLC_EPOCH_UNINITIALISED: i64 = -1;

/// The durable per-VBucket metadata blob (stable JSON key set).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedVbState {
    pub state: VBucketState,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u64,
    pub high_seqno: i64,
    pub purge_seqno: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub max_cas: u64,
    pub hlc_cas_epoch_seqno: i64,
    pub might_contain_xattrs: bool,
    pub failover_table: Vec<FailoverEntry>,
    pub supports_collections: bool,
}

impl PersistedVbState {
    /// A vbstate must be re-persisted iff the state or the failover
    /// table changed since the last persist.
    pub fn needs_to_be_persisted(&self, previous: &PersistedVbState) -> bool {
        self.state != previous.state || self.failover_table != previous.failover_table
    }

    /// Zeroes every counter, keeping only the state tag.
    pub fn reset(&mut self) {
        self.checkpoint_id = 0;
        self.max_deleted_seqno = 0;
        self.high_seqno = 0;
        self.purge_seqno = 0;
        self.snap_start = 0;
        self.snap_end = 0;
        self.max_cas = 0;
        self.hlc_cas_epoch_seqno = HLC_EPOCH_UNINITIALISED;
        self.might_contain_xattrs = false;
        self.failover_table.clear();
    }
}

/// File-backed vbstate store, one JSON blob per VBucket.
#[derive(Debug)]
pub struct VbStateStore {
    dir: PathBuf,
}

impl VbStateStore {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create vbstate dir")?;
        Ok(Self { dir })
    }

    fn blob_path(&self, vbid: Vbid) -> PathBuf {
        self.dir.join(format!("vbstate_{vbid}.json"))
    }

    pub fn load(&self, vbid: Vbid) -> anyhow::Result<Option<PersistedVbState>> {
        let path = self.blob_path(vbid);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read vbstate blob"),
        };
        let state = serde_json::from_slice(&data).context("decode vbstate blob")?;
        Ok(Some(state))
    }

    /// Writes the blob via a temp file and rename so readers never see
    /// a torn state.
    pub fn persist(&self, vbid: Vbid, state: &PersistedVbState) -> anyhow::Result<()> {
        let path = self.blob_path(vbid);
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec(state).context("encode vbstate blob")?;
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .context("open vbstate temp")?;
        out.write_all(&data)?;
        out.sync_all()?;
        fs::rename(&tmp_path, &path).context("replace vbstate blob")?;
        Ok(())
    }

    /// Persists only when the change-detection policy requires it.
    /// Returns whether a write happened.
    pub fn maybe_persist(&self, vbid: Vbid, state: &PersistedVbState) -> anyhow::Result<bool> {
        if let Some(previous) = self.load(vbid)? {
            if !state.needs_to_be_persisted(&previous) {
                return Ok(false);
            }
        }
        self.persist(vbid, state)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedVbState {
        PersistedVbState {
            state: VBucketState::Active,
            checkpoint_id: 2,
            max_deleted_seqno: 7,
            high_seqno: 42,
            purge_seqno: 3,
            snap_start: 40,
            snap_end: 42,
            max_cas: 0x1122_3344_5566_7788,
            hlc_cas_epoch_seqno: HLC_EPOCH_UNINITIALISED,
            might_contain_xattrs: false,
            failover_table: vec![
                FailoverEntry { uuid: 99, seq: 40 },
                FailoverEntry { uuid: 98, seq: 0 },
            ],
            supports_collections: true,
        }
    }

    #[test]
    fn blob_round_trips_unchanged() {
        let state = sample();
        let blob = serde_json::to_value(&state).expect("encode");
        let decoded: PersistedVbState = serde_json::from_value(blob.clone()).expect("decode");
        assert_eq!(state, decoded);
        assert_eq!(blob, serde_json::to_value(&decoded).expect("re-encode"));
    }

    #[test]
    fn blob_uses_the_stable_key_set() {
        let blob = serde_json::to_value(sample()).expect("encode");
        let object = blob.as_object().expect("object");
        for key in [
            "state",
            "checkpoint_id",
            "max_deleted_seqno",
            "high_seqno",
            "purge_seqno",
            "snap_start",
            "snap_end",
            "max_cas",
            "hlc_cas_epoch_seqno",
            "might_contain_xattrs",
            "failover_table",
            "supports_collections",
        ] {
            assert!(object.contains_key(key), "missing key {key}");
        }
        assert_eq!("active", blob["state"]);
        assert_eq!(40, blob["failover_table"][0]["seq"]);
    }

    #[test]
    fn persist_policy_tracks_state_and_failovers_only() {
        let base = sample();

        let mut counters_only = base.clone();
        counters_only.high_seqno = 1000;
        counters_only.max_cas = 1;
        assert!(!counters_only.needs_to_be_persisted(&base));

        let mut state_change = base.clone();
        state_change.state = VBucketState::Replica;
        assert!(state_change.needs_to_be_persisted(&base));

        let mut failover_change = base.clone();
        failover_change
            .failover_table
            .insert(0, FailoverEntry { uuid: 1, seq: 50 });
        assert!(failover_change.needs_to_be_persisted(&base));
    }

    #[test]
    fn reset_restores_the_epoch_sentinel() {
        let mut state = sample();
        state.reset();
        assert_eq!(0, state.high_seqno);
        assert_eq!(HLC_EPOCH_UNINITIALISED, state.hlc_cas_epoch_seqno);
        assert!(state.failover_table.is_empty());
        assert_eq!(VBucketState::Active, state.state);
    }

    #[test]
    fn store_round_trips_and_applies_the_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VbStateStore::open_dir(dir.path()).expect("open store");

        assert_eq!(None, store.load(3).expect("load empty"));

        let state = sample();
        assert!(store.maybe_persist(3, &state).expect("first persist"));
        assert_eq!(Some(state.clone()), store.load(3).expect("load"));

        // Counter-only drift does not hit the disk again.
        let mut drifted = state.clone();
        drifted.high_seqno = 500;
        assert!(!store.maybe_persist(3, &drifted).expect("skip persist"));

        let mut flipped = state;
        flipped.state = VBucketState::Dead;
        assert!(store.maybe_persist(3, &flipped).expect("state change"));
        assert_eq!(
            VBucketState::Dead,
            store.load(3).expect("reload").expect("present").state
        );
    }
}
