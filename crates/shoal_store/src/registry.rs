//! VBucket registry: the id-indexed map and its state transitions.
//!
//! Admin-path transitions serialize on a per-id mutex so that a state
//! change never interleaves with a concurrent create or drop of the
//! same VBucket. Dropping a VBucket replaces it with nothing
//! immediately and hands the instance to a teardown worker thread.

use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;

use anyhow::Context;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::collections::CollectionsManifest;
use crate::config::StoreConfig;
use crate::status::Status;
use crate::vbucket::{Topology, VBucket, VBucketState, Vbid};

/// State-change failure: the status code plus the context message the
/// admin surface reports verbatim.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StateChangeError {
    pub status: Status,
    pub message: String,
}

impl StateChangeError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: Status::InvalidArguments,
            message: message.into(),
        }
    }

    fn not_my_vbucket(vbid: Vbid) -> Self {
        Self {
            status: Status::NotMyVbucket,
            message: format!("no vbucket {vbid}"),
        }
    }
}

struct Slot {
    vb: RwLock<Option<Arc<VBucket>>>,
    transition: Mutex<()>,
}

/// Dense map of VBucket-id to VBucket.
pub struct Registry {
    slots: Vec<Slot>,
    config: Arc<StoreConfig>,
    manifest: Arc<CollectionsManifest>,
    teardown_tx: mpsc::Sender<Arc<VBucket>>,
}

impl Registry {
    pub fn new(
        config: Arc<StoreConfig>,
        manifest: Arc<CollectionsManifest>,
    ) -> anyhow::Result<Self> {
        let (teardown_tx, teardown_rx) = mpsc::channel::<Arc<VBucket>>();
        thread::Builder::new()
            .name("vb-teardown".to_string())
            .spawn(move || {
                while let Ok(vb) = teardown_rx.recv() {
                    let id = vb.id();
                    vb.clear();
                    info!(vb = id, "vbucket torn down");
                }
            })
            .context("spawn vbucket teardown thread")?;

        let slots = (0..config.max_vbuckets)
            .map(|_| Slot {
                vb: RwLock::new(None),
                transition: Mutex::new(()),
            })
            .collect();
        Ok(Self {
            slots,
            config,
            manifest,
            teardown_tx,
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn get_bucket(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        self.slots
            .get(usize::from(vbid))?
            .vb
            .read()
            .expect("registry slot lock poisoned")
            .clone()
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<VBucket>)) {
        for slot in &self.slots {
            let vb = slot.vb.read().expect("registry slot lock poisoned").clone();
            if let Some(vb) = vb {
                visitor(&vb);
            }
        }
    }

    /// Validates state-change metadata and extracts the replication
    /// topology, if any. Returns the human-readable rejection reason
    /// on failure.
    pub fn validate_set_state_meta(meta: &Value) -> Result<Option<Topology>, String> {
        let Some(topology) = meta.get("topology") else {
            return Ok(None);
        };
        let chains = topology
            .as_array()
            .ok_or_else(|| "'topology' must be an array".to_string())?;
        if chains.is_empty() || chains.len() > 2 {
            return Err("'topology' must contain 1..2 elements".to_string());
        }
        let mut parsed: Vec<Vec<String>> = Vec::with_capacity(chains.len());
        for (i, chain) in chains.iter().enumerate() {
            let nodes = chain
                .as_array()
                .ok_or_else(|| format!("chain[{i}] must be an array"))?;
            if nodes.is_empty() || nodes.len() > 4 {
                return Err(format!("chain[{i}] must contain 1..4 nodes"));
            }
            let mut out = Vec::with_capacity(nodes.len());
            for (j, node) in nodes.iter().enumerate() {
                let node = node
                    .as_str()
                    .ok_or_else(|| format!("chain[{i}] node[{j}] must be a string"))?;
                out.push(node.to_string());
            }
            parsed.push(out);
        }
        let mut chains = parsed.into_iter();
        let first = chains.next().expect("validated non-empty above");
        Ok(Some(Topology {
            first,
            second: chains.next(),
        }))
    }

    /// Creates or transitions the VBucket at `vbid`.
    pub fn set_state(
        &self,
        vbid: Vbid,
        state: VBucketState,
        meta: Option<&Value>,
    ) -> Result<(), StateChangeError> {
        let slot = self
            .slots
            .get(usize::from(vbid))
            .ok_or_else(|| StateChangeError::invalid(format!("vbucket {vbid} out of range")))?;
        let topology = match meta {
            Some(meta) => Self::validate_set_state_meta(meta).map_err(StateChangeError::invalid)?,
            None => None,
        };

        let _transition = slot.transition.lock().expect("transition lock poisoned");
        let existing = slot
            .vb
            .read()
            .expect("registry slot lock poisoned")
            .clone();
        match existing {
            Some(vb) => vb
                .set_state(state, topology)
                .map_err(|err| StateChangeError::invalid(err.to_string())),
            None => {
                let vb = VBucket::new(
                    vbid,
                    state,
                    Arc::clone(&self.config),
                    Arc::clone(&self.manifest),
                );
                if topology.is_some() {
                    vb.set_state(state, topology)
                        .map_err(|err| StateChangeError::invalid(err.to_string()))?;
                }
                info!(vb = vbid, state = %state, "vbucket created");
                *slot.vb.write().expect("registry slot lock poisoned") = Some(vb);
                Ok(())
            }
        }
    }

    /// Atomically replaces the VBucket with nothing and schedules its
    /// teardown on the worker thread. The instance transitions to
    /// `dead` first, so parked clients and tracked prepares resolve.
    pub fn drop_and_defer(&self, vbid: Vbid) -> Result<(), StateChangeError> {
        let slot = self
            .slots
            .get(usize::from(vbid))
            .ok_or_else(|| StateChangeError::invalid(format!("vbucket {vbid} out of range")))?;
        let _transition = slot.transition.lock().expect("transition lock poisoned");
        let Some(vb) = slot
            .vb
            .write()
            .expect("registry slot lock poisoned")
            .take()
        else {
            return Err(StateChangeError::not_my_vbucket(vbid));
        };
        if let Err(err) = vb.set_state(VBucketState::Dead, None) {
            warn!(vb = vbid, error = %err, "dead transition during drop");
        }
        if self.teardown_tx.send(vb).is_err() {
            warn!(vb = vbid, "teardown worker gone, dropping vbucket inline");
        }
        Ok(())
    }
}
