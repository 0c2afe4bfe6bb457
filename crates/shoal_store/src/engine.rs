//! Engine front: routes the command surface to the owning VBucket.
//!
//! This is the layer a connection handler talks to. It owns the
//! registry, the collections manifest and the shared configuration,
//! resolves the VBucket for each command and forwards; all state and
//! precondition arbitration happens inside the VBucket itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use shoal_durability::Requirements;

use crate::collections::{CollectionsManifest, Manifest};
use crate::config::StoreConfig;
use crate::item::{DocKey, Item};
use crate::registry::{Registry, StateChangeError};
use crate::status::{ClientCookie, Status};
use crate::vbucket::{
    GetOptions, GetResult, KeyStats, Mutation, VBucket, VBucketState, Vbid, WithMetaOptions,
};

#[derive(Default)]
struct EngineStats {
    not_my_vbuckets: AtomicU64,
}

/// Engine-wide counter snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStatsSnapshot {
    /// Commands addressed to a VBucket this node does not hold.
    pub not_my_vbuckets: u64,
}

/// The node-side entry point for every engine command.
pub struct Engine {
    config: Arc<StoreConfig>,
    manifest: Arc<CollectionsManifest>,
    registry: Registry,
    stats: EngineStats,
}

impl Engine {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let manifest = Arc::new(CollectionsManifest::default());
        let registry = Registry::new(Arc::clone(&config), Arc::clone(&manifest))?;
        Ok(Self {
            config,
            manifest,
            registry,
            stats: EngineStats::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats_snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            not_my_vbuckets: self.stats.not_my_vbuckets.load(Ordering::Relaxed),
        }
    }

    fn vb(&self, vbid: Vbid) -> Result<Arc<VBucket>, Status> {
        match self.registry.get_bucket(vbid) {
            Some(vb) => Ok(vb),
            None => {
                self.stats.not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                Err(Status::NotMyVbucket)
            }
        }
    }

    // ---- mutation commands -------------------------------------------------

    pub fn set(
        &self,
        vbid: Vbid,
        item: Item,
        cookie: Option<&ClientCookie>,
    ) -> Result<Mutation, Status> {
        self.vb(vbid)?.set(item, cookie)
    }

    pub fn add(
        &self,
        vbid: Vbid,
        item: Item,
        cookie: Option<&ClientCookie>,
    ) -> Result<Mutation, Status> {
        self.vb(vbid)?.add(item, cookie)
    }

    pub fn replace(
        &self,
        vbid: Vbid,
        item: Item,
        cookie: Option<&ClientCookie>,
    ) -> Result<Mutation, Status> {
        self.vb(vbid)?.replace(item, cookie)
    }

    pub fn delete(
        &self,
        vbid: Vbid,
        key: DocKey,
        cas: u64,
        cookie: Option<&ClientCookie>,
        durability: Option<Requirements>,
    ) -> Result<Mutation, Status> {
        self.vb(vbid)?.delete(key, cas, cookie, durability)
    }

    pub fn set_with_meta(
        &self,
        vbid: Vbid,
        item: Item,
        options: WithMetaOptions,
        cookie: Option<&ClientCookie>,
    ) -> Result<(), Status> {
        self.vb(vbid)?.set_with_meta(item, options, cookie)
    }

    pub fn delete_with_meta(
        &self,
        vbid: Vbid,
        item: Item,
        options: WithMetaOptions,
        cookie: Option<&ClientCookie>,
    ) -> Result<(), Status> {
        self.vb(vbid)?.delete_with_meta(item, options, cookie)
    }

    pub fn add_backfill_item(&self, vbid: Vbid, item: Item) -> Result<(), Status> {
        self.vb(vbid)?.add_backfill_item(item)
    }

    // ---- read commands -----------------------------------------------------

    pub fn get(
        &self,
        vbid: Vbid,
        key: &DocKey,
        cookie: Option<&ClientCookie>,
        options: GetOptions,
    ) -> Result<GetResult, Status> {
        self.vb(vbid)?.get(key, cookie, options)
    }

    pub fn get_and_update_ttl(
        &self,
        vbid: Vbid,
        key: &DocKey,
        expiry: u32,
        cookie: Option<&ClientCookie>,
    ) -> Result<GetResult, Status> {
        self.vb(vbid)?.get_and_update_ttl(key, expiry, cookie)
    }

    pub fn get_locked(
        &self,
        vbid: Vbid,
        key: &DocKey,
        lock_window: Option<std::time::Duration>,
        cookie: Option<&ClientCookie>,
    ) -> Result<GetResult, Status> {
        self.vb(vbid)?.get_locked(key, lock_window, cookie)
    }

    pub fn unlock_key(&self, vbid: Vbid, key: &DocKey, cas: u64) -> Result<(), Status> {
        self.vb(vbid)?.unlock_key(key, cas)
    }

    pub fn get_key_stats(&self, vbid: Vbid, key: &DocKey) -> Result<KeyStats, Status> {
        self.vb(vbid)?.get_key_stats(key)
    }

    pub fn evict_key(&self, vbid: Vbid, key: &DocKey) -> Result<(), Status> {
        self.vb(vbid)?.evict_key(key)
    }

    // ---- admin and replication commands ------------------------------------

    pub fn set_vbucket_state(
        &self,
        vbid: Vbid,
        state: VBucketState,
        meta: Option<&Value>,
    ) -> Result<(), StateChangeError> {
        self.registry.set_state(vbid, state, meta)
    }

    pub fn delete_vbucket(&self, vbid: Vbid) -> Result<(), StateChangeError> {
        self.registry.drop_and_defer(vbid)
    }

    pub fn seqno_acknowledged(
        &self,
        vbid: Vbid,
        replica: &str,
        memory_seqno: u64,
        disk_seqno: u64,
    ) -> Result<(), Status> {
        self.vb(vbid)?
            .seqno_acknowledged(replica, memory_seqno, disk_seqno)
    }

    pub fn notify_persisted(&self, vbid: Vbid, seqno: u64) -> Result<(), Status> {
        self.vb(vbid)?.notify_persisted(seqno);
        Ok(())
    }

    pub fn receive_snapshot_marker(&self, vbid: Vbid, start: u64, end: u64) -> Result<(), Status> {
        self.vb(vbid)?.receive_snapshot_marker(start, end)
    }

    /// Installs a newer collections manifest, shared by every VBucket.
    pub fn update_collections_manifest(&self, manifest: Manifest) -> Result<(), Status> {
        self.manifest.update(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(StoreConfig {
            max_vbuckets: 4,
            ..StoreConfig::default()
        })
        .expect("engine")
    }

    fn key(name: &str) -> DocKey {
        DocKey::app(name.as_bytes().to_vec())
    }

    #[test]
    fn commands_to_missing_vbuckets_are_counted() {
        let engine = engine();
        assert_eq!(
            Err(Status::NotMyVbucket),
            engine.set(1, Item::set(key("doc"), "v"), None).map(|_| ())
        );
        assert_eq!(
            Err(Status::NotMyVbucket),
            engine.get(1, &key("doc"), None, GetOptions::default()).map(|_| ())
        );
        assert_eq!(2, engine.stats_snapshot().not_my_vbuckets);
    }

    #[test]
    fn full_command_round_trip() {
        let engine = engine();
        let meta = json!({"topology": [["active", "replica"]]});
        engine
            .set_vbucket_state(0, VBucketState::Active, Some(&meta))
            .expect("create vbucket");

        let stored = engine
            .set(0, Item::set(key("doc"), "value"), None)
            .expect("set");
        let got = engine
            .get(0, &key("doc"), None, GetOptions::default())
            .expect("get");
        assert_eq!(stored.cas, got.cas);

        engine
            .delete(0, key("doc"), stored.cas, None, None)
            .expect("delete");
        assert_eq!(
            Err(Status::KeyNotFound),
            engine
                .get(0, &key("doc"), None, GetOptions::default())
                .map(|_| ())
        );

        engine.delete_vbucket(0).expect("drop vbucket");
        assert_eq!(
            Err(Status::NotMyVbucket),
            engine.set(0, Item::set(key("doc"), "v"), None).map(|_| ())
        );
    }

    #[test]
    fn durable_write_round_trip_through_the_engine() {
        let engine = engine();
        let meta = json!({"topology": [["active", "replica"]]});
        engine
            .set_vbucket_state(0, VBucketState::Active, Some(&meta))
            .expect("create vbucket");

        let (cookie, handle) = ClientCookie::new();
        let item = Item::set(key("doc"), "value").with_durability(Requirements::majority());
        assert_eq!(
            Err(Status::WouldBlock),
            engine.set(0, item, Some(&cookie)).map(|_| ())
        );

        engine.seqno_acknowledged(0, "replica", 1, 0).expect("ack");
        assert_eq!(Some(Status::Success), handle.wait());
    }

    #[test]
    fn manifest_updates_flow_to_vbuckets() {
        let engine = engine();
        engine
            .set_vbucket_state(0, VBucketState::Active, None)
            .expect("create vbucket");

        let item = Item::set(DocKey::new(8, "doc".as_bytes().to_vec()), "v");
        assert_eq!(
            Err(Status::UnknownCollection),
            engine.set(0, item.clone(), None).map(|_| ())
        );

        engine
            .update_collections_manifest(
                Manifest::new(1).with_collection(8, "sessions", None),
            )
            .expect("manifest update");
        engine.set(0, item, None).expect("collection known now");
    }
}
