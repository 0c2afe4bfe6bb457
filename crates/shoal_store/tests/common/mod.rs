//! Shared helpers for integration tests.

use std::sync::Arc;

use shoal_durability::Requirements;
use shoal_store::{
    ClientCookie, CollectionsManifest, CompletionHandle, DocKey, Item, Status, StoreConfig,
    Topology, VBucket, VBucketState, Vbid,
};

pub const ACTIVE: &str = "active";
pub const REPLICA: &str = "replica";

pub fn store_config() -> Arc<StoreConfig> {
    Arc::new(StoreConfig::default())
}

/// Active VBucket with a replication chain of `ACTIVE` plus the given
/// replicas.
pub fn active_vbucket(id: Vbid, replicas: &[&str]) -> Arc<VBucket> {
    let vb = VBucket::new(
        id,
        VBucketState::Active,
        store_config(),
        Arc::new(CollectionsManifest::default()),
    );
    let mut chain = vec![ACTIVE.to_string()];
    chain.extend(replicas.iter().map(|r| r.to_string()));
    vb.set_state(
        VBucketState::Active,
        Some(Topology {
            first: chain,
            second: None,
        }),
    )
    .expect("register topology");
    vb
}

pub fn doc_key(name: &str) -> DocKey {
    DocKey::app(name.as_bytes().to_vec())
}

/// Stores one synchronous write and returns the completion handle the
/// client would be notified through.
pub fn store_sync_write(
    vb: &Arc<VBucket>,
    name: &str,
    requirements: Requirements,
) -> CompletionHandle {
    let (cookie, handle) = ClientCookie::new();
    let item = Item::set(doc_key(name), "value").with_durability(requirements);
    assert_eq!(
        Err(Status::WouldBlock),
        vb.set(item, Some(&cookie)).map(|_| ()),
        "sync write admission must defer"
    );
    handle
}

/// Burns one seqno with a plain mutation on an unrelated key.
pub fn store_filler(vb: &Arc<VBucket>, name: &str) -> u64 {
    vb.set(Item::set(doc_key(name), "filler"), None)
        .expect("filler mutation")
        .seqno
}
