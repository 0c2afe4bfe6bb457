//! Collections manifest and reader-locked access handles.
//!
//! Write paths acquire a read-locked handle for the item's collection
//! and hold it for the duration of the operation, so a manifest update
//! can never interleave with an in-flight mutation.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;

use crate::item::{now_unix, CollectionId, Item, DEFAULT_COLLECTION};
use crate::status::Status;

/// Per-collection metadata.
#[derive(Clone, Debug)]
pub struct CollectionMeta {
    pub name: String,
    /// Collection-level ceiling on document expiries; falls back to
    /// the bucket-wide setting when absent.
    pub max_ttl: Option<Duration>,
}

/// One version of the collections manifest.
#[derive(Clone, Debug)]
pub struct Manifest {
    uid: u64,
    collections: HashMap<CollectionId, CollectionMeta>,
}

impl Manifest {
    pub fn new(uid: u64) -> Self {
        Self {
            uid,
            collections: HashMap::new(),
        }
    }

    /// The epoch manifest: uid 0 with only the default collection.
    pub fn epoch() -> Self {
        let mut manifest = Self::new(0);
        manifest.collections.insert(
            DEFAULT_COLLECTION,
            CollectionMeta {
                name: "_default".to_string(),
                max_ttl: None,
            },
        );
        manifest
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn with_collection(
        mut self,
        id: CollectionId,
        name: impl Into<String>,
        max_ttl: Option<Duration>,
    ) -> Self {
        self.collections.insert(
            id,
            CollectionMeta {
                name: name.into(),
                max_ttl,
            },
        );
        self
    }
}

/// Shared manifest with reader-locked collection handles.
#[derive(Debug)]
pub struct CollectionsManifest {
    inner: RwLock<Manifest>,
}

impl Default for CollectionsManifest {
    fn default() -> Self {
        Self::new(Manifest::epoch())
    }
}

impl CollectionsManifest {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            inner: RwLock::new(manifest),
        }
    }

    pub fn uid(&self) -> u64 {
        self.inner.read().expect("manifest lock poisoned").uid
    }

    /// Installs a newer manifest. The uid must advance.
    pub fn update(&self, manifest: Manifest) -> Result<(), Status> {
        let mut inner = self.inner.write().expect("manifest lock poisoned");
        if manifest.uid <= inner.uid {
            return Err(Status::InvalidArguments);
        }
        *inner = manifest;
        Ok(())
    }

    /// Read-locked handle for `collection`; `None` when the collection
    /// is not in the current manifest.
    pub fn lock(&self, collection: CollectionId) -> Option<CollectionHandle<'_>> {
        let guard = self.inner.read().expect("manifest lock poisoned");
        if !guard.collections.contains_key(&collection) {
            return None;
        }
        Some(CollectionHandle { guard, collection })
    }
}

/// Read access to one collection, held across a single operation.
pub struct CollectionHandle<'a> {
    guard: RwLockReadGuard<'a, Manifest>,
    collection: CollectionId,
}

impl CollectionHandle<'_> {
    pub fn manifest_uid(&self) -> u64 {
        self.guard.uid
    }

    /// True when ingested data references a manifest this node has not
    /// seen yet.
    pub fn is_ahead(&self, data_manifest_uid: u64) -> bool {
        data_manifest_uid > self.guard.uid
    }

    fn max_ttl(&self, bucket_max_ttl: Option<Duration>) -> Option<Duration> {
        self.guard
            .collections
            .get(&self.collection)
            .and_then(|meta| meta.max_ttl)
            .or(bucket_max_ttl)
    }

    /// Applies the effective max-TTL policy to an item's expiry.
    ///
    /// A zero (never-expires) or beyond-ceiling expiry is clamped to
    /// `now + max_ttl` when a ceiling is configured.
    pub fn process_expiry(&self, item: &mut Item, bucket_max_ttl: Option<Duration>) {
        let Some(max_ttl) = self.max_ttl(bucket_max_ttl) else {
            return;
        };
        let ceiling = now_unix().saturating_add(max_ttl.as_secs().min(u64::from(u32::MAX)) as u32);
        if item.expiry == 0 || item.expiry > ceiling {
            item.expiry = ceiling;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::DocKey;

    #[test]
    fn unknown_collection_has_no_handle() {
        let manifest = CollectionsManifest::default();
        assert!(manifest.lock(DEFAULT_COLLECTION).is_some());
        assert!(manifest.lock(9).is_none());
    }

    #[test]
    fn update_requires_advancing_uid() {
        let manifest = CollectionsManifest::new(Manifest::epoch().with_collection(8, "beta", None));
        assert_eq!(
            Err(Status::InvalidArguments),
            manifest.update(Manifest::new(0))
        );
        assert_eq!(Ok(()), manifest.update(Manifest::new(3)));
        assert_eq!(3, manifest.uid());
        // The old collection is gone with the new manifest.
        assert!(manifest.lock(8).is_none());
    }

    #[test]
    fn max_ttl_clamps_zero_and_oversized_expiries() {
        let manifest = CollectionsManifest::new(Manifest::epoch().with_collection(
            4,
            "ephemeral",
            Some(Duration::from_secs(60)),
        ));
        let handle = manifest.lock(4).expect("collection known");

        let mut item = Item::set(DocKey::new(4, "k"), "v");
        handle.process_expiry(&mut item, None);
        let ceiling = now_unix() + 60;
        assert!(item.expiry > 0 && item.expiry <= ceiling + 1);

        let mut far = Item::set(DocKey::new(4, "k"), "v").with_expiry(u32::MAX);
        handle.process_expiry(&mut far, None);
        assert!(far.expiry <= ceiling + 1);

        // A shorter explicit expiry is left alone.
        let mut soon = Item::set(DocKey::new(4, "k"), "v").with_expiry(now_unix() + 5);
        let before = soon.expiry;
        handle.process_expiry(&mut soon, None);
        assert_eq!(before, soon.expiry);
    }

    #[test]
    fn bucket_ttl_applies_when_collection_has_none() {
        let manifest = CollectionsManifest::default();
        let handle = manifest.lock(DEFAULT_COLLECTION).expect("default");

        let mut item = Item::set(DocKey::app("k"), "v");
        handle.process_expiry(&mut item, Some(Duration::from_secs(30)));
        assert!(item.expiry > 0);
    }

    #[test]
    fn manifest_ahead_detection() {
        let manifest = CollectionsManifest::new(Manifest::epoch());
        let handle = manifest.lock(DEFAULT_COLLECTION).expect("default");
        assert!(!handle.is_ahead(0));
        assert!(handle.is_ahead(1));
    }
}
