//! TTL read-through cache over a [`PolicyStorage`] backend.
//!
//! The cache is an ordinary value owned by whoever needs it (the HTTP server
//! keeps one in its state). Expiry is measured against an injected
//! [`Clock`], so tests drive it with a `ManualClock`.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};

use policyline_core::{Clock, Deployment, Rule, Snapshot, SnapshotId};

use crate::error::StorageError;
use crate::traits::PolicyStorage;

struct Entry<V> {
    value: V,
    stored_at: OffsetDateTime,
}

/// Key/value cache whose entries expire `ttl` after insertion.
///
/// A zero TTL disables caching: every lookup misses.
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fresh value for `key`, evicting it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if now - entry.stored_at < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if self.ttl <= Duration::ZERO {
            return;
        }
        let stored_at = self.clock.now();
        self.lock().insert(key, Entry { value, stored_at });
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Return the cached value or run `load` and cache its success.
    ///
    /// The lock is not held while `load` runs; two concurrent misses may both
    /// load, and the later insert wins.
    pub async fn get_or_try_load<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = load().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

/// Read-through cache for the list queries of a storage backend.
///
/// Writers must call the matching `invalidate_*` method after a successful
/// write, otherwise readers see the old listing until the TTL lapses.
pub struct CachedStore<S> {
    inner: Arc<S>,
    snapshots: TtlCache<(), Vec<Snapshot>>,
    rules: TtlCache<SnapshotId, Vec<Rule>>,
    deployments: TtlCache<bool, Vec<Deployment>>,
}

impl<S: PolicyStorage> CachedStore<S> {
    pub fn new(inner: Arc<S>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            snapshots: TtlCache::new(ttl, clock.clone()),
            rules: TtlCache::new(ttl, clock.clone()),
            deployments: TtlCache::new(ttl, clock),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>, StorageError> {
        self.snapshots
            .get_or_try_load((), || self.inner.list_snapshots())
            .await
    }

    pub async fn rules_for_snapshot(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<Vec<Rule>, StorageError> {
        self.rules
            .get_or_try_load(snapshot_id, || self.inner.rules_for_snapshot(snapshot_id))
            .await
    }

    pub async fn list_deployments(&self, active_only: bool) -> Result<Vec<Deployment>, StorageError> {
        self.deployments
            .get_or_try_load(active_only, || self.inner.list_deployments(active_only))
            .await
    }

    /// Drop cached snapshot listings and the rules of `snapshot_id`.
    pub fn invalidate_snapshot(&self, snapshot_id: SnapshotId) {
        self.snapshots.clear();
        self.rules.invalidate(&snapshot_id);
    }

    /// Drop cached deployment listings. Activation also flips snapshot
    /// `is_active` flags, so snapshot listings go too.
    pub fn invalidate_deployments(&self) {
        self.deployments.clear();
        self.snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::record::NewSnapshot;
    use policyline_core::{ArtifactFormat, ManualClock};

    fn fields(version: &str) -> NewSnapshot {
        NewSnapshot {
            version: version.to_string(),
            env: "prod".to_string(),
            stage: "draft".to_string(),
            artifact_format: ArtifactFormat::Native,
            checksum: None,
            size_bytes: 0,
            notes: None,
            parent_id: None,
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::at_epoch());
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::seconds(10), clock.clone());
        cache.insert("a", 1);
        clock.advance(Duration::seconds(9));
        assert_eq!(cache.get(&"a"), Some(1));
        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn zero_ttl_never_caches() {
        let clock = Arc::new(ManualClock::at_epoch());
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::ZERO, clock);
        cache.insert(1, 1);
        assert_eq!(cache.get(&1), None);
    }

    #[tokio::test]
    async fn load_errors_are_not_cached() {
        let clock = Arc::new(ManualClock::at_epoch());
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::seconds(60), clock);
        let err: Result<u8, &str> = cache.get_or_try_load(1, || async { Err("down") }).await;
        assert_eq!(err, Err("down"));
        let ok: Result<u8, &str> = cache.get_or_try_load(1, || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
        let hit: Result<u8, &str> = cache.get_or_try_load(1, || async { Ok(8) }).await;
        assert_eq!(hit, Ok(7));
    }

    #[tokio::test]
    async fn cached_listing_is_stale_until_expiry_or_invalidation() {
        let clock = Arc::new(ManualClock::at_epoch());
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        let cached = CachedStore::new(storage.clone(), Duration::seconds(30), clock.clone());

        storage.create_snapshot(fields("v1")).await.unwrap();
        assert_eq!(cached.list_snapshots().await.unwrap().len(), 1);

        let v2 = storage.create_snapshot(fields("v2")).await.unwrap();
        assert_eq!(cached.list_snapshots().await.unwrap().len(), 1);

        clock.advance(Duration::seconds(30));
        assert_eq!(cached.list_snapshots().await.unwrap().len(), 2);

        storage.create_snapshot(fields("v3")).await.unwrap();
        cached.invalidate_snapshot(v2.id);
        assert_eq!(cached.list_snapshots().await.unwrap().len(), 3);
    }
}
