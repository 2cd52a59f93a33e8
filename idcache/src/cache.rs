use crate::config::CacheConfig;
use crate::store::{CacheError, SnapshotStore};
use crate::workers;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Forward entry: everything known about one proxy ID within a type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub name: String,
    /// backendID → originalID
    #[serde(rename = "perBackend")]
    pub per_backend: HashMap<u8, i64>,
    /// Unix seconds; only used for TTL eviction.
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

/// Reverse entry: backendID → proxyID for one original ID.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReverseEntry {
    #[serde(rename = "perBackend")]
    pub per_backend: HashMap<u8, i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct TypeMaps {
    #[serde(default)]
    forward: HashMap<i64, ForwardEntry>,
    #[serde(default)]
    reverse: HashMap<i64, ReverseEntry>,
}

/// The serialized cache tree. Additive schema changes are allowed: unknown
/// top-level keys are ignored on load.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct CacheSnapshot {
    #[serde(rename = "cacheType", default)]
    pub(crate) types: HashMap<String, TypeMaps>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Bidirectional map for one entity type, guarded by a single writer lock so
/// both directions always mutate together.
pub struct TypeCache {
    inner: RwLock<TypeMaps>,
}

impl TypeCache {
    fn new() -> Self {
        TypeCache {
            inner: RwLock::new(TypeMaps::default()),
        }
    }

    /// Upserts a `proxyID ↔ (backendID → originalID)` pair.
    ///
    /// Re-inserting identical values only bumps the TTL timestamp. When the
    /// original ID for an existing `(proxyID, backendID)` changes, the stale
    /// reverse mapping is dropped in the same critical section.
    pub fn set(&self, proxy_id: i64, original_id: i64, backend_id: u8, name: &str) {
        if proxy_id <= 0 || original_id <= 0 || backend_id == 0 {
            tracing::warn!(
                proxy_id,
                original_id,
                backend_id,
                "Rejected invalid cache insert"
            );
            return;
        }

        let mut guard = self.inner.write();
        let maps = &mut *guard;
        let created_at = now_unix();

        match maps.forward.get_mut(&proxy_id) {
            Some(entry) => {
                entry.created_at = created_at;
                let previous = entry.per_backend.insert(backend_id, original_id);
                if previous != Some(original_id) {
                    entry.name = name.to_string();
                    if let Some(old_original) = previous {
                        // The proxy ID now points elsewhere for this backend;
                        // the old reverse mapping must not resolve anymore.
                        let emptied = match maps.reverse.get_mut(&old_original) {
                            Some(reverse) => {
                                reverse.per_backend.remove(&backend_id);
                                reverse.per_backend.is_empty()
                            }
                            None => false,
                        };
                        if emptied {
                            maps.reverse.remove(&old_original);
                        }
                    }
                }
            }
            None => {
                maps.forward.insert(
                    proxy_id,
                    ForwardEntry {
                        name: name.to_string(),
                        per_backend: HashMap::from([(backend_id, original_id)]),
                        created_at,
                    },
                );
            }
        }

        maps.reverse
            .entry(original_id)
            .or_default()
            .per_backend
            .insert(backend_id, proxy_id);
    }

    pub fn get_original_id(&self, proxy_id: i64, backend_id: u8) -> Option<i64> {
        let maps = self.inner.read();
        maps.forward
            .get(&proxy_id)
            .and_then(|entry| entry.per_backend.get(&backend_id))
            .copied()
    }

    pub fn get_proxy_id(&self, original_id: i64, backend_id: u8) -> Option<i64> {
        let maps = self.inner.read();
        maps.reverse
            .get(&original_id)
            .and_then(|entry| entry.per_backend.get(&backend_id))
            .copied()
    }

    /// Removes the given forward entries and every reverse entry they
    /// reference.
    pub fn delete(&self, proxy_ids: &[i64]) {
        let mut maps = self.inner.write();
        for proxy_id in proxy_ids {
            if let Some(entry) = maps.forward.remove(proxy_id) {
                for original_id in entry.per_backend.values() {
                    maps.reverse.remove(original_id);
                }
            }
        }
    }

    /// Removes entries older than `ttl`. The candidate set is computed under
    /// the read lock and deleted afterwards; entries only age upwards, so a
    /// stale candidate list never removes a live entry.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let now = now_unix();
        let expired: Vec<i64> = {
            let maps = self.inner.read();
            maps.forward
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.created_at) > ttl.as_secs())
                .map(|(proxy_id, _)| *proxy_id)
                .collect()
        };

        if !expired.is_empty() {
            self.delete(&expired);
        }
        expired.len()
    }

    /// (forward entries, reverse entries)
    pub fn counts(&self) -> (usize, usize) {
        let maps = self.inner.read();
        (maps.forward.len(), maps.reverse.len())
    }

    pub(crate) fn snapshot(&self) -> TypeMaps {
        self.inner.read().clone()
    }

    pub(crate) fn restore(&self, maps: TypeMaps) {
        *self.inner.write() = maps;
    }

    #[cfg(test)]
    fn rewind_created_at(&self, secs: u64) {
        let mut maps = self.inner.write();
        for entry in maps.forward.values_mut() {
            entry.created_at = entry.created_at.saturating_sub(secs);
        }
    }
}

/// The full translation cache: one `TypeCache` per configured entity type,
/// an optional on-disk snapshot store, and the background worker handle.
pub struct TranslationCache {
    types: RwLock<HashMap<String, Arc<TypeCache>>>,
    /// Taken (closing the store file) on `stop`, so a reloaded cache can
    /// reopen the same path.
    store: Mutex<Option<SnapshotStore>>,
    workers: Mutex<Option<watch::Sender<bool>>>,
    config: CacheConfig,
}

impl TranslationCache {
    /// Opens the snapshot store, seeds the configured entity types, and
    /// restores any previously saved tree. Background workers are not
    /// started here; call [`TranslationCache::start`].
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let store = SnapshotStore::open(&config.db_path)?;
        let blob = store.load();
        let cache = Self::with_store(config, Some(store));

        match blob {
            Ok(Some(blob)) => match serde_json::from_slice::<CacheSnapshot>(&blob) {
                Ok(snapshot) => cache.apply_snapshot(snapshot),
                Err(e) => tracing::error!(error = %e, "Failed to decode cache snapshot"),
            },
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Failed to load cache snapshot"),
        }

        Ok(cache)
    }

    /// Cache without persistence. Used by tests and as a fallback surface.
    pub fn in_memory(cached_fields: HashMap<String, String>) -> Self {
        let config = CacheConfig {
            ttl: Duration::from_secs(0),
            cleanup_interval: Duration::from_secs(0),
            auto_save: Duration::from_secs(0),
            db_path: std::path::PathBuf::new(),
            cached_fields,
        };
        Self::with_store(config, None)
    }

    fn with_store(config: CacheConfig, store: Option<SnapshotStore>) -> Self {
        let types = config
            .cached_fields
            .keys()
            .map(|entity| (entity.clone(), Arc::new(TypeCache::new())))
            .collect();

        TranslationCache {
            types: RwLock::new(types),
            store: Mutex::new(store),
            workers: Mutex::new(None),
            config,
        }
    }

    fn apply_snapshot(&self, snapshot: CacheSnapshot) {
        let mut types = self.types.write();
        for (entity, maps) in snapshot.types {
            types
                .entry(entity)
                .or_insert_with(|| Arc::new(TypeCache::new()))
                .restore(maps);
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Name of the field hash-derived IDs are computed from, if `entity` is
    /// a cached type.
    pub fn name_field(&self, entity: &str) -> Option<String> {
        self.config.cached_fields.get(entity).cloned()
    }

    pub fn is_cached_type(&self, entity: &str) -> bool {
        self.config.cached_fields.contains_key(entity)
    }

    pub fn type_cache(&self, entity: &str) -> Option<Arc<TypeCache>> {
        self.types.read().get(entity).cloned()
    }

    pub fn set(&self, entity: &str, proxy_id: i64, original_id: i64, backend_id: u8, name: &str) {
        match self.type_cache(entity) {
            Some(cache) => cache.set(proxy_id, original_id, backend_id, name),
            None => tracing::warn!(entity, "Insert into unconfigured cache type"),
        }
    }

    pub fn get_original_id(&self, entity: &str, proxy_id: i64, backend_id: u8) -> Option<i64> {
        self.type_cache(entity)?.get_original_id(proxy_id, backend_id)
    }

    pub fn get_proxy_id(&self, entity: &str, original_id: i64, backend_id: u8) -> Option<i64> {
        self.type_cache(entity)?.get_proxy_id(original_id, backend_id)
    }

    pub fn evict_expired(&self) -> usize {
        let types: Vec<Arc<TypeCache>> = self.types.read().values().cloned().collect();
        types
            .iter()
            .map(|cache| cache.evict_expired(self.config.ttl))
            .sum()
    }

    /// Serializes the whole tree and writes it to the store, if any.
    pub fn save(&self) -> Result<(), CacheError> {
        let blob = self.encode_snapshot()?;
        match self.store.lock().as_ref() {
            Some(store) => store.save(&blob),
            None => Ok(()),
        }
    }

    fn encode_snapshot(&self) -> Result<Vec<u8>, CacheError> {
        let snapshot = CacheSnapshot {
            types: self
                .types
                .read()
                .iter()
                .map(|(entity, cache)| (entity.clone(), cache.snapshot()))
                .collect(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    /// Starts the eviction and autosave workers. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.workers.lock();
        if guard.is_some() {
            tracing::warn!("Cache background workers already running");
            return;
        }

        let (tx, rx) = watch::channel(false);
        workers::spawn_all(Arc::clone(self), rx);
        *guard = Some(tx);
    }

    /// Stops the workers (safe without a prior `start`), writes a final
    /// snapshot, and closes the store file.
    pub fn stop(&self) {
        if let Some(tx) = self.workers.lock().take() {
            let _ = tx.send(true);
            tracing::info!("Cache background workers stopped");
        }

        if let Some(store) = self.store.lock().take() {
            match self.encode_snapshot() {
                Ok(blob) => {
                    if let Err(e) = store.save(&blob) {
                        tracing::error!(error = %e, "Final cache snapshot failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Final cache snapshot failed"),
            }
        }
    }

    /// Per-type entry counts, keyed `{type}_proxy_items` / `{type}_reverse_items`.
    pub fn stats(&self) -> HashMap<String, usize> {
        let mut stats = HashMap::new();
        for (entity, cache) in self.types.read().iter() {
            let (forward, reverse) = cache.counts();
            stats.insert(format!("{entity}_proxy_items"), forward);
            stats.insert(format!("{entity}_reverse_items"), reverse);
        }
        stats
    }
}
