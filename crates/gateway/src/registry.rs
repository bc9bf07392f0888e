//! Worker registry: the canonical `{worker_id -> WorkerInfo}` map.
//!
//! Populated from persistence on first read, then kept in an in-memory
//! cache that every mutation writes through to the backing store. This
//! is the only component allowed to mutate `WorkerInfo`; everyone else
//! goes through `update_load` or the CRUD methods below.

use gw_core::worker::{normalize_base_url, Credentials};
use gw_core::{Clock, WorkerId, WorkerInfo};
use gw_storage::{StoreResult, WorkerStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fields a caller may update on an existing worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerUpdate {
    pub display_name: Option<String>,
    pub weight: Option<u32>,
    pub enabled: Option<bool>,
    pub credentials: Option<Option<Credentials>>,
}

pub struct WorkerRegistry {
    store: Arc<dyn WorkerStore>,
    cache: RwLock<HashMap<WorkerId, WorkerInfo>>,
    loaded: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn WorkerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, cache: RwLock::new(HashMap::new()), loaded: AtomicBool::new(false), clock }
    }

    async fn ensure_loaded(&self) -> StoreResult<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut cache = self.cache.write().await;
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        for w in self.store.list().await? {
            cache.insert(w.worker_id.clone(), w);
        }
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn list(&self) -> StoreResult<Vec<WorkerInfo>> {
        self.ensure_loaded().await?;
        Ok(self.cache.read().await.values().cloned().collect())
    }

    pub async fn get(&self, id: &WorkerId) -> StoreResult<Option<WorkerInfo>> {
        self.ensure_loaded().await?;
        Ok(self.cache.read().await.get(id).cloned())
    }

    /// Register a worker. Normalizes `base_url` by stripping a trailing
    /// slash and assigns a fresh id.
    pub async fn add(
        &self,
        base_url: impl Into<String>,
        display_name: Option<String>,
        weight: u32,
        credentials: Option<Credentials>,
    ) -> StoreResult<WorkerInfo> {
        self.ensure_loaded().await?;
        let id = WorkerId::generate();
        let mut info = WorkerInfo::new(id.clone(), normalize_base_url(&base_url.into()), weight);
        if let Some(name) = display_name {
            info.display_name = name;
        }
        info.credentials = credentials;
        self.store.upsert(&info).await?;
        self.cache.write().await.insert(id, info.clone());
        Ok(info)
    }

    pub async fn update(&self, id: &WorkerId, fields: WorkerUpdate) -> StoreResult<Option<WorkerInfo>> {
        self.ensure_loaded().await?;
        let mut cache = self.cache.write().await;
        let Some(info) = cache.get_mut(id) else { return Ok(None) };
        if let Some(name) = fields.display_name {
            info.display_name = name;
        }
        if let Some(weight) = fields.weight {
            info.weight = weight;
        }
        if let Some(enabled) = fields.enabled {
            info.enabled = enabled;
        }
        if let Some(creds) = fields.credentials {
            info.credentials = creds;
        }
        self.store.upsert(info).await?;
        Ok(Some(info.clone()))
    }

    /// Remove a worker's registry entry. Mappings and history rows are
    /// left intact: a removed worker can no longer be selected for new
    /// work, but in-flight prompts it already owns keep their records.
    pub async fn remove(&self, id: &WorkerId) -> StoreResult<bool> {
        self.ensure_loaded().await?;
        let removed = self.store.remove(id).await?;
        self.cache.write().await.remove(id);
        Ok(removed)
    }

    /// Refresh the cached load/health snapshot for one worker, as
    /// observed by the selector or health prober.
    pub async fn update_load(&self, id: &WorkerId, running: u32, pending: u32, healthy: bool) -> StoreResult<()> {
        let now = self.clock.now_secs();
        self.ensure_loaded().await?;
        let mut cache = self.cache.write().await;
        if let Some(info) = cache.get_mut(id) {
            info.queue_running = running;
            info.queue_pending = pending;
            info.healthy = healthy;
            info.cache_timestamp = now;
            self.store.upsert(info).await?;
        }
        Ok(())
    }

    /// Optimistic bump applied by the dispatcher right after a
    /// successful submission, ahead of the next probe.
    pub async fn bump_running(&self, id: &WorkerId) -> StoreResult<()> {
        self.ensure_loaded().await?;
        let mut cache = self.cache.write().await;
        if let Some(info) = cache.get_mut(id) {
            info.queue_running += 1;
            self.store.upsert(info).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::clock::FakeClock;
    use gw_storage::backends::memory::MemoryWorkerStore;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(Arc::new(MemoryWorkerStore::default()), Arc::new(FakeClock::new(1000)))
    }

    #[tokio::test]
    async fn add_normalizes_url_and_persists() {
        let reg = registry();
        let w = reg.add("http://w1/", None, 1, None).await.unwrap();
        assert_eq!(w.base_url, "http://w1");
        assert_eq!(reg.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_load_sets_cache_timestamp() {
        let reg = registry();
        let w = reg.add("http://w1", None, 1, None).await.unwrap();
        reg.update_load(&w.worker_id, 2, 3, true).await.unwrap();
        let refreshed = reg.get(&w.worker_id).await.unwrap().unwrap();
        assert_eq!(refreshed.queue_running, 2);
        assert_eq!(refreshed.cache_timestamp, 1000);
    }

    #[tokio::test]
    async fn remove_purges_registry_but_not_mappings() {
        let reg = registry();
        let w = reg.add("http://w1", None, 1, None).await.unwrap();
        assert!(reg.remove(&w.worker_id).await.unwrap());
        assert!(reg.get(&w.worker_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bump_running_increments_in_place() {
        let reg = registry();
        let w = reg.add("http://w1", None, 1, None).await.unwrap();
        reg.bump_running(&w.worker_id).await.unwrap();
        reg.bump_running(&w.worker_id).await.unwrap();
        assert_eq!(reg.get(&w.worker_id).await.unwrap().unwrap().queue_running, 2);
    }
}
