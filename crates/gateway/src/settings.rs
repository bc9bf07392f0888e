//! Global settings: a tiny read-through cache over `SettingsStore`.

use gw_core::worker::Credentials;
use gw_core::GlobalSettings;
use gw_storage::{SettingsStore, StoreResult};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct SettingsService {
    store: Arc<dyn SettingsStore>,
    cache: RwLock<Option<GlobalSettings>>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store, cache: RwLock::new(None) }
    }

    pub async fn get(&self) -> StoreResult<GlobalSettings> {
        if let Some(cached) = self.cache.read().await.clone() {
            return Ok(cached);
        }
        let fresh = self.store.get().await?;
        *self.cache.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    pub async fn set(&self, settings: GlobalSettings) -> StoreResult<()> {
        self.store.set(&settings).await?;
        *self.cache.write().await = Some(settings);
        Ok(())
    }

    /// The process-global worker auth pair, used as a fallback whenever a
    /// worker has no per-worker credentials.
    pub async fn global_worker_auth(&self) -> StoreResult<Option<Credentials>> {
        Ok(self.get().await?.global_worker_auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_storage::backends::memory::MemorySettingsStore;

    #[tokio::test]
    async fn set_then_get_round_trips_through_cache() {
        let svc = SettingsService::new(Arc::new(MemorySettingsStore::default()));
        let mut settings = GlobalSettings::default();
        settings.global_worker_auth = Some(Credentials::new("u", "p"));
        svc.set(settings.clone()).await.unwrap();
        assert_eq!(svc.get().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn get_populates_cache_from_empty_store() {
        let svc = SettingsService::new(Arc::new(MemorySettingsStore::default()));
        assert_eq!(svc.get().await.unwrap(), GlobalSettings::default());
        assert!(svc.global_worker_auth().await.unwrap().is_none());
    }
}
