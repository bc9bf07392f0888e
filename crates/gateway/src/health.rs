//! Health prober: a single background task that refreshes the registry's
//! `healthy` bit every `interval`. Advisory only — the selector never
//! trusts it and always re-probes at dispatch time.

use crate::registry::WorkerRegistry;
use crate::settings::SettingsService;
use gw_worker_client::WorkerClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct HealthProber {
    registry: Arc<WorkerRegistry>,
    settings: Arc<SettingsService>,
    interval: Duration,
    worker_timeout: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<WorkerRegistry>, settings: Arc<SettingsService>, interval: Duration, worker_timeout: Duration) -> Self {
        Self { registry, settings, interval, worker_timeout }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.probe_once().await;
            }
        })
    }

    async fn probe_once(&self) {
        let Ok(workers) = self.registry.list().await else { return };
        let global_auth = self.settings.global_worker_auth().await.unwrap_or(None);
        for worker in workers.into_iter().filter(|w| w.enabled) {
            let client = WorkerClient::new(worker.base_url.clone(), worker.auth(global_auth.as_ref()).cloned(), self.worker_timeout);
            let (ok, detail) = client.health_probe().await;
            debug!(worker_id = %worker.worker_id, healthy = ok, %detail, "health prober");
            let _ = self.registry.update_load(&worker.worker_id, worker.queue_running, worker.queue_pending, ok).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::clock::FakeClock;
    use gw_storage::backends::memory::{MemorySettingsStore, MemoryWorkerStore};

    #[tokio::test]
    async fn probe_once_marks_unreachable_worker_unhealthy() {
        let registry = Arc::new(WorkerRegistry::new(Arc::new(MemoryWorkerStore::default()), Arc::new(FakeClock::new(1000))));
        let settings = Arc::new(SettingsService::new(Arc::new(MemorySettingsStore::default())));
        let w = registry.add("http://127.0.0.1:1", None, 1, None).await.unwrap();

        let prober = HealthProber::new(registry.clone(), settings, Duration::from_secs(30), Duration::from_secs(30));
        prober.probe_once().await;

        let refreshed = registry.get(&w.worker_id).await.unwrap().unwrap();
        assert!(!refreshed.healthy);
    }
}
