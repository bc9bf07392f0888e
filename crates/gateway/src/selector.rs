//! Load-balancing selector. Re-probes every enabled worker on every
//! call — no stale data is tolerated at dispatch time.

use crate::registry::WorkerRegistry;
use crate::settings::SettingsService;
use gw_core::{Clock, GatewayError, GatewayResult, WorkerInfo};
use gw_worker_client::WorkerClient;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

pub struct Selector {
    registry: Arc<WorkerRegistry>,
    settings: Arc<SettingsService>,
    clock: Arc<dyn Clock>,
    worker_timeout: Duration,
}

impl Selector {
    pub fn new(registry: Arc<WorkerRegistry>, settings: Arc<SettingsService>, clock: Arc<dyn Clock>, worker_timeout: Duration) -> Self {
        Self { registry, settings, clock, worker_timeout }
    }

    /// Choose the best worker for the next submission, or `None` if no
    /// enabled worker survives probing.
    pub async fn select(&self) -> GatewayResult<Option<WorkerInfo>> {
        let candidates: Vec<WorkerInfo> = self
            .registry
            .list()
            .await
            .map_err(|e| GatewayError::transport(e.to_string()))?
            .into_iter()
            .filter(|w| w.enabled)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        let global_auth = self.settings.global_worker_auth().await.map_err(|e| GatewayError::transport(e.to_string()))?;

        let probes = candidates.iter().map(|w| {
            let client = WorkerClient::new(w.base_url.clone(), w.auth(global_auth.as_ref()).cloned(), self.worker_timeout);
            async move { client.fetch_queue().await }
        });
        let snapshots = futures_util::future::join_all(probes).await;

        let now = self.clock.now_secs();
        let mut survivors = Vec::new();
        for (mut info, snapshot) in candidates.into_iter().zip(snapshots) {
            match snapshot {
                Some(snap) => {
                    let (running, pending) = gw_wire::parse_queue_counts(&snap);
                    let (running, pending) = (running as u32, pending as u32);
                    let _ = self.registry.update_load(&info.worker_id, running, pending, true).await;
                    info.queue_running = running;
                    info.queue_pending = pending;
                    info.healthy = true;
                    info.cache_timestamp = now;
                    survivors.push(info);
                }
                None => {
                    let _ = self.registry.update_load(&info.worker_id, info.queue_running, info.queue_pending, false).await;
                }
            }
        }

        if survivors.is_empty() {
            return Ok(None);
        }

        let mut idle: Vec<WorkerInfo> = survivors.iter().filter(|w| w.is_idle()).cloned().collect();
        if !idle.is_empty() {
            idle.sort_by_key(idle_sort_key);
            return Ok(idle.into_iter().next());
        }

        survivors.sort_by_key(loaded_sort_key);
        Ok(survivors.into_iter().next())
    }
}

fn idle_sort_key(w: &WorkerInfo) -> (Reverse<u32>, u32, String) {
    (Reverse(w.weight), w.queue_pending, w.worker_id.as_str().to_string())
}

fn loaded_sort_key(w: &WorkerInfo) -> (u32, Reverse<u32>, String) {
    (w.load_score(), Reverse(w.weight), w.worker_id.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::clock::FakeClock;
    use gw_storage::backends::memory::{MemorySettingsStore, MemoryWorkerStore};

    async fn selector() -> (Selector, Arc<WorkerRegistry>) {
        let registry = Arc::new(WorkerRegistry::new(Arc::new(MemoryWorkerStore::default()), Arc::new(FakeClock::new(1000))));
        let settings = Arc::new(SettingsService::new(Arc::new(MemorySettingsStore::default())));
        let selector = Selector::new(registry.clone(), settings, Arc::new(FakeClock::new(1000)), Duration::from_secs(30));
        (selector, registry)
    }

    #[tokio::test]
    async fn select_returns_none_with_no_workers() {
        let (selector, _registry) = selector().await;
        assert!(selector.select().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn select_returns_none_when_every_probe_fails() {
        // Unreachable base_url: fetch_queue returns None for every candidate.
        let (selector, registry) = selector().await;
        registry.add("http://127.0.0.1:1", None, 1, None).await.unwrap();
        assert!(selector.select().await.unwrap().is_none());
    }

    #[test]
    fn idle_sort_key_prefers_higher_weight_then_lower_pending() {
        let mut w1 = WorkerInfo::new(gw_core::WorkerId::new("w1"), "http://w1", 1);
        w1.queue_pending = 3;
        let mut w2 = WorkerInfo::new(gw_core::WorkerId::new("w2"), "http://w2", 5);
        w2.queue_pending = 0;
        let mut workers = vec![w1.clone(), w2.clone()];
        workers.sort_by_key(idle_sort_key);
        assert_eq!(workers[0].worker_id, w2.worker_id);
    }

    #[test]
    fn loaded_sort_key_prefers_lower_load_score() {
        let mut w1 = WorkerInfo::new(gw_core::WorkerId::new("w1"), "http://w1", 1);
        w1.queue_running = 0;
        w1.queue_pending = 3;
        let mut w2 = WorkerInfo::new(gw_core::WorkerId::new("w2"), "http://w2", 5);
        w2.queue_running = 2;
        w2.queue_pending = 0;
        let mut workers = vec![w2.clone(), w1.clone()];
        workers.sort_by_key(loaded_sort_key);
        assert_eq!(workers[0].worker_id, w1.worker_id);
    }
}
