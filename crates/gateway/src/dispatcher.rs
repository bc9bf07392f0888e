//! Dispatcher loop: the single background actor that drains the priority
//! queue into workers. Never parallelise pops — this stays one logical
//! actor so queue order is a total order, not a race.

use crate::history::HistoryService;
use crate::registry::WorkerRegistry;
use crate::selector::Selector;
use crate::settings::SettingsService;
use gw_core::{GatewayJobMapping, PromptId, QueuedJob, TaskId};
use gw_storage::{MappingStore, PendingQueueStore};
use gw_worker_client::WorkerClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct Dispatcher {
    pending: Arc<dyn PendingQueueStore>,
    mappings: Arc<dyn MappingStore>,
    selector: Arc<Selector>,
    registry: Arc<WorkerRegistry>,
    settings: Arc<SettingsService>,
    history: Arc<HistoryService>,
    batch_size: usize,
    tick: Duration,
    worker_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pending: Arc<dyn PendingQueueStore>,
        mappings: Arc<dyn MappingStore>,
        selector: Arc<Selector>,
        registry: Arc<WorkerRegistry>,
        settings: Arc<SettingsService>,
        history: Arc<HistoryService>,
        batch_size: usize,
        tick: Duration,
        worker_timeout: Duration,
    ) -> Self {
        Self { pending, mappings, selector, registry, settings, history, batch_size, tick, worker_timeout }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        loop {
            let processed = self.run_batch().await;
            let sleep_for = if processed == 0 { self.tick * 2 } else { self.tick };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// One batch: up to `batch_size` iterations of `(pop, select, post)`.
    /// Returns how many jobs were popped.
    async fn run_batch(&self) -> usize {
        let mut processed = 0;
        for _ in 0..self.batch_size {
            let job = match self.pending.pop_highest().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "dispatcher: pop_highest failed, ending batch");
                    break;
                }
            };
            processed += 1;
            self.dispatch_one(job).await;
        }
        processed
    }

    async fn dispatch_one(&self, job: QueuedJob) {
        let worker = match self.selector.select().await {
            Ok(Some(w)) => w,
            Ok(None) => {
                self.reenqueue(job).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "dispatcher: selection failed, re-enqueueing");
                self.reenqueue(job).await;
                return;
            }
        };

        let global_auth = self.settings.global_worker_auth().await.unwrap_or(None);
        let client = WorkerClient::new(worker.base_url.clone(), worker.auth(global_auth.as_ref()).cloned(), self.worker_timeout);
        let (body, status) = client.post_prompt(job.prompt.clone(), Some(job.client_id.as_str().to_string())).await;
        let task_id = TaskId::from_gateway_job_id(&job.gateway_job_id);

        match status {
            200..=299 => {
                let prompt_id = body.as_ref().and_then(|b| b.get("prompt_id")).and_then(|v| v.as_str()).map(PromptId::new);
                let Some(prompt_id) = prompt_id else {
                    let _ = self.history.mark_failed(&task_id, "worker response missing prompt_id").await;
                    return;
                };
                let _ = self.mappings.set_prompt_worker(&prompt_id, &worker.worker_id).await;
                let _ = self
                    .mappings
                    .set_gateway_job(&GatewayJobMapping {
                        gateway_job_id: job.gateway_job_id.clone(),
                        prompt_id: prompt_id.clone(),
                        worker_id: worker.worker_id.clone(),
                    })
                    .await;
                let _ = self.registry.bump_running(&worker.worker_id).await;
                let _ = self.history.mark_submitted(&task_id, prompt_id, worker.worker_id.clone()).await;
            }
            503 => self.reenqueue(job).await,
            _ => {
                let message = body.as_ref().map(|b| b.to_string()).unwrap_or_else(|| format!("worker returned status {status}"));
                let _ = self.history.mark_failed(&task_id, message).await;
            }
        }
    }

    async fn reenqueue(&self, job: QueuedJob) {
        if let Err(e) = self.pending.re_enqueue(&job).await {
            warn!(error = %e, job = %job.gateway_job_id, "dispatcher: re-enqueue failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::clock::FakeClock;
    use gw_core::ClientId;
    use gw_storage::backends::memory::{
        MemoryHistoryStore, MemoryMappingStore, MemoryPendingQueueStore, MemorySettingsStore, MemoryWorkerStore,
    };
    use serde_json::json;

    fn dispatcher() -> (Arc<Dispatcher>, Arc<dyn PendingQueueStore>, Arc<WorkerRegistry>) {
        let clock = Arc::new(FakeClock::new(1000));
        let pending: Arc<dyn PendingQueueStore> = Arc::new(MemoryPendingQueueStore::default());
        let mappings: Arc<dyn MappingStore> = Arc::new(MemoryMappingStore::default());
        let registry = Arc::new(WorkerRegistry::new(Arc::new(MemoryWorkerStore::default()), clock.clone()));
        let settings = Arc::new(SettingsService::new(Arc::new(MemorySettingsStore::default())));
        let history = Arc::new(HistoryService::new(
            Arc::new(MemoryHistoryStore::default()),
            registry.clone(),
            settings.clone(),
            clock.clone(),
            "/api/view",
            Duration::from_secs(30),
        ));
        let selector = Arc::new(Selector::new(registry.clone(), settings.clone(), clock.clone(), Duration::from_secs(30)));
        let dispatcher = Arc::new(Dispatcher::new(
            pending.clone(),
            mappings,
            selector,
            registry.clone(),
            settings,
            history,
            20,
            Duration::from_millis(1),
            Duration::from_secs(30),
        ));
        (dispatcher, pending, registry)
    }

    #[tokio::test]
    async fn run_batch_on_empty_queue_processes_nothing() {
        let (dispatcher, _pending, _registry) = dispatcher();
        assert_eq!(dispatcher.run_batch().await, 0);
    }

    #[tokio::test]
    async fn dispatch_with_no_worker_reenqueues_job() {
        let (dispatcher, pending, _registry) = dispatcher();
        let job = QueuedJob::new(json!({"node": 1}), ClientId::new("c1"), 5, 10.0);
        pending.enqueue(&job).await.unwrap();

        assert_eq!(dispatcher.run_batch().await, 1);
        assert_eq!(pending.len().await.unwrap(), 1);
        let requeued = pending.peek(&job.gateway_job_id).await.unwrap().unwrap();
        assert_eq!(requeued.created_at, 10.0);
    }

    /// One enabled worker returns 503 on `post_prompt`; the job is still in
    /// the queue after one tick, and a subsequent tick against a now-healthy
    /// worker dispatches it successfully.
    #[tokio::test]
    async fn dispatch_reenqueues_on_503_then_succeeds_on_retry() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"prompt_id": "p1", "number": 1})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"queue_running": [], "queue_pending": []})))
            .mount(&server)
            .await;

        let (dispatcher, pending, registry) = dispatcher();
        registry.add(server.uri(), None, 1, None).await.unwrap();
        let job = QueuedJob::new(json!({"node": 1}), ClientId::new("c1"), 5, 10.0);
        pending.enqueue(&job).await.unwrap();

        assert_eq!(dispatcher.run_batch().await, 1);
        assert_eq!(pending.len().await.unwrap(), 1, "job must remain queued after a 503");

        assert_eq!(dispatcher.run_batch().await, 1);
        assert_eq!(pending.len().await.unwrap(), 0, "retry against a healthy worker drains the queue");
    }
}
