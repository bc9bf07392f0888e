//! In-process backend: lost on restart, used when no relational database
//! or cache URL is configured, and as the fallback target for the cache
//! backend on any error.

use crate::error::StoreResult;
use crate::ports::{HistoryStore, MappingStore, PendingQueueStore, SettingsStore, WorkerStore};
use async_trait::async_trait;
use gw_core::queue::sort_pending;
use gw_core::{
    GatewayJobId, GatewayJobMapping, GlobalSettings, PromptId, QueuedJob, TaskId, TaskRecord,
    TaskStatus, WorkerId, WorkerInfo,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Coarse-locked, process-local implementation of every port. A single
/// [`Mutex`] per map serialises mutation around each read-modify-write.
#[derive(Default)]
pub struct MemoryWorkerStore {
    workers: Mutex<HashMap<WorkerId, WorkerInfo>>,
}

#[async_trait]
impl WorkerStore for MemoryWorkerStore {
    async fn list(&self) -> StoreResult<Vec<WorkerInfo>> {
        Ok(self.workers.lock().values().cloned().collect())
    }

    async fn get(&self, id: &WorkerId) -> StoreResult<Option<WorkerInfo>> {
        Ok(self.workers.lock().get(id).cloned())
    }

    async fn upsert(&self, worker: &WorkerInfo) -> StoreResult<()> {
        self.workers.lock().insert(worker.worker_id.clone(), worker.clone());
        Ok(())
    }

    async fn remove(&self, id: &WorkerId) -> StoreResult<bool> {
        Ok(self.workers.lock().remove(id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryMappingStore {
    task_worker: Mutex<HashMap<PromptId, WorkerId>>,
    gateway_jobs: Mutex<HashMap<GatewayJobId, GatewayJobMapping>>,
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn set_prompt_worker(&self, prompt_id: &PromptId, worker_id: &WorkerId) -> StoreResult<()> {
        self.task_worker.lock().insert(prompt_id.clone(), worker_id.clone());
        Ok(())
    }

    async fn get_prompt_worker(&self, prompt_id: &PromptId) -> StoreResult<Option<WorkerId>> {
        Ok(self.task_worker.lock().get(prompt_id).cloned())
    }

    async fn set_gateway_job(&self, mapping: &GatewayJobMapping) -> StoreResult<()> {
        self.gateway_jobs.lock().insert(mapping.gateway_job_id.clone(), mapping.clone());
        Ok(())
    }

    async fn get_gateway_job(&self, id: &GatewayJobId) -> StoreResult<Option<GatewayJobMapping>> {
        Ok(self.gateway_jobs.lock().get(id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryPendingQueueStore {
    items: Mutex<Vec<QueuedJob>>,
}

#[async_trait]
impl PendingQueueStore for MemoryPendingQueueStore {
    async fn enqueue(&self, job: &QueuedJob) -> StoreResult<()> {
        self.items.lock().push(job.clone());
        Ok(())
    }

    async fn pop_highest(&self) -> StoreResult<Option<QueuedJob>> {
        let mut items = self.items.lock();
        if items.is_empty() {
            return Ok(None);
        }
        sort_pending(&mut items);
        Ok(Some(items.remove(0)))
    }

    async fn peek(&self, id: &GatewayJobId) -> StoreResult<Option<QueuedJob>> {
        Ok(self.items.lock().iter().find(|j| &j.gateway_job_id == id).cloned())
    }

    async fn remove(&self, id: &GatewayJobId) -> StoreResult<bool> {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|j| &j.gateway_job_id != id);
        Ok(items.len() != before)
    }

    async fn re_enqueue(&self, job: &QueuedJob) -> StoreResult<()> {
        self.items.lock().push(job.clone());
        Ok(())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.items.lock().len())
    }
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    /// `prompt_id -> task_id`, so `upsert_by_prompt_id`'s "first call wins"
    /// rule holds even when `task_id != prompt_id`.
    by_prompt: Mutex<HashMap<PromptId, TaskId>>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn upsert(&self, record: &TaskRecord) -> StoreResult<()> {
        if let Some(prompt_id) = &record.prompt_id {
            self.by_prompt.lock().entry(prompt_id.clone()).or_insert_with(|| record.task_id.clone());
        }
        self.records.lock().insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn get_by_task_id(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn get_by_prompt_id(&self, id: &PromptId) -> StoreResult<Option<TaskRecord>> {
        let task_id = match self.by_prompt.lock().get(id).cloned() {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(self.records.lock().get(&task_id).cloned())
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
        worker_id: Option<&WorkerId>,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| worker_id.is_none_or(|w| r.worker_id.as_ref() == Some(w)))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }
}

#[derive(Default)]
pub struct MemorySettingsStore {
    settings: Mutex<GlobalSettings>,
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self) -> StoreResult<GlobalSettings> {
        Ok(self.settings.lock().clone())
    }

    async fn set(&self, settings: &GlobalSettings) -> StoreResult<()> {
        *self.settings.lock() = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::ClientId;
    use serde_json::json;

    fn job(priority: i64, created_at: f64) -> QueuedJob {
        QueuedJob::new(json!({}), ClientId::new("c1"), priority, created_at)
    }

    #[tokio::test]
    async fn pop_highest_returns_priority_desc_created_at_asc() {
        let store = MemoryPendingQueueStore::default();
        let a = job(0, 1.0);
        let b = job(10, 2.0);
        let c = job(10, 3.0);
        store.enqueue(&a).await.unwrap();
        store.enqueue(&b).await.unwrap();
        store.enqueue(&c).await.unwrap();

        let first = store.pop_highest().await.unwrap().unwrap();
        let second = store.pop_highest().await.unwrap().unwrap();
        let third = store.pop_highest().await.unwrap().unwrap();
        assert_eq!(first.gateway_job_id, b.gateway_job_id);
        assert_eq!(second.gateway_job_id, c.gateway_job_id);
        assert_eq!(third.gateway_job_id, a.gateway_job_id);
        assert!(store.pop_highest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_highest_is_at_most_once() {
        let store = MemoryPendingQueueStore::default();
        let a = job(1, 1.0);
        store.enqueue(&a).await.unwrap();
        let first = store.pop_highest().await.unwrap();
        let second = store.pop_highest().await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn re_enqueue_preserves_created_at() {
        let store = MemoryPendingQueueStore::default();
        let a = job(1, 5.0);
        store.enqueue(&a).await.unwrap();
        let popped = store.pop_highest().await.unwrap().unwrap();
        assert_eq!(popped.created_at, 5.0);
        store.re_enqueue(&popped).await.unwrap();
        let peeked = store.peek(&popped.gateway_job_id).await.unwrap().unwrap();
        assert_eq!(peeked.created_at, 5.0);
    }

    #[tokio::test]
    async fn upsert_by_prompt_id_is_idempotent_against_task_id() {
        let store = MemoryHistoryStore::default();
        let mut rec = TaskRecord::new(TaskId::new("gw-1"), 0, 0);
        rec.prompt_id = Some(PromptId::new("p-1"));
        store.upsert(&rec).await.unwrap();

        // A later record under a *different* task_id with the same prompt_id
        // must not create a second logical record reachable by prompt_id.
        let mut other = TaskRecord::new(TaskId::new("p-1"), 0, 0);
        other.prompt_id = Some(PromptId::new("p-1"));
        store.upsert(&other).await.unwrap();

        let by_prompt = store.get_by_prompt_id(&PromptId::new("p-1")).await.unwrap().unwrap();
        assert_eq!(by_prompt.task_id, TaskId::new("gw-1"));
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = MemorySettingsStore::default();
        let mut settings = GlobalSettings::default();
        settings.global_worker_auth = Some(gw_core::Credentials::new("u", "p"));
        store.set(&settings).await.unwrap();
        assert_eq!(store.get().await.unwrap(), settings);
    }
}
