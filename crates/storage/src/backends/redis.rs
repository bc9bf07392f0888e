//! Cache backend: a Redis-compatible store via `fred`, used when a remote
//! cache URL is configured but no relational database is. Best-effort:
//! every call carries a short connect/read timeout and, on any error,
//! silently falls back to an in-process store rather than surfacing a
//! user-visible "persistence unavailable" error.

use crate::backends::memory::{
    MemoryHistoryStore, MemoryMappingStore, MemoryPendingQueueStore, MemorySettingsStore,
    MemoryWorkerStore,
};
use crate::error::StoreResult;
use crate::ports::{HistoryStore, MappingStore, PendingQueueStore, SettingsStore, WorkerStore};
use async_trait::async_trait;
use fred::prelude::*;
use gw_core::{
    GatewayJobId, GatewayJobMapping, GlobalSettings, PromptId, QueuedJob, TaskId, TaskRecord,
    TaskStatus, WorkerId, WorkerInfo,
};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const WORKERS_KEY: &str = "gateway:workers";
const PENDING_KEY: &str = "gateway:pending_queue";

/// Connects lazily (`fred` reconnects on its own); a connection that
/// never succeeds just means every call below times out and falls
/// through to the in-process fallback.
#[derive(Clone)]
pub struct RedisHandle {
    client: RedisClient,
}

impl RedisHandle {
    pub fn new(url: &str) -> StoreResult<Self> {
        let config = RedisConfig::from_url(url).map_err(|e| crate::error::StoreError::Cache(e.to_string()))?;
        let client = Builder::from_config(config).build().map_err(|e| crate::error::StoreError::Cache(e.to_string()))?;
        let handle = Self { client: client.clone() };
        tokio::spawn(async move {
            let _ = client.connect();
            let _ = tokio::time::timeout(CONNECT_TIMEOUT, client.wait_for_connect()).await;
        });
        Ok(handle)
    }

    async fn get_string(&self, key: &str) -> Option<String> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.client.get::<Option<String>, _>(key)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(error = %e, key, "redis get failed, falling back to in-process");
                None
            }
            Err(_) => {
                warn!(key, "redis get timed out, falling back to in-process");
                None
            }
        }
    }

    async fn set_string(&self, key: &str, value: &str) -> bool {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.client.set::<(), _, _>(key, value, None, None, false))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, key, "redis set failed, falling back to in-process");
                false
            }
            Err(_) => {
                warn!(key, "redis set timed out, falling back to in-process");
                false
            }
        }
    }

}

/// A port implementation that tries Redis first and falls back to an
/// in-process store of the same shape on any failure. The fallback
/// store is shared across calls so state survives intermittent Redis
/// outages within one process lifetime.
pub struct RedisWorkerStore {
    redis: RedisHandle,
    fallback: MemoryWorkerStore,
}

impl RedisWorkerStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis, fallback: MemoryWorkerStore::default() }
    }

    async fn load(&self) -> Vec<WorkerInfo> {
        match self.redis.get_string(WORKERS_KEY).await {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => self.fallback.list().await.unwrap_or_default(),
        }
    }

    async fn save(&self, workers: &[WorkerInfo]) {
        if let Ok(json) = serde_json::to_string(workers) {
            if self.redis.set_string(WORKERS_KEY, &json).await {
                return;
            }
        }
        for w in workers {
            let _ = self.fallback.upsert(w).await;
        }
    }
}

#[async_trait]
impl WorkerStore for RedisWorkerStore {
    async fn list(&self) -> StoreResult<Vec<WorkerInfo>> {
        Ok(self.load().await)
    }

    async fn get(&self, id: &WorkerId) -> StoreResult<Option<WorkerInfo>> {
        Ok(self.load().await.into_iter().find(|w| &w.worker_id == id))
    }

    async fn upsert(&self, worker: &WorkerInfo) -> StoreResult<()> {
        let mut workers = self.load().await;
        if let Some(existing) = workers.iter_mut().find(|w| w.worker_id == worker.worker_id) {
            *existing = worker.clone();
        } else {
            workers.push(worker.clone());
        }
        self.save(&workers).await;
        self.fallback.upsert(worker).await?;
        Ok(())
    }

    async fn remove(&self, id: &WorkerId) -> StoreResult<bool> {
        let mut workers = self.load().await;
        let before = workers.len();
        workers.retain(|w| &w.worker_id != id);
        let removed = workers.len() != before;
        self.save(&workers).await;
        self.fallback.remove(id).await?;
        Ok(removed)
    }
}

/// Mappings are never re-listed wholesale, so each key is addressed
/// directly rather than rewritten as one blob.
pub struct RedisMappingStore {
    redis: RedisHandle,
    fallback: MemoryMappingStore,
}

impl RedisMappingStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis, fallback: MemoryMappingStore::default() }
    }
}

#[async_trait]
impl MappingStore for RedisMappingStore {
    async fn set_prompt_worker(&self, prompt_id: &PromptId, worker_id: &WorkerId) -> StoreResult<()> {
        let key = format!("gateway:task:{}", prompt_id);
        if !self.redis.set_string(&key, worker_id.as_str()).await {
            self.fallback.set_prompt_worker(prompt_id, worker_id).await?;
        }
        Ok(())
    }

    async fn get_prompt_worker(&self, prompt_id: &PromptId) -> StoreResult<Option<WorkerId>> {
        let key = format!("gateway:task:{}", prompt_id);
        if let Some(v) = self.redis.get_string(&key).await {
            return Ok(Some(WorkerId::new(v)));
        }
        self.fallback.get_prompt_worker(prompt_id).await
    }

    async fn set_gateway_job(&self, mapping: &GatewayJobMapping) -> StoreResult<()> {
        let key = format!("gateway:job:{}", mapping.gateway_job_id);
        let json = serde_json::json!({"prompt_id": mapping.prompt_id.as_str(), "worker_id": mapping.worker_id.as_str()});
        if !self.redis.set_string(&key, &json.to_string()).await {
            self.fallback.set_gateway_job(mapping).await?;
        }
        Ok(())
    }

    async fn get_gateway_job(&self, id: &GatewayJobId) -> StoreResult<Option<GatewayJobMapping>> {
        let key = format!("gateway:job:{}", id);
        if let Some(raw) = self.redis.get_string(&key).await {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&raw) {
                let prompt_id = v.get("prompt_id").and_then(|v| v.as_str()).unwrap_or_default();
                let worker_id = v.get("worker_id").and_then(|v| v.as_str()).unwrap_or_default();
                return Ok(Some(GatewayJobMapping {
                    gateway_job_id: id.clone(),
                    prompt_id: PromptId::new(prompt_id),
                    worker_id: WorkerId::new(worker_id),
                }));
            }
        }
        self.fallback.get_gateway_job(id).await
    }
}

/// Pop-highest needs a read-then-write that Redis alone can't make atomic
/// without scripting; `order_lock` serialises it within this process
/// instead.
pub struct RedisPendingQueueStore {
    redis: RedisHandle,
    fallback: MemoryPendingQueueStore,
    order_lock: AsyncMutex<()>,
}

impl RedisPendingQueueStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis, fallback: MemoryPendingQueueStore::default(), order_lock: AsyncMutex::new(()) }
    }

    async fn load(&self) -> Vec<QueuedJob> {
        match self.redis.get_string(PENDING_KEY).await {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => {
                let mut items = Vec::new();
                while let Ok(Some(j)) = self.fallback.pop_highest().await {
                    items.push(j);
                }
                for j in &items {
                    let _ = self.fallback.re_enqueue(j).await;
                }
                items
            }
        }
    }

    async fn save(&self, items: &[QueuedJob]) {
        if let Ok(json) = serde_json::to_string(items) {
            if self.redis.set_string(PENDING_KEY, &json).await {
                return;
            }
        }
        while self.fallback.pop_highest().await.ok().flatten().is_some() {}
        for j in items {
            let _ = self.fallback.enqueue(j).await;
        }
    }
}

#[async_trait]
impl PendingQueueStore for RedisPendingQueueStore {
    async fn enqueue(&self, job: &QueuedJob) -> StoreResult<()> {
        let _guard = self.order_lock.lock().await;
        let mut items = self.load().await;
        items.push(job.clone());
        self.save(&items).await;
        Ok(())
    }

    async fn pop_highest(&self) -> StoreResult<Option<QueuedJob>> {
        let _guard = self.order_lock.lock().await;
        let mut items = self.load().await;
        if items.is_empty() {
            return Ok(None);
        }
        gw_core::queue::sort_pending(&mut items);
        let top = items.remove(0);
        self.save(&items).await;
        Ok(Some(top))
    }

    async fn peek(&self, id: &GatewayJobId) -> StoreResult<Option<QueuedJob>> {
        let _guard = self.order_lock.lock().await;
        Ok(self.load().await.into_iter().find(|j| &j.gateway_job_id == id))
    }

    async fn remove(&self, id: &GatewayJobId) -> StoreResult<bool> {
        let _guard = self.order_lock.lock().await;
        let mut items = self.load().await;
        let before = items.len();
        items.retain(|j| &j.gateway_job_id != id);
        let removed = items.len() != before;
        self.save(&items).await;
        Ok(removed)
    }

    async fn re_enqueue(&self, job: &QueuedJob) -> StoreResult<()> {
        let _guard = self.order_lock.lock().await;
        let mut items = self.load().await;
        items.push(job.clone());
        self.save(&items).await;
        Ok(())
    }

    async fn len(&self) -> StoreResult<usize> {
        let _guard = self.order_lock.lock().await;
        Ok(self.load().await.len())
    }
}

pub struct RedisHistoryStore {
    redis: RedisHandle,
    fallback: MemoryHistoryStore,
}

impl RedisHistoryStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis, fallback: MemoryHistoryStore::default() }
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn upsert(&self, record: &TaskRecord) -> StoreResult<()> {
        let key = format!("gateway:history:{}", record.task_id);
        if let Ok(json) = serde_json::to_string(record) {
            if self.redis.set_string(&key, &json).await {
                if let Some(prompt_id) = &record.prompt_id {
                    let idx_key = format!("gateway:history:by_prompt:{}", prompt_id);
                    // Only point the index at this record if nothing already claims
                    // this prompt_id — first `upsert_by_prompt_id` wins.
                    if self.redis.get_string(&idx_key).await.is_none() {
                        self.redis.set_string(&idx_key, record.task_id.as_str()).await;
                    }
                }
                self.fallback.upsert(record).await?;
                return Ok(());
            }
        }
        self.fallback.upsert(record).await
    }

    async fn get_by_task_id(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>> {
        let key = format!("gateway:history:{}", id);
        if let Some(raw) = self.redis.get_string(&key).await {
            if let Ok(record) = serde_json::from_str(&raw) {
                return Ok(Some(record));
            }
        }
        self.fallback.get_by_task_id(id).await
    }

    async fn get_by_prompt_id(&self, id: &PromptId) -> StoreResult<Option<TaskRecord>> {
        let idx_key = format!("gateway:history:by_prompt:{}", id);
        if let Some(task_id) = self.redis.get_string(&idx_key).await {
            return self.get_by_task_id(&TaskId::new(task_id)).await;
        }
        self.fallback.get_by_prompt_id(id).await
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
        worker_id: Option<&WorkerId>,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<TaskRecord>> {
        // Listing/reconciliation is infrequent relative to point lookups;
        // the in-process mirror (kept current by `upsert` above) serves it.
        self.fallback.list(limit, offset, worker_id, status).await
    }
}

pub struct RedisSettingsStore {
    redis: RedisHandle,
    fallback: MemorySettingsStore,
}

impl RedisSettingsStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis, fallback: MemorySettingsStore::default() }
    }
}

const SETTINGS_KEY: &str = "gateway:settings";

#[async_trait]
impl SettingsStore for RedisSettingsStore {
    async fn get(&self) -> StoreResult<GlobalSettings> {
        if let Some(raw) = self.redis.get_string(SETTINGS_KEY).await {
            if let Ok(settings) = serde_json::from_str(&raw) {
                return Ok(settings);
            }
        }
        self.fallback.get().await
    }

    async fn set(&self, settings: &GlobalSettings) -> StoreResult<()> {
        if let Ok(json) = serde_json::to_string(settings) {
            self.redis.set_string(SETTINGS_KEY, &json).await;
        }
        self.fallback.set(settings).await
    }
}
