//! Narrow persistence ports.
//!
//! Each port is a small async trait. All three backends (relational,
//! cache, in-process) implement every port with identical semantics:
//! upserts are idempotent, fetches return `None` rather than erroring
//! when the row/key is absent.

use crate::error::StoreResult;
use async_trait::async_trait;
use gw_core::{
    GatewayJobId, GatewayJobMapping, GlobalSettings, PromptId, QueuedJob, TaskId, TaskRecord,
    WorkerId, WorkerInfo,
};

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn list(&self) -> StoreResult<Vec<WorkerInfo>>;
    async fn get(&self, id: &WorkerId) -> StoreResult<Option<WorkerInfo>>;
    async fn upsert(&self, worker: &WorkerInfo) -> StoreResult<()>;
    async fn remove(&self, id: &WorkerId) -> StoreResult<bool>;
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn set_prompt_worker(&self, prompt_id: &PromptId, worker_id: &WorkerId) -> StoreResult<()>;
    async fn get_prompt_worker(&self, prompt_id: &PromptId) -> StoreResult<Option<WorkerId>>;
    async fn set_gateway_job(&self, mapping: &GatewayJobMapping) -> StoreResult<()>;
    async fn get_gateway_job(&self, id: &GatewayJobId) -> StoreResult<Option<GatewayJobMapping>>;
}

#[async_trait]
pub trait PendingQueueStore: Send + Sync {
    async fn enqueue(&self, job: &QueuedJob) -> StoreResult<()>;
    /// Remove and return the job with maximum `priority`, breaking ties
    /// on minimum `created_at`. A popped job is never returned again.
    async fn pop_highest(&self) -> StoreResult<Option<QueuedJob>>;
    async fn peek(&self, id: &GatewayJobId) -> StoreResult<Option<QueuedJob>>;
    async fn remove(&self, id: &GatewayJobId) -> StoreResult<bool>;
    /// Re-insert a previously popped job, preserving its original
    /// `created_at` so it retains its position among equal priorities.
    async fn re_enqueue(&self, job: &QueuedJob) -> StoreResult<()>;
    async fn len(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn upsert(&self, record: &TaskRecord) -> StoreResult<()>;
    async fn get_by_task_id(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>>;
    async fn get_by_prompt_id(&self, id: &PromptId) -> StoreResult<Option<TaskRecord>>;
    async fn list(
        &self,
        limit: usize,
        offset: usize,
        worker_id: Option<&WorkerId>,
        status: Option<gw_core::TaskStatus>,
    ) -> StoreResult<Vec<TaskRecord>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self) -> StoreResult<GlobalSettings>;
    async fn set(&self, settings: &GlobalSettings) -> StoreResult<()>;
}

/// Bundle of the five ports backing one running gateway process. All
/// three backend implementations produce one of these behind a single
/// `Arc`-shared set of trait objects — constructed once at start-up and
/// injected, never a module-level singleton.
pub struct Stores {
    pub workers: Box<dyn WorkerStore>,
    pub mappings: Box<dyn MappingStore>,
    pub pending_queue: Box<dyn PendingQueueStore>,
    pub history: Box<dyn HistoryStore>,
    pub settings: Box<dyn SettingsStore>,
}
