//! Task history service: append-on-insert, update-in-place thereafter,
//! plus on-demand reconciliation for non-terminal records and a
//! result-URL rewrite that swaps worker-hosted output URLs for the
//! gateway's own `/view` endpoint before a record is persisted.

use crate::registry::WorkerRegistry;
use crate::settings::SettingsService;
use gw_core::{Clock, PromptId, TaskId, TaskRecord, TaskStatus, WorkerId};
use gw_storage::{HistoryStore, StoreResult};
use gw_worker_client::WorkerClient;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Result keys holding a list of output descriptors rather than a single
/// one; each entry in the list gets its own rewritten `url`.
const OUTPUT_LIST_KEYS: [&str; 3] = ["images", "gifs", "videos"];

pub struct HistoryService {
    store: Arc<dyn HistoryStore>,
    registry: Arc<WorkerRegistry>,
    settings: Arc<SettingsService>,
    clock: Arc<dyn Clock>,
    view_base: String,
    worker_timeout: Duration,
}

impl HistoryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn HistoryStore>,
        registry: Arc<WorkerRegistry>,
        settings: Arc<SettingsService>,
        clock: Arc<dyn Clock>,
        view_base: impl Into<String>,
        worker_timeout: Duration,
    ) -> Self {
        Self { store, registry, settings, clock, view_base: view_base.into(), worker_timeout }
    }

    pub async fn create(&self, task_id: TaskId, priority: i64) -> StoreResult<TaskRecord> {
        let record = TaskRecord::new(task_id, priority, self.clock.now_secs());
        self.store.upsert(&record).await?;
        Ok(record)
    }

    /// Mark a freshly-enqueued priority job `queued` (`pending -> queued`),
    /// without yet knowing a worker or prompt_id.
    pub async fn mark_queued(&self, task_id: &TaskId) -> StoreResult<()> {
        let Some(mut record) = self.store.get_by_task_id(task_id).await? else { return Ok(()) };
        if record.status.can_advance_to(TaskStatus::Queued) {
            record.status = TaskStatus::Queued;
            self.store.upsert(&record).await?;
        }
        Ok(())
    }

    pub async fn mark_submitted(&self, task_id: &TaskId, prompt_id: PromptId, worker_id: WorkerId) -> StoreResult<()> {
        let now = self.clock.now_secs();
        let mut record = self.store.get_by_task_id(task_id).await?.unwrap_or_else(|| TaskRecord::new(task_id.clone(), 0, now));
        record.mark_submitted(prompt_id, worker_id, now);
        self.store.upsert(&record).await
    }

    pub async fn update_progress(&self, task_id: &TaskId, progress: u8) -> StoreResult<()> {
        let Some(mut record) = self.store.get_by_task_id(task_id).await? else { return Ok(()) };
        record.apply_progress(progress);
        self.store.upsert(&record).await
    }

    pub async fn mark_completed(&self, task_id: &TaskId, result_blob: Option<Value>) -> StoreResult<()> {
        let now = self.clock.now_secs();
        let mut record = self.store.get_by_task_id(task_id).await?.unwrap_or_else(|| TaskRecord::new(task_id.clone(), 0, now));
        record.mark_completed(result_blob, now);
        self.store.upsert(&record).await
    }

    pub async fn mark_failed(&self, task_id: &TaskId, error_message: impl Into<String>) -> StoreResult<()> {
        let now = self.clock.now_secs();
        let mut record = self.store.get_by_task_id(task_id).await?.unwrap_or_else(|| TaskRecord::new(task_id.clone(), 0, now));
        record.mark_failed(error_message, now);
        self.store.upsert(&record).await
    }

    /// Idempotent anchor for the direct submission path: if a record with
    /// this `prompt_id` exists, update its `worker_id`; else insert with
    /// `task_id = prompt_id` and status `running`.
    pub async fn upsert_by_prompt_id(&self, prompt_id: PromptId, worker_id: WorkerId, priority: i64) -> StoreResult<TaskRecord> {
        let now = self.clock.now_secs();
        let record = match self.store.get_by_prompt_id(&prompt_id).await? {
            Some(mut existing) => {
                existing.worker_id = Some(worker_id);
                existing
            }
            None => {
                let mut fresh = TaskRecord::new(TaskId::from_prompt_id(&prompt_id), priority, now);
                fresh.mark_submitted(prompt_id, worker_id, now);
                fresh
            }
        };
        self.store.upsert(&record).await?;
        Ok(record)
    }

    /// Reconcile a record against observed truth from the owning worker;
    /// creates the record if absent.
    pub async fn sync(
        &self,
        prompt_id: PromptId,
        status: TaskStatus,
        progress: Option<u8>,
        worker_id: Option<WorkerId>,
        error: Option<String>,
        result: Option<Value>,
    ) -> StoreResult<TaskRecord> {
        let now = self.clock.now_secs();
        let mut record = match self.store.get_by_prompt_id(&prompt_id).await? {
            Some(r) => r,
            None => {
                let mut r = TaskRecord::new(TaskId::from_prompt_id(&prompt_id), 0, now);
                r.prompt_id = Some(prompt_id.clone());
                r
            }
        };
        if let Some(wid) = worker_id {
            record.worker_id = Some(wid);
        }
        if let Some(p) = progress {
            record.apply_progress(p);
        }
        match status {
            TaskStatus::Done => record.mark_completed(result, now),
            TaskStatus::Failed => record.mark_failed(error.unwrap_or_else(|| "worker reported failure".to_string()), now),
            other => {
                if !record.status.is_terminal() && record.status.can_advance_to(other) {
                    record.status = other;
                }
            }
        }
        self.store.upsert(&record).await?;
        Ok(record)
    }

    pub async fn get_by_task_id(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>> {
        self.store.get_by_task_id(id).await
    }

    pub async fn get_by_prompt_id(&self, id: &PromptId) -> StoreResult<Option<TaskRecord>> {
        self.store.get_by_prompt_id(id).await
    }

    /// `list` with on-demand reconciliation of non-terminal records, up
    /// to `concurrency` in parallel.
    pub async fn list(
        &self,
        limit: usize,
        offset: usize,
        worker_id: Option<&WorkerId>,
        status: Option<TaskStatus>,
        concurrency: usize,
    ) -> StoreResult<Vec<TaskRecord>> {
        let records = self.store.list(limit, offset, worker_id, status).await?;
        let non_terminal: Vec<TaskRecord> = records.iter().filter(|r| !r.status.is_terminal()).cloned().collect();
        if non_terminal.is_empty() {
            return Ok(records);
        }
        for chunk in non_terminal.chunks(concurrency.max(1)) {
            let reconciliations = chunk.iter().cloned().map(|r| self.reconcile(r));
            futures_util::future::join_all(reconciliations).await;
        }
        self.store.list(limit, offset, worker_id, status).await
    }

    /// Reconcile one non-terminal record against its owning worker's live
    /// queue/history state; also used directly by the on-demand status
    /// lookup rather than only the periodic `list` sweep.
    pub async fn reconcile(&self, record: TaskRecord) {
        let (Some(worker_id), Some(prompt_id)) = (record.worker_id.clone(), record.prompt_id.clone()) else { return };
        let worker = match self.registry.get(&worker_id).await {
            Ok(Some(w)) => w,
            _ => return,
        };
        let global_auth = self.settings.global_worker_auth().await.unwrap_or(None);
        let client = WorkerClient::new(worker.base_url.clone(), worker.auth(global_auth.as_ref()).cloned(), self.worker_timeout);

        let (hist_body, hist_status) = client.get_history(prompt_id.as_str()).await;
        if hist_status == 200 {
            if let Some(mut result) = hist_body.as_ref().and_then(|b| b.get(prompt_id.as_str())).cloned() {
                Self::rewrite_result_urls(&mut result, prompt_id.as_str(), &self.view_base);
                let _ = self.sync(prompt_id, TaskStatus::Done, Some(100), Some(worker_id), None, Some(result)).await;
                return;
            }
        }

        if let Some(snapshot) = client.fetch_queue().await {
            if contains_prompt(&snapshot.queue_running, prompt_id.as_str()) {
                let _ = self.sync(prompt_id, TaskStatus::Running, None, Some(worker_id), None, None).await;
                return;
            }
            if contains_prompt(&snapshot.queue_pending, prompt_id.as_str()) {
                let _ = self.sync(prompt_id, TaskStatus::Queued, Some(0), Some(worker_id), None, None).await;
                return;
            }
        }

        let _ = self.sync(prompt_id, TaskStatus::Failed, None, Some(worker_id), Some("not in queue and no history".to_string()), None).await;
    }

    /// Rewrite any worker-hosted output URL in `result_blob` to the
    /// gateway's own `/view` endpoint, so a client never sees a
    /// worker-internal hostname.
    pub fn rewrite_result_urls(result_blob: &mut Value, prompt_id: &str, view_base: &str) {
        if prompt_id.is_empty() || view_base.is_empty() {
            return;
        }
        inject_urls(result_blob, prompt_id, view_base.trim_end_matches('/'));
    }
}

fn contains_prompt(items: &[Value], prompt_id: &str) -> bool {
    items.iter().any(|item| gw_wire::extract_prompt_id(item).as_deref() == Some(prompt_id))
}

fn inject_urls(value: &mut Value, prompt_id: &str, base: &str) {
    match value {
        Value::Object(map) => {
            if let Some(filename) = map.get("filename").and_then(|v| v.as_str()).map(str::to_string) {
                annotate(map, prompt_id, base, &filename);
                return;
            }
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                if OUTPUT_LIST_KEYS.contains(&key.as_str()) {
                    if let Some(Value::Array(items)) = map.get_mut(&key) {
                        for item in items.iter_mut() {
                            if let Value::Object(item_map) = item {
                                if let Some(filename) = item_map.get("filename").and_then(|v| v.as_str()).map(str::to_string) {
                                    annotate(item_map, prompt_id, base, &filename);
                                }
                            }
                        }
                    }
                } else if let Some(v) = map.get_mut(&key) {
                    inject_urls(v, prompt_id, base);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                inject_urls(item, prompt_id, base);
            }
        }
        _ => {}
    }
}

fn annotate(map: &mut serde_json::Map<String, Value>, prompt_id: &str, base: &str, filename: &str) {
    let subfolder = map.get("subfolder").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let kind = map.get("type").and_then(|v| v.as_str()).unwrap_or("output").to_string();
    let url = format!(
        "{base}?prompt_id={}&filename={}&subfolder={}&type={}",
        percent_encode(prompt_id),
        percent_encode(filename),
        percent_encode(&subfolder),
        percent_encode(&kind),
    );
    map.insert("url".to_string(), Value::String(url));
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::clock::FakeClock;
    use gw_storage::backends::memory::{MemoryHistoryStore, MemorySettingsStore, MemoryWorkerStore};
    use serde_json::json;

    fn service() -> HistoryService {
        HistoryService::new(
            Arc::new(MemoryHistoryStore::default()),
            Arc::new(WorkerRegistry::new(Arc::new(MemoryWorkerStore::default()), Arc::new(FakeClock::new(1000)))),
            Arc::new(SettingsService::new(Arc::new(MemorySettingsStore::default()))),
            Arc::new(FakeClock::new(1000)),
            "/api/view",
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn create_inserts_pending() {
        let svc = service();
        let record = svc.create(TaskId::new("t1"), 5).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.priority, 5);
    }

    #[tokio::test]
    async fn upsert_by_prompt_id_is_idempotent() {
        let svc = service();
        let first = svc.upsert_by_prompt_id(PromptId::new("p1"), WorkerId::new("w1"), 0).await.unwrap();
        let second = svc.upsert_by_prompt_id(PromptId::new("p1"), WorkerId::new("w2"), 0).await.unwrap();
        assert_eq!(first.task_id, second.task_id);
        assert_eq!(second.worker_id, Some(WorkerId::new("w2")));
    }

    #[tokio::test]
    async fn sync_creates_then_promotes_to_done() {
        let svc = service();
        svc.sync(PromptId::new("p1"), TaskStatus::Running, Some(10), Some(WorkerId::new("w1")), None, None).await.unwrap();
        let done = svc.sync(PromptId::new("p1"), TaskStatus::Done, Some(100), None, None, Some(json!({"ok": true}))).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.result_blob, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn sync_does_not_regress_a_terminal_record() {
        let svc = service();
        svc.sync(PromptId::new("p1"), TaskStatus::Done, Some(100), Some(WorkerId::new("w1")), None, Some(json!({"a":1}))).await.unwrap();
        let after = svc.sync(PromptId::new("p1"), TaskStatus::Failed, None, None, Some("late".to_string()), None).await.unwrap();
        assert_eq!(after.status, TaskStatus::Done);
    }

    #[test]
    fn rewrite_result_urls_annotates_nested_images() {
        let mut blob = json!({"outputs": {"9": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]}}});
        HistoryService::rewrite_result_urls(&mut blob, "p1", "http://gateway/api/view/");
        let url = blob["outputs"]["9"]["images"][0]["url"].as_str().unwrap();
        assert_eq!(url, "http://gateway/api/view?prompt_id=p1&filename=a.png&subfolder=&type=output");
    }
}
