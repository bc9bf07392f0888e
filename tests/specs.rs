//! Workspace-level integration tests for the domain invariants that don't
//! need a running gateway process: queue ordering, storage round-trips, and
//! the task lifecycle state machine, exercised directly against `gw-core`
//! and `gw-storage`.
//!
//! Dispatcher re-enqueue-on-503, worker selection under load, and
//! progress-event folding are exercised as crate-internal unit tests in
//! `gw-gateway` (`dispatcher.rs`, `selector.rs`, `progress.rs`) since this
//! package has no dependency on that crate.

use gw_core::queue::sort_pending;
use gw_core::{
    ClientId, Credentials, GatewayJobId, GatewayJobMapping, GlobalSettings, PromptId, QueuedJob,
    TaskId, TaskRecord, TaskStatus, WorkerId,
};
use gw_storage::backends::memory::{
    MemoryHistoryStore, MemoryMappingStore, MemoryPendingQueueStore, MemorySettingsStore,
    MemoryWorkerStore,
};
use gw_storage::{HistoryStore, MappingStore, PendingQueueStore, SettingsStore, WorkerStore};
use gw_wire::http::{extract_prompt_id, parse_queue_counts, QueueSnapshot};
use proptest::prelude::*;
use serde_json::json;

fn job(priority: i64, created_at: f64) -> QueuedJob {
    QueuedJob::new(json!({"node": 1}), ClientId::new("c1"), priority, created_at)
}

// --- Ordering invariant ------------------------------------------------

proptest! {
    /// `sort_pending` always yields priority descending, then created_at
    /// ascending, for any finite batch of jobs.
    #[test]
    fn sort_pending_is_priority_desc_then_created_at_asc(
        priorities in proptest::collection::vec(-100i64..100, 1..30),
        offsets in proptest::collection::vec(0u32..10_000, 1..30),
    ) {
        let n = priorities.len().min(offsets.len());
        let mut jobs: Vec<QueuedJob> = (0..n)
            .map(|i| job(priorities[i], offsets[i] as f64))
            .collect();
        sort_pending(&mut jobs);

        for pair in jobs.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(
                a.priority > b.priority
                    || (a.priority == b.priority && a.created_at <= b.created_at)
            );
        }
    }
}

#[tokio::test]
async fn pending_queue_store_pop_is_at_most_once_across_many_jobs() {
    let store = MemoryPendingQueueStore::default();
    let mut ids = Vec::new();
    for i in 0..20 {
        let j = job(i % 5, i as f64);
        ids.push(j.gateway_job_id.clone());
        store.enqueue(&j).await.unwrap();
    }

    let mut popped = Vec::new();
    while let Some(j) = store.pop_highest().await.unwrap() {
        popped.push(j.gateway_job_id);
    }

    assert_eq!(popped.len(), ids.len(), "every enqueued job is popped exactly once");
    let mut sorted_popped = popped.clone();
    sorted_popped.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    let mut sorted_ids = ids;
    sorted_ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(sorted_popped, sorted_ids);
    assert!(store.pop_highest().await.unwrap().is_none());
}

#[tokio::test]
async fn empty_queue_pop_returns_none() {
    let store = MemoryPendingQueueStore::default();
    assert!(store.pop_highest().await.unwrap().is_none());
    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn equal_priority_ties_break_on_created_at_then_job_id() {
    let store = MemoryPendingQueueStore::default();
    let a = QueuedJob { gateway_job_id: GatewayJobId::new("bbb"), ..job(1, 5.0) };
    let b = QueuedJob { gateway_job_id: GatewayJobId::new("aaa"), ..job(1, 5.0) };
    store.enqueue(&a).await.unwrap();
    store.enqueue(&b).await.unwrap();

    let first = store.pop_highest().await.unwrap().unwrap();
    assert_eq!(first.gateway_job_id.as_str(), "aaa", "equal priority and timestamp breaks tie on id");
}

// --- Mapping consistency ------------------------------------------------

#[tokio::test]
async fn mapping_store_round_trips_prompt_and_gateway_job() {
    let store = MemoryMappingStore::default();
    let prompt_id = PromptId::generate();
    let worker_id = WorkerId::new("w1");
    store.set_prompt_worker(&prompt_id, &worker_id).await.unwrap();
    assert_eq!(store.get_prompt_worker(&prompt_id).await.unwrap(), Some(worker_id.clone()));

    let gateway_job_id = GatewayJobId::generate();
    let mapping = GatewayJobMapping { gateway_job_id: gateway_job_id.clone(), prompt_id: prompt_id.clone(), worker_id: worker_id.clone() };
    store.set_gateway_job(&mapping).await.unwrap();
    assert_eq!(store.get_gateway_job(&gateway_job_id).await.unwrap(), Some(mapping));
}

#[tokio::test]
async fn mapping_lookup_misses_return_none_not_error() {
    let store = MemoryMappingStore::default();
    assert_eq!(store.get_prompt_worker(&PromptId::new("missing")).await.unwrap(), None);
    assert_eq!(store.get_gateway_job(&GatewayJobId::new("missing")).await.unwrap(), None);
}

// --- Task lifecycle: monotone progress & terminal absorption ----------

#[tokio::test]
async fn task_history_store_round_trips_by_task_id_and_prompt_id() {
    let store = MemoryHistoryStore::default();
    let mut record = TaskRecord::new(TaskId::new("gw-1"), 7, 0);
    record.mark_submitted(PromptId::new("p-1"), WorkerId::new("w1"), 1);
    store.upsert(&record).await.unwrap();

    assert_eq!(store.get_by_task_id(&TaskId::new("gw-1")).await.unwrap(), Some(record.clone()));
    assert_eq!(store.get_by_prompt_id(&PromptId::new("p-1")).await.unwrap(), Some(record));
}

#[tokio::test]
async fn upsert_by_prompt_id_is_idempotent_on_repeated_calls() {
    let store = MemoryHistoryStore::default();
    let mut record = TaskRecord::new(TaskId::new("gw-1"), 0, 0);
    record.prompt_id = Some(PromptId::new("p-1"));
    store.upsert(&record).await.unwrap();
    store.upsert(&record).await.unwrap();

    let list = store.list(100, 0, None, None).await.unwrap();
    assert_eq!(list.len(), 1, "re-upserting the same record never duplicates it");
}

#[tokio::test]
async fn history_list_filters_by_worker_and_status() {
    let store = MemoryHistoryStore::default();
    let mut done = TaskRecord::new(TaskId::new("t-done"), 0, 0);
    done.worker_id = Some(WorkerId::new("w1"));
    done.status = TaskStatus::Running;
    done.mark_completed(Some(json!({"ok": true})), 10);
    store.upsert(&done).await.unwrap();

    let mut failed = TaskRecord::new(TaskId::new("t-failed"), 0, 0);
    failed.worker_id = Some(WorkerId::new("w2"));
    failed.status = TaskStatus::Running;
    failed.mark_failed("boom", 10);
    store.upsert(&failed).await.unwrap();

    let only_w1 = store.list(100, 0, Some(&WorkerId::new("w1")), None).await.unwrap();
    assert_eq!(only_w1.len(), 1);
    assert_eq!(only_w1[0].task_id, TaskId::new("t-done"));

    let only_failed = store.list(100, 0, None, Some(TaskStatus::Failed)).await.unwrap();
    assert_eq!(only_failed.len(), 1);
    assert_eq!(only_failed[0].task_id, TaskId::new("t-failed"));
}

proptest! {
    /// Progress never decreases and terminal states absorb every further
    /// update, for any interleaving of progress values and a trailing
    /// completion/failure.
    #[test]
    fn progress_is_monotone_and_terminal_absorbs(
        values in proptest::collection::vec(0u8..=255, 0..20),
        fails in any::<bool>(),
    ) {
        let mut record = TaskRecord::new(TaskId::new("t1"), 0, 0);
        record.mark_submitted(PromptId::new("p1"), WorkerId::new("w1"), 0);

        let mut last = 0u8;
        for v in &values {
            record.apply_progress(*v);
            prop_assert!(record.progress >= last);
            last = record.progress;
        }
        prop_assert!(record.progress <= 100);

        if fails {
            record.mark_failed("err", 1);
        } else {
            record.mark_completed(None, 1);
        }
        let snapshot = record.clone();
        record.apply_progress(200);
        record.mark_failed("late", 2);
        prop_assert_eq!(record, snapshot, "terminal record absorbs every further update");
    }
}

// --- Boundary: queue-item parsing ambiguity -----------------------------

#[test]
fn parse_queue_counts_and_extract_prompt_id_handle_mixed_shapes() {
    let snapshot: QueueSnapshot = serde_json::from_value(json!({
        "queue_running": [["abc", 5]],
        "queue_pending": [],
    }))
    .unwrap();
    assert_eq!(parse_queue_counts(&snapshot), (1, 0));
    assert_eq!(extract_prompt_id(&snapshot.queue_running[0]), None, "non-UUID scalars are rejected");

    let uuid = uuid::Uuid::new_v4().to_string();
    let tuple = json!([5, uuid.clone()]);
    assert_eq!(extract_prompt_id(&tuple).as_deref(), Some(uuid.as_str()));
}

// --- Settings round-trip -------------------------------------------------

#[tokio::test]
async fn settings_store_persists_global_worker_auth() {
    let store = MemorySettingsStore::default();
    let mut settings = GlobalSettings::default();
    settings.global_worker_auth = Some(Credentials::new("svc", "secret"));
    store.set(&settings).await.unwrap();
    assert_eq!(store.get().await.unwrap(), settings);
}

// --- Scenario: direct-path submission reaches a terminal state ---------

#[tokio::test]
async fn direct_submission_reaches_done_without_touching_the_pending_queue() {
    let pending = MemoryPendingQueueStore::default();
    let history = MemoryHistoryStore::default();

    let prompt_id = PromptId::generate();
    let task_id = TaskId::from_prompt_id(&prompt_id);
    let mut record = TaskRecord::new(task_id.clone(), 0, 0);
    record.mark_submitted(prompt_id, WorkerId::new("w1"), 1);
    history.upsert(&record).await.unwrap();

    record.apply_progress(100);
    record.mark_completed(Some(json!({"outputs": []})), 2);
    history.upsert(&record).await.unwrap();

    let stored = history.get_by_task_id(&task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Done);
    assert_eq!(pending.len().await.unwrap(), 0, "a direct-path submission never enters the priority queue");
}

// --- Scenario: priority queue dispatch ordering B/C/A -------------------

#[tokio::test]
async fn priority_queue_dispatches_in_declared_scenario_order() {
    let pending = MemoryPendingQueueStore::default();
    let a = QueuedJob::new(json!({"label": "A"}), ClientId::new("c1"), 0, 1.0);
    let b = QueuedJob::new(json!({"label": "B"}), ClientId::new("c1"), 10, 2.0);
    let c = QueuedJob::new(json!({"label": "C"}), ClientId::new("c1"), 10, 3.0);
    pending.enqueue(&a).await.unwrap();
    pending.enqueue(&b).await.unwrap();
    pending.enqueue(&c).await.unwrap();

    let first = pending.pop_highest().await.unwrap().unwrap();
    let second = pending.pop_highest().await.unwrap().unwrap();
    let third = pending.pop_highest().await.unwrap().unwrap();
    assert_eq!(first.prompt["label"], "B");
    assert_eq!(second.prompt["label"], "C");
    assert_eq!(third.prompt["label"], "A");
}

// --- Scenario: persistence defaults to the in-process backend ----------

#[tokio::test]
async fn connect_with_no_urls_configured_uses_in_process_backend() {
    let config = gw_storage::PersistenceConfig::default();
    let stores = gw_storage::connect(&config).await.unwrap();

    let worker = gw_core::WorkerInfo::new(WorkerId::new("w1"), "http://worker", 1);
    stores.workers.upsert(&worker).await.unwrap();
    assert_eq!(stores.workers.list().await.unwrap().len(), 1);

    let job = job(0, 1.0);
    stores.pending_queue.enqueue(&job).await.unwrap();
    assert_eq!(stores.pending_queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn removing_a_worker_leaves_its_history_and_mappings_intact() {
    let workers = MemoryWorkerStore::default();
    let mappings = MemoryMappingStore::default();
    let history = MemoryHistoryStore::default();

    let worker = gw_core::WorkerInfo::new(WorkerId::new("w1"), "http://worker", 1);
    workers.upsert(&worker).await.unwrap();

    let prompt_id = PromptId::generate();
    mappings.set_prompt_worker(&prompt_id, &worker.worker_id).await.unwrap();
    let mut record = TaskRecord::new(TaskId::from_prompt_id(&prompt_id), 0, 0);
    record.mark_submitted(prompt_id.clone(), worker.worker_id.clone(), 1);
    history.upsert(&record).await.unwrap();

    assert!(workers.remove(&worker.worker_id).await.unwrap());
    assert_eq!(workers.get(&worker.worker_id).await.unwrap(), None);

    assert_eq!(mappings.get_prompt_worker(&prompt_id).await.unwrap(), Some(worker.worker_id.clone()));
    assert!(history.get_by_prompt_id(&prompt_id).await.unwrap().is_some());
}
