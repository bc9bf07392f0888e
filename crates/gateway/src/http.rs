//! HTTP surface: the thin external-interface layer external collaborators
//! address the core through. Everything here is a translation to/from
//! JSON; all real behavior lives in the services in `state::AppState`.

use crate::auth::auth_middleware;
use crate::registry::WorkerUpdate;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use gw_core::{ClientId, Credentials, GatewayError, GatewayJobId, GlobalWorkerAuthView, PromptId, QueuedJob, TaskId, TaskStatus, WorkerId, WorkerInfo};
use gw_storage::{MappingStore, PendingQueueStore};
use gw_wire::{parse_queue_counts, ViewQuery};
use gw_worker_client::WorkerClient;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/prompt", post(submit))
        .route("/api/status/:prompt_id", get(status))
        .route("/api/gateway_status/:gateway_job_id", get(gateway_status))
        .route("/api/view", get(view))
        .route("/api/queue", get(queue_view))
        .route("/api/workers", get(list_workers).post(register_worker))
        .route("/api/workers/:worker_id", patch(update_worker).delete(delete_worker))
        .route("/api/workers/:worker_id/health", post(manual_health))
        .route("/api/settings", get(get_settings).post(set_settings))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:task_id", get(get_task))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(api)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

fn error_response(err: GatewayError) -> Response {
    let (status, message) = match &err {
        GatewayError::Transport(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
        GatewayError::Protocol(m) => (StatusCode::BAD_GATEWAY, m.clone()),
        GatewayError::NoCapacity => (StatusCode::SERVICE_UNAVAILABLE, "no healthy worker available".to_string()),
        GatewayError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
        GatewayError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
    };
    (status, Json(json!({"error": message}))).into_response()
}

fn store_error(e: impl std::fmt::Display) -> Response {
    error_response(GatewayError::transport(e.to_string()))
}

fn worker_view(info: &WorkerInfo, now: i64, cache_ttl_secs: i64) -> Value {
    json!({
        "worker_id": info.worker_id.as_str(),
        "base_url": info.base_url,
        "display_name": info.display_name,
        "weight": info.weight,
        "enabled": info.enabled,
        "queue_running": info.queue_running,
        "queue_pending": info.queue_pending,
        "healthy": info.healthy,
        "cache_fresh": info.cache_valid(now, cache_ttl_secs),
        "has_credentials": info.credentials.is_some(),
    })
}

// --- submission ---

#[derive(Deserialize)]
struct SubmitBody {
    prompt: Value,
    client_id: Option<String>,
    priority: Option<i64>,
}

async fn submit(State(state): State<AppState>, Json(body): Json<SubmitBody>) -> Response {
    match body.priority {
        Some(priority) => submit_priority(state, body, priority).await,
        None => submit_direct(state, body).await,
    }
}

async fn submit_priority(state: AppState, body: SubmitBody, priority: i64) -> Response {
    let client_id = ClientId::new(body.client_id.unwrap_or_default());
    let job = QueuedJob::new(body.prompt, client_id, priority, state.clock.now_secs() as f64);
    let task_id = TaskId::from_gateway_job_id(&job.gateway_job_id);
    if let Err(e) = state.history.create(task_id.clone(), priority).await {
        return store_error(e);
    }
    if let Err(e) = state.pending_queue.enqueue(&job).await {
        return store_error(e);
    }
    let _ = state.history.mark_queued(&task_id).await;
    Json(json!({"gateway_job_id": job.gateway_job_id.as_str(), "status": "queued"})).into_response()
}

async fn submit_direct(state: AppState, body: SubmitBody) -> Response {
    let worker = match state.selector.select().await {
        Ok(Some(w)) => w,
        Ok(None) => return error_response(GatewayError::NoCapacity),
        Err(e) => return error_response(e),
    };
    let global_auth = state.settings.global_worker_auth().await.unwrap_or(None);
    let client = WorkerClient::new(worker.base_url.clone(), worker.auth(global_auth.as_ref()).cloned(), state.config.worker_request_timeout);
    let (resp_body, status) = client.post_prompt(body.prompt, body.client_id).await;
    if !(200..300).contains(&status) {
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        return (code, Json(resp_body.unwrap_or_else(|| json!({})))).into_response();
    }
    let Some(prompt_id) = resp_body.as_ref().and_then(|b| b.get("prompt_id")).and_then(|v| v.as_str()).map(PromptId::new) else {
        return error_response(GatewayError::protocol("worker response missing prompt_id"));
    };
    let _ = state.mappings.set_prompt_worker(&prompt_id, &worker.worker_id).await;
    let _ = state.registry.bump_running(&worker.worker_id).await;
    let _ = state.history.upsert_by_prompt_id(prompt_id, worker.worker_id, 0).await;
    Json(resp_body.unwrap_or_else(|| json!({}))).into_response()
}

// --- status ---

async fn status(State(state): State<AppState>, Path(prompt_id): Path<String>) -> Response {
    let prompt_id = PromptId::new(prompt_id);
    let Ok(Some(mut record)) = state.history.get_by_prompt_id(&prompt_id).await else {
        return Json(json!({"status": "unknown"})).into_response();
    };
    if !record.status.is_terminal() {
        state.history.reconcile(record.clone()).await;
        if let Ok(Some(fresh)) = state.history.get_by_prompt_id(&prompt_id).await {
            record = fresh;
        }
    }
    Json(json!({
        "status": record.status.to_string(),
        "worker_id": record.worker_id.map(|w| w.as_str().to_string()),
        "progress": record.progress,
    }))
    .into_response()
}

async fn gateway_status(State(state): State<AppState>, Path(gateway_job_id): Path<String>) -> Response {
    let id = GatewayJobId::new(gateway_job_id);
    if matches!(state.pending_queue.peek(&id).await, Ok(Some(_))) {
        return Json(json!({"status": "queued"})).into_response();
    }
    match state.mappings.get_gateway_job(&id).await {
        Ok(Some(mapping)) => {
            let task_id = TaskId::from_gateway_job_id(&id);
            let status = match state.history.get_by_task_id(&task_id).await {
                Ok(Some(record)) => record.status.to_string(),
                _ => "unknown".to_string(),
            };
            Json(json!({"status": status, "prompt_id": mapping.prompt_id.as_str()})).into_response()
        }
        _ => Json(json!({"status": "unknown"})).into_response(),
    }
}

// --- view proxy ---

#[derive(Deserialize)]
struct GatewayViewQuery {
    prompt_id: String,
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

async fn view(State(state): State<AppState>, Query(q): Query<GatewayViewQuery>) -> Response {
    let prompt_id = PromptId::new(q.prompt_id.clone());
    let Ok(Some(worker_id)) = state.mappings.get_prompt_worker(&prompt_id).await else {
        return error_response(GatewayError::not_found(format!("unknown prompt_id {}", q.prompt_id)));
    };
    let Ok(Some(worker)) = state.registry.get(&worker_id).await else {
        return error_response(GatewayError::not_found(format!("unknown worker {worker_id}")));
    };
    let global_auth = state.settings.global_worker_auth().await.unwrap_or(None);
    let client = WorkerClient::new(worker.base_url.clone(), worker.auth(global_auth.as_ref()).cloned(), state.config.worker_request_timeout);
    let view_query = ViewQuery { filename: q.filename, subfolder: q.subfolder, kind: q.kind };
    match client.proxy_view(&view_query).await {
        Ok(resp) => stream_proxy_response(resp),
        Err(e) => error_response(e),
    }
}

fn stream_proxy_response(resp: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::OK);
    let content_type = resp.headers().get(reqwest::header::CONTENT_TYPE).cloned();
    let content_disposition = resp.headers().get(reqwest::header::CONTENT_DISPOSITION).cloned();
    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(axum::http::header::CONTENT_TYPE, ct);
    }
    if let Some(cd) = content_disposition {
        builder = builder.header(axum::http::header::CONTENT_DISPOSITION, cd);
    }
    builder.body(Body::from_stream(resp.bytes_stream())).unwrap_or_else(|_| Response::new(Body::empty()))
}

// --- aggregated queue view ---

async fn queue_view(State(state): State<AppState>) -> Response {
    let workers: Vec<WorkerInfo> = state.registry.list().await.unwrap_or_default().into_iter().filter(|w| w.enabled).collect();
    let global_auth = state.settings.global_worker_auth().await.unwrap_or(None);
    let probes = workers.iter().map(|w| {
        let client = WorkerClient::new(w.base_url.clone(), w.auth(global_auth.as_ref()).cloned(), state.config.worker_request_timeout);
        async move { client.fetch_queue().await }
    });
    let snapshots = futures_util::future::join_all(probes).await;

    let mut per_worker = serde_json::Map::new();
    let mut running = Vec::new();
    let mut pending = Vec::new();
    for (worker, snapshot) in workers.iter().zip(snapshots) {
        match snapshot {
            Some(snap) => {
                let (running_count, pending_count) = parse_queue_counts(&snap);
                per_worker.insert(worker.worker_id.to_string(), json!({"running": running_count, "pending": pending_count, "healthy": true}));
                for (position, item) in snap.queue_running.iter().enumerate() {
                    running.push(json!({"worker_id": worker.worker_id.as_str(), "position": position, "item": item}));
                }
                for (position, item) in snap.queue_pending.iter().enumerate() {
                    pending.push(json!({"worker_id": worker.worker_id.as_str(), "position": position, "item": item}));
                }
            }
            None => {
                per_worker.insert(worker.worker_id.to_string(), json!({"running": 0, "pending": 0, "healthy": false}));
            }
        }
    }
    Json(json!({"workers": per_worker, "running": running, "pending": pending})).into_response()
}

// --- worker CRUD ---

#[derive(Deserialize)]
struct RegisterWorkerBody {
    base_url: String,
    display_name: Option<String>,
    #[serde(default = "default_weight")]
    weight: u32,
    username: Option<String>,
    password: Option<String>,
    #[serde(default)]
    skip_health: bool,
}

fn default_weight() -> u32 {
    1
}

async fn register_worker(State(state): State<AppState>, Json(body): Json<RegisterWorkerBody>) -> Response {
    let credentials = match (body.username, body.password) {
        (Some(u), Some(p)) => Some(Credentials::new(u, p)),
        _ => None,
    };
    if !body.skip_health {
        let probe = WorkerClient::new(body.base_url.clone(), credentials.clone(), state.config.worker_request_timeout);
        let (ok, detail) = probe.health_probe().await;
        if !ok {
            return error_response(GatewayError::transport(format!("registration refused: health probe failed ({detail})")));
        }
    }
    match state.registry.add(body.base_url, body.display_name, body.weight, credentials).await {
        Ok(info) => {
            let now = state.clock.now_secs();
            Json(worker_view(&info, now, state.config.queue_cache_ttl.as_secs() as i64)).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn list_workers(State(state): State<AppState>) -> Response {
    match state.registry.list().await {
        Ok(workers) => {
            let now = state.clock.now_secs();
            let ttl = state.config.queue_cache_ttl.as_secs() as i64;
            Json(json!({"workers": workers.iter().map(|w| worker_view(w, now, ttl)).collect::<Vec<_>>()})).into_response()
        }
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize, Default)]
struct UpdateWorkerBody {
    display_name: Option<String>,
    weight: Option<u32>,
    enabled: Option<bool>,
    username: Option<String>,
    password: Option<String>,
}

async fn update_worker(State(state): State<AppState>, Path(worker_id): Path<String>, Json(body): Json<UpdateWorkerBody>) -> Response {
    let id = WorkerId::new(worker_id);
    let credentials = match (&body.username, &body.password) {
        (Some(u), Some(p)) => Some(Some(Credentials::new(u.clone(), p.clone()))),
        _ => None,
    };
    let fields = WorkerUpdate { display_name: body.display_name, weight: body.weight, enabled: body.enabled, credentials };
    match state.registry.update(&id, fields).await {
        Ok(Some(info)) => {
            let now = state.clock.now_secs();
            Json(worker_view(&info, now, state.config.queue_cache_ttl.as_secs() as i64)).into_response()
        }
        Ok(None) => error_response(GatewayError::not_found(format!("unknown worker {id}"))),
        Err(e) => store_error(e),
    }
}

async fn delete_worker(State(state): State<AppState>, Path(worker_id): Path<String>) -> Response {
    let id = WorkerId::new(worker_id);
    match state.registry.remove(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(GatewayError::not_found(format!("unknown worker {id}"))),
        Err(e) => store_error(e),
    }
}

async fn manual_health(State(state): State<AppState>, Path(worker_id): Path<String>) -> Response {
    let id = WorkerId::new(worker_id);
    let Ok(Some(worker)) = state.registry.get(&id).await else {
        return error_response(GatewayError::not_found(format!("unknown worker {id}")));
    };
    let global_auth = state.settings.global_worker_auth().await.unwrap_or(None);
    let client = WorkerClient::new(worker.base_url.clone(), worker.auth(global_auth.as_ref()).cloned(), state.config.worker_request_timeout);
    let (ok, detail) = client.health_probe().await;
    let _ = state.registry.update_load(&id, worker.queue_running, worker.queue_pending, ok).await;
    Json(json!({"healthy": ok, "detail": detail})).into_response()
}

// --- settings ---

async fn get_settings(State(state): State<AppState>) -> Response {
    match state.settings.get().await {
        Ok(settings) => Json(json!({"global_worker_auth": GlobalWorkerAuthView::from(settings.global_worker_auth.as_ref())})).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
struct SetSettingsBody {
    username: Option<String>,
    password: Option<String>,
}

async fn set_settings(State(state): State<AppState>, Json(body): Json<SetSettingsBody>) -> Response {
    let mut settings = state.settings.get().await.unwrap_or_default();
    settings.global_worker_auth = match (body.username, body.password) {
        (Some(u), Some(p)) => Some(Credentials::new(u, p)),
        _ => None,
    };
    match state.settings.set(settings.clone()).await {
        Ok(()) => Json(json!({"global_worker_auth": GlobalWorkerAuthView::from(settings.global_worker_auth.as_ref())})).into_response(),
        Err(e) => store_error(e),
    }
}

// --- task history ---

#[derive(Deserialize)]
struct ListTasksQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    worker_id: Option<String>,
    status: Option<String>,
}

fn default_limit() -> usize {
    100
}

fn parse_status(s: &str) -> Option<TaskStatus> {
    match s {
        "pending" => Some(TaskStatus::Pending),
        "queued" => Some(TaskStatus::Queued),
        "submitted" => Some(TaskStatus::Submitted),
        "running" => Some(TaskStatus::Running),
        "done" => Some(TaskStatus::Done),
        "failed" => Some(TaskStatus::Failed),
        _ => None,
    }
}

async fn list_tasks(State(state): State<AppState>, Query(q): Query<ListTasksQuery>) -> Response {
    let worker_id = q.worker_id.map(WorkerId::new);
    let status = q.status.as_deref().and_then(parse_status);
    match state.history.list(q.limit, q.offset, worker_id.as_ref(), status, state.config.dispatcher_batch_size).await {
        Ok(tasks) => Json(json!({"tasks": tasks, "limit": q.limit, "offset": q.offset})).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.history.get_by_task_id(&TaskId::new(task_id.clone())).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(GatewayError::not_found(format!("unknown task {task_id}"))),
        Err(e) => store_error(e),
    }
}

// --- process health ---

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> StatusCode {
    match state.registry.list().await {
        Ok(workers) if workers.iter().any(|w| w.enabled && w.healthy) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}
