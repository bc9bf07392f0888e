//! Relational backend.
//!
//! Used whenever a relational database is configured. Schemas are
//! created on start-up with `CREATE TABLE IF NOT EXISTS`; the pending
//! queue's `pop_highest` is a `SELECT ... FOR UPDATE SKIP LOCKED` +
//! `DELETE` inside one transaction, giving an at-most-once-pop guarantee
//! even with multiple dispatcher replicas.

use crate::error::{StoreError, StoreResult};
use crate::ports::{HistoryStore, MappingStore, PendingQueueStore, SettingsStore, WorkerStore};
use async_trait::async_trait;
use gw_core::{
    Credentials, GatewayJobId, GatewayJobMapping, GlobalSettings, PromptId, QueuedJob, TaskId,
    TaskRecord, TaskStatus, WorkerId, WorkerInfo,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Shared pool, handed to each of the five port implementations below.
#[derive(Clone)]
pub struct PostgresStores {
    pool: PgPool,
}

impl PostgresStores {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        let stores = Self { pool };
        stores.migrate().await?;
        Ok(stores)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                name TEXT NOT NULL,
                weight INTEGER NOT NULL DEFAULT 1,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                auth_username TEXT,
                auth_password TEXT,
                queue_running INTEGER NOT NULL DEFAULT 0,
                queue_pending INTEGER NOT NULL DEFAULT 0,
                healthy BOOLEAN NOT NULL DEFAULT TRUE,
                cache_timestamp BIGINT NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS task_worker (
                prompt_id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS gateway_job (
                gateway_job_id TEXT PRIMARY KEY,
                prompt_id TEXT NOT NULL,
                worker_id TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pending_queue (
                gateway_job_id TEXT PRIMARY KEY,
                prompt JSONB NOT NULL,
                client_id TEXT NOT NULL,
                priority BIGINT NOT NULL,
                created_at DOUBLE PRECISION NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS pending_queue_order ON pending_queue (priority DESC, created_at ASC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS task_history (
                task_id TEXT PRIMARY KEY,
                prompt_id TEXT,
                worker_id TEXT,
                priority BIGINT NOT NULL,
                status TEXT NOT NULL,
                progress SMALLINT NOT NULL DEFAULT 0,
                error_message TEXT,
                submitted_at BIGINT NOT NULL,
                started_at BIGINT,
                completed_at BIGINT,
                result_blob JSONB
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS task_history_status ON task_history (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS task_history_worker ON task_history (worker_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS task_history_submitted ON task_history (submitted_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS settings (
                k TEXT PRIMARY KEY,
                v JSONB NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn workers(&self) -> PostgresWorkerStore {
        PostgresWorkerStore { pool: self.pool.clone() }
    }

    pub fn mappings(&self) -> PostgresMappingStore {
        PostgresMappingStore { pool: self.pool.clone() }
    }

    pub fn pending_queue(&self) -> PostgresPendingQueueStore {
        PostgresPendingQueueStore { pool: self.pool.clone() }
    }

    pub fn history(&self) -> PostgresHistoryStore {
        PostgresHistoryStore { pool: self.pool.clone() }
    }

    pub fn settings(&self) -> PostgresSettingsStore {
        PostgresSettingsStore { pool: self.pool.clone() }
    }
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> WorkerInfo {
    let username: Option<String> = row.get("auth_username");
    let password: Option<String> = row.get("auth_password");
    WorkerInfo {
        worker_id: WorkerId::new(row.get::<String, _>("worker_id")),
        base_url: row.get("url"),
        display_name: row.get("name"),
        weight: row.get::<i32, _>("weight") as u32,
        enabled: row.get("enabled"),
        credentials: username.zip(password).map(|(u, p)| Credentials::new(u, p)),
        queue_running: row.get::<i32, _>("queue_running") as u32,
        queue_pending: row.get::<i32, _>("queue_pending") as u32,
        healthy: row.get("healthy"),
        cache_timestamp: row.get("cache_timestamp"),
    }
}

pub struct PostgresWorkerStore {
    pool: PgPool,
}

#[async_trait]
impl WorkerStore for PostgresWorkerStore {
    async fn list(&self) -> StoreResult<Vec<WorkerInfo>> {
        let rows = sqlx::query("SELECT * FROM workers").fetch_all(&self.pool).await?;
        Ok(rows.iter().map(worker_from_row).collect())
    }

    async fn get(&self, id: &WorkerId) -> StoreResult<Option<WorkerInfo>> {
        let row = sqlx::query("SELECT * FROM workers WHERE worker_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(worker_from_row))
    }

    async fn upsert(&self, worker: &WorkerInfo) -> StoreResult<()> {
        let (username, password) = worker
            .credentials
            .as_ref()
            .map(|c| (Some(c.username.clone()), Some(c.password.clone())))
            .unwrap_or((None, None));
        sqlx::query(
            r#"INSERT INTO workers
                (worker_id, url, name, weight, enabled, auth_username, auth_password,
                 queue_running, queue_pending, healthy, cache_timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (worker_id) DO UPDATE SET
                 url = EXCLUDED.url,
                 name = EXCLUDED.name,
                 weight = EXCLUDED.weight,
                 enabled = EXCLUDED.enabled,
                 auth_username = EXCLUDED.auth_username,
                 auth_password = EXCLUDED.auth_password,
                 queue_running = EXCLUDED.queue_running,
                 queue_pending = EXCLUDED.queue_pending,
                 healthy = EXCLUDED.healthy,
                 cache_timestamp = EXCLUDED.cache_timestamp"#,
        )
        .bind(worker.worker_id.as_str())
        .bind(&worker.base_url)
        .bind(&worker.display_name)
        .bind(worker.weight as i32)
        .bind(worker.enabled)
        .bind(username)
        .bind(password)
        .bind(worker.queue_running as i32)
        .bind(worker.queue_pending as i32)
        .bind(worker.healthy)
        .bind(worker.cache_timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &WorkerId) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM workers WHERE worker_id = $1").bind(id.as_str()).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct PostgresMappingStore {
    pool: PgPool,
}

#[async_trait]
impl MappingStore for PostgresMappingStore {
    async fn set_prompt_worker(&self, prompt_id: &PromptId, worker_id: &WorkerId) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO task_worker (prompt_id, worker_id) VALUES ($1, $2)
               ON CONFLICT (prompt_id) DO UPDATE SET worker_id = EXCLUDED.worker_id"#,
        )
        .bind(prompt_id.as_str())
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_prompt_worker(&self, prompt_id: &PromptId) -> StoreResult<Option<WorkerId>> {
        let row = sqlx::query("SELECT worker_id FROM task_worker WHERE prompt_id = $1")
            .bind(prompt_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| WorkerId::new(r.get::<String, _>("worker_id"))))
    }

    async fn set_gateway_job(&self, mapping: &GatewayJobMapping) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO gateway_job (gateway_job_id, prompt_id, worker_id) VALUES ($1, $2, $3)
               ON CONFLICT (gateway_job_id) DO UPDATE SET prompt_id = EXCLUDED.prompt_id, worker_id = EXCLUDED.worker_id"#,
        )
        .bind(mapping.gateway_job_id.as_str())
        .bind(mapping.prompt_id.as_str())
        .bind(mapping.worker_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_gateway_job(&self, id: &GatewayJobId) -> StoreResult<Option<GatewayJobMapping>> {
        let row = sqlx::query("SELECT * FROM gateway_job WHERE gateway_job_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| GatewayJobMapping {
            gateway_job_id: GatewayJobId::new(r.get::<String, _>("gateway_job_id")),
            prompt_id: PromptId::new(r.get::<String, _>("prompt_id")),
            worker_id: WorkerId::new(r.get::<String, _>("worker_id")),
        }))
    }
}

pub struct PostgresPendingQueueStore {
    pool: PgPool,
}

fn queued_job_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<QueuedJob> {
    let prompt: serde_json::Value = row.get("prompt");
    Ok(QueuedJob {
        gateway_job_id: GatewayJobId::new(row.get::<String, _>("gateway_job_id")),
        prompt,
        client_id: gw_core::ClientId::new(row.get::<String, _>("client_id")),
        priority: row.get("priority"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl PendingQueueStore for PostgresPendingQueueStore {
    async fn enqueue(&self, job: &QueuedJob) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pending_queue (gateway_job_id, prompt, client_id, priority, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job.gateway_job_id.as_str())
        .bind(&job.prompt)
        .bind(job.client_id.as_str())
        .bind(job.priority)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pop_highest(&self) -> StoreResult<Option<QueuedJob>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT * FROM pending_queue ORDER BY priority DESC, created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let job = queued_job_from_row(&row)?;
        sqlx::query("DELETE FROM pending_queue WHERE gateway_job_id = $1")
            .bind(job.gateway_job_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn peek(&self, id: &GatewayJobId) -> StoreResult<Option<QueuedJob>> {
        let row = sqlx::query("SELECT * FROM pending_queue WHERE gateway_job_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(queued_job_from_row).transpose()
    }

    async fn remove(&self, id: &GatewayJobId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM pending_queue WHERE gateway_job_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn re_enqueue(&self, job: &QueuedJob) -> StoreResult<()> {
        self.enqueue(job).await
    }

    async fn len(&self) -> StoreResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_queue").fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("n") as usize)
    }
}

pub struct PostgresHistoryStore {
    pool: PgPool,
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Queued => "queued",
        TaskStatus::Submitted => "submitted",
        TaskStatus::Running => "running",
        TaskStatus::Done => "done",
        TaskStatus::Failed => "failed",
    }
}

fn task_status_from_str(s: &str) -> TaskStatus {
    match s {
        "pending" => TaskStatus::Pending,
        "queued" => TaskStatus::Queued,
        "submitted" => TaskStatus::Submitted,
        "running" => TaskStatus::Running,
        "done" => TaskStatus::Done,
        _ => TaskStatus::Failed,
    }
}

fn task_record_from_row(row: &sqlx::postgres::PgRow) -> TaskRecord {
    let prompt_id: Option<String> = row.get("prompt_id");
    let worker_id: Option<String> = row.get("worker_id");
    TaskRecord {
        task_id: TaskId::new(row.get::<String, _>("task_id")),
        prompt_id: prompt_id.map(PromptId::new),
        worker_id: worker_id.map(WorkerId::new),
        priority: row.get("priority"),
        status: task_status_from_str(row.get::<String, _>("status").as_str()),
        progress: row.get::<i16, _>("progress") as u8,
        error_message: row.get("error_message"),
        submitted_at: row.get("submitted_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        result_blob: row.get("result_blob"),
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn upsert(&self, record: &TaskRecord) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO task_history
                (task_id, prompt_id, worker_id, priority, status, progress, error_message,
                 submitted_at, started_at, completed_at, result_blob)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (task_id) DO UPDATE SET
                 prompt_id = EXCLUDED.prompt_id,
                 worker_id = EXCLUDED.worker_id,
                 status = EXCLUDED.status,
                 progress = EXCLUDED.progress,
                 error_message = EXCLUDED.error_message,
                 started_at = EXCLUDED.started_at,
                 completed_at = EXCLUDED.completed_at,
                 result_blob = EXCLUDED.result_blob"#,
        )
        .bind(record.task_id.as_str())
        .bind(record.prompt_id.as_ref().map(|p| p.as_str()))
        .bind(record.worker_id.as_ref().map(|w| w.as_str()))
        .bind(record.priority)
        .bind(task_status_str(record.status))
        .bind(record.progress as i16)
        .bind(&record.error_message)
        .bind(record.submitted_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.result_blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_task_id(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM task_history WHERE task_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_record_from_row))
    }

    async fn get_by_prompt_id(&self, id: &PromptId) -> StoreResult<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM task_history WHERE prompt_id = $1 ORDER BY submitted_at ASC LIMIT 1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_record_from_row))
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
        worker_id: Option<&WorkerId>,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"SELECT * FROM task_history
               WHERE ($1::TEXT IS NULL OR worker_id = $1)
                 AND ($2::TEXT IS NULL OR status = $2)
               ORDER BY submitted_at DESC
               LIMIT $3 OFFSET $4"#,
        )
        .bind(worker_id.map(|w| w.as_str()))
        .bind(status.map(task_status_str))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(task_record_from_row).collect())
    }
}

pub struct PostgresSettingsStore {
    pool: PgPool,
}

#[async_trait]
impl SettingsStore for PostgresSettingsStore {
    async fn get(&self) -> StoreResult<GlobalSettings> {
        let row = sqlx::query("SELECT v FROM settings WHERE k = 'global'")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: serde_json::Value = row.get("v");
                Ok(serde_json::from_value(value).map_err(StoreError::Serialization)?)
            }
            None => Ok(GlobalSettings::default()),
        }
    }

    async fn set(&self, settings: &GlobalSettings) -> StoreResult<()> {
        let value = serde_json::to_value(settings).map_err(StoreError::Serialization)?;
        sqlx::query(
            r#"INSERT INTO settings (k, v) VALUES ('global', $1)
               ON CONFLICT (k) DO UPDATE SET v = EXCLUDED.v"#,
        )
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
