//! Progress monitor: one persistent WebSocket per enabled+healthy worker,
//! folding push events into task history.

use crate::history::HistoryService;
use crate::registry::WorkerRegistry;
use crate::settings::SettingsService;
use futures_util::StreamExt;
use gw_core::{TaskStatus, WorkerId};
use gw_wire::{parse_ws_message, WsMessage};
use gw_worker_client::WorkerClient;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

pub struct ProgressMonitor {
    history: Arc<HistoryService>,
    /// `prompt_id -> last observed percent`, read by `get_task_progress`.
    active_tasks: tokio::sync::RwLock<HashMap<String, u8>>,
    /// `worker_id -> prompt_id currently executing`, used to attribute
    /// `executing`/`execution_error` events that omit a `prompt_id`.
    worker_current_task: tokio::sync::RwLock<HashMap<WorkerId, String>>,
    connected: tokio::sync::RwLock<HashSet<WorkerId>>,
    worker_timeout: Duration,
}

impl ProgressMonitor {
    pub fn new(history: Arc<HistoryService>, worker_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            history,
            active_tasks: tokio::sync::RwLock::new(HashMap::new()),
            worker_current_task: tokio::sync::RwLock::new(HashMap::new()),
            connected: tokio::sync::RwLock::new(HashSet::new()),
            worker_timeout,
        })
    }

    /// Last cached progress percent for a prompt, if the monitor has
    /// observed one.
    pub async fn get_task_progress(&self, prompt_id: &str) -> Option<u8> {
        self.active_tasks.read().await.get(prompt_id).copied()
    }

    /// Wakes every `interval` and opens a read loop for any worker that
    /// is enabled, healthy, and lacks an open socket.
    pub fn spawn_reconnect_supervisor(
        self: Arc<Self>,
        registry: Arc<WorkerRegistry>,
        settings: Arc<SettingsService>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.reconnect_missing(&registry, &settings).await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    async fn reconnect_missing(self: &Arc<Self>, registry: &Arc<WorkerRegistry>, settings: &Arc<SettingsService>) {
        let Ok(workers) = registry.list().await else { return };
        let global_auth = settings.global_worker_auth().await.unwrap_or(None);
        for worker in workers.into_iter().filter(|w| w.enabled && w.healthy) {
            if self.connected.read().await.contains(&worker.worker_id) {
                continue;
            }
            let monitor = self.clone();
            let auth = worker.auth(global_auth.as_ref()).cloned();
            let base_url = worker.base_url.clone();
            let worker_id = worker.worker_id.clone();
            tokio::spawn(async move { monitor.run_worker_loop(worker_id, base_url, auth).await });
        }
    }

    async fn run_worker_loop(self: Arc<Self>, worker_id: WorkerId, base_url: String, auth: Option<gw_core::worker::Credentials>) {
        let client = WorkerClient::new(base_url, auth, self.worker_timeout);
        let mut ws = match client.open_ws().await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "progress monitor: failed to open worker socket");
                return;
            }
        };
        self.connected.write().await.insert(worker_id.clone());
        debug!(worker_id = %worker_id, "progress monitor: connected");

        while let Some(frame) = ws.next().await {
            let text = match frame {
                Ok(Message::Text(t)) => t,
                Ok(_) => continue,
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "progress monitor: socket error");
                    break;
                }
            };
            let Some(message) = parse_ws_message(&text) else { continue };
            self.handle_message(&worker_id, message).await;
        }

        self.connected.write().await.remove(&worker_id);
        debug!(worker_id = %worker_id, "progress monitor: disconnected");
    }

    async fn handle_message(&self, worker_id: &WorkerId, message: WsMessage) {
        match message {
            WsMessage::ExecutionStart { prompt_id } => {
                self.active_tasks.write().await.insert(prompt_id.clone(), 0);
                self.worker_current_task.write().await.insert(worker_id.clone(), prompt_id.clone());
                let _ = self
                    .history
                    .sync(gw_core::PromptId::new(prompt_id), TaskStatus::Running, Some(0), Some(worker_id.clone()), None, None)
                    .await;
            }
            WsMessage::Progress { value, max } => {
                let pct = WsMessage::progress_percent(value, max);
                let current = self.worker_current_task.read().await.get(worker_id).cloned();
                if let Some(prompt_id) = current {
                    self.active_tasks.write().await.insert(prompt_id.clone(), pct);
                    let _ = self
                        .history
                        .sync(gw_core::PromptId::new(prompt_id), TaskStatus::Running, Some(pct), None, None, None)
                        .await;
                }
            }
            WsMessage::ExecutionError { prompt_id, exception_message } => {
                let prompt_id = match prompt_id {
                    Some(p) => Some(p),
                    None => self.worker_current_task.read().await.get(worker_id).cloned(),
                };
                if let Some(prompt_id) = prompt_id {
                    let _ = self
                        .history
                        .sync(gw_core::PromptId::new(prompt_id.clone()), TaskStatus::Failed, None, Some(worker_id.clone()), Some(exception_message), None)
                        .await;
                    self.active_tasks.write().await.remove(&prompt_id);
                }
                self.worker_current_task.write().await.remove(worker_id);
            }
            WsMessage::Executing { node: None } => {
                if let Some(prompt_id) = self.worker_current_task.write().await.remove(worker_id) {
                    self.active_tasks.write().await.remove(&prompt_id);
                }
            }
            // `executing{node}` with a node present, `executed`,
            // `execution_cached`, `status`, and unrecognised types are
            // informational only.
            WsMessage::Executing { node: Some(_) } | WsMessage::Executed { .. } | WsMessage::ExecutionCached { .. } | WsMessage::Status | WsMessage::Unknown => {}
        }
    }
}
