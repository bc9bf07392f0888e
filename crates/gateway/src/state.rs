//! Shared application state handed to every HTTP handler.

use crate::auth::AuthLayer;
use crate::config::Config;
use crate::history::HistoryService;
use crate::progress::ProgressMonitor;
use crate::registry::WorkerRegistry;
use crate::selector::Selector;
use crate::settings::SettingsService;
use gw_core::Clock;
use gw_storage::{MappingStore, PendingQueueStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<WorkerRegistry>,
    pub settings: Arc<SettingsService>,
    pub selector: Arc<Selector>,
    pub history: Arc<HistoryService>,
    pub progress: Arc<ProgressMonitor>,
    pub mappings: Arc<dyn MappingStore>,
    pub pending_queue: Arc<dyn PendingQueueStore>,
    pub clock: Arc<dyn Clock>,
    pub auth: Arc<dyn AuthLayer>,
}
