//! Gateway daemon entry point: wires persistence, the service layer, and
//! the HTTP surface together, then runs until killed.

mod auth;
mod config;
mod dispatcher;
mod health;
mod history;
mod http;
mod progress;
mod registry;
mod selector;
mod settings;
mod state;

use auth::NoopAuth;
use config::Config;
use dispatcher::Dispatcher;
use gw_core::clock::SystemClock;
use gw_storage::PersistenceConfig;
use health::HealthProber;
use history::HistoryService;
use progress::ProgressMonitor;
use registry::WorkerRegistry;
use selector::Selector;
use settings::SettingsService;
use state::AppState;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let config = Arc::new(Config::from_env());
    let clock = Arc::new(SystemClock);

    let stores = gw_storage::connect(&PersistenceConfig {
        database_url: config.database_url.clone(),
        cache_url: config.cache_url.clone(),
    })
    .await?;

    let workers: Arc<dyn gw_storage::WorkerStore> = Arc::from(stores.workers);
    let mappings: Arc<dyn gw_storage::MappingStore> = Arc::from(stores.mappings);
    let pending_queue: Arc<dyn gw_storage::PendingQueueStore> = Arc::from(stores.pending_queue);
    let history_store: Arc<dyn gw_storage::HistoryStore> = Arc::from(stores.history);
    let settings_store: Arc<dyn gw_storage::SettingsStore> = Arc::from(stores.settings);

    let registry = Arc::new(WorkerRegistry::new(workers, clock.clone()));
    let settings = Arc::new(SettingsService::new(settings_store));
    let selector = Arc::new(Selector::new(registry.clone(), settings.clone(), clock.clone(), config.worker_request_timeout));
    let history = Arc::new(HistoryService::new(
        history_store,
        registry.clone(),
        settings.clone(),
        clock.clone(),
        config.view_base.clone(),
        config.worker_request_timeout,
    ));
    let progress = ProgressMonitor::new(history.clone(), config.worker_request_timeout);

    let dispatcher = Arc::new(Dispatcher::new(
        pending_queue.clone(),
        mappings.clone(),
        selector.clone(),
        registry.clone(),
        settings.clone(),
        history.clone(),
        config.dispatcher_batch_size,
        config.dispatcher_tick,
        config.worker_request_timeout,
    ));
    let health_prober = Arc::new(HealthProber::new(registry.clone(), settings.clone(), config.health_prober_interval, config.worker_request_timeout));

    dispatcher.spawn();
    health_prober.spawn();
    progress.clone().spawn_reconnect_supervisor(registry.clone(), settings.clone(), config.ws_reconnect_interval);

    let state = AppState {
        config: config.clone(),
        registry,
        settings,
        selector,
        history,
        progress,
        mappings,
        pending_queue,
        clock,
        auth: Arc::new(NoopAuth),
    };

    let bind_addr = config.bind_addr.clone();
    info!(%bind_addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, http::router(state)).await?;
    Ok(())
}
