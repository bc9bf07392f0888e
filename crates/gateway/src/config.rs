//! Centralized environment variable access.

use std::time::Duration;

/// All process configuration, read once at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub cache_url: Option<String>,
    pub queue_cache_ttl: Duration,
    pub worker_request_timeout: Duration,
    pub dispatcher_tick: Duration,
    pub dispatcher_batch_size: usize,
    pub health_prober_interval: Duration,
    pub ws_reconnect_interval: Duration,
    pub view_base: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: bind_addr(),
            database_url: database_url(),
            cache_url: cache_url(),
            queue_cache_ttl: queue_cache_ttl(),
            worker_request_timeout: worker_request_timeout(),
            dispatcher_tick: dispatcher_tick(),
            dispatcher_batch_size: dispatcher_batch_size(),
            health_prober_interval: health_prober_interval(),
            ws_reconnect_interval: Duration::from_secs(30),
            view_base: view_base(),
        }
    }
}

/// Public base URL the gateway rewrites worker-hosted output URLs to.
fn view_base() -> String {
    std::env::var("GATEWAY_VIEW_BASE").unwrap_or_else(|_| "/api/view".to_string())
}

fn bind_addr() -> String {
    std::env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8188".to_string())
}

/// Relational connection string. Presence takes precedence over `cache_url`.
fn database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty())
}

fn cache_url() -> Option<String> {
    std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty())
}

/// Worker load-cache freshness window (default 5 s).
fn queue_cache_ttl() -> Duration {
    env_secs("QUEUE_CACHE_TTL_SECONDS", 5)
}

/// Uniform outbound timeout for submission/history calls (default 30 s).
fn worker_request_timeout() -> Duration {
    env_secs("WORKER_REQUEST_TIMEOUT_SECONDS", 30)
}

fn dispatcher_tick() -> Duration {
    std::env::var("DISPATCHER_TICK_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(750))
}

fn dispatcher_batch_size() -> usize {
    std::env::var("DISPATCHER_BATCH_SIZE").ok().and_then(|s| s.parse().ok()).unwrap_or(20)
}

fn health_prober_interval() -> Duration {
    env_secs("HEALTH_PROBER_INTERVAL_SECONDS", 30)
}

fn env_secs(key: &str, default: u64) -> Duration {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(Duration::from_secs(default))
}
