//! Worker registry domain types.

use crate::ids::WorkerId;
use serde::{Deserialize, Serialize};

/// Basic-auth credential pair used when calling a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

/// Canonical record for one registered worker.
///
/// `worker_id` uniquely identifies a `base_url`. Removing a worker purges
/// this record but leaves historical mappings in [`crate::mapping`] intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub base_url: String,
    pub display_name: String,
    /// Positive selection tiebreaker; higher wins ties.
    pub weight: u32,
    pub enabled: bool,
    pub credentials: Option<Credentials>,
    /// Cached load, refreshed by the selector/prober; stale beyond `cache_ts + TTL`.
    pub queue_running: u32,
    pub queue_pending: u32,
    pub healthy: bool,
    /// Unix seconds at which `queue_running`/`queue_pending`/`healthy` were last refreshed.
    pub cache_timestamp: i64,
}

impl WorkerInfo {
    pub fn new(worker_id: WorkerId, base_url: impl Into<String>, weight: u32) -> Self {
        let base_url = base_url.into();
        Self {
            display_name: base_url.clone(),
            worker_id,
            base_url,
            weight,
            enabled: true,
            credentials: None,
            queue_running: 0,
            queue_pending: 0,
            healthy: true,
            cache_timestamp: 0,
        }
    }

    /// `running + pending` at the moment of the last probe.
    pub fn load_score(&self) -> u32 {
        self.queue_running + self.queue_pending
    }

    /// Whether the cached load is still within `ttl_seconds` of `now`. The
    /// selector never consults this — it always re-probes at dispatch
    /// time — but it's how API consumers (the worker listing) judge
    /// whether the displayed queue/health numbers are fresh.
    pub fn cache_valid(&self, now: i64, ttl_seconds: i64) -> bool {
        now.saturating_sub(self.cache_timestamp) <= ttl_seconds
    }

    /// Per-worker credentials, falling back to the process-global pair.
    pub fn auth<'a>(&'a self, global: Option<&'a Credentials>) -> Option<&'a Credentials> {
        self.credentials.as_ref().or(global)
    }

    pub fn is_idle(&self) -> bool {
        self.queue_running == 0
    }
}

/// Strip a trailing slash, as the registry does on every `add`.
pub fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
