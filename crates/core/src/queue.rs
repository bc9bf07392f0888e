//! Priority admission queue domain type.

use crate::ids::{ClientId, GatewayJobId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A job waiting to be dispatched to a worker.
///
/// A job is in exactly one of: pending in queue, submitted with a
/// prompt_id, or removed. Ordering key across all pending jobs is
/// `(-priority, created_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub gateway_job_id: GatewayJobId,
    /// Opaque job graph; passed through byte-identical to the worker.
    pub prompt: Value,
    pub client_id: ClientId,
    /// Higher is more urgent.
    pub priority: i64,
    /// Monotonic-derived epoch seconds.
    pub created_at: f64,
}

impl QueuedJob {
    pub fn new(prompt: Value, client_id: ClientId, priority: i64, created_at: f64) -> Self {
        Self { gateway_job_id: GatewayJobId::generate(), prompt, client_id, priority, created_at }
    }

    /// Total ordering key: `(-priority, created_at)`. Two jobs with equal
    /// priority and timestamp break ties on `gateway_job_id` for
    /// determinism.
    pub fn sort_key(&self) -> (i64, OrderedF64, &str) {
        (-self.priority, OrderedF64(self.created_at), self.gateway_job_id.as_str())
    }
}

/// `f64` wrapper with a total order, for use as a sort key.
/// `created_at` values are always finite epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedF64(pub f64);

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sort a batch of jobs by the pop ordering contract: priority descending,
/// then `created_at` ascending, then `gateway_job_id` ascending.
pub fn sort_pending(jobs: &mut [QueuedJob]) {
    jobs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(priority: i64, created_at: f64, id: &str) -> QueuedJob {
        QueuedJob {
            gateway_job_id: GatewayJobId::new(id),
            prompt: json!({"node": 1}),
            client_id: ClientId::new("c1"),
            priority,
            created_at,
        }
    }

    #[test]
    fn sort_pending_orders_by_priority_desc_then_created_at_asc() {
        let mut jobs = vec![job(0, 1.0, "a"), job(10, 2.0, "b"), job(10, 3.0, "c")];
        sort_pending(&mut jobs);
        let ids: Vec<_> = jobs.iter().map(|j| j.gateway_job_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn equal_priority_and_timestamp_breaks_tie_on_id() {
        let mut jobs = vec![job(5, 1.0, "zzz"), job(5, 1.0, "aaa")];
        sort_pending(&mut jobs);
        let ids: Vec<_> = jobs.iter().map(|j| j.gateway_job_id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "zzz"]);
    }
}
