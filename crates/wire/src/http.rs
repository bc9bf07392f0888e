//! HTTP wire shapes exchanged with a worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body posted to a worker's submission endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequest {
    pub prompt: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Successful worker response to a submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: u64,
}

/// A worker's queue snapshot. Queue items may be a bare scalar or an
/// array/tuple; see [`extract_prompt_id`] for why this type stays
/// `Value`-typed rather than a fixed tuple shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Value>,
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

/// Count of running/pending entries; the items themselves are opaque.
pub fn parse_queue_counts(snapshot: &QueueSnapshot) -> (usize, usize) {
    (snapshot.queue_running.len(), snapshot.queue_pending.len())
}

/// Extract a `prompt_id` from one queue-item entry, whatever shape it
/// takes. The owning system's true tuple position of `prompt_id` is
/// unspecified and inconsistent across call sites, so this scans every
/// scalar slot of the entry for the one that parses as a UUID rather
/// than trusting a fixed index.
pub fn extract_prompt_id(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => looks_like_uuid(s).then(|| s.clone()),
        Value::Array(entries) => {
            entries.iter().find_map(|entry| entry.as_str().filter(|s| looks_like_uuid(s)).map(String::from))
        }
        _ => None,
    }
}

fn looks_like_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
}

/// Query parameters accepted by the proxying `view` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewQuery {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default = "default_view_type")]
    #[serde(rename = "type")]
    pub kind: String,
}

fn default_view_type() -> String {
    "output".to_string()
}

/// Body returned by a worker's `/history/{prompt_id}` endpoint; treated
/// as opaque JSON except for the presence check callers need.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct HistoryBody(pub Value);

impl HistoryBody {
    pub fn contains_prompt(&self, prompt_id: &str) -> bool {
        self.0.get(prompt_id).is_some()
    }

    pub fn outputs_for(&self, prompt_id: &str) -> Option<&Value> {
        self.0.get(prompt_id)?.get("outputs")
    }
}
