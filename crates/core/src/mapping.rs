//! Identity-mapping domain types.

use crate::ids::{GatewayJobId, PromptId, WorkerId};
use serde::{Deserialize, Serialize};

/// `gateway_job_id -> (prompt_id, worker_id)`, established once a
/// priority-queued job is successfully submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayJobMapping {
    pub gateway_job_id: GatewayJobId,
    pub prompt_id: PromptId,
    pub worker_id: WorkerId,
}
