//! Task-history domain types: the lifecycle state machine for one task.

use crate::ids::{PromptId, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a task. Statuses advance monotonically along any
/// valid path; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Submitted,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Rank along the canonical path `Pending -> Queued -> Submitted ->
    /// Running -> {Done, Failed}`, used to reject a regression.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Queued => 1,
            TaskStatus::Submitted => 2,
            TaskStatus::Running => 3,
            TaskStatus::Done | TaskStatus::Failed => 4,
        }
    }

    /// Whether transitioning from `self` to `next` is a forward (or
    /// no-op) move along the state machine. Terminal states never allow
    /// a further transition.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One row of the task-history timeline.
///
/// `task_id` equals `gateway_job_id` for priority-path tasks and
/// `prompt_id` for direct-path tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub prompt_id: Option<PromptId>,
    pub worker_id: Option<WorkerId>,
    pub priority: i64,
    pub status: TaskStatus,
    /// Clamped to `[0, 100]`, non-decreasing until terminal.
    pub progress: u8,
    pub error_message: Option<String>,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result_blob: Option<Value>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, priority: i64, now: i64) -> Self {
        Self {
            task_id,
            prompt_id: None,
            worker_id: None,
            priority,
            status: TaskStatus::Pending,
            progress: 0,
            error_message: None,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            result_blob: None,
        }
    }

    /// Apply a non-decreasing progress update. No-op if `self.status` is
    /// terminal or `value <= self.progress`.
    pub fn apply_progress(&mut self, value: u8) {
        if self.status.is_terminal() {
            return;
        }
        let clamped = value.min(100);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }

    pub fn mark_submitted(&mut self, prompt_id: PromptId, worker_id: WorkerId, now: i64) {
        if !self.status.can_advance_to(TaskStatus::Running) {
            return;
        }
        self.prompt_id = Some(prompt_id);
        self.worker_id = Some(worker_id);
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
    }

    pub fn mark_completed(&mut self, result_blob: Option<Value>, now: i64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Done;
        self.progress = 100;
        self.completed_at = Some(now);
        if result_blob.is_some() {
            self.result_blob = result_blob;
        }
    }

    pub fn mark_failed(&mut self, error_message: impl Into<String>, now: i64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(error_message.into());
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_non_decreasing() {
        let mut t = TaskRecord::new(TaskId::new("t1"), 0, 0);
        t.status = TaskStatus::Running;
        t.apply_progress(50);
        t.apply_progress(10);
        assert_eq!(t.progress, 50);
        t.apply_progress(80);
        assert_eq!(t.progress, 80);
    }

    #[test]
    fn terminal_absorbs_further_updates() {
        let mut t = TaskRecord::new(TaskId::new("t1"), 0, 0);
        t.status = TaskStatus::Running;
        t.mark_completed(None, 10);
        let before = t.clone();
        t.apply_progress(10);
        t.mark_failed("late error", 20);
        assert_eq!(t, before);
    }

    #[test]
    fn progress_clamps_to_100() {
        let mut t = TaskRecord::new(TaskId::new("t1"), 0, 0);
        t.status = TaskStatus::Running;
        t.apply_progress(255);
        assert_eq!(t.progress, 100);
    }

    #[test]
    fn mark_submitted_sets_running_and_mapping() {
        let mut t = TaskRecord::new(TaskId::new("t1"), 0, 0);
        t.mark_submitted(PromptId::new("p1"), WorkerId::new("w1"), 5);
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.started_at, Some(5));
        assert_eq!(t.prompt_id.unwrap().as_str(), "p1");
    }

    #[test]
    fn can_advance_to_rejects_regression() {
        assert!(!TaskStatus::Running.can_advance_to(TaskStatus::Queued));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_advance_to(TaskStatus::Running));
    }
}
