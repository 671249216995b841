//! Preload task bookkeeping

use crate::types::{now_millis, ResourceKey, ResourcePriority};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique preload task identifier
pub type TaskId = Uuid;

/// Lifecycle state of a preload task
///
/// Terminal states are `Completed`, `Failed`, and `Cancelled`; a task
/// reaches exactly one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a dispatch slot
    Queued,
    /// Download in flight
    Running,
    /// Prefix fully cached
    Completed,
    /// Terminal failure with its reason
    Failed(String),
    /// Cancelled by the caller or the scheduler
    Cancelled,
    /// Parked; resume returns it to the queue
    Paused,
}

impl TaskState {
    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed(_) | TaskState::Cancelled
        )
    }
}

/// One preload request: pull a prefix of a resource before playback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadTask {
    /// Unique task id
    pub id: TaskId,

    /// Origin URL
    pub url: String,

    /// Resource key for the URL
    pub key: ResourceKey,

    /// Bytes to prefetch from offset 0; `None` means the entire resource
    pub length: Option<i64>,

    /// Dispatch and eviction priority
    pub priority: ResourcePriority,

    /// Enqueue time, unix millis
    pub created_at: i64,

    /// Dispatch time, unix millis
    pub started_at: Option<i64>,

    /// Terminal-transition time, unix millis
    pub ended_at: Option<i64>,

    /// Current lifecycle state
    pub state: TaskState,

    /// Retries consumed so far
    pub retry_count: u32,

    /// Per-task timeout in seconds
    pub timeout_seconds: u64,
}

impl PreloadTask {
    /// New queued task
    pub fn new(
        url: String,
        key: ResourceKey,
        length: Option<i64>,
        priority: ResourcePriority,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            key,
            length,
            priority,
            created_at: now_millis(),
            started_at: None,
            ended_at: None,
            state: TaskState::Queued,
            retry_count: 0,
            timeout_seconds,
        }
    }

    /// Milliseconds spent since enqueue
    pub fn age_millis(&self, now: i64) -> i64 {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::resource_key_for;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Failed("x".into()).is_terminal());
    }

    #[test]
    fn test_new_task_is_queued() {
        let url = "https://example.com/a.mp4";
        let task = PreloadTask::new(
            url.to_string(),
            resource_key_for(url),
            Some(1024),
            ResourcePriority::Normal,
            300,
        );
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_none());
        assert!(task.ended_at.is_none());
    }
}
