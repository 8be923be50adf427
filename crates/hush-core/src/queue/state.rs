//! Task state machine for the queue.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Running -> Succeeded
/// - Pending -> Running -> RetryScheduled -> Running (loop until the retry budget is spent)
/// - Pending -> Running -> Failed
///
/// Terminal tasks are removed from their queue right away; the terminal
/// states only show up in event snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its turn at the head of the queue.
    #[default]
    Pending,

    /// Currently being executed.
    Running,

    /// Waiting out a backoff delay before the next attempt.
    RetryScheduled,

    /// Successfully completed.
    Succeeded,

    /// Failed permanently (retry budget spent, or the failure did not match).
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Is a drain loop currently working on the task?
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskState::Running | TaskState::RetryScheduled)
    }
}
