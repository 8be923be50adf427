//! Task record: the persisted unit of work plus its runtime state.

use serde::{Deserialize, Serialize};

use super::{RetryPolicy, TaskState};
use crate::domain::{Behavior, MethodDescriptor, TaskId};
use crate::vdata::ProducedVData;

fn enabled() -> bool {
    true
}

/// A task in a queue.
///
/// Design:
/// - Only the pending-work definition is persisted; runtime fields are skipped
///   and come back with their defaults after a reload.
/// - All state transitions happen here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub queue_name: String,

    /// Dehydrated method; may carry placeholder tokens.
    pub method: MethodDescriptor,

    pub behavior: Behavior,
    pub retry: RetryPolicy,

    /// Placeholders this task resolves on success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produced: Vec<ProducedVData>,

    #[serde(skip)]
    pub state: TaskState,

    /// Retries already performed.
    #[serde(skip)]
    pub retry_times: u32,

    /// False once a before-push listener vetoed the task.
    #[serde(skip, default = "enabled")]
    pub active: bool,

    #[serde(skip, default = "enabled")]
    pub persist: bool,

    #[serde(skip)]
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        queue_name: impl Into<String>,
        method: MethodDescriptor,
        behavior: Behavior,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id,
            queue_name: queue_name.into(),
            method,
            behavior,
            retry,
            produced: Vec::new(),
            state: TaskState::Pending,
            retry_times: 0,
            active: true,
            persist: true,
            last_error: None,
        }
    }

    pub fn with_produced(mut self, produced: Vec<ProducedVData>) -> Self {
        self.produced = produced;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Method name used by task lookups.
    pub fn name(&self) -> Option<&str> {
        self.method.name.as_deref()
    }

    /// Persisted if active and not opted out.
    pub fn is_persistable(&self) -> bool {
        self.active && self.persist
    }

    /// Mark as running.
    pub fn start_attempt(&mut self) {
        self.state = TaskState::Running;
    }

    /// Count one more retry and wait for it.
    pub fn schedule_retry(&mut self, error: String) {
        self.state = TaskState::RetryScheduled;
        self.retry_times += 1;
        self.last_error = Some(error);
    }

    pub fn mark_succeeded(&mut self) {
        self.state = TaskState::Succeeded;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = TaskState::Failed;
        self.last_error = Some(error);
    }

    /// Vetoed before entering the queue: kept, never run, never persisted.
    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            "default",
            MethodDescriptor::post("/todo", json!({"title": "a"})),
            Behavior::Silent,
            RetryPolicy::default(),
        )
    }

    #[test]
    fn transitions() {
        let mut r = record();
        assert_eq!(r.state, TaskState::Pending);

        r.start_attempt();
        assert_eq!(r.state, TaskState::Running);

        r.schedule_retry("boom".into());
        assert_eq!(r.state, TaskState::RetryScheduled);
        assert_eq!(r.retry_times, 1);

        r.start_attempt();
        r.mark_failed("boom again".into());
        assert!(r.state.is_terminal());
        assert_eq!(r.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn runtime_fields_are_not_persisted() {
        let mut r = record().with_persist(false);
        r.start_attempt();
        r.schedule_retry("x".into());
        r.deactivate();

        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("state").is_none());
        assert!(json.get("retry_times").is_none());
        assert!(json.get("active").is_none());

        let back: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, r.id);
        assert_eq!(back.method, r.method);
        assert_eq!(back.state, TaskState::Pending);
        assert_eq!(back.retry_times, 0);
        assert!(back.active);
        assert!(back.persist);
    }

    #[test]
    fn vetoed_records_are_not_persistable() {
        let mut r = record();
        assert!(r.is_persistable());
        r.deactivate();
        assert!(!r.is_persistable());
        assert!(!record().with_persist(false).is_persistable());
    }
}
