//! Lifecycle events.
//!
//! Hook-scoped events are delivered to listeners bound on one `SqHook`;
//! `FactoryEvent` is broadcast to everything subscribed on the factory.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{Behavior, MethodDescriptor, VDataId};
use crate::error::HushError;
use crate::queue::TaskRecord;
use crate::vdata::VValue;

/// Answer of a cancelable listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Proceed,
    Veto,
}

impl Verdict {
    pub fn is_veto(self) -> bool {
        matches!(self, Verdict::Veto)
    }
}

/// `false` vetoes, `true` proceeds.
impl From<bool> for Verdict {
    fn from(proceed: bool) -> Self {
        if proceed {
            Verdict::Proceed
        } else {
            Verdict::Veto
        }
    }
}

/// Listeners that return nothing never veto.
impl From<()> for Verdict {
    fn from(_: ()) -> Self {
        Verdict::Proceed
    }
}

/// Common part of every hook-scoped event.
#[derive(Debug, Clone)]
pub struct ScopedEvent {
    pub behavior: Behavior,
    pub method: MethodDescriptor,
    /// Absent for static submissions, which never create a task.
    pub task: Option<TaskRecord>,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct SuccessEvent {
    pub scope: ScopedEvent,
    /// The real response, or the virtual response for a silent submission.
    pub data: VValue,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub scope: ScopedEvent,
    pub error: HushError,
    /// Retries already performed before this failed attempt.
    pub retry_times: u32,
    pub will_retry: bool,
}

/// Terminal failure after the retry budget was spent (or the failure did not match).
#[derive(Debug, Clone)]
pub struct FallbackEvent {
    pub scope: ScopedEvent,
    pub error: HushError,
}

#[derive(Debug, Clone)]
pub struct CompleteEvent {
    pub scope: ScopedEvent,
    pub outcome: Result<VValue, HushError>,
}

impl CompleteEvent {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Factory-wide event, observed through `SilentFactory::subscribe`.
#[derive(Debug, Clone)]
pub enum FactoryEvent {
    Boot,

    BeforeSubmit {
        queue: String,
        task: TaskRecord,
    },

    Success {
        queue: String,
        task: TaskRecord,
        data: Value,
        /// Placeholders this task resolved, with their real values.
        resolved: BTreeMap<VDataId, Value>,
    },

    Error {
        queue: String,
        task: TaskRecord,
        error: HushError,
        retry_times: u32,
    },

    Fail {
        queue: String,
        task: TaskRecord,
        error: HushError,
    },

    Complete {
        queue: String,
        task: TaskRecord,
        outcome: Result<Value, HushError>,
    },
}

impl FactoryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FactoryEvent::Boot => "boot",
            FactoryEvent::BeforeSubmit { .. } => "before_submit",
            FactoryEvent::Success { .. } => "success",
            FactoryEvent::Error { .. } => "error",
            FactoryEvent::Fail { .. } => "fail",
            FactoryEvent::Complete { .. } => "complete",
        }
    }

    pub fn task(&self) -> Option<&TaskRecord> {
        match self {
            FactoryEvent::Boot => None,
            FactoryEvent::BeforeSubmit { task, .. }
            | FactoryEvent::Success { task, .. }
            | FactoryEvent::Error { task, .. }
            | FactoryEvent::Fail { task, .. }
            | FactoryEvent::Complete { task, .. } => Some(task),
        }
    }
}
