//! Submission behavior and per-submission settings.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::method::MethodDescriptor;

/// How a submission is carried out.
///
/// - `Static`: execute immediately, outside any queue.
/// - `Queue`: append to a named queue; the caller waits for the real response.
/// - `Silent`: answer the caller with a virtual response now, execute in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Static,
    #[default]
    Queue,
    Silent,
}

impl Behavior {
    pub fn is_queued(self) -> bool {
        !matches!(self, Behavior::Static)
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Behavior::Static => "static",
            Behavior::Queue => "queue",
            Behavior::Silent => "silent",
        };
        f.write_str(s)
    }
}

/// What a setting resolver gets to look at: the method about to be submitted
/// and the arguments `send` was called with.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub method: MethodDescriptor,
    pub args: Vec<Value>,
}

type Resolver<T> = Arc<dyn Fn(&SubmitContext) -> T + Send + Sync>;

/// A value that is either fixed or evaluated once per submission.
pub enum Setting<T> {
    Fixed(T),
    Dynamic(Resolver<T>),
}

impl<T: Clone> Setting<T> {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&SubmitContext) -> T + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self, ctx: &SubmitContext) -> T {
        match self {
            Setting::Fixed(value) => value.clone(),
            Setting::Dynamic(f) => f(ctx),
        }
    }
}

impl<T: Clone> Clone for Setting<T> {
    fn clone(&self) -> Self {
        match self {
            Setting::Fixed(value) => Setting::Fixed(value.clone()),
            Setting::Dynamic(f) => Setting::Dynamic(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Setting::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl<T> From<T> for Setting<T> {
    fn from(value: T) -> Self {
        Setting::Fixed(value)
    }
}
