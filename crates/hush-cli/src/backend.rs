//! In-process todo backend used as the demo transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use hush_core::domain::{MethodDescriptor, Verb};
use hush_core::ports::Transport;
use hush_core::TransportFailure;

/// `GET/POST /todos`, `PUT/DELETE /todos/{id}`.
///
/// The first `fail_times` calls fail with a network error.
pub struct TodoBackend {
    todos: Mutex<BTreeMap<u64, Value>>,
    next_id: AtomicU64,
    failures_left: AtomicU32,
    latency: Duration,
}

impl TodoBackend {
    pub fn new(fail_times: u32, latency: Duration) -> Self {
        Self {
            todos: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            failures_left: AtomicU32::new(fail_times),
            latency,
        }
    }

    pub fn todos(&self) -> Vec<Value> {
        self.todos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn route(&self, method: &MethodDescriptor) -> Result<Value, TransportFailure> {
        let mut todos = self.todos.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = match method.url.strip_prefix("/todos/") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| TransportFailure::status(400, format!("bad todo id `{raw}`")))?,
            ),
            None if method.url == "/todos" => None,
            None => return Err(TransportFailure::status(404, format!("no route {}", method.url))),
        };

        match (method.verb, id) {
            (Verb::Get, None) => Ok(Value::Array(todos.values().cloned().collect())),
            (Verb::Post, None) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let todo = json!({
                    "id": id,
                    "title": method.data.get("title").cloned().unwrap_or(Value::Null),
                    "done": false,
                });
                todos.insert(id, todo.clone());
                Ok(todo)
            }
            (Verb::Put, Some(id)) => {
                let todo = todos
                    .get_mut(&id)
                    .ok_or_else(|| TransportFailure::status(404, format!("todo {id} not found")))?;
                if let (Some(target), Some(patch)) = (todo.as_object_mut(), method.data.as_object()) {
                    for (k, v) in patch {
                        target.insert(k.clone(), v.clone());
                    }
                }
                Ok(todo.clone())
            }
            (Verb::Delete, Some(id)) => match todos.remove(&id) {
                Some(_) => Ok(json!({ "deleted": id })),
                None => Err(TransportFailure::status(404, format!("todo {id} not found"))),
            },
            (verb, _) => Err(TransportFailure::status(405, format!("{verb} {}", method.url))),
        }
    }
}

#[async_trait]
impl Transport for TodoBackend {
    async fn execute(&self, method: &MethodDescriptor) -> Result<Value, TransportFailure> {
        tokio::time::sleep(self.latency).await;

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            debug!(verb = %method.verb, url = %method.url, left, "intentional failure");
            return Err(TransportFailure::network(format!(
                "connection reset (left={left})"
            )));
        }

        self.route(method)
    }
}
