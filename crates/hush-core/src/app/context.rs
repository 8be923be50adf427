//! HushContext - factory 全体で共有される状態
//!
//! registry, queue store, transport, state store, delegation を 1 つにまとめ、
//! scheduler / drain loop / hook の全員が `Arc<HushContext>` 経由で触る。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{Notify, broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use super::delegation::{ActionHandlers, DelegationRegistry};
use super::listeners::HookEvents;
use super::middleware::Middleware;
use super::status::FactoryStatus;
use super::worker_loop;
use crate::config::{HushConfig, RequestWaits};
use crate::domain::{FactoryEvent, ScopedEvent, TaskId, VDataId};
use crate::error::HushError;
use crate::ports::{IdGenerator, Transport};
use crate::queue::{QueueStore, TaskRecord};
use crate::vdata::{StateCell, StateStore, VDataRegistry};

const EVENT_CAPACITY: usize = 256;

/// What a hook attaches to every task it submits.
#[derive(Clone)]
pub(crate) struct HookBinding {
    pub(crate) events: Arc<HookEvents>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) middleware: Option<Arc<dyn Middleware>>,
    pub(crate) controls: ActionHandlers,
}

/// Runtime attachments of one queued task. Never persisted: a task
/// reloaded from storage runs without hook listeners.
pub(crate) struct TaskBinding {
    pub(crate) hook: HookBinding,
    pub(crate) args: Vec<Value>,
    pub(crate) responder: Option<oneshot::Sender<Result<Value, HushError>>>,
}

impl TaskBinding {
    pub(crate) fn scope(&self, task: &TaskRecord) -> ScopedEvent {
        scoped(task, &self.args)
    }
}

pub(crate) struct HushContext {
    pub(crate) config: HushConfig,
    pub(crate) waits: RequestWaits,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) registry: Arc<VDataRegistry>,
    pub(crate) store: QueueStore,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) states: StateStore,
    pub(crate) delegation: Arc<DelegationRegistry>,
    events: broadcast::Sender<FactoryEvent>,
    status: watch::Sender<FactoryStatus>,
    drainers: Mutex<HashSet<String>>,
    bindings: Mutex<HashMap<TaskId, TaskBinding>>,
    aborted: Notify,
}

impl HushContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: HushConfig,
        waits: RequestWaits,
        ids: Arc<dyn IdGenerator>,
        registry: Arc<VDataRegistry>,
        store: QueueStore,
        transport: Arc<dyn Transport>,
        states: StateStore,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(FactoryStatus::Idle);
        Self {
            config,
            waits,
            ids,
            registry,
            store,
            transport,
            states,
            delegation: Arc::new(DelegationRegistry::new()),
            events,
            status,
            drainers: Mutex::new(HashSet::new()),
            bindings: Mutex::new(HashMap::new()),
            aborted: Notify::new(),
        }
    }

    // ========================================
    // Events / status
    // ========================================

    /// Broadcast to subscribers; nobody listening is fine.
    pub(crate) fn emit(&self, event: FactoryEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<FactoryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn status(&self) -> FactoryStatus {
        *self.status.borrow()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<FactoryStatus> {
        self.status.subscribe()
    }

    /// Move to `to` if the current status is one of `from`.
    pub(crate) fn transition(&self, from: &[FactoryStatus], to: FactoryStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(status = %to, "factory status changed");
        }
        changed
    }

    /// Park until the factory runs. False once it is stopped.
    pub(crate) async fn wait_running(&self) -> bool {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                FactoryStatus::Running => return true,
                FactoryStatus::Stopped => return false,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    // ========================================
    // Drainers
    // ========================================

    fn drainers(&self) -> MutexGuard<'_, HashSet<String>> {
        self.drainers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start draining `queue` unless a drainer already owns it.
    /// Before boot this is a no-op: boot starts every queue.
    pub(crate) fn ensure_drainer(self: &Arc<Self>, queue: &str) {
        if !self.status().is_active() {
            return;
        }
        if !self.drainers().insert(queue.to_string()) {
            return;
        }
        debug!(queue, "drainer spawned");
        tokio::spawn(worker_loop::drain(Arc::clone(self), queue.to_string()));
    }

    /// Called by a drainer that found its queue empty. Returns true if the
    /// drainer must exit; false if a task arrived in the meantime.
    pub(crate) fn finish_drain(&self, queue: &str) -> bool {
        let mut drainers = self.drainers();
        if self.store.is_empty(queue) {
            drainers.remove(queue);
            true
        } else {
            false
        }
    }

    pub(crate) fn release_drainer(&self, queue: &str) {
        self.drainers().remove(queue);
    }

    // ========================================
    // Bindings
    // ========================================

    fn bindings(&self) -> MutexGuard<'_, HashMap<TaskId, TaskBinding>> {
        self.bindings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn bind_task(&self, id: TaskId, binding: TaskBinding) {
        self.bindings().insert(id, binding);
    }

    /// Hook attachments and submission args, without the responder.
    pub(crate) fn binding_of(&self, id: TaskId) -> Option<(HookBinding, Vec<Value>)> {
        self.bindings()
            .get(&id)
            .map(|b| (b.hook.clone(), b.args.clone()))
    }

    pub(crate) fn take_binding(&self, id: TaskId) -> Option<TaskBinding> {
        self.bindings().remove(&id)
    }

    // ========================================
    // Resolution / persistence / abort
    // ========================================

    /// Resolve a placeholder everywhere: tracked locations and pending task payloads.
    pub(crate) async fn resolve_vdata(&self, id: VDataId, value: Value) -> Result<usize, HushError> {
        let changed = self.registry.resolve(id, value.clone())?;
        let queues = self.store.substitute(id, &value);
        self.persist_queues(queues).await;
        Ok(changed)
    }

    /// Persist each queue; failures are logged so other queues keep going.
    pub(crate) async fn persist_queues<I>(&self, queues: I)
    where
        I: IntoIterator<Item = String>,
    {
        for queue in queues {
            if let Err(e) = self.store.persist_queue(&queue).await {
                warn!(queue = %queue, error = %e, "persisting queue failed");
            }
        }
    }

    pub(crate) fn abort_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.aborted.notified()
    }

    /// Remove a task and complete it as aborted. An attempt in flight is not
    /// interrupted; its result is discarded when it arrives. The caller
    /// persists the queue.
    pub(crate) fn abort_task(&self, queue: &str, id: TaskId) -> bool {
        let Some(task) = self.store.remove(queue, id) else {
            return false;
        };
        self.aborted.notify_waiters();
        info!(queue, task_id = %id, "task aborted");
        worker_loop::finish(self, &task, Err(HushError::Aborted(id)));
        true
    }

    /// Persist `queue` in the background, for callers outside async code.
    pub(crate) fn spawn_persist(self: &Arc<Self>, queue: &str) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ctx = Arc::clone(self);
                let queue = queue.to_string();
                handle.spawn(async move { ctx.persist_queues([queue]).await });
            }
            Err(_) => warn!(queue, "no runtime to persist the queue"),
        }
    }
}

/// Event scope of `task` submitted with `args`.
pub(crate) fn scoped(task: &TaskRecord, args: &[Value]) -> ScopedEvent {
    ScopedEvent {
        behavior: task.behavior,
        method: task.method.clone(),
        task: Some(task.clone()),
        args: args.to_vec(),
    }
}
