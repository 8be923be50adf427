//! SilentFactory - silent queue の実行エンジン
//!
//! # 責務
//! - boot: 永続化されたキューを読み込み、キューごとに drainer を起動
//! - pause / resume / set_online / stop による状態遷移
//! - placeholder の解決をキュー内のタスクへ伝播
//! - タスクの参照・置換・削除、hook の生成、action delegation

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::builder::HushBuilder;
use super::context::HushContext;
use super::delegation::{ActionDelegation, ActionHandlers};
use super::hook::SqRequest;
use super::middleware::Middleware;
use super::status::FactoryStatus;
use crate::config::HushConfig;
use crate::domain::{FactoryEvent, MethodDescriptor, TaskId, VDataId};
use crate::error::HushError;
use crate::observability::QueueStats;
use crate::queue::TaskRecord;
use crate::vdata::{StateCell, StateStore, VDataRegistry, VValue};

/// Cheap to clone; every clone drives the same queues.
#[derive(Clone)]
pub struct SilentFactory {
    ctx: Arc<HushContext>,
}

impl SilentFactory {
    pub fn builder() -> HushBuilder {
        HushBuilder::new()
    }

    pub(crate) fn from_context(ctx: HushContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Load persisted queues and start draining.
    ///
    /// Loaded tasks go ahead of anything enqueued before boot. Returns the
    /// number of loaded tasks; a second call is a no-op returning 0.
    pub async fn boot(&self) -> Result<usize, HushError> {
        let ctx = &self.ctx;
        if !ctx.transition(&[FactoryStatus::Idle], FactoryStatus::Booted) {
            warn!(status = %ctx.status(), "boot ignored");
            return Ok(0);
        }

        let loaded = match ctx.store.load_all().await {
            Ok(n) => n,
            Err(e) => {
                ctx.transition(&[FactoryStatus::Booted], FactoryStatus::Idle);
                return Err(e);
            }
        };
        info!(loaded, queues = ctx.store.queue_names().len(), "silent factory booted");
        ctx.emit(FactoryEvent::Boot);

        let delay = ctx.config.factory.boot_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        ctx.transition(&[FactoryStatus::Booted], FactoryStatus::Running);
        self.start_drainers();
        Ok(loaded)
    }

    fn start_drainers(&self) {
        for queue in self.ctx.store.queue_names() {
            self.ctx.ensure_drainer(&queue);
        }
    }

    /// Drainers park at their next task boundary.
    pub fn pause(&self) -> bool {
        self.ctx.transition(
            &[FactoryStatus::Booted, FactoryStatus::Running],
            FactoryStatus::Paused,
        )
    }

    pub fn resume(&self) -> bool {
        let resumed = self
            .ctx
            .transition(&[FactoryStatus::Paused], FactoryStatus::Running);
        if resumed {
            self.start_drainers();
        }
        resumed
    }

    /// Connectivity report: offline pauses, online resumes.
    pub fn set_online(&self, online: bool) -> bool {
        if online { self.resume() } else { self.pause() }
    }

    /// Terminal. Drainers exit at their next task boundary; later sends fail with `Stopped`.
    pub fn stop(&self) -> bool {
        self.ctx.transition(
            &[
                FactoryStatus::Idle,
                FactoryStatus::Booted,
                FactoryStatus::Running,
                FactoryStatus::Paused,
            ],
            FactoryStatus::Stopped,
        )
    }

    pub fn status(&self) -> FactoryStatus {
        self.ctx.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<FactoryStatus> {
        self.ctx.watch_status()
    }

    /// Factory-wide events. Slow receivers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<FactoryEvent> {
        self.ctx.subscribe()
    }

    pub fn config(&self) -> &HushConfig {
        &self.ctx.config
    }

    // ========================================
    // Virtual data / state
    // ========================================

    pub fn registry(&self) -> &Arc<VDataRegistry> {
        &self.ctx.registry
    }

    pub fn states(&self) -> &StateStore {
        &self.ctx.states
    }

    /// Resolve a placeholder by hand, including inside pending task payloads.
    pub async fn resolve(&self, id: VDataId, value: Value) -> Result<usize, HushError> {
        self.ctx.resolve_vdata(id, value).await
    }

    /// State owned by the factory, for caches that outlive any hook.
    pub fn open_state(&self, key: &str, initial: &Value) -> Arc<StateCell> {
        self.ctx.states.open(key, initial)
    }

    /// Mutate the state under `key` with a graph that may hold placeholders.
    pub fn update_state_effect<F>(&self, key: &str, mutator: F) -> Result<bool, HushError>
    where
        F: Fn(VValue) -> VValue,
    {
        self.ctx.states.update_state_effect(key, mutator)
    }

    // ========================================
    // Tasks
    // ========================================

    pub fn stats(&self) -> QueueStats {
        self.ctx.store.stats()
    }

    pub fn tasks(&self, queue: &str) -> Vec<TaskRecord> {
        self.ctx.store.snapshot(queue)
    }

    /// Tasks whose method name matches `name_pattern`, optionally in one queue.
    pub fn filter_tasks(
        &self,
        name_pattern: &str,
        queue: Option<&str>,
    ) -> Result<Vec<TaskRecord>, HushError> {
        self.ctx.store.filter(name_pattern, queue)
    }

    pub fn get_task(&self, id: TaskId) -> Option<TaskRecord> {
        self.ctx.store.get(id)
    }

    /// Remove a task as if aborted. A running attempt finishes but its
    /// result is discarded.
    pub async fn remove_task(&self, id: TaskId) -> bool {
        let Some(task) = self.ctx.store.get(id) else {
            return false;
        };
        if !self.ctx.abort_task(&task.queue_name, id) {
            return false;
        }
        self.ctx.persist_queues([task.queue_name]).await;
        true
    }

    /// Replace a pending task's definition, keeping its position.
    pub async fn replace_task(&self, record: TaskRecord) -> Result<bool, HushError> {
        let queue = record.queue_name.clone();
        if !self.ctx.store.replace(record) {
            return Ok(false);
        }
        self.ctx.store.persist_queue(&queue).await?;
        Ok(true)
    }

    pub async fn persist_all(&self) -> Result<(), HushError> {
        self.ctx.store.persist_all().await
    }

    // ========================================
    // Hooks / delegation
    // ========================================

    /// Start building a hook around `handler`, which turns `send` arguments
    /// into a method descriptor.
    pub fn sq_request<F>(&self, handler: F) -> SqRequest
    where
        F: Fn(&[Value]) -> Result<MethodDescriptor, HushError> + Send + Sync + 'static,
    {
        SqRequest::new(Arc::clone(&self.ctx), Arc::new(handler))
    }

    /// Middleware registering the executing hook's controls under `name`.
    pub fn action_delegation(&self, name: impl Into<String>) -> Arc<dyn Middleware> {
        Arc::new(ActionDelegation::new(name, Arc::clone(&self.ctx.delegation)))
    }

    /// Call `f` with every control bundle registered under `name`.
    pub fn access_action<F>(&self, name: &str, f: F) -> Result<usize, HushError>
    where
        F: FnMut(&ActionHandlers),
    {
        self.ctx.delegation.access_action(name, f)
    }
}
