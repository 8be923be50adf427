//! SqHook - submission primitive bound to one reactive state
//!
//! `SilentFactory::sq_request(handler)` returns an `SqRequest` builder;
//! `build()` yields an `SqHook` whose `send` dispatches by behavior:
//!
//! - `Static`: executed right away through middleware and transport.
//! - `Queue`: enqueued; `send` resolves after the real execution.
//! - `Silent`: enqueued; `send` resolves at once with a virtual response
//!   which the real one replaces in place later.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::context::{HookBinding, HushContext, TaskBinding, scoped};
use super::delegation::ActionHandlers;
use super::listeners::{HookEvents, ListenerId};
use super::middleware::{Middleware, MiddlewareContext, execute};
use super::worker_loop::unresolved_tokens;
use crate::domain::{
    Behavior, CompleteEvent, ErrorEvent, FallbackEvent, HookId, MethodDescriptor, ScopedEvent,
    Setting, SubmitContext, SuccessEvent, TaskId, Verdict,
};
use crate::error::HushError;
use crate::ports::StateView;
use crate::queue::{Backoff, RetryMatcher, RetryPolicy, TaskRecord};
use crate::vdata::{StateCell, VValue};

type Handler = dyn Fn(&[Value]) -> Result<MethodDescriptor, HushError> + Send + Sync;
type Capture = dyn Fn(&MethodDescriptor) -> Option<Value> + Send + Sync;

#[derive(Clone)]
struct HookOptions {
    behavior: Setting<Behavior>,
    queue: String,
    force: Setting<bool>,
    retry: RetryPolicy,
    immediate: bool,
    immediate_args: Vec<Value>,
    vdata_captured: Option<Arc<Capture>>,
    silent_default_response: Option<Value>,
    middleware: Option<Arc<dyn Middleware>>,
    persist: Option<bool>,
    initial_data: Value,
}

// ========================================
// Builder
// ========================================

pub struct SqRequest {
    ctx: Arc<HushContext>,
    handler: Arc<Handler>,
    options: HookOptions,
    events: HookEvents,
}

impl SqRequest {
    pub(crate) fn new(ctx: Arc<HushContext>, handler: Arc<Handler>) -> Self {
        let defaults = &ctx.config.defaults;
        let options = HookOptions {
            behavior: Setting::Fixed(Behavior::default()),
            queue: defaults.queue.clone(),
            force: Setting::Fixed(false),
            retry: RetryPolicy {
                max_retry_times: defaults.max_retry_times,
                backoff: defaults.backoff.clone(),
                retry_matcher: defaults.retry_error.clone(),
            },
            immediate: defaults.immediate,
            immediate_args: Vec::new(),
            vdata_captured: None,
            silent_default_response: None,
            middleware: None,
            persist: None,
            initial_data: Value::Null,
        };
        Self {
            ctx,
            handler,
            options,
            events: HookEvents::default(),
        }
    }

    /// Fixed behavior, or `Setting::dynamic(|ctx| ..)` to decide per submission.
    pub fn behavior(mut self, behavior: impl Into<Setting<Behavior>>) -> Self {
        self.options.behavior = behavior.into();
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.options.queue = name.into();
        self
    }

    pub fn force(mut self, force: impl Into<Setting<bool>>) -> Self {
        self.options.force = force.into();
        self
    }

    pub fn max_retry_times(mut self, n: u32) -> Self {
        self.options.retry.max_retry_times = n;
        self
    }

    pub fn retry_error(mut self, matcher: RetryMatcher) -> Self {
        self.options.retry.retry_matcher = matcher;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.options.retry.backoff = backoff;
        self
    }

    /// Send once on `build()`.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.options.immediate = immediate;
        self
    }

    /// Arguments of the send performed on `build()`.
    pub fn immediate_args(mut self, args: Vec<Value>) -> Self {
        self.options.immediate_args = args;
        self
    }

    /// Answer for a method that still holds unresolved placeholders.
    /// Returning `None` lets the submission proceed.
    pub fn vdata_captured<F>(mut self, f: F) -> Self
    where
        F: Fn(&MethodDescriptor) -> Option<Value> + Send + Sync + 'static,
    {
        self.options.vdata_captured = Some(Arc::new(f));
        self
    }

    /// Shape of the virtual response of silent submissions.
    pub fn silent_default_response(mut self, value: Value) -> Self {
        self.options.silent_default_response = Some(value);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.options.middleware = Some(middleware);
        self
    }

    /// Override the "no fallback listener means persisted" rule.
    pub fn persist(mut self, persist: bool) -> Self {
        self.options.persist = Some(persist);
        self
    }

    pub fn initial_data(mut self, data: Value) -> Self {
        self.options.initial_data = data;
        self
    }

    pub fn on_before_push_queue<F, V>(self, f: F) -> Self
    where
        F: Fn(&ScopedEvent) -> V + Send + Sync + 'static,
        V: Into<Verdict>,
    {
        self.events.before_push_queue.add(f);
        self
    }

    pub fn on_pushed_queue<F>(self, f: F) -> Self
    where
        F: Fn(&ScopedEvent) + Send + Sync + 'static,
    {
        self.events.pushed_queue.add(f);
        self
    }

    pub fn on_success<F>(self, f: F) -> Self
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.events.success.add(f);
        self
    }

    pub fn on_error<F>(self, f: F) -> Self
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.events.error.add(f);
        self
    }

    pub fn on_fallback<F>(self, f: F) -> Self
    where
        F: Fn(&FallbackEvent) + Send + Sync + 'static,
    {
        self.events.fallback.add(f);
        self
    }

    pub fn on_complete<F>(self, f: F) -> Self
    where
        F: Fn(&CompleteEvent) + Send + Sync + 'static,
    {
        self.events.complete.add(f);
        self
    }

    /// Create the hook. With `immediate` set, the first send is spawned on
    /// the current tokio runtime.
    pub fn build(self) -> SqHook {
        let id = self.ctx.ids.generate_hook_id();
        let key = match (self.handler)(&self.options.immediate_args) {
            Ok(method) => method.key(),
            Err(_) => id.to_string(),
        };
        let state = self.ctx.states.bind(key);
        state.set_raw(self.options.initial_data.clone());

        let hook = SqHook {
            inner: Arc::new(HookInner {
                id,
                ctx: self.ctx,
                handler: self.handler,
                options: self.options,
                events: Arc::new(self.events),
                state,
                current: Mutex::new(None),
            }),
        };
        debug!(hook_id = %id, key = hook.inner.state.key(), "hook built");

        if hook.inner.options.immediate {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let sender = hook.clone();
                    let args = hook.inner.options.immediate_args.clone();
                    handle.spawn(async move {
                        if let Err(e) = sender.send(args).await {
                            debug!(hook_id = %sender.id(), error = %e, "immediate send failed");
                        }
                    });
                }
                Err(_) => warn!(hook_id = %id, "immediate send skipped outside a runtime"),
            }
        }
        hook
    }
}

// ========================================
// Hook
// ========================================

struct HookInner {
    id: HookId,
    ctx: Arc<HushContext>,
    handler: Arc<Handler>,
    options: HookOptions,
    events: Arc<HookEvents>,
    state: Arc<StateCell>,
    /// Last queued submission, the target of `abort`.
    current: Mutex<Option<(String, TaskId)>>,
}

impl HookInner {
    fn current(&self) -> MutexGuard<'_, Option<(String, TaskId)>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HookInner {
    fn drop(&mut self) {
        self.ctx.delegation.unregister_hook(self.id);
    }
}

#[derive(Clone)]
pub struct SqHook {
    inner: Arc<HookInner>,
}

impl fmt::Debug for SqHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqHook")
            .field("id", &self.inner.id)
            .field("key", &self.inner.state.key())
            .finish_non_exhaustive()
    }
}

impl SqHook {
    pub fn id(&self) -> HookId {
        self.inner.id
    }

    /// Key the hook state is published under.
    pub fn state_key(&self) -> &str {
        self.inner.state.key()
    }

    /// Current loading/data/error.
    pub fn snapshot(&self) -> StateView {
        self.inner.state.snapshot()
    }

    /// Current data as a live graph.
    pub fn data(&self) -> VValue {
        self.inner.state.data()
    }

    /// Send/abort controls that do not keep the hook alive.
    pub fn controls(&self) -> ActionHandlers {
        let for_send = Arc::downgrade(&self.inner);
        let for_abort = Arc::downgrade(&self.inner);
        ActionHandlers::new(
            self.inner.id,
            move |args| {
                let weak = for_send.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => SqHook { inner }.send(args).await,
                        None => Err(HushError::Detached),
                    }
                })
            },
            move || {
                if let Some(inner) = for_abort.upgrade() {
                    SqHook { inner }.abort();
                }
            },
        )
    }

    fn binding(&self) -> HookBinding {
        HookBinding {
            events: Arc::clone(&self.inner.events),
            state: Arc::clone(&self.inner.state),
            middleware: self.inner.options.middleware.clone(),
            controls: self.controls(),
        }
    }

    // ----------------------------------------
    // Subscriptions
    // ----------------------------------------

    pub fn on_before_push_queue<F, V>(&self, f: F) -> ListenerId
    where
        F: Fn(&ScopedEvent) -> V + Send + Sync + 'static,
        V: Into<Verdict>,
    {
        self.inner.events.before_push_queue.add(f)
    }

    pub fn on_pushed_queue<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&ScopedEvent) + Send + Sync + 'static,
    {
        self.inner.events.pushed_queue.add(f)
    }

    pub fn on_success<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.inner.events.success.add(f)
    }

    pub fn on_error<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.inner.events.error.add(f)
    }

    pub fn on_fallback<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&FallbackEvent) + Send + Sync + 'static,
    {
        self.inner.events.fallback.add(f)
    }

    pub fn on_complete<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&CompleteEvent) + Send + Sync + 'static,
    {
        self.inner.events.complete.add(f)
    }

    /// Remove a listener registered through any `on_*` method.
    pub fn off(&self, id: ListenerId) -> bool {
        let events = &self.inner.events;
        events.before_push_queue.remove(id)
            || events.pushed_queue.remove(id)
            || events.success.remove(id)
            || events.error.remove(id)
            || events.fallback.remove(id)
            || events.complete.remove(id)
    }

    // ----------------------------------------
    // Controls
    // ----------------------------------------

    /// Abort the last queued submission: it leaves the queue and completes
    /// with `Aborted`. Returns false if it already terminated.
    pub fn abort(&self) -> bool {
        let current = self.inner.current().take();
        let Some((queue, id)) = current else {
            return false;
        };
        let ctx = &self.inner.ctx;
        if !ctx.abort_task(&queue, id) {
            return false;
        }
        ctx.spawn_persist(&queue);
        true
    }

    pub async fn send(&self, args: Vec<Value>) -> Result<VValue, HushError> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        if ctx.status().is_stopped() {
            return Err(HushError::Stopped);
        }

        let mut method = (inner.handler)(&args)?;
        let submit = SubmitContext {
            method: method.clone(),
            args: args.clone(),
        };
        let behavior = inner.options.behavior.resolve(&submit);
        method.force |= inner.options.force.resolve(&submit);

        let registry = &ctx.registry;
        method.rewrite(|part| registry.substitute_resolved(part));

        if let Some(capture) = &inner.options.vdata_captured
            && !unresolved_tokens(registry, &method).is_empty()
            && let Some(response) = capture(&method)
        {
            debug!(hook_id = %inner.id, url = %method.url, "answered by vdata_captured");
            return Ok(self.answer_captured(behavior, method, args, response));
        }

        match behavior {
            Behavior::Static => self.send_static(method, args).await,
            Behavior::Queue | Behavior::Silent => self.submit(behavior, method, args).await,
        }
    }

    fn answer_captured(
        &self,
        behavior: Behavior,
        method: MethodDescriptor,
        args: Vec<Value>,
        response: Value,
    ) -> VValue {
        let inner = &self.inner;
        let scope = ScopedEvent {
            behavior,
            method,
            task: None,
            args,
        };
        let value = VValue::from(response.clone());
        inner.state.set_raw(response);
        inner.state.set_loading(false);
        inner.events.success.emit(&SuccessEvent {
            scope: scope.clone(),
            data: value.clone(),
        });
        inner.events.complete.emit(&CompleteEvent {
            scope,
            outcome: Ok(value.clone()),
        });
        value
    }

    async fn send_static(&self, method: MethodDescriptor, args: Vec<Value>) -> Result<VValue, HushError> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        let scope = ScopedEvent {
            behavior: Behavior::Static,
            method: method.clone(),
            task: None,
            args: args.clone(),
        };

        let tokens = unresolved_tokens(&ctx.registry, &method);
        let result = if tokens.is_empty() {
            inner.state.set_loading(true);
            let mctx = MiddlewareContext {
                method,
                behavior: Behavior::Static,
                args,
                task: None,
                controls: self.controls(),
            };
            execute(&ctx.transport, inner.options.middleware.as_ref(), mctx).await
        } else {
            Err(HushError::Captured { tokens })
        };
        inner.state.set_loading(false);

        match result {
            Ok(data) => {
                let value = VValue::from(data.clone());
                inner.state.set_raw(data);
                inner.state.set_error(None);
                inner.events.success.emit(&SuccessEvent {
                    scope: scope.clone(),
                    data: value.clone(),
                });
                inner.events.complete.emit(&CompleteEvent {
                    scope,
                    outcome: Ok(value.clone()),
                });
                Ok(value)
            }
            Err(error) => {
                inner.state.set_error(Some(error.clone()));
                inner.events.error.emit(&ErrorEvent {
                    scope: scope.clone(),
                    error: error.clone(),
                    retry_times: 0,
                    will_retry: false,
                });
                inner.events.complete.emit(&CompleteEvent {
                    scope,
                    outcome: Err(error.clone()),
                });
                Err(error)
            }
        }
    }

    async fn submit(
        &self,
        behavior: Behavior,
        method: MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<VValue, HushError> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        let options = &inner.options;
        let queue = options.queue.clone();

        let id = ctx.ids.generate_task_id();
        let persist = options
            .persist
            .unwrap_or_else(|| inner.events.fallback.is_empty());
        let mut record = TaskRecord::new(id, queue.clone(), method, behavior, options.retry.clone())
            .with_persist(persist);

        let virtual_response = if behavior == Behavior::Silent {
            let response = ctx
                .registry
                .create_virtual_response(options.silent_default_response.as_ref());
            record = record.with_produced(response.produced);
            Some(response.value)
        } else {
            None
        };

        let (responder, outcome) = if behavior == Behavior::Queue {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        ctx.bind_task(
            id,
            TaskBinding {
                hook: self.binding(),
                args: args.clone(),
                responder,
            },
        );

        // The veto and the hook bookkeeping precede the push: a drainer
        // already working this queue may run the task as soon as it lands.
        let scope = scoped(&record, &args);
        let verdict = inner.events.before_push_queue.check(&scope);
        if verdict.is_veto() {
            ctx.take_binding(id);
            debug!(queue = %queue, task_id = %id, "submission vetoed");
            if let Err(e) = ctx.store.enqueue(record, |_| verdict).await {
                warn!(queue = %queue, task_id = %id, error = %e, "enqueue of vetoed task failed");
            }
            ctx.ensure_drainer(&queue);
            return virtual_response.ok_or(HushError::Vetoed);
        }

        *inner.current() = Some((queue.clone(), id));
        inner.events.pushed_queue.emit(&scope);
        match &virtual_response {
            Some(value) => {
                if let Err(e) = inner.state.set_data(value) {
                    warn!(task_id = %id, error = %e, "virtual response not published");
                }
                inner.state.set_loading(false);
                inner.events.success.emit(&SuccessEvent {
                    scope,
                    data: value.clone(),
                });
            }
            None => inner.state.set_loading(true),
        }

        // Only persistable (accepted) tasks are written.
        if let Err(e) = ctx.store.enqueue(record, |_| verdict).await {
            warn!(queue = %queue, task_id = %id, error = %e, "persisting new task failed");
        }
        ctx.ensure_drainer(&queue);

        match (virtual_response, outcome) {
            (Some(value), _) => Ok(value),
            (None, Some(rx)) => rx.await.map_err(|_| HushError::Detached)?.map(VValue::from),
            (None, None) => Err(HushError::Detached),
        }
    }
}
