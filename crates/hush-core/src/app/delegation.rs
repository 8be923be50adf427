//! Action delegation: named channels of send/abort controls.
//!
//! A hook using the `action_delegation(name)` middleware registers its
//! controls under `name` the first time it executes. Any other code can
//! then reach it through `access_action(name, ..)`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::middleware::{Middleware, MiddlewareContext, Next};
use crate::domain::HookId;
use crate::error::HushError;
use crate::vdata::VValue;

type SendFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<VValue, HushError>> + Send + Sync;
type AbortFn = dyn Fn() + Send + Sync;

/// Send/abort controls of one hook.
#[derive(Clone)]
pub struct ActionHandlers {
    hook: HookId,
    send: Arc<SendFn>,
    abort: Arc<AbortFn>,
}

impl ActionHandlers {
    pub fn new<S, A>(hook: HookId, send: S, abort: A) -> Self
    where
        S: Fn(Vec<Value>) -> BoxFuture<'static, Result<VValue, HushError>> + Send + Sync + 'static,
        A: Fn() + Send + Sync + 'static,
    {
        Self {
            hook,
            send: Arc::new(send),
            abort: Arc::new(abort),
        }
    }

    /// Controls of a hook that no longer exists.
    pub fn detached(hook: HookId) -> Self {
        Self::new(
            hook,
            |_| Box::pin(async { Err::<VValue, _>(HushError::Detached) }),
            || {},
        )
    }

    pub fn hook(&self) -> HookId {
        self.hook
    }

    pub fn send(&self, args: Vec<Value>) -> BoxFuture<'static, Result<VValue, HushError>> {
        (self.send)(args)
    }

    pub fn abort(&self) {
        (self.abort)()
    }
}

impl fmt::Debug for ActionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandlers")
            .field("hook", &self.hook)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct DelegationRegistry {
    channels: Mutex<HashMap<String, Vec<ActionHandlers>>>,
}

impl DelegationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ActionHandlers>>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handlers` under `name`. One entry per hook and channel;
    /// returns false if the hook was already registered there.
    pub fn register(&self, name: &str, handlers: ActionHandlers) -> bool {
        let mut channels = self.lock();
        let list = channels.entry(name.to_string()).or_default();
        if list.iter().any(|h| h.hook == handlers.hook) {
            return false;
        }
        debug!(channel = name, hook_id = %handlers.hook, "action handlers registered");
        list.push(handlers);
        true
    }

    /// Drop every registration of `hook`.
    pub fn unregister_hook(&self, hook: HookId) -> usize {
        let mut channels = self.lock();
        let mut removed = 0;
        channels.retain(|_, list| {
            let before = list.len();
            list.retain(|h| h.hook != hook);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub fn handlers(&self, name: &str) -> Vec<ActionHandlers> {
        self.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Call `f` with every bundle registered under `name`.
    ///
    /// Returns how many bundles were visited; `UnknownAction` if none.
    pub fn access_action<F>(&self, name: &str, mut f: F) -> Result<usize, HushError>
    where
        F: FnMut(&ActionHandlers),
    {
        let handlers = self.handlers(name);
        if handlers.is_empty() {
            return Err(HushError::UnknownAction(name.to_string()));
        }
        for h in &handlers {
            f(h);
        }
        Ok(handlers.len())
    }
}

/// Middleware registering the executing hook's controls under a channel name.
pub struct ActionDelegation {
    name: String,
    registry: Arc<DelegationRegistry>,
}

impl ActionDelegation {
    pub(crate) fn new(name: impl Into<String>, registry: Arc<DelegationRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
        }
    }
}

#[async_trait]
impl Middleware for ActionDelegation {
    async fn handle(&self, ctx: MiddlewareContext, next: Next) -> Result<Value, HushError> {
        self.registry.register(&self.name, ctx.controls.clone());
        next.run(&ctx.method).await
    }
}
