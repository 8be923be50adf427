//! Middleware around the execute step.
//!
//! A middleware receives the call context and a `Next` continuation. It
//! proceeds by calling `next.run(method)`, possibly with a rewritten
//! descriptor, or answers on its own without touching the transport.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::delegation::ActionHandlers;
use crate::domain::{Behavior, MethodDescriptor};
use crate::error::HushError;
use crate::ports::Transport;
use crate::queue::TaskRecord;

/// What a middleware sees of one execution.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub method: MethodDescriptor,
    pub behavior: Behavior,
    pub args: Vec<Value>,
    /// Absent for static submissions.
    pub task: Option<TaskRecord>,
    /// Send/abort controls of the hook that submitted the method.
    pub controls: ActionHandlers,
}

/// Continuation into the transport.
#[derive(Clone)]
pub struct Next {
    transport: Arc<dyn Transport>,
}

impl Next {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn run(&self, method: &MethodDescriptor) -> Result<Value, HushError> {
        debug!(verb = %method.verb, url = %method.url, force = method.force, "transport execute");
        Ok(self.transport.execute(method).await?)
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: MiddlewareContext, next: Next) -> Result<Value, HushError>;
}

/// Middleware from a closure returning a boxed future.
pub struct FnMiddleware<F>(F);

pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(MiddlewareContext, Next) -> BoxFuture<'static, Result<Value, HushError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware(f))
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(MiddlewareContext, Next) -> BoxFuture<'static, Result<Value, HushError>>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, ctx: MiddlewareContext, next: Next) -> Result<Value, HushError> {
        (self.0)(ctx, next).await
    }
}

/// Run `ctx.method` through `middleware` when present, else straight to the transport.
pub(crate) async fn execute(
    transport: &Arc<dyn Transport>,
    middleware: Option<&Arc<dyn Middleware>>,
    ctx: MiddlewareContext,
) -> Result<Value, HushError> {
    let next = Next::new(Arc::clone(transport));
    match middleware {
        Some(m) => m.handle(ctx, next).await,
        None => next.run(&ctx.method).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HookId;
    use crate::error::TransportFailure;
    use crate::impls::FnTransport;
    use futures::FutureExt;
    use serde_json::json;

    fn context(method: MethodDescriptor) -> MiddlewareContext {
        MiddlewareContext {
            method,
            behavior: Behavior::Static,
            args: vec![],
            task: None,
            controls: ActionHandlers::detached(HookId::from_ulid(ulid::Ulid::nil())),
        }
    }

    fn echo() -> Arc<dyn Transport> {
        Arc::new(FnTransport::new(|m| Ok(json!({ "url": m.url }))))
    }

    #[tokio::test]
    async fn without_middleware_goes_to_transport() {
        let out = execute(&echo(), None, context(MethodDescriptor::get("/a")))
            .await
            .unwrap();
        assert_eq!(out, json!({"url": "/a"}));
    }

    #[tokio::test]
    async fn middleware_can_rewrite_then_proceed() {
        let m = middleware_fn(|ctx, next| {
            async move {
                let mut method = ctx.method;
                method.url = format!("/v2{}", method.url);
                next.run(&method).await
            }
            .boxed()
        });
        let out = execute(&echo(), Some(&m), context(MethodDescriptor::get("/a")))
            .await
            .unwrap();
        assert_eq!(out, json!({"url": "/v2/a"}));
    }

    #[tokio::test]
    async fn middleware_can_answer_without_transport() {
        let transport = Arc::new(FnTransport::new(|_| Err(TransportFailure::network("down"))));
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let m = middleware_fn(|_, _| async { Ok::<_, HushError>(json!("cached")) }.boxed());

        let out = execute(&dyn_transport, Some(&m), context(MethodDescriptor::get("/a")))
            .await
            .unwrap();
        assert_eq!(out, json!("cached"));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn transport_failures_become_transport_errors() {
        let transport: Arc<dyn Transport> =
            Arc::new(FnTransport::new(|_| Err(TransportFailure::status(502, "bad gateway"))));
        let err = execute(&transport, None, context(MethodDescriptor::get("/a")))
            .await
            .unwrap_err();
        assert_eq!(err.as_transport().map(|f| f.name()), Some("status"));
    }
}
