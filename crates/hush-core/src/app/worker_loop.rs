//! Drain loop - 1 キューにつき 1 つの drainer
//!
//! # 責務
//! - キューの先頭タスクを取り出し、transport（または middleware）経由で実行
//! - 失敗時は RetryPolicy に従ってバックオフ後に同じタスクを再実行
//! - 成功時は produced placeholder を解決し、キューと永続化から取り除く
//!
//! # 並行性
//! - 同じキューのタスクは直列（先頭が終わるまで次に進まない）
//! - キューが空になったら drainer は終了し、次の push で再び起動される
//! - pause 中は watch チャネルで待機し、stop で終了する

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::context::{HookBinding, HushContext, scoped};
use super::middleware::{MiddlewareContext, Next, execute};
use crate::domain::{
    Behavior, CompleteEvent, ErrorEvent, FactoryEvent, FallbackEvent, MethodDescriptor,
    SuccessEvent, TaskId,
};
use crate::error::HushError;
use crate::queue::{Decision, TaskRecord};
use crate::vdata::{VDataRegistry, VValue, vdata_token};

pub(crate) async fn drain(ctx: Arc<HushContext>, queue: String) {
    debug!(queue = %queue, "drain start");
    loop {
        if !ctx.wait_running().await {
            ctx.release_drainer(&queue);
            debug!(queue = %queue, "drain stopped");
            return;
        }

        let Some(head) = ctx.store.head(&queue) else {
            if ctx.finish_drain(&queue) {
                debug!(queue = %queue, "drain idle");
                return;
            }
            continue;
        };

        if !head.active {
            debug!(queue = %queue, task_id = %head.id, "skipping inactive task");
            ctx.store.remove(&queue, head.id);
            ctx.take_binding(head.id);
            ctx.registry.prune();
            continue;
        }

        run_task(&ctx, head).await;

        let wait = ctx.waits.for_queue(&queue);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Tokens of the placeholders in `method` that are still unresolved.
pub(crate) fn unresolved_tokens(registry: &VDataRegistry, method: &MethodDescriptor) -> Vec<String> {
    let mut ids = BTreeSet::new();
    for part in method.parts() {
        ids.extend(registry.unresolved_refs(&part));
    }
    ids.into_iter().map(vdata_token).collect()
}

/// Run one task until it leaves the queue.
async fn run_task(ctx: &Arc<HushContext>, head: TaskRecord) {
    let queue = head.queue_name.clone();
    let id = head.id;
    let binding = ctx.binding_of(id);

    loop {
        let registry = &ctx.registry;
        let Some(task) = ctx.store.update(&queue, id, |r| {
            r.method.rewrite(|part| registry.substitute_resolved(part));
            r.start_attempt();
        }) else {
            debug!(queue = %queue, task_id = %id, "task left the queue before its attempt");
            return;
        };

        let tokens = unresolved_tokens(registry, &task.method);
        if !tokens.is_empty() {
            let error = HushError::Captured { tokens };
            report_error(ctx, &task, binding.as_ref(), &error, false);
            fail(ctx, task, error).await;
            return;
        }

        debug!(queue = %queue, task_id = %id, retry_times = task.retry_times, "attempt start");
        ctx.emit(FactoryEvent::BeforeSubmit {
            queue: queue.clone(),
            task: task.clone(),
        });

        let result = match &binding {
            Some((hook, args)) => {
                let mctx = MiddlewareContext {
                    method: task.method.clone(),
                    behavior: task.behavior,
                    args: args.clone(),
                    task: Some(task.clone()),
                    controls: hook.controls.clone(),
                };
                execute(&ctx.transport, hook.middleware.as_ref(), mctx).await
            }
            None => Next::new(Arc::clone(&ctx.transport)).run(&task.method).await,
        };

        if ctx.store.get(id).is_none() {
            debug!(queue = %queue, task_id = %id, "discarding result of aborted task");
            return;
        }

        let error = match result {
            Ok(data) => {
                succeed(ctx, task, data).await;
                return;
            }
            Err(error) => error,
        };

        match task.retry.decide(task.retry_times, &error) {
            Decision::Retry { delay, reason } => {
                report_error(ctx, &task, binding.as_ref(), &error, true);
                let Some(task) = ctx.store.update(&queue, id, |r| r.schedule_retry(error.to_string()))
                else {
                    return;
                };
                debug!(
                    queue = %queue,
                    task_id = %id,
                    retry_times = task.retry_times,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "retry scheduled"
                );
                if !backoff(ctx, id, delay).await {
                    debug!(queue = %queue, task_id = %id, "aborted during backoff");
                    return;
                }
                if !ctx.wait_running().await {
                    return;
                }
            }
            Decision::MarkFailed { reason } => {
                report_error(ctx, &task, binding.as_ref(), &error, false);
                debug!(queue = %queue, task_id = %id, reason = %reason, "no more retries");
                fail(ctx, task, error).await;
                return;
            }
        }
    }
}

/// Sleep `delay`; false if the task was aborted meanwhile.
async fn backoff(ctx: &HushContext, id: TaskId, delay: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return ctx.store.get(id).is_some(),
            _ = ctx.abort_notified() => {
                if ctx.store.get(id).is_none() {
                    return false;
                }
            }
        }
    }
}

fn report_error(
    ctx: &HushContext,
    task: &TaskRecord,
    binding: Option<&(HookBinding, Vec<Value>)>,
    error: &HushError,
    will_retry: bool,
) {
    debug!(
        queue = %task.queue_name,
        task_id = %task.id,
        retry_times = task.retry_times,
        will_retry,
        error = %error,
        "attempt failed"
    );
    ctx.emit(FactoryEvent::Error {
        queue: task.queue_name.clone(),
        task: task.clone(),
        error: error.clone(),
        retry_times: task.retry_times,
    });
    if let Some((hook, args)) = binding {
        hook.events.error.emit(&ErrorEvent {
            scope: scoped(task, args),
            error: error.clone(),
            retry_times: task.retry_times,
            will_retry,
        });
    }
}

async fn succeed(ctx: &HushContext, mut task: TaskRecord, data: Value) {
    let queue = task.queue_name.clone();
    if ctx.store.remove(&queue, task.id).is_none() {
        debug!(queue = %queue, task_id = %task.id, "discarding result of aborted task");
        return;
    }
    task.mark_succeeded();

    let mut changed = BTreeSet::from([queue.clone()]);
    let mut resolved = BTreeMap::new();
    for produced in &task.produced {
        let value = produced.pick(&data);
        match ctx.registry.resolve(produced.id, value.clone()) {
            Ok(_) => {
                changed.extend(ctx.store.substitute(produced.id, &value));
                resolved.insert(produced.id, value);
            }
            Err(e) => warn!(task_id = %task.id, vdata_id = %produced.id, error = %e, "resolution skipped"),
        }
    }
    ctx.persist_queues(changed).await;

    info!(queue = %queue, task_id = %task.id, resolved = resolved.len(), "task succeeded");
    ctx.emit(FactoryEvent::Success {
        queue,
        task: task.clone(),
        data: data.clone(),
        resolved,
    });
    finish(ctx, &task, Ok(data));
}

async fn fail(ctx: &HushContext, mut task: TaskRecord, error: HushError) {
    let queue = task.queue_name.clone();
    if ctx.store.remove(&queue, task.id).is_none() {
        return;
    }
    task.mark_failed(error.to_string());
    ctx.persist_queues([queue.clone()]).await;

    info!(
        queue = %queue,
        task_id = %task.id,
        retry_times = task.retry_times,
        error = %error,
        "task failed"
    );
    ctx.emit(FactoryEvent::Fail {
        queue,
        task: task.clone(),
        error: error.clone(),
    });
    finish(ctx, &task, Err(error));
}

/// Deliver the terminal outcome of a task that already left the queue:
/// hook listeners and state, the waiting caller, then the factory event.
pub(crate) fn finish(ctx: &HushContext, task: &TaskRecord, outcome: Result<Value, HushError>) {
    if let Some(mut binding) = ctx.take_binding(task.id) {
        let scope = binding.scope(task);
        let hook = &binding.hook;
        let queued = task.behavior == Behavior::Queue;

        match &outcome {
            Ok(data) => {
                if queued {
                    hook.state.set_raw(data.clone());
                    hook.state.set_error(None);
                    hook.events.success.emit(&SuccessEvent {
                        scope: scope.clone(),
                        data: VValue::from(data.clone()),
                    });
                }
            }
            Err(HushError::Aborted(_)) => {}
            Err(error) => {
                if queued {
                    hook.state.set_error(Some(error.clone()));
                }
                hook.events.fallback.emit(&FallbackEvent {
                    scope: scope.clone(),
                    error: error.clone(),
                });
            }
        }
        if queued {
            hook.state.set_loading(false);
        }
        hook.events.complete.emit(&CompleteEvent {
            scope,
            outcome: outcome.clone().map(VValue::from),
        });
        if let Some(tx) = binding.responder.take() {
            let _ = tx.send(outcome.clone());
        }
    }

    ctx.emit(FactoryEvent::Complete {
        queue: task.queue_name.clone(),
        task: task.clone(),
        outcome,
    });
    // 中止・失敗したタスクの仮データはもう解決されない
    ctx.registry.prune();
}
