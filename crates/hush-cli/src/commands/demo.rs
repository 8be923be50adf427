//! `hush demo` - optimistic todo scenario.
//!
//! 1. fetch the list (static)
//! 2. create two todos silently and push them into the list state
//! 3. toggle the first one by its still-virtual id (silent)
//! 4. delete the second one and wait for the real answer (queue)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use hush_core::domain::{Behavior, FactoryEvent, MethodDescriptor};
use hush_core::impls::{FileStorage, MemoryStates};
use hush_core::queue::{Backoff, RetryMatcher};
use hush_core::vdata::VValue;
use hush_core::{HushConfig, HushError, SilentFactory, SqHook};

use crate::backend::TodoBackend;

#[derive(Args)]
pub struct DemoArgs {
    /// Fail the first N backend calls with a network error
    #[arg(long, default_value_t = 2)]
    fail_times: u32,

    /// Retries per task
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Delay between retries, in milliseconds
    #[arg(long, default_value_t = 200)]
    backoff_ms: u64,

    /// Simulated backend latency, in milliseconds
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Persist queues under this directory (in memory otherwise)
    #[arg(long, env = "HUSH_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, env = "HUSH_CONFIG")]
    config: Option<PathBuf>,
}

pub async fn run(args: DemoArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => HushConfig::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => HushConfig::default(),
    };

    let backend = Arc::new(TodoBackend::new(
        args.fail_times,
        Duration::from_millis(args.latency_ms),
    ));
    let states = Arc::new(MemoryStates::new());
    let mut builder = SilentFactory::builder()
        .config(config)
        .transport(backend.clone())
        .state_sink(states.clone());
    if let Some(dir) = &args.storage_dir {
        builder = builder.storage(Arc::new(FileStorage::new(dir.clone())));
    }
    let factory = builder.build()?;

    let events = factory.subscribe();
    tokio::spawn(print_events(events));

    let loaded = factory.boot().await?;
    if loaded > 0 {
        println!("resumed {loaded} persisted task(s)");
    }

    // (1) list
    let list = factory
        .sq_request(|_| Ok(MethodDescriptor::get("/todos")))
        .behavior(Behavior::Static)
        .initial_data(json!([]))
        .immediate(false)
        .build();
    list.send(vec![]).await?;

    // (2) silent creates
    let create = silent_hook(&factory, &args, |args| {
        let title = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| HushError::Handler("a title is required".into()))?;
        Ok(MethodDescriptor::post("/todos", json!({ "title": title })).with_name("todo.create"))
    })
    .silent_default_response(json!({ "id": "--", "title": "", "done": false }))
    .build();

    let docs = create.send(vec![json!("write the docs")]).await?;
    let ship = create.send(vec![json!("ship it")]).await?;
    for todo in [&docs, &ship] {
        let todo = todo.clone();
        factory.update_state_effect(list.state_key(), move |todos| match todos {
            VValue::Array(mut items) => {
                items.push(todo.clone());
                VValue::Array(items)
            }
            other => other,
        })?;
    }
    print_state("optimistic", &states, &list);

    // (3) silent toggle, addressed by a virtual id
    let toggle = silent_hook(&factory, &args, |args| {
        let id = args.first().and_then(Value::as_str).unwrap_or_default();
        Ok(MethodDescriptor::put(format!("/todos/{id}"), json!({ "done": true }))
            .with_name("todo.toggle"))
    })
    .build();
    toggle.send(vec![json!(id_text(&docs)?)]).await?;

    // (4) queued delete; resolves after everything ahead of it ran
    let remove = factory
        .sq_request(|args| {
            let id = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(MethodDescriptor::delete(format!("/todos/{id}")).with_name("todo.delete"))
        })
        .behavior(Behavior::Queue)
        .queue("todos")
        .max_retry_times(args.retries)
        .retry_error(RetryMatcher::Always)
        .backoff(Backoff::fixed(Duration::from_millis(args.backoff_ms)))
        .immediate(false)
        .build();
    match remove.send(vec![json!(id_text(&ship)?)]).await {
        Ok(answer) => println!("delete answered: {}", answer.display()),
        Err(e) => warn!(error = %e, "delete failed"),
    }

    print_state("final", &states, &list);
    println!(
        "backend: {}",
        serde_json::to_string(&backend.todos()).context("encoding backend todos")?
    );
    println!("stats: {}", serde_json::to_string(&factory.stats())?);

    factory.stop();
    Ok(())
}

fn silent_hook<F>(factory: &SilentFactory, args: &DemoArgs, handler: F) -> hush_core::SqRequest
where
    F: Fn(&[Value]) -> Result<MethodDescriptor, HushError> + Send + Sync + 'static,
{
    factory
        .sq_request(handler)
        .behavior(Behavior::Silent)
        .queue("todos")
        .max_retry_times(args.retries)
        .retry_error(RetryMatcher::Always)
        .backoff(Backoff::fixed(Duration::from_millis(args.backoff_ms)))
        .immediate(false)
}

/// The todo id as URL text: the real id once known, a placeholder token before.
fn id_text(todo: &VValue) -> Result<String> {
    let id = todo.get("id").context("todo without id")?;
    Ok(id.stringify()?)
}

fn print_state(label: &str, states: &MemoryStates, hook: &SqHook) {
    if let Some(view) = states.view(hook.state_key()) {
        println!("{label}: {}", view.display);
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<FactoryEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => describe(&event),
            Err(RecvError::Lagged(missed)) => warn!(missed, "event printer lagging"),
            Err(RecvError::Closed) => return,
        }
    }
}

fn describe(event: &FactoryEvent) {
    match event {
        FactoryEvent::Boot => info!("factory booted"),
        FactoryEvent::BeforeSubmit { queue, task } => {
            info!(queue = %queue, url = %task.method.url, attempt = task.retry_times + 1, "submitting");
        }
        FactoryEvent::Success { task, resolved, .. } => {
            println!("  ok   {} {} (resolved {})", task.method.verb, task.method.url, resolved.len());
        }
        FactoryEvent::Error { task, error, .. } => {
            println!("  err  {} {}: {error}", task.method.verb, task.method.url);
        }
        FactoryEvent::Fail { task, error, .. } => {
            println!("  FAIL {} {}: {error}", task.method.verb, task.method.url);
        }
        FactoryEvent::Complete { .. } => {}
    }
}
