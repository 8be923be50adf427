mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use hush_core::domain::{Behavior, MethodDescriptor, Setting, Verb};
use hush_core::impls::{FnTransport, InMemoryStorage};
use hush_core::{HushError, TransportFailure};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use common::{eventually, factory, recv};

fn list_transport() -> Arc<FnTransport> {
    Arc::new(FnTransport::new(|m| match (m.verb, m.url.as_str()) {
        (Verb::Get, "/todos") => Ok(json!([{ "id": 1 }])),
        (Verb::Get, _) => Err(TransportFailure::status(404, "not found")),
        _ => Ok(json!({ "ok": true })),
    }))
}

#[tokio::test]
async fn static_send_publishes_state() {
    let transport = list_transport();
    let factory = factory(transport.clone(), InMemoryStorage::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let hook = factory
        .sq_request(|_| Ok(MethodDescriptor::get("/todos")))
        .behavior(Behavior::Static)
        .initial_data(json!([]))
        .on_success(move |e| {
            let _ = tx.send(e.data.display());
        })
        .build();
    assert_eq!(hook.state_key(), "GET /todos");
    assert_eq!(hook.snapshot().raw, json!([]));

    // Static sends go straight to the transport, boot or not.
    let value = hook.send(vec![]).await.unwrap();
    assert_eq!(value.display(), json!([{ "id": 1 }]));
    assert_eq!(recv(&mut rx).await, json!([{ "id": 1 }]));

    let view = hook.snapshot();
    assert!(!view.loading);
    assert_eq!(view.raw, json!([{ "id": 1 }]));
    assert_eq!(view.error, None);
    assert!(factory.tasks("default").is_empty());
}

#[tokio::test]
async fn static_failure_lands_in_state() {
    let factory = factory(list_transport(), InMemoryStorage::new());
    let hook = factory
        .sq_request(|_| Ok(MethodDescriptor::get("/missing")))
        .behavior(Behavior::Static)
        .build();

    let err = hook.send(vec![]).await.unwrap_err();
    assert_eq!(err, HushError::from(TransportFailure::status(404, "not found")));
    assert_eq!(hook.snapshot().error, Some(err));
}

#[tokio::test]
async fn immediate_hook_sends_on_build() {
    let transport = list_transport();
    let factory = factory(transport.clone(), InMemoryStorage::new());

    let hook = factory
        .sq_request(|_| Ok(MethodDescriptor::get("/todos")))
        .behavior(Behavior::Static)
        .immediate(true)
        .build();

    eventually(|| transport.call_count() == 1).await;
    eventually(|| hook.snapshot().raw == json!([{ "id": 1 }])).await;
}

#[tokio::test]
async fn behavior_can_depend_on_the_method() {
    let transport = list_transport();
    let factory = factory(transport.clone(), InMemoryStorage::new());

    let hook = factory
        .sq_request(|args| match args.first() {
            Some(id) => Ok(MethodDescriptor::put(format!("/todos/{id}"), json!({}))),
            None => Ok(MethodDescriptor::get("/todos")),
        })
        .behavior(Setting::dynamic(|ctx| match ctx.method.verb {
            Verb::Get => Behavior::Static,
            _ => Behavior::Silent,
        }))
        .build();

    hook.send(vec![]).await.unwrap();
    assert_eq!(transport.call_count(), 1);

    let virtual_value = hook.send(vec![json!(1)]).await.unwrap();
    assert!(virtual_value.is_live());
    assert_eq!(factory.tasks("default").len(), 1);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn delegated_actions_reach_the_hook_until_it_drops() {
    let transport = list_transport();
    let factory = factory(transport.clone(), InMemoryStorage::new());

    let hook = factory
        .sq_request(|_| Ok(MethodDescriptor::get("/todos")))
        .behavior(Behavior::Static)
        .middleware(factory.action_delegation("todo-list"))
        .build();

    // The first send registers the hook's controls under the channel.
    hook.send(vec![]).await.unwrap();

    let mut handlers = Vec::new();
    let reached = factory
        .access_action("todo-list", |h| handlers.push(h.clone()))
        .unwrap();
    assert_eq!(reached, 1);
    assert_eq!(handlers[0].hook(), hook.id());

    let results = join_all(handlers.iter().map(|h| h.send(vec![]))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.call_count(), 2);

    drop(hook);
    assert_eq!(
        factory.access_action("todo-list", |_| {}),
        Err(HushError::UnknownAction("todo-list".into()))
    );
    assert_eq!(handlers[0].send(vec![]).await.unwrap_err(), HushError::Detached);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn captured_placeholders_can_be_answered_locally() {
    let transport = list_transport();
    let factory = factory(transport.clone(), InMemoryStorage::new());
    let pending = factory.registry().create(None);
    let url = format!("/todos/{}", pending.token());

    let answered = {
        let url = url.clone();
        factory
            .sq_request(move |_| Ok(MethodDescriptor::get(url.clone())))
            .behavior(Behavior::Static)
            .vdata_captured(|m| Some(json!({ "cached": m.url })))
            .build()
    };
    let value = answered.send(vec![]).await.unwrap();
    assert_eq!(value.display(), json!({ "cached": url }));
    assert_eq!(answered.snapshot().raw, json!({ "cached": url }));

    let refused = factory
        .sq_request(move |_| Ok(MethodDescriptor::get(url.clone())))
        .behavior(Behavior::Static)
        .vdata_captured(|_| None)
        .build();
    match refused.send(vec![]).await {
        Err(HushError::Captured { tokens }) => assert_eq!(tokens, vec![pending.token()]),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn removed_listener_stops_firing() {
    let factory = factory(list_transport(), InMemoryStorage::new());
    let hits = Arc::new(AtomicUsize::new(0));

    let hook = factory
        .sq_request(|_| Ok(MethodDescriptor::get("/todos")))
        .behavior(Behavior::Static)
        .build();
    let counter = Arc::clone(&hits);
    let id = hook.on_complete(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    hook.send(vec![]).await.unwrap();
    assert!(hook.off(id));
    assert!(!hook.off(id));
    hook.send(vec![]).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_errors_surface_before_any_submission() {
    let factory = factory(list_transport(), InMemoryStorage::new());
    let hook = factory
        .sq_request(|args| match args.first().and_then(Value::as_u64) {
            Some(id) => Ok(MethodDescriptor::delete(format!("/todos/{id}"))),
            None => Err(HushError::Handler("an id is required".into())),
        })
        .behavior(Behavior::Queue)
        .build();

    assert_eq!(
        hook.send(vec![json!("x")]).await.unwrap_err(),
        HushError::Handler("an id is required".into())
    );
    assert!(factory.tasks("default").is_empty());
}
