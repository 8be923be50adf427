#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hush_core::domain::FactoryEvent;
use hush_core::impls::InMemoryStorage;
use hush_core::ports::Transport;
use hush_core::queue::Backoff;
use hush_core::{HushConfig, SilentFactory};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

/// No immediate sends and a 1 ms backoff, so scenarios stay fast and explicit.
pub fn config() -> HushConfig {
    let mut config = HushConfig::default();
    config.defaults.immediate = false;
    config.defaults.backoff = Backoff::fixed(Duration::from_millis(1));
    config
}

pub fn factory(transport: Arc<dyn Transport>, storage: InMemoryStorage) -> SilentFactory {
    SilentFactory::builder()
        .config(config())
        .transport(transport)
        .storage(Arc::new(storage))
        .build()
        .unwrap()
}

/// Next `Complete` event, skipping the others.
pub async fn next_complete(
    rx: &mut broadcast::Receiver<FactoryEvent>,
) -> (String, Result<Value, hush_core::HushError>) {
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        if let FactoryEvent::Complete { task, outcome, .. } = event {
            return (task.method.url, outcome);
        }
    }
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a listener")
        .expect("listener channel closed")
}

/// Poll `cond` every millisecond until it holds.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition never held");
}
