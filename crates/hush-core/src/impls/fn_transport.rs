//! Transport backed by a closure, with a call log.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::MethodDescriptor;
use crate::error::TransportFailure;
use crate::ports::Transport;

type Respond = dyn Fn(&MethodDescriptor) -> Result<Value, TransportFailure> + Send + Sync;
type Latency = dyn Fn(&MethodDescriptor) -> Duration + Send + Sync;

pub struct FnTransport {
    respond: Box<Respond>,
    latency: Option<Box<Latency>>,
    calls: Mutex<Vec<MethodDescriptor>>,
}

impl FnTransport {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&MethodDescriptor) -> Result<Value, TransportFailure> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering each call.
    pub fn with_latency<L>(mut self, latency: L) -> Self
    where
        L: Fn(&MethodDescriptor) -> Duration + Send + Sync + 'static,
    {
        self.latency = Some(Box::new(latency));
        self
    }

    fn log(&self) -> MutexGuard<'_, Vec<MethodDescriptor>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every descriptor executed so far, in call order.
    pub fn calls(&self) -> Vec<MethodDescriptor> {
        self.log().clone()
    }

    pub fn call_count(&self) -> usize {
        self.log().len()
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn execute(&self, method: &MethodDescriptor) -> Result<Value, TransportFailure> {
        self.log().push(method.clone());
        if let Some(latency) = &self.latency {
            tokio::time::sleep(latency(method)).await;
        }
        (self.respond)(method)
    }
}
