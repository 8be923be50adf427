//! Transport port: performs one request.
//!
//! Retries re-invoke `execute`; the implementation never retries by itself
//! as far as this crate is concerned.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::MethodDescriptor;
use crate::error::TransportFailure;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, method: &MethodDescriptor) -> Result<Value, TransportFailure>;
}
