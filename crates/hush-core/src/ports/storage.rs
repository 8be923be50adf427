//! Storage port: raw key-value byte persistence.

use async_trait::async_trait;

use crate::error::HushError;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, HushError>;

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), HushError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), HushError>;
}
