//! HushBuilder - SilentFactory の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - transport が未設定なら BuildError::MissingTransport
//! - queue_waits の正規表現が不正なら BuildError::InvalidQueuePattern
//! - storage / state sink / id generator は省略するとインメモリ実装になる

use std::sync::Arc;

use super::context::HushContext;
use super::scheduler::SilentFactory;
use crate::config::{HushConfig, RequestWaits};
use crate::impls::{InMemoryStorage, MemoryStates};
use crate::ports::{IdGenerator, StateSink, Storage, SystemClock, Transport, UlidGenerator};
use crate::queue::QueueStore;
use crate::vdata::{StateStore, VDataRegistry};

/// # 使用例
/// ```ignore
/// let factory = SilentFactory::builder()
///     .config(config)
///     .transport(Arc::new(MyTransport))
///     .storage(Arc::new(FileStorage::new("./data")))
///     .build()?;
/// factory.boot().await?;
/// ```
#[derive(Default)]
pub struct HushBuilder {
    config: HushConfig,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn Storage>>,
    sink: Option<Arc<dyn StateSink>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError は factory 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No transport configured. Call .transport(..) before .build().")]
    MissingTransport,

    #[error("Invalid queue wait pattern `{pattern}`: {reason}")]
    InvalidQueuePattern { pattern: String, reason: String },
}

impl HushBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: HushConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn state_sink(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<SilentFactory, BuildError> {
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        let waits = RequestWaits::compile(&self.config.factory).map_err(|(pattern, e)| {
            BuildError::InvalidQueuePattern {
                pattern,
                reason: e.to_string(),
            }
        })?;

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock)));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(MemoryStates::new()));

        let registry = Arc::new(VDataRegistry::new(Arc::clone(&ids)));
        let store = QueueStore::new(storage, self.config.factory.storage_namespace.clone());
        let states = StateStore::new(sink, Arc::clone(&registry));

        Ok(SilentFactory::from_context(HushContext::new(
            self.config,
            waits,
            ids,
            registry,
            store,
            transport,
            states,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueWait;
    use crate::impls::FnTransport;
    use serde_json::json;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(FnTransport::new(|_| Ok(json!(null))))
    }

    #[test]
    fn transport_is_required() {
        let err = HushBuilder::new().build().err().unwrap();
        assert!(matches!(err, BuildError::MissingTransport));
    }

    #[test]
    fn invalid_queue_pattern_fails_fast() {
        let mut config = HushConfig::default();
        config.factory.queue_waits.push(QueueWait {
            pattern: "[".into(),
            wait_ms: 10,
        });
        let err = HushBuilder::new()
            .config(config)
            .transport(transport())
            .build()
            .err()
            .unwrap();
        match err {
            BuildError::InvalidQueuePattern { pattern, .. } => assert_eq!(pattern, "["),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn defaults_fill_the_missing_ports() {
        let factory = HushBuilder::new().transport(transport()).build().unwrap();
        assert_eq!(factory.config().factory.storage_namespace, "hush.sq");
        assert!(factory.stats().is_idle());
    }
}
