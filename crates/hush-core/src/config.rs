//! Configuration.
//!
//! Every field has a default, so partial JSON documents are accepted:
//!
//! ```json
//! { "factory": { "request_wait_ms": 50 }, "defaults": { "max_retry_times": 2 } }
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HushError;
use crate::queue::{Backoff, DEFAULT_NAMESPACE, RetryMatcher};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HushConfig {
    pub factory: FactoryConfig,
    pub defaults: RequestDefaults,
}

impl HushConfig {
    pub fn from_json_str(s: &str) -> Result<Self, HushError> {
        Ok(serde_json::from_str(s)?)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, HushError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&text)
    }
}

/// Wait between two consecutive tasks of the queues whose name matches `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWait {
    pub pattern: String,
    pub wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Delay between loading persisted queues and starting to drain them.
    pub boot_delay_ms: u64,

    /// Wait between two consecutive tasks of one queue.
    pub request_wait_ms: u64,

    /// Per-queue overrides of `request_wait_ms`; the first matching pattern wins.
    pub queue_waits: Vec<QueueWait>,

    /// Storage key prefix.
    pub storage_namespace: String,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: 0,
            request_wait_ms: 0,
            queue_waits: Vec::new(),
            storage_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl FactoryConfig {
    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }
}

/// `queue_waits` with compiled patterns.
#[derive(Debug, Clone)]
pub(crate) struct RequestWaits {
    default: Duration,
    rules: Vec<(Regex, Duration)>,
}

impl RequestWaits {
    pub(crate) fn compile(config: &FactoryConfig) -> Result<Self, (String, regex::Error)> {
        let rules = config
            .queue_waits
            .iter()
            .map(|w| {
                Regex::new(&w.pattern)
                    .map(|re| (re, Duration::from_millis(w.wait_ms)))
                    .map_err(|e| (w.pattern.clone(), e))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            default: Duration::from_millis(config.request_wait_ms),
            rules,
        })
    }

    pub(crate) fn for_queue(&self, queue: &str) -> Duration {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(queue))
            .map_or(self.default, |(_, wait)| *wait)
    }
}

/// Defaults applied to every hook before its own options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub queue: String,
    pub max_retry_times: u32,
    pub backoff: Backoff,
    pub retry_error: RetryMatcher,
    /// Send once as soon as the hook is built.
    pub immediate: bool,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            max_retry_times: 0,
            backoff: Backoff::default(),
            retry_error: RetryMatcher::Never,
            immediate: true,
        }
    }
}
