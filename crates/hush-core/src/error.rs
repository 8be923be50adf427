use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{TaskId, VDataId};

/// Failure reported by the transport capability.
///
/// This is the only error class that retry matchers ever look at.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportFailure {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("server responded with status {status}: {message}")]
    Status { status: u16, message: String },
}

impl TransportFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Short class name, matched by `RetryMatcher::Failure { name, .. }`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::Status { .. } => "status",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Network { message } | Self::Status { message, .. } => message.clone(),
            Self::Timeout { after_ms } => format!("timed out after {after_ms}ms"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HushError {
    #[error(transparent)]
    Transport(#[from] TransportFailure),

    #[error("method still captures unresolved virtual data: {tokens:?}")]
    Captured { tokens: Vec<String> },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("virtual data {0} was already resolved")]
    AlreadyResolved(VDataId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("submission was vetoed before entering the queue")]
    Vetoed,

    #[error("task {0} was aborted")]
    Aborted(TaskId),

    #[error("silent factory is stopped")]
    Stopped,

    #[error("hook was dropped before the action could run")]
    Detached,

    #[error("no action handlers registered under `{0}`")]
    UnknownAction(String),

    #[error("malformed virtual data token: {0}")]
    MalformedToken(String),

    #[error("method handler failed: {0}")]
    Handler(String),
}

impl HushError {
    pub fn as_transport(&self) -> Option<&TransportFailure> {
        match self {
            Self::Transport(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HushError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for HushError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failure_exposes_name_and_message() {
        let f = TransportFailure::status(500, "server error");
        assert_eq!(f.name(), "status");
        assert_eq!(f.message(), "server error");
        assert!(f.to_string().contains("500"));

        let t = TransportFailure::Timeout { after_ms: 30 };
        assert_eq!(t.name(), "timeout");
        assert!(t.message().contains("30"));
    }

    #[test]
    fn transport_failure_is_tagged_json() {
        let s = serde_json::to_value(TransportFailure::network("reset")).unwrap();
        assert_eq!(s["kind"], "network");
        assert_eq!(s["message"], "reset");
    }

    #[test]
    fn serde_errors_become_serialization_errors() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let e: HushError = err.into();
        assert!(matches!(e, HushError::Serialization(_)));
    }
}
