//! FactoryStatus - silent factory の状態
//!
//! 状態遷移:
//! - Idle -> Booted -> Running <-> Paused
//! - 任意の状態 -> Stopped（終端）

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactoryStatus {
    /// Not booted yet; submissions are queued but nothing drains.
    #[default]
    Idle,
    /// Persisted queues are loaded; waiting out the boot delay.
    Booted,
    Running,
    Paused,
    Stopped,
}

impl FactoryStatus {
    pub fn is_running(self) -> bool {
        matches!(self, FactoryStatus::Running)
    }

    pub fn is_stopped(self) -> bool {
        matches!(self, FactoryStatus::Stopped)
    }

    /// Drainers may exist (possibly parked).
    pub fn is_active(self) -> bool {
        matches!(self, FactoryStatus::Running | FactoryStatus::Paused)
    }
}

impl fmt::Display for FactoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactoryStatus::Idle => "idle",
            FactoryStatus::Booted => "booted",
            FactoryStatus::Running => "running",
            FactoryStatus::Paused => "paused",
            FactoryStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
