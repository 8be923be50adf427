use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Task counts of one queue, by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub retry_scheduled: usize,
    /// Vetoed tasks still sitting in the queue.
    pub inactive: usize,
    /// Tasks that will be written to storage.
    pub persisted: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.retry_scheduled + self.inactive
    }
}

/// Counts for every non-empty queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queues: BTreeMap<String, QueueCounts>,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queues.values().map(QueueCounts::total).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.queues
            .values()
            .all(|c| c.running == 0 && c.retry_scheduled == 0)
    }
}
