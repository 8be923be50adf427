//! MemoryStates - 最新の state をキーごとに保持する StateSink

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::ports::{StateSink, StateUpdate, StateView};

/// UI フレームワークの代わりに、キーごとの最新ビューを覚えておくだけの sink
#[derive(Debug, Default)]
pub struct MemoryStates {
    views: Mutex<HashMap<String, StateView>>,
}

impl MemoryStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self, key: &str) -> Option<StateView> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StateView>> {
        self.views.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateSink for MemoryStates {
    fn publish(&self, key: &str, update: StateUpdate) {
        self.lock().entry(key.to_string()).or_default().apply(update);
    }
}
