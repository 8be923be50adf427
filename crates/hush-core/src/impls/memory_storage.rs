//! InMemoryStorage - テスト用・開発用のストレージ
//!
//! # 学習ポイント
//! - `snapshot()` / `from_snapshot()` でリロードをシミュレートできる

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::HushError;
use crate::ports::Storage;

/// InMemoryStorage はプロセス内の HashMap にバイト列を保存します
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在の内容のコピー（「ディスクに残ったもの」として扱う）
    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.lock().clone()
    }

    /// スナップショットから復元（リロード後のプロセスを想定）
    pub fn from_snapshot(entries: HashMap<String, Vec<u8>>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, HushError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), HushError> {
        self.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), HushError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_remove() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.load("a").await.unwrap(), None);

        storage.save("a", b"1".to_vec()).await.unwrap();
        assert_eq!(storage.load("a").await.unwrap(), Some(b"1".to_vec()));

        storage.remove("a").await.unwrap();
        storage.remove("a").await.unwrap();
        assert_eq!(storage.load("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn snapshot_survives_as_a_new_storage() {
        let storage = InMemoryStorage::new();
        storage.save("k", b"v".to_vec()).await.unwrap();

        let reloaded = InMemoryStorage::from_snapshot(storage.snapshot());
        storage.remove("k").await.unwrap();

        assert_eq!(reloaded.load("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(reloaded.keys(), vec!["k".to_string()]);
    }
}
