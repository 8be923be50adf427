//! Queue store: named FIFO lanes of task records, persisted through `Storage`.
//!
//! Storage layout (namespace `hush.sq` by default):
//! - `<namespace>`: JSON array with the names of persisted queues
//! - `<namespace>.<queue>`: JSON array of task records, in queue order
//!
//! Inactive (vetoed) tasks and tasks opted out of persistence are never
//! written. A queue with nothing to write has its key removed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use tracing::{debug, warn};

use super::{TaskRecord, TaskState};
use crate::domain::{TaskId, VDataId, Verdict};
use crate::error::HushError;
use crate::observability::{QueueCounts, QueueStats};
use crate::ports::Storage;
use crate::vdata;

pub const DEFAULT_NAMESPACE: &str = "hush.sq";

pub struct QueueStore {
    queues: Mutex<HashMap<String, VecDeque<TaskRecord>>>,
    storage: Arc<dyn Storage>,
    namespace: String,
    /// Serializes read-modify-write of the index key.
    persist_lock: tokio::sync::Mutex<()>,
}

impl QueueStore {
    pub fn new(storage: Arc<dyn Storage>, namespace: impl Into<String>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            storage,
            namespace: namespace.into(),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<TaskRecord>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}.{}", self.namespace, queue)
    }

    // ========================================
    // Mutations
    // ========================================

    /// Append a task, asking `before_push` first.
    ///
    /// A vetoed task is still appended, but inactive: it never runs and is
    /// never persisted. Returns whether the task was accepted.
    pub async fn enqueue<F>(&self, mut record: TaskRecord, before_push: F) -> Result<bool, HushError>
    where
        F: FnOnce(&TaskRecord) -> Verdict,
    {
        let accepted = !before_push(&record).is_veto();
        if !accepted {
            record.deactivate();
        }

        let queue = record.queue_name.clone();
        let persist = record.is_persistable();
        debug!(queue = %queue, task_id = %record.id, accepted, "enqueue");
        self.lock().entry(queue.clone()).or_default().push_back(record);

        if persist {
            self.persist_queue(&queue).await?;
        }
        Ok(accepted)
    }

    /// Peek at the head without running it.
    pub fn head(&self, queue: &str) -> Option<TaskRecord> {
        self.lock().get(queue).and_then(|q| q.front().cloned())
    }

    /// Remove a task. Empty queues disappear.
    pub fn remove(&self, queue: &str, id: TaskId) -> Option<TaskRecord> {
        let mut queues = self.lock();
        let lane = queues.get_mut(queue)?;
        let index = lane.iter().position(|r| r.id == id)?;
        let removed = lane.remove(index);
        if lane.is_empty() {
            queues.remove(queue);
        }
        removed
    }

    /// Mutate a task in place; returns the updated copy.
    pub fn update<F>(&self, queue: &str, id: TaskId, f: F) -> Option<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut queues = self.lock();
        let record = queues.get_mut(queue)?.iter_mut().find(|r| r.id == id)?;
        f(record);
        Some(record.clone())
    }

    /// Substitute a resolved placeholder into every pending method.
    ///
    /// Returns the names of the queues that changed.
    pub fn substitute(&self, id: VDataId, value: &serde_json::Value) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (name, lane) in self.lock().iter_mut() {
            for record in lane.iter_mut() {
                if record
                    .method
                    .rewrite(|part| vdata::substitute(part, id, value))
                {
                    debug!(queue = %name, task_id = %record.id, vdata_id = %id, "method substituted");
                    changed.insert(name.clone());
                }
            }
        }
        changed
    }

    /// Replace a task by id, keeping its queue position and runtime state.
    pub fn replace(&self, record: TaskRecord) -> bool {
        let mut queues = self.lock();
        let Some(slot) = queues
            .get_mut(&record.queue_name)
            .and_then(|lane| lane.iter_mut().find(|r| r.id == record.id))
        else {
            return false;
        };
        *slot = TaskRecord {
            state: slot.state,
            retry_times: slot.retry_times,
            active: slot.active,
            ..record
        };
        true
    }

    // ========================================
    // Persistence
    // ========================================

    /// Write one queue (or remove its key when nothing is persistable).
    pub async fn persist_queue(&self, queue: &str) -> Result<(), HushError> {
        let _guard = self.persist_lock.lock().await;

        let records: Vec<TaskRecord> = self
            .lock()
            .get(queue)
            .map(|lane| lane.iter().filter(|r| r.is_persistable()).cloned().collect())
            .unwrap_or_default();

        let mut index = self.load_index().await?;
        if records.is_empty() {
            self.storage.remove(&self.queue_key(queue)).await?;
            if index.remove(queue) {
                self.save_index(&index).await?;
            }
        } else {
            let bytes = serde_json::to_vec(&records)?;
            self.storage.save(&self.queue_key(queue), bytes).await?;
            if index.insert(queue.to_string()) {
                self.save_index(&index).await?;
            }
        }
        debug!(queue, records = records.len(), "queue persisted");
        Ok(())
    }

    /// Write every queue, in memory or in the stored index.
    pub async fn persist_all(&self) -> Result<(), HushError> {
        let mut names: BTreeSet<String> = self.lock().keys().cloned().collect();
        names.extend(self.load_index().await?);
        for name in names {
            self.persist_queue(&name).await?;
        }
        Ok(())
    }

    /// Load every persisted queue.
    ///
    /// Loaded tasks go ahead of anything already in memory; ids already
    /// present are skipped. Returns the number of tasks loaded.
    pub async fn load_all(&self) -> Result<usize, HushError> {
        let index = self.load_index().await?;
        let mut loaded = 0;

        for name in index {
            let Some(bytes) = self.storage.load(&self.queue_key(&name)).await? else {
                warn!(queue = %name, "indexed queue has no record");
                continue;
            };
            let records: Vec<TaskRecord> = serde_json::from_slice(&bytes)?;

            let mut queues = self.lock();
            let lane = queues.entry(name.clone()).or_default();
            let known: BTreeSet<TaskId> = lane.iter().map(|r| r.id).collect();
            for mut record in records.into_iter().rev() {
                if known.contains(&record.id) {
                    continue;
                }
                record.queue_name = name.clone();
                lane.push_front(record);
                loaded += 1;
            }
            if lane.is_empty() {
                queues.remove(&name);
            }
        }
        debug!(tasks = loaded, "queues loaded");
        Ok(loaded)
    }

    async fn load_index(&self) -> Result<BTreeSet<String>, HushError> {
        match self.storage.load(&self.namespace).await? {
            Some(bytes) => Ok(serde_json::from_slice::<Vec<String>>(&bytes)?
                .into_iter()
                .collect()),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn save_index(&self, index: &BTreeSet<String>) -> Result<(), HushError> {
        if index.is_empty() {
            return self.storage.remove(&self.namespace).await;
        }
        let names: Vec<&String> = index.iter().collect();
        self.storage
            .save(&self.namespace, serde_json::to_vec(&names)?)
            .await
    }

    // ========================================
    // Queries
    // ========================================

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.lock()
            .values()
            .flat_map(|lane| lane.iter())
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn snapshot(&self, queue: &str) -> Vec<TaskRecord> {
        self.lock()
            .get(queue)
            .map(|lane| lane.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tasks whose method name matches `name_pattern` (a regex), optionally
    /// restricted to one queue. Tasks without a name never match.
    pub fn filter(&self, name_pattern: &str, queue: Option<&str>) -> Result<Vec<TaskRecord>, HushError> {
        let re = Regex::new(name_pattern)
            .map_err(|e| HushError::Handler(format!("invalid name pattern `{name_pattern}`: {e}")))?;
        let queues = self.lock();
        let mut names: Vec<&String> = queues.keys().collect();
        names.sort();

        Ok(names
            .into_iter()
            .filter(|name| queue.is_none_or(|q| q == name.as_str()))
            .flat_map(|name| queues[name].iter())
            .filter(|r| r.name().is_some_and(|n| re.is_match(n)))
            .cloned()
            .collect())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self, queue: &str) -> usize {
        self.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    pub fn stats(&self) -> QueueStats {
        let queues = self.lock();
        let mut stats = QueueStats::default();
        for (name, lane) in queues.iter() {
            let mut counts = QueueCounts::default();
            for record in lane {
                if !record.active {
                    counts.inactive += 1;
                    continue;
                }
                match record.state {
                    TaskState::Running => counts.running += 1,
                    TaskState::RetryScheduled => counts.retry_scheduled += 1,
                    _ => counts.pending += 1,
                }
                if record.persist {
                    counts.persisted += 1;
                }
            }
            stats.queues.insert(name.clone(), counts);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Behavior, MethodDescriptor};
    use crate::impls::InMemoryStorage;
    use crate::queue::RetryPolicy;
    use crate::vdata::vdata_token;
    use serde_json::json;
    use ulid::Ulid;

    fn record(queue: &str, name: &str) -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            queue,
            MethodDescriptor::post("/todo", json!({"n": name})).with_name(name),
            Behavior::Queue,
            RetryPolicy::default(),
        )
    }

    fn store() -> (InMemoryStorage, QueueStore) {
        let storage = InMemoryStorage::new();
        let store = QueueStore::new(Arc::new(storage.clone()), DEFAULT_NAMESPACE);
        (storage, store)
    }

    #[tokio::test]
    async fn enqueue_keeps_fifo_order() {
        let (_, store) = store();
        let a = record("q", "a");
        let b = record("q", "b");
        store.enqueue(a.clone(), |_| Verdict::Proceed).await.unwrap();
        store.enqueue(b.clone(), |_| Verdict::Proceed).await.unwrap();

        assert_eq!(store.head("q").unwrap().id, a.id);
        store.remove("q", a.id);
        assert_eq!(store.head("q").unwrap().id, b.id);
        store.remove("q", b.id);
        assert!(store.head("q").is_none());
        assert!(store.queue_names().is_empty());
    }

    #[tokio::test]
    async fn vetoed_task_is_inactive_and_not_persisted() {
        let (storage, store) = store();
        let r = record("q", "a");
        let accepted = store.enqueue(r.clone(), |_| Verdict::Veto).await.unwrap();
        assert!(!accepted);

        let head = store.head("q").unwrap();
        assert!(!head.active);
        assert_eq!(store.stats().queues["q"].inactive, 1);
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn persist_and_reload_roundtrip() {
        let (storage, store) = store();
        let a = record("q", "a");
        let b = record("q", "b").with_persist(false);
        let c = record("other", "c");
        store.enqueue(a.clone(), |_| Verdict::Proceed).await.unwrap();
        store.enqueue(b.clone(), |_| Verdict::Proceed).await.unwrap();
        store.enqueue(c.clone(), |_| Verdict::Proceed).await.unwrap();

        assert_eq!(
            storage.keys(),
            vec!["hush.sq", "hush.sq.other", "hush.sq.q"]
        );

        let reloaded = QueueStore::new(
            Arc::new(InMemoryStorage::from_snapshot(storage.snapshot())),
            DEFAULT_NAMESPACE,
        );
        assert_eq!(reloaded.load_all().await.unwrap(), 2);
        assert_eq!(reloaded.snapshot("q").len(), 1);
        assert_eq!(reloaded.head("q").unwrap().method, a.method);
        assert_eq!(reloaded.head("other").unwrap().id, c.id);
    }

    #[tokio::test]
    async fn empty_queue_leaves_storage() {
        let (storage, store) = store();
        let a = record("q", "a");
        store.enqueue(a.clone(), |_| Verdict::Proceed).await.unwrap();
        store.remove("q", a.id);
        store.persist_queue("q").await.unwrap();
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn loaded_tasks_go_first() {
        let (storage, store) = store();
        let old = record("q", "old");
        store.enqueue(old.clone(), |_| Verdict::Proceed).await.unwrap();

        let fresh = QueueStore::new(
            Arc::new(InMemoryStorage::from_snapshot(storage.snapshot())),
            DEFAULT_NAMESPACE,
        );
        let new = record("q", "new");
        fresh.enqueue(new.clone(), |_| Verdict::Proceed).await.unwrap();
        fresh.load_all().await.unwrap();

        let ids: Vec<_> = fresh.snapshot("q").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![old.id, new.id]);
    }

    #[tokio::test]
    async fn substitute_rewrites_pending_methods() {
        let (_, store) = store();
        let id = VDataId::from_ulid(Ulid::new());
        let mut r = record("q", "del");
        r.method = MethodDescriptor::delete(format!("/detail/{}", vdata_token(id)));
        store.enqueue(r.clone(), |_| Verdict::Proceed).await.unwrap();

        let changed = store.substitute(id, &json!(1010));
        assert!(changed.contains("q"));
        assert_eq!(store.get(r.id).unwrap().method.url, "/detail/1010");
    }

    #[tokio::test]
    async fn filter_by_name_and_replace() {
        let (_, store) = store();
        let a = record("q", "create-todo");
        let b = record("q", "delete-todo");
        let c = record("p", "create-note");
        for r in [&a, &b, &c] {
            store.enqueue(r.clone(), |_| Verdict::Proceed).await.unwrap();
        }

        let creates = store.filter("^create", None).unwrap();
        assert_eq!(creates.len(), 2);
        let in_q = store.filter("todo$", Some("q")).unwrap();
        assert_eq!(in_q.len(), 2);
        assert!(store.filter("(", None).is_err());

        let mut changed = a.clone();
        changed.method.data = json!({"n": "changed"});
        assert!(store.replace(changed));
        assert_eq!(store.get(a.id).unwrap().method.data, json!({"n": "changed"}));
        assert!(!store.replace(record("q", "missing")));
    }

    #[tokio::test]
    async fn update_changes_runtime_state() {
        let (_, store) = store();
        let a = record("q", "a");
        store.enqueue(a.clone(), |_| Verdict::Proceed).await.unwrap();
        let updated = store.update("q", a.id, TaskRecord::start_attempt).unwrap();
        assert_eq!(updated.state, TaskState::Running);
        assert_eq!(store.stats().queues["q"].running, 1);
        assert!(!store.stats().is_idle());
    }
}
