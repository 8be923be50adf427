//! Bound state containers.
//!
//! A `StateCell` keeps one loading/data/error triple in dehydrated form and
//! forwards every change to the `StateSink`. Cells are tracked by the
//! registry, so resolving a placeholder rewrites the cell in place and
//! republishes it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tracing::debug;

use super::registry::{VDataHolder, VDataRegistry};
use super::token::{self, collect_refs};
use super::value::VValue;
use crate::domain::VDataId;
use crate::error::HushError;
use crate::ports::{StateSink, StateUpdate, StateView};

pub struct StateCell {
    key: String,
    view: Mutex<StateView>,
    sink: Arc<dyn StateSink>,
    registry: Arc<VDataRegistry>,
}

impl StateCell {
    pub fn new(
        key: impl Into<String>,
        sink: Arc<dyn StateSink>,
        registry: Arc<VDataRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            view: Mutex::new(StateView::default()),
            sink,
            registry,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StateView> {
        self.view.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot(&self) -> StateView {
        self.lock().clone()
    }

    pub fn raw(&self) -> Value {
        self.lock().raw.clone()
    }

    /// Current data as a live graph.
    pub fn data(&self) -> VValue {
        self.registry.hydrate(&self.raw())
    }

    pub fn set_loading(&self, loading: bool) {
        self.lock().loading = loading;
        self.sink.publish(&self.key, StateUpdate::Loading(loading));
    }

    pub fn set_error(&self, error: Option<HushError>) {
        self.lock().error = error.clone();
        self.sink.publish(&self.key, StateUpdate::Error(error));
    }

    /// Replace the data and start watching the placeholders it contains.
    pub fn set_data(self: &Arc<Self>, data: &VValue) -> Result<(), HushError> {
        self.set_raw(data.dehydrate()?);
        Ok(())
    }

    pub fn set_raw(self: &Arc<Self>, raw: Value) {
        self.lock().raw = raw.clone();
        self.publish_data(raw);

        let holder: Arc<dyn VDataHolder> = self.clone();
        self.registry.track(&holder);
    }

    fn publish_data(&self, raw: Value) {
        let display = self.registry.display_json(&raw);
        self.lock().display = display.clone();
        self.sink
            .publish(&self.key, StateUpdate::Data { raw, display });
    }
}

impl VDataHolder for StateCell {
    fn refs(&self) -> BTreeSet<VDataId> {
        let mut out = BTreeSet::new();
        collect_refs(&self.lock().raw, &mut out);
        out
    }

    fn substitute(&self, id: VDataId, value: &Value) -> bool {
        let raw = {
            let mut view = self.lock();
            if !token::substitute(&mut view.raw, id, value) {
                return false;
            }
            view.raw.clone()
        };
        debug!(key = %self.key, vdata_id = %id, "state substituted");
        self.publish_data(raw);
        true
    }
}

/// State cells by key.
///
/// Hook states are held weakly and disappear with their hook; states opened
/// through `open` live as long as the store.
pub struct StateStore {
    sink: Arc<dyn StateSink>,
    registry: Arc<VDataRegistry>,
    cells: Mutex<HashMap<String, Vec<Weak<StateCell>>>>,
    owned: Mutex<HashMap<String, Arc<StateCell>>>,
}

impl StateStore {
    pub fn new(sink: Arc<dyn StateSink>, registry: Arc<VDataRegistry>) -> Self {
        Self {
            sink,
            registry,
            cells: Mutex::new(HashMap::new()),
            owned: Mutex::new(HashMap::new()),
        }
    }

    fn cells(&self) -> MutexGuard<'_, HashMap<String, Vec<Weak<StateCell>>>> {
        self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// New cell registered under `key`.
    pub fn bind(&self, key: impl Into<String>) -> Arc<StateCell> {
        let key = key.into();
        let cell = StateCell::new(key.clone(), Arc::clone(&self.sink), Arc::clone(&self.registry));
        let mut cells = self.cells();
        let entry = cells.entry(key).or_default();
        entry.retain(|weak| weak.strong_count() > 0);
        entry.push(Arc::downgrade(&cell));
        cell
    }

    /// Cell owned by the store itself, created with `initial` data on first use.
    pub fn open(&self, key: &str, initial: &Value) -> Arc<StateCell> {
        let mut owned = self
            .owned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cell) = owned.get(key) {
            return Arc::clone(cell);
        }
        let cell = self.bind(key);
        cell.set_raw(initial.clone());
        owned.insert(key.to_string(), Arc::clone(&cell));
        cell
    }

    /// Live cells under `key`.
    pub fn lookup(&self, key: &str) -> Vec<Arc<StateCell>> {
        self.cells()
            .get(key)
            .map(|list| list.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Apply `mutator` to the data of every state under `key`.
    ///
    /// The mutated graph is stored in dehydrated form and its placeholders
    /// are tracked, so the entries added here are rewritten in place when
    /// their placeholders resolve. Returns false if no state is bound.
    pub fn update_state_effect<F>(&self, key: &str, mutator: F) -> Result<bool, HushError>
    where
        F: Fn(VValue) -> VValue,
    {
        let cells = self.lookup(key);
        if cells.is_empty() {
            return Ok(false);
        }
        for cell in cells {
            let next = mutator(cell.data());
            cell.set_data(&next)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStates;
    use crate::ports::{SystemClock, UlidGenerator};
    use serde_json::json;

    fn fixture() -> (Arc<MemoryStates>, Arc<VDataRegistry>, StateStore) {
        let sink = Arc::new(MemoryStates::new());
        let registry = Arc::new(VDataRegistry::new(Arc::new(UlidGenerator::new(SystemClock))));
        let store = StateStore::new(sink.clone(), Arc::clone(&registry));
        (sink, registry, store)
    }

    #[test]
    fn update_state_effect_pushes_then_reconciles() {
        let (sink, registry, store) = fixture();
        let _list = store.open("todos", &json!([{"id": 1, "text": "a"}]));

        let vd = registry.create(Some(json!("--")));
        let item: VValue = [("id", VValue::from(vd.clone())), ("text", VValue::from("b"))]
            .into_iter()
            .collect();

        let updated = store
            .update_state_effect("todos", |list| match list {
                VValue::Array(mut items) => {
                    items.push(item.clone());
                    VValue::Array(items)
                }
                other => other,
            })
            .unwrap();
        assert!(updated);
        assert_eq!(
            sink.view("todos").unwrap().display,
            json!([{"id": 1, "text": "a"}, {"id": "--", "text": "b"}])
        );

        registry.resolve(vd.id(), json!(2)).unwrap();
        let view = sink.view("todos").unwrap();
        assert_eq!(view.raw, json!([{"id": 1, "text": "a"}, {"id": 2, "text": "b"}]));
        assert_eq!(view.display, view.raw);
    }

    #[test]
    fn update_state_effect_without_state_is_false() {
        let (_, _, store) = fixture();
        assert!(!store.update_state_effect("missing", |v| v).unwrap());
    }

    #[test]
    fn bound_cells_vanish_with_their_owner() {
        let (_, _, store) = fixture();
        let cell = store.bind("GET /list");
        assert_eq!(store.lookup("GET /list").len(), 1);
        drop(cell);
        assert!(store.lookup("GET /list").is_empty());
    }

    #[test]
    fn loading_and_error_reach_the_sink() {
        let (sink, _, store) = fixture();
        let cell = store.bind("k");
        cell.set_loading(true);
        cell.set_error(Some(HushError::Stopped));
        let view = sink.view("k").unwrap();
        assert!(view.loading);
        assert_eq!(view.error, Some(HushError::Stopped));
        assert_eq!(cell.snapshot().error, Some(HushError::Stopped));
    }
}
