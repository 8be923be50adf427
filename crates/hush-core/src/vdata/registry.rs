//! Virtual value registry.
//!
//! Allocates placeholders, converts between live graphs (`VValue`) and their
//! dehydrated JSON form, and resolves placeholders everywhere they were
//! captured. Structural locations register themselves through `track`; each
//! one is substituted at most once per placeholder.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::expr::Expression;
use super::token::{self, Rewrite, Token, collect_refs, parse_whole, settle};
use super::value::{LiveExpr, VData, VDataCell, VValue};
use crate::domain::VDataId;
use crate::error::HushError;
use crate::ports::IdGenerator;

/// Anything that holds dehydrated values and wants real values substituted in.
pub trait VDataHolder: Send + Sync {
    /// Placeholders currently referenced.
    fn refs(&self) -> BTreeSet<VDataId>;

    /// Replace `id` with `value`. Returns whether anything changed.
    fn substitute(&self, id: VDataId, value: &Value) -> bool;
}

/// A placeholder created for a virtual response, and where its real value
/// lives in the real response (a JSON pointer; `""` is the whole response).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedVData {
    pub id: VDataId,
    pub pointer: String,
}

impl ProducedVData {
    /// Real value for this placeholder. Missing paths resolve to `null`.
    pub fn pick(&self, response: &Value) -> Value {
        response.pointer(&self.pointer).cloned().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct VirtualResponse {
    pub value: VValue,
    pub produced: Vec<ProducedVData>,
}

#[derive(Default)]
struct RegistryState {
    cells: HashMap<VDataId, Weak<VDataCell>>,
    displays: HashMap<VDataId, Value>,
    resolved: HashMap<VDataId, Value>,
    holders: HashMap<usize, Weak<dyn VDataHolder>>,
    watching: HashMap<VDataId, HashSet<usize>>,
}

pub struct VDataRegistry {
    ids: Arc<dyn IdGenerator>,
    state: Mutex<RegistryState>,
}

fn holder_key(holder: &Arc<dyn VDataHolder>) -> usize {
    Arc::as_ptr(holder) as *const () as usize
}

impl VDataRegistry {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            ids,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a placeholder. Without a display value it shows as `null`.
    pub fn create(&self, display: Option<Value>) -> VData {
        let id = self.ids.generate_vdata_id();
        let display = display.unwrap_or(Value::Null);
        let vd = VData::new(id, display.clone(), None);

        let mut state = self.lock();
        state.cells.insert(id, vd.downgrade());
        state.displays.insert(id, display);
        vd
    }

    /// Virtual response for a silent submission.
    ///
    /// Every scalar leaf of an object/array default becomes its own
    /// placeholder; a scalar or missing default becomes one root placeholder.
    pub fn create_virtual_response(&self, default: Option<&Value>) -> VirtualResponse {
        let mut produced = Vec::new();
        let value = match default {
            Some(v @ (Value::Object(_) | Value::Array(_))) => {
                self.virtualize(v, String::new(), &mut produced)
            }
            other => {
                let vd = self.create(other.cloned());
                produced.push(ProducedVData {
                    id: vd.id(),
                    pointer: String::new(),
                });
                VValue::Virtual(vd)
            }
        };
        VirtualResponse { value, produced }
    }

    fn virtualize(&self, v: &Value, pointer: String, produced: &mut Vec<ProducedVData>) -> VValue {
        match v {
            Value::Object(map) => VValue::Object(
                map.iter()
                    .map(|(k, child)| {
                        let escaped = k.replace('~', "~0").replace('/', "~1");
                        let child = self.virtualize(child, format!("{pointer}/{escaped}"), produced);
                        (k.clone(), child)
                    })
                    .collect(),
            ),
            Value::Array(items) => VValue::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, child)| self.virtualize(child, format!("{pointer}/{i}"), produced))
                    .collect(),
            ),
            leaf => {
                let vd = self.create(Some(leaf.clone()));
                produced.push(ProducedVData { id: vd.id(), pointer });
                VValue::Virtual(vd)
            }
        }
    }

    pub fn dehydrate(&self, value: &VValue) -> Result<Value, HushError> {
        value.dehydrate()
    }

    pub fn display(&self, value: &VValue) -> Value {
        value.display()
    }

    /// Display view of a dehydrated graph: resolved values where known,
    /// display values elsewhere. Tokens with unknown ids render as `null`.
    pub fn display_json(&self, value: &Value) -> Value {
        let state = self.lock();
        let lookup = |id: VDataId| {
            state
                .resolved
                .get(&id)
                .or_else(|| state.displays.get(&id))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let mut out = value.clone();
        token::rewrite(&mut out, &mut |token| match token {
            Token::VData(id) => Rewrite::Value(lookup(*id)),
            Token::Expr(expr) => {
                Rewrite::Value(expr.evaluate(&|id| Some(lookup(id))).unwrap_or(Value::Null))
            }
        });
        out
    }

    /// See [`VValue::stringify`]. Only objects and arrays survive a trip
    /// through [`parse`](Self::parse) with their type intact.
    pub fn stringify(&self, value: &VValue) -> Result<String, HushError> {
        value.stringify()
    }

    /// Inverse of `stringify`, as far as it goes.
    ///
    /// Whole tokens become live handles, JSON objects and arrays are parsed
    /// and hydrated, anything else stays a string.
    ///
    /// Top-level scalars are not parsed back: `parse("5")`, `parse("true")`
    /// and `parse("null")` all return [`VValue::String`]. A string whose
    /// text is a JSON object or array comes back as that object or array.
    pub fn parse(&self, s: &str) -> VValue {
        let trimmed = s.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(json) = serde_json::from_str::<Value>(s)
        {
            return self.hydrate(&json);
        }
        self.hydrate(&Value::String(s.to_string()))
    }

    /// Turn whole-string tokens back into live handles.
    ///
    /// Strings with embedded tokens stay strings: they are already in
    /// dehydrated form and get substituted where they are tracked.
    pub fn hydrate(&self, value: &Value) -> VValue {
        match value {
            Value::String(s) => match parse_whole(s) {
                Some(Token::VData(id)) => VValue::Virtual(self.handle(id)),
                Some(Token::Expr(expr)) => self.hydrate_expr(expr),
                None => VValue::String(s.clone()),
            },
            Value::Array(items) => VValue::Array(items.iter().map(|v| self.hydrate(v)).collect()),
            Value::Object(map) => VValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.hydrate(v)))
                    .collect(),
            ),
            other => VValue::from(other.clone()),
        }
    }

    fn hydrate_expr(&self, expr: Expression) -> VValue {
        let deps = expr.refs().into_iter().map(|id| self.handle(id)).collect();
        let live = LiveExpr::new(expr, deps);
        match live.value() {
            Some(value) => VValue::from(value),
            None => VValue::Expr(live),
        }
    }

    /// Live handle for `id`, revived from the registry's records if no
    /// handle is alive (for example after a reload).
    pub fn handle(&self, id: VDataId) -> VData {
        let mut state = self.lock();
        if let Some(cell) = state.cells.get(&id).and_then(Weak::upgrade) {
            return VData::from_cell(cell);
        }
        let display = state.displays.get(&id).cloned().unwrap_or(Value::Null);
        let resolved = state.resolved.get(&id).cloned();
        let vd = VData::new(id, display, resolved);
        state.cells.insert(id, vd.downgrade());
        vd
    }

    pub fn is_resolved(&self, id: VDataId) -> bool {
        self.lock().resolved.contains_key(&id)
    }

    pub fn resolved_value(&self, id: VDataId) -> Option<Value> {
        self.lock().resolved.get(&id).cloned()
    }

    /// Register a structural location. Placeholders it references that are
    /// already resolved are substituted right away.
    pub fn track(&self, holder: &Arc<dyn VDataHolder>) {
        let key = holder_key(holder);
        let refs = holder.refs();
        if refs.is_empty() {
            return;
        }

        let mut ready = Vec::new();
        {
            let mut state = self.lock();
            state.holders.insert(key, Arc::downgrade(holder));
            for id in refs {
                match state.resolved.get(&id) {
                    Some(value) => ready.push((id, value.clone())),
                    None => {
                        state.watching.entry(id).or_default().insert(key);
                    }
                }
            }
        }

        for (id, value) in ready {
            holder.substitute(id, &value);
        }
    }

    /// Resolve a placeholder and substitute it into every tracked location.
    ///
    /// Returns how many locations changed. A second resolution of the same
    /// id is refused with `AlreadyResolved`.
    pub fn resolve(&self, id: VDataId, value: Value) -> Result<usize, HushError> {
        let holders: Vec<Arc<dyn VDataHolder>> = {
            let mut state = self.lock();
            if state.resolved.contains_key(&id) {
                warn!(vdata_id = %id, "virtual data resolved twice");
                return Err(HushError::AlreadyResolved(id));
            }
            state.resolved.insert(id, value.clone());
            if let Some(cell) = state.cells.get(&id).and_then(Weak::upgrade) {
                VData::from_cell(cell).settle(value.clone());
            }

            let keys = state.watching.remove(&id).unwrap_or_default();
            let mut alive = Vec::with_capacity(keys.len());
            for key in keys {
                match state.holders.get(&key).and_then(Weak::upgrade) {
                    Some(holder) => alive.push(holder),
                    None => {
                        state.holders.remove(&key);
                    }
                }
            }
            alive
        };

        let mut changed = 0;
        for holder in holders {
            if holder.substitute(id, &value) {
                changed += 1;
            }
        }
        debug!(vdata_id = %id, locations = changed, "virtual data resolved");
        Ok(changed)
    }

    /// Drop bookkeeping nothing can observe anymore: dead holders and
    /// handles, watch lists of dropped holders, and display values of
    /// placeholders that are resolved or referenced by no live handle or
    /// location. Resolved values are kept, so resolution stays one-way.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        let mut state = self.lock();
        let RegistryState {
            cells,
            displays,
            resolved,
            holders,
            watching,
        } = &mut *state;
        let before = cells.len() + displays.len() + holders.len() + watching.len();

        holders.retain(|_, holder| holder.strong_count() > 0);
        watching.retain(|_, keys| {
            keys.retain(|key| holders.contains_key(key));
            !keys.is_empty()
        });
        cells.retain(|_, cell| cell.strong_count() > 0);
        displays.retain(|id, _| {
            !resolved.contains_key(id) && (cells.contains_key(id) || watching.contains_key(id))
        });

        let removed = before - (cells.len() + displays.len() + holders.len() + watching.len());
        if removed > 0 {
            debug!(removed, "registry pruned");
        }
        removed
    }

    /// Substitute every already-resolved token in `value`.
    pub fn substitute_resolved(&self, value: &mut Value) -> bool {
        let resolved = {
            let state = self.lock();
            let mut refs = BTreeSet::new();
            collect_refs(value, &mut refs);
            refs.into_iter()
                .filter_map(|id| state.resolved.get(&id).map(|v| (id, v.clone())))
                .collect::<HashMap<_, _>>()
        };
        if resolved.is_empty() {
            return false;
        }

        token::rewrite(value, &mut |token| match token {
            Token::VData(id) => match resolved.get(id) {
                Some(v) => Rewrite::Value(v.clone()),
                None => Rewrite::Keep,
            },
            Token::Expr(expr) => {
                let mut expr = expr.clone();
                let mut changed = false;
                for (id, v) in &resolved {
                    changed |= expr.substitute(*id, v);
                }
                if changed { settle(expr) } else { Rewrite::Keep }
            }
        })
    }

    /// Placeholders in `value` that have no real value yet.
    pub fn unresolved_refs(&self, value: &Value) -> BTreeSet<VDataId> {
        let mut refs = BTreeSet::new();
        collect_refs(value, &mut refs);
        let state = self.lock();
        refs.retain(|id| !state.resolved.contains_key(id));
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{SystemClock, UlidGenerator};
    use crate::vdata::token::vdata_token;
    use serde_json::json;

    fn registry() -> VDataRegistry {
        VDataRegistry::new(Arc::new(UlidGenerator::new(SystemClock)))
    }

    struct Slot(Mutex<Value>);

    impl VDataHolder for Slot {
        fn refs(&self) -> BTreeSet<VDataId> {
            let mut out = BTreeSet::new();
            collect_refs(&self.0.lock().unwrap(), &mut out);
            out
        }

        fn substitute(&self, id: VDataId, value: &Value) -> bool {
            token::substitute(&mut self.0.lock().unwrap(), id, value)
        }
    }

    #[test]
    fn create_allocates_unique_tokens() {
        let reg = registry();
        let a = reg.create(None);
        let b = reg.create(Some(json!("--")));
        assert_ne!(a.token(), b.token());
        assert_eq!(a.display(), &Value::Null);
        assert_eq!(b.display(), &json!("--"));
    }

    #[test]
    fn resolve_updates_tracked_locations_once() {
        let reg = registry();
        let vd = reg.create(None);
        let slot = Arc::new(Slot(Mutex::new(json!({"id": vd.token()}))));
        let holder: Arc<dyn VDataHolder> = slot.clone();
        reg.track(&holder);

        assert_eq!(reg.resolve(vd.id(), json!(7)).unwrap(), 1);
        assert_eq!(*slot.0.lock().unwrap(), json!({"id": 7}));
        assert!(vd.is_resolved());

        let err = reg.resolve(vd.id(), json!(8)).unwrap_err();
        assert_eq!(err, HushError::AlreadyResolved(vd.id()));
        assert_eq!(*slot.0.lock().unwrap(), json!({"id": 7}));
    }

    #[test]
    fn late_tracking_substitutes_immediately() {
        let reg = registry();
        let vd = reg.create(None);
        reg.resolve(vd.id(), json!("real")).unwrap();

        let slot = Arc::new(Slot(Mutex::new(json!([vd.token()]))));
        let holder: Arc<dyn VDataHolder> = slot.clone();
        reg.track(&holder);
        assert_eq!(*slot.0.lock().unwrap(), json!(["real"]));
    }

    #[test]
    fn virtual_response_leaves_become_placeholders() {
        let reg = registry();
        let resp = reg.create_virtual_response(Some(&json!({"id": "--", "tags": ["x"]})));
        assert_eq!(resp.produced.len(), 2);
        let pointers: Vec<_> = resp.produced.iter().map(|p| p.pointer.as_str()).collect();
        assert!(pointers.contains(&"/id"));
        assert!(pointers.contains(&"/tags/0"));
        assert_eq!(reg.display(&resp.value), json!({"id": "--", "tags": ["x"]}));

        let real = json!({"id": 1010, "tags": ["y"]});
        for p in &resp.produced {
            reg.resolve(p.id, p.pick(&real)).unwrap();
        }
        assert_eq!(reg.dehydrate(&resp.value).unwrap(), real);
    }

    #[test]
    fn scalar_default_is_one_root_placeholder() {
        let reg = registry();
        let resp = reg.create_virtual_response(None);
        assert_eq!(resp.produced.len(), 1);
        assert_eq!(resp.produced[0].pointer, "");
        assert!(resp.value.as_vdata().is_some());
    }

    #[test]
    fn hydrate_revives_handles() {
        let reg = registry();
        let vd = reg.create(Some(json!(0)));
        let id = vd.id();
        drop(vd);

        let live = reg.hydrate(&json!({"n": vdata_token(id)}));
        let n = live.get("n").and_then(VValue::as_vdata).unwrap();
        assert_eq!(n.id(), id);
        assert_eq!(n.display(), &json!(0));
    }

    #[test]
    fn display_json_reads_resolved_and_defaults() {
        let reg = registry();
        let a = reg.create(Some(json!("--")));
        let b = reg.create(Some(json!("--")));
        reg.resolve(b.id(), json!(2)).unwrap();
        let raw = json!({"a": a.token(), "b": b.token(), "url": format!("/x/{}", b.token())});
        assert_eq!(
            reg.display_json(&raw),
            json!({"a": "--", "b": 2, "url": "/x/2"})
        );
    }

    #[test]
    fn substitute_resolved_and_unresolved_refs() {
        let reg = registry();
        let a = reg.create(None);
        let b = reg.create(None);
        reg.resolve(a.id(), json!(1)).unwrap();

        let mut payload = json!({"a": a.token(), "b": b.token()});
        assert!(reg.substitute_resolved(&mut payload));
        assert_eq!(payload["a"], json!(1));
        assert_eq!(reg.unresolved_refs(&payload), BTreeSet::from([b.id()]));
    }

    #[test]
    fn parse_inverts_stringify() {
        let reg = registry();
        let vd = reg.create(None);
        let graph: VValue = [("id", VValue::from(vd.clone())), ("n", VValue::from(1))]
            .into_iter()
            .collect();
        let s = reg.stringify(&graph).unwrap();
        let back = reg.parse(&s);
        assert_eq!(reg.dehydrate(&back).unwrap(), reg.dehydrate(&graph).unwrap());

        let token = reg.stringify(&VValue::from(vd.clone())).unwrap();
        assert_eq!(reg.parse(&token).as_vdata().map(VData::id), Some(vd.id()));
    }

    #[rstest::rstest]
    #[case::number(VValue::from(5), "5")]
    #[case::negative(VValue::from(-1.5), "-1.5")]
    #[case::boolean(VValue::from(true), "true")]
    #[case::null(VValue::Null, "null")]
    #[case::numeric_string(VValue::from("5"), "5")]
    fn scalars_come_back_as_strings(#[case] graph: VValue, #[case] text: &str) {
        let reg = registry();
        let s = reg.stringify(&graph).unwrap();
        assert_eq!(s, text);
        assert_eq!(reg.parse(&s), VValue::String(text.to_string()));
    }

    #[test]
    fn prune_drops_unreachable_placeholders() {
        let reg = registry();
        let vd = reg.create(Some(json!("--")));
        let slot = Arc::new(Slot(Mutex::new(json!({"id": vd.token()}))));
        let holder: Arc<dyn VDataHolder> = slot.clone();
        reg.track(&holder);
        let id = vd.id();

        // 解決されないまま参照がすべて消える（中止・拒否されたタスクの応答）
        drop(vd);
        drop(holder);
        drop(slot);
        assert_eq!(reg.prune(), 4);

        let state = reg.lock();
        assert!(state.cells.is_empty());
        assert!(state.displays.is_empty());
        assert!(state.holders.is_empty());
        assert!(state.watching.is_empty());
        drop(state);

        assert_eq!(reg.prune(), 0);
        // 後から解決しても追跡先はない
        assert_eq!(reg.resolve(id, json!(1)).unwrap(), 0);
    }

    #[test]
    fn prune_keeps_what_is_still_shown() {
        let reg = registry();
        let vd = reg.create(Some(json!("--")));
        let token = vd.token();
        let slot = Arc::new(Slot(Mutex::new(json!([token.clone()]))));
        let holder: Arc<dyn VDataHolder> = slot.clone();
        reg.track(&holder);

        // ハンドルが消えても追跡中の場所がある限り表示値は残る
        drop(vd);
        reg.prune();
        assert_eq!(reg.display_json(&json!([token.clone()])), json!(["--"]));

        let id = reg.parse(&token).as_vdata().map(VData::id);
        assert!(id.is_some());
        assert_eq!(reg.resolve(id.unwrap(), json!(9)).unwrap(), 1);
        assert_eq!(*slot.0.lock().unwrap(), json!([9]));

        // 解決済みなら表示値は不要だが、二度目の解決は拒否される
        reg.prune();
        assert!(reg.lock().displays.is_empty());
        assert_eq!(reg.display_json(&json!(token.clone())), json!(9));
        assert!(matches!(
            reg.resolve(id.unwrap(), json!(10)),
            Err(HushError::AlreadyResolved(_))
        ));
    }
}
