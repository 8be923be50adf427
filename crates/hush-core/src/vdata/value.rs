//! Live value graphs that may contain placeholders.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::sync::{Arc, OnceLock, Weak};

use serde_json::{Map, Number, Value};

use super::expr::{BinaryOp, Coercion, Expression, apply_binary, apply_coercion, js_string};
use super::token::{expr_token, vdata_token};
use crate::domain::VDataId;
use crate::error::HushError;

pub(crate) struct VDataCell {
    id: VDataId,
    display: Value,
    resolved: OnceLock<Value>,
}

/// Shared handle to one placeholder.
///
/// The resolved value is set at most once, by `VDataRegistry::resolve`.
#[derive(Clone)]
pub struct VData(Arc<VDataCell>);

impl VData {
    pub(crate) fn new(id: VDataId, display: Value, resolved: Option<Value>) -> Self {
        let cell = VDataCell {
            id,
            display,
            resolved: OnceLock::new(),
        };
        if let Some(value) = resolved {
            let _ = cell.resolved.set(value);
        }
        Self(Arc::new(cell))
    }

    pub(crate) fn downgrade(&self) -> Weak<VDataCell> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn from_cell(cell: Arc<VDataCell>) -> Self {
        Self(cell)
    }

    /// Returns false if a value was already set.
    pub(crate) fn settle(&self, value: Value) -> bool {
        self.0.resolved.set(value).is_ok()
    }

    pub fn id(&self) -> VDataId {
        self.0.id
    }

    pub fn token(&self) -> String {
        vdata_token(self.0.id)
    }

    /// Value shown while unresolved.
    pub fn display(&self) -> &Value {
        &self.0.display
    }

    pub fn get(&self) -> Option<&Value> {
        self.0.resolved.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.0.resolved.get().is_some()
    }

    /// Resolved value, or the display value while unresolved.
    pub fn current(&self) -> Value {
        self.get().unwrap_or(&self.0.display).clone()
    }
}

impl PartialEq for VData {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl fmt::Debug for VData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VData")
            .field("id", &self.0.id)
            .field("resolved", &self.0.resolved.get())
            .finish()
    }
}

/// A derivation tree plus handles to the placeholders it references.
#[derive(Clone)]
pub struct LiveExpr {
    expr: Arc<Expression>,
    deps: Arc<[VData]>,
}

impl LiveExpr {
    pub(crate) fn new(expr: Expression, mut deps: Vec<VData>) -> Self {
        deps.sort_by_key(VData::id);
        deps.dedup_by_key(|d| d.id());
        Self {
            expr: Arc::new(expr),
            deps: deps.into(),
        }
    }

    pub fn expression(&self) -> &Expression {
        &self.expr
    }

    pub fn deps(&self) -> &[VData] {
        &self.deps
    }

    fn lookup(&self, id: VDataId) -> Option<&VData> {
        self.deps.iter().find(|d| d.id() == id)
    }

    /// The value, if every dependency is resolved.
    pub fn value(&self) -> Option<Value> {
        self.expr
            .evaluate(&|id| self.lookup(id).and_then(|d| d.get().cloned()))
    }

    fn display(&self) -> Value {
        self.expr
            .evaluate(&|id| self.lookup(id).map(VData::current))
            .unwrap_or(Value::Null)
    }

    /// Tree with every resolved dependency inlined as a literal.
    fn partially_resolved(&self) -> Expression {
        let mut expr = (*self.expr).clone();
        for dep in self.deps.iter() {
            if let Some(value) = dep.get() {
                expr.substitute(dep.id(), value);
            }
        }
        expr
    }
}

impl PartialEq for LiveExpr {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl fmt::Debug for LiveExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveExpr")
            .field("expr", &self.expr)
            .field("deps", &self.deps.len())
            .finish()
    }
}

/// A value graph in application code.
///
/// Plain JSON plus two live variants: a placeholder, and a computation over
/// placeholders. Arithmetic, comparison, coercion and member access on a
/// live value build a new `Expr` instead of failing.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum VValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<VValue>),
    Object(BTreeMap<String, VValue>),
    Virtual(VData),
    Expr(LiveExpr),
}

impl VValue {
    /// True if a placeholder appears anywhere in the graph.
    pub fn is_live(&self) -> bool {
        match self {
            VValue::Virtual(_) | VValue::Expr(_) => true,
            VValue::Array(items) => items.iter().any(VValue::is_live),
            VValue::Object(map) => map.values().any(VValue::is_live),
            _ => false,
        }
    }

    pub fn as_vdata(&self) -> Option<&VData> {
        match self {
            VValue::Virtual(vd) => Some(vd),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&VValue> {
        match self {
            VValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Token-preserving structural copy.
    ///
    /// Unresolved placeholders become `[vd:..]` tokens, unresolved
    /// computations `[vx:..]` tokens; resolved ones become their real values.
    pub fn dehydrate(&self) -> Result<Value, HushError> {
        Ok(match self {
            VValue::Null => Value::Null,
            VValue::Bool(b) => Value::Bool(*b),
            VValue::Number(n) => Value::Number(n.clone()),
            VValue::String(s) => Value::String(s.clone()),
            VValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(VValue::dehydrate)
                    .collect::<Result<_, _>>()?,
            ),
            VValue::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.dehydrate()?);
                }
                Value::Object(out)
            }
            VValue::Virtual(vd) => match vd.get() {
                Some(value) => value.clone(),
                None => Value::String(vd.token()),
            },
            VValue::Expr(live) => match live.value() {
                Some(value) => value,
                None => Value::String(expr_token(&live.partially_resolved())?),
            },
        })
    }

    /// What a UI shows: real values where known, display values elsewhere.
    pub fn display(&self) -> Value {
        match self {
            VValue::Null => Value::Null,
            VValue::Bool(b) => Value::Bool(*b),
            VValue::Number(n) => Value::Number(n.clone()),
            VValue::String(s) => Value::String(s.clone()),
            VValue::Array(items) => Value::Array(items.iter().map(VValue::display).collect()),
            VValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.display()))
                    .collect(),
            ),
            VValue::Virtual(vd) => vd.current(),
            VValue::Expr(live) => live.display(),
        }
    }

    /// Deterministic string form, usable as a map key or URL fragment.
    ///
    /// Strings and placeholders render as their (token) text, everything
    /// else as the JSON text of its dehydrated form. `5` and `"5"` both
    /// render as `5`, so `VDataRegistry::parse` returns top-level numbers,
    /// booleans and `null` as strings.
    pub fn stringify(&self) -> Result<String, HushError> {
        match self.dehydrate()? {
            Value::String(s) => Ok(s),
            other => Ok(serde_json::to_string(&other)?),
        }
    }

    fn operand(&self) -> (Expression, Vec<VData>) {
        match self {
            VValue::Virtual(vd) => match vd.get() {
                Some(value) => (Expression::literal(value.clone()), Vec::new()),
                None => (Expression::reference(vd.id()), vec![vd.clone()]),
            },
            VValue::Expr(live) => ((*live.expr).clone(), live.deps.to_vec()),
            other => (Expression::literal(other.display()), Vec::new()),
        }
    }

    fn derive(expr: Expression, deps: Vec<VData>) -> VValue {
        let live = LiveExpr::new(expr, deps);
        match live.value() {
            Some(value) => VValue::from(value),
            None => VValue::Expr(live),
        }
    }

    pub fn binary(&self, op: BinaryOp, rhs: &VValue) -> VValue {
        let (l, mut deps) = self.operand();
        let (r, rdeps) = rhs.operand();
        if deps.is_empty() && rdeps.is_empty() {
            if let (Expression::Literal { v: l }, Expression::Literal { v: r }) = (&l, &r) {
                return VValue::from(apply_binary(op, l, r));
            }
        }
        deps.extend(rdeps);
        Self::derive(Expression::binary(op, l, r), deps)
    }

    pub fn coerce(&self, to: Coercion) -> VValue {
        let (e, deps) = self.operand();
        if let (true, Expression::Literal { v }) = (deps.is_empty(), &e) {
            return VValue::from(apply_coercion(to, v));
        }
        Self::derive(Expression::coerce(to, e), deps)
    }

    /// Property access. Plain objects and arrays are indexed directly.
    pub fn member(&self, key: &str) -> VValue {
        match self {
            VValue::Object(map) => map.get(key).cloned().unwrap_or_default(),
            VValue::Array(items) => match key.parse::<usize>() {
                Ok(i) => items.get(i).cloned().unwrap_or_default(),
                Err(_) if key == "length" => VValue::from(items.len()),
                Err(_) => VValue::Null,
            },
            VValue::Virtual(_) | VValue::Expr(_) => {
                let (e, deps) = self.operand();
                Self::derive(Expression::member(e, key), deps)
            }
            other => VValue::from(super::expr::member_of(&other.display(), key)),
        }
    }

    pub fn to_js_string(&self) -> VValue {
        self.coerce(Coercion::String)
    }

    pub fn eq_value(&self, rhs: &VValue) -> VValue {
        self.binary(BinaryOp::Eq, rhs)
    }

    pub fn ne_value(&self, rhs: &VValue) -> VValue {
        self.binary(BinaryOp::Ne, rhs)
    }

    pub fn lt(&self, rhs: &VValue) -> VValue {
        self.binary(BinaryOp::Lt, rhs)
    }

    pub fn gt(&self, rhs: &VValue) -> VValue {
        self.binary(BinaryOp::Gt, rhs)
    }

    /// Plain string form for values without placeholders.
    pub fn as_text(&self) -> String {
        js_string(&self.display())
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for VValue {
            type Output = VValue;
            fn $method(self, rhs: VValue) -> VValue {
                self.binary($op, &rhs)
            }
        }

        impl<'a> $trait<&'a VValue> for &'a VValue {
            type Output = VValue;
            fn $method(self, rhs: &'a VValue) -> VValue {
                self.binary($op, rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

// ========================================
// Conversions
// ========================================

impl From<Value> for VValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => VValue::Null,
            Value::Bool(b) => VValue::Bool(b),
            Value::Number(n) => VValue::Number(n),
            Value::String(s) => VValue::String(s),
            Value::Array(items) => VValue::Array(items.into_iter().map(VValue::from).collect()),
            Value::Object(map) => {
                VValue::Object(map.into_iter().map(|(k, v)| (k, VValue::from(v))).collect())
            }
        }
    }
}

impl From<VData> for VValue {
    fn from(vd: VData) -> Self {
        VValue::Virtual(vd)
    }
}

impl From<&str> for VValue {
    fn from(s: &str) -> Self {
        VValue::String(s.to_string())
    }
}

impl From<String> for VValue {
    fn from(s: String) -> Self {
        VValue::String(s)
    }
}

impl From<bool> for VValue {
    fn from(b: bool) -> Self {
        VValue::Bool(b)
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for VValue {
                fn from(n: $ty) -> Self {
                    VValue::Number(n.into())
                }
            }
        )*
    };
}

impl_from_int!(i32, i64, u32, u64, usize);

impl From<f64> for VValue {
    fn from(f: f64) -> Self {
        VValue::from(super::expr::number_value(f))
    }
}

impl From<Vec<VValue>> for VValue {
    fn from(items: Vec<VValue>) -> Self {
        VValue::Array(items)
    }
}

impl<K: Into<String>> FromIterator<(K, VValue)> for VValue {
    fn from_iter<I: IntoIterator<Item = (K, VValue)>>(iter: I) -> Self {
        VValue::Object(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdata::token::{Token, parse_whole};
    use serde_json::json;
    use ulid::Ulid;

    fn placeholder(display: Value) -> VData {
        VData::new(VDataId::from_ulid(Ulid::new()), display, None)
    }

    #[test]
    fn plain_values_compute_eagerly() {
        let v = VValue::from(2) + VValue::from(3);
        assert_eq!(v, VValue::from(5));
        let s = VValue::from("id-") + VValue::from(7);
        assert_eq!(s, VValue::from("id-7"));
    }

    #[test]
    fn placeholder_arithmetic_builds_expression() {
        let vd = placeholder(json!(0));
        let v = VValue::from(vd.clone()) + VValue::from(1);
        let VValue::Expr(live) = &v else {
            panic!("expected a live expression, got {v:?}");
        };
        assert_eq!(live.deps().len(), 1);
        assert_eq!(v.display(), json!(1));

        assert!(vd.settle(json!(41)));
        assert_eq!(v.dehydrate().unwrap(), json!(42));
    }

    #[test]
    fn dehydrate_uses_tokens_until_resolved() {
        let vd = placeholder(json!("--"));
        let graph: VValue = [
            ("id", VValue::from(vd.clone())),
            ("text", VValue::from("hi")),
        ]
        .into_iter()
        .collect();

        let dry = graph.dehydrate().unwrap();
        assert_eq!(dry, json!({"id": vd.token(), "text": "hi"}));
        assert_eq!(graph.display(), json!({"id": "--", "text": "hi"}));

        vd.settle(json!(9));
        assert_eq!(graph.dehydrate().unwrap(), json!({"id": 9, "text": "hi"}));
    }

    #[test]
    fn url_built_from_placeholder_is_an_expression_token() {
        let vd = placeholder(Value::Null);
        let url = VValue::from("/detail/") + VValue::from(vd.clone());
        let s = url.stringify().unwrap();
        match parse_whole(&s) {
            Some(Token::Expr(expr)) => assert!(expr.refs().contains(&vd.id())),
            other => panic!("expected an expression token, got {other:?}"),
        }

        vd.settle(json!(1010));
        assert_eq!(url.stringify().unwrap(), "/detail/1010");
    }

    #[test]
    fn member_on_placeholder_is_lazy() {
        let vd = placeholder(json!({"id": "--"}));
        let id = VValue::from(vd.clone()).member("id");
        assert!(id.is_live());
        assert_eq!(id.display(), json!("--"));
        vd.settle(json!({"id": 5}));
        assert_eq!(id.dehydrate().unwrap(), json!(5));
    }

    #[test]
    fn comparisons_and_coercion() {
        assert_eq!(VValue::from(1).lt(&VValue::from(2)), VValue::from(true));
        assert_eq!(VValue::from(3).to_js_string(), VValue::from("3"));
        let vd = placeholder(Value::Null);
        assert!(VValue::from(vd).eq_value(&VValue::from(1)).is_live());
    }
}
