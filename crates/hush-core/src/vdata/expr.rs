//! Derivation trees over placeholders.
//!
//! Computing with a value that is not known yet builds an `Expression`
//! instead of failing. The tree is serializable so it can travel inside
//! persisted payloads as a `[vx:..]` token, and is re-evaluated once every
//! placeholder it references has a real value.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::domain::VDataId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Gt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    String,
    Number,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum Expression {
    Literal {
        v: Value,
    },
    Ref {
        id: VDataId,
    },
    Binary {
        op: BinaryOp,
        l: Box<Expression>,
        r: Box<Expression>,
    },
    Coerce {
        to: Coercion,
        e: Box<Expression>,
    },
    Member {
        e: Box<Expression>,
        key: String,
    },
}

impl Expression {
    pub fn literal(v: Value) -> Self {
        Expression::Literal { v }
    }

    pub fn reference(id: VDataId) -> Self {
        Expression::Ref { id }
    }

    pub fn binary(op: BinaryOp, l: Expression, r: Expression) -> Self {
        Expression::Binary {
            op,
            l: Box::new(l),
            r: Box::new(r),
        }
    }

    pub fn coerce(to: Coercion, e: Expression) -> Self {
        Expression::Coerce { to, e: Box::new(e) }
    }

    pub fn member(e: Expression, key: impl Into<String>) -> Self {
        Expression::Member {
            e: Box::new(e),
            key: key.into(),
        }
    }

    /// Placeholders referenced anywhere in the tree.
    pub fn refs(&self) -> BTreeSet<VDataId> {
        let mut out = BTreeSet::new();
        self.collect_refs(&mut out);
        out
    }

    pub(crate) fn collect_refs(&self, out: &mut BTreeSet<VDataId>) {
        match self {
            Expression::Literal { .. } => {}
            Expression::Ref { id } => {
                out.insert(*id);
            }
            Expression::Binary { l, r, .. } => {
                l.collect_refs(out);
                r.collect_refs(out);
            }
            Expression::Coerce { e, .. } | Expression::Member { e, .. } => e.collect_refs(out),
        }
    }

    /// Evaluate the tree. `None` as soon as `lookup` cannot supply a referenced value.
    pub fn evaluate(&self, lookup: &dyn Fn(VDataId) -> Option<Value>) -> Option<Value> {
        match self {
            Expression::Literal { v } => Some(v.clone()),
            Expression::Ref { id } => lookup(*id),
            Expression::Binary { op, l, r } => {
                let l = l.evaluate(lookup)?;
                let r = r.evaluate(lookup)?;
                Some(apply_binary(*op, &l, &r))
            }
            Expression::Coerce { to, e } => Some(apply_coercion(*to, &e.evaluate(lookup)?)),
            Expression::Member { e, key } => Some(member_of(&e.evaluate(lookup)?, key)),
        }
    }

    /// Replace every `Ref { id }` with a literal. Returns whether anything changed.
    pub fn substitute(&mut self, id: VDataId, value: &Value) -> bool {
        match self {
            Expression::Literal { .. } => false,
            Expression::Ref { id: own } => {
                if *own == id {
                    *self = Expression::Literal { v: value.clone() };
                    true
                } else {
                    false
                }
            }
            Expression::Binary { l, r, .. } => {
                let left = l.substitute(id, value);
                let right = r.substitute(id, value);
                left || right
            }
            Expression::Coerce { e, .. } | Expression::Member { e, .. } => e.substitute(id, value),
        }
    }
}

// ========================================
// Value semantics (loosely JavaScript-like)
// ========================================

/// String form of a value, as used by concatenation and `Coercion::String`.
pub fn js_string(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format_number(f),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

pub(crate) fn to_number(v: &Value) -> f64 {
    match v {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

pub(crate) fn to_bool(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numbers that cannot be represented (NaN, infinities) become `null`.
pub(crate) fn number_value(f: f64) -> Value {
    if !f.is_finite() {
        return Value::Null;
    }
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        return Value::from(f as i64);
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn is_stringish(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Array(_) | Value::Object(_))
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => to_number(l) == to_number(r),
        _ => l == r,
    }
}

pub fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::Add if is_stringish(l) || is_stringish(r) => {
            Value::String(format!("{}{}", js_string(l), js_string(r)))
        }
        BinaryOp::Add => number_value(to_number(l) + to_number(r)),
        BinaryOp::Sub => number_value(to_number(l) - to_number(r)),
        BinaryOp::Mul => number_value(to_number(l) * to_number(r)),
        BinaryOp::Div => number_value(to_number(l) / to_number(r)),
        BinaryOp::Eq => Value::Bool(loose_eq(l, r)),
        BinaryOp::Ne => Value::Bool(!loose_eq(l, r)),
        BinaryOp::Lt | BinaryOp::Gt => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => to_number(l).partial_cmp(&to_number(r)),
            };
            let want = if op == BinaryOp::Lt {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            };
            Value::Bool(ordering == Some(want))
        }
    }
}

pub fn apply_coercion(to: Coercion, v: &Value) -> Value {
    match to {
        Coercion::String => Value::String(js_string(v)),
        Coercion::Number => number_value(to_number(v)),
        Coercion::Bool => Value::Bool(to_bool(v)),
    }
}

/// Property access: object keys, array indices, and `length`.
pub fn member_of(v: &Value, key: &str) -> Value {
    match v {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
        Value::Array(items) if key == "length" => Value::from(items.len()),
        Value::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Null),
        Value::String(s) if key == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}
