//! Placeholder tokens inside JSON graphs.
//!
//! - `[vd:<ulid>]` stands for one placeholder.
//! - `[vx:<base64url(json(expression))>]` stands for a derivation tree.
//!
//! A token may be a whole JSON string, or be embedded inside a longer string
//! (a URL fragment, a composite map key). Malformed tokens are left as text.

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use tracing::warn;

use super::expr::{Expression, js_string};
use crate::domain::VDataId;
use crate::error::HushError;

const VD_OPEN: &str = "[vd:";
const VX_OPEN: &str = "[vx:";

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    VData(VDataId),
    Expr(Expression),
}

pub fn vdata_token(id: VDataId) -> String {
    format!("{VD_OPEN}{}]", id.as_ulid())
}

pub fn expr_token(expr: &Expression) -> Result<String, HushError> {
    let json = serde_json::to_vec(expr)?;
    Ok(format!("{VX_OPEN}{}]", URL_SAFE_NO_PAD.encode(json)))
}

pub fn decode_expr(payload: &str) -> Result<Expression, HushError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| HushError::MalformedToken(format!("{payload}: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| HushError::MalformedToken(format!("{payload}: {e}")))
}

/// The token `s` consists of, if it is exactly one token.
pub fn parse_whole(s: &str) -> Option<Token> {
    match token_at(s) {
        Some((token, len)) if len == s.len() => Some(token),
        _ => None,
    }
}

pub(crate) enum Segment<'a> {
    Text(&'a str),
    Token { token: Token, raw: &'a str },
}

pub(crate) fn segments(s: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = s[cursor..].find('[') {
        let start = cursor + offset;
        match token_at(&s[start..]) {
            Some((token, len)) => {
                if text_start < start {
                    out.push(Segment::Text(&s[text_start..start]));
                }
                out.push(Segment::Token {
                    token,
                    raw: &s[start..start + len],
                });
                cursor = start + len;
                text_start = cursor;
            }
            None => cursor = start + 1,
        }
    }

    if text_start < s.len() {
        out.push(Segment::Text(&s[text_start..]));
    }
    out
}

fn token_at(s: &str) -> Option<(Token, usize)> {
    let (is_expr, rest) = if let Some(rest) = s.strip_prefix(VD_OPEN) {
        (false, rest)
    } else if let Some(rest) = s.strip_prefix(VX_OPEN) {
        (true, rest)
    } else {
        return None;
    };

    let end = rest.find(']')?;
    let payload = &rest[..end];
    let len = VD_OPEN.len() + end + 1;

    let token = if is_expr {
        Token::Expr(decode_expr(payload).ok()?)
    } else {
        Token::VData(VDataId::parse_ulid(payload)?)
    };
    Some((token, len))
}

fn has_token(s: &str) -> bool {
    segments(s)
        .iter()
        .any(|seg| matches!(seg, Segment::Token { .. }))
}

pub fn contains_tokens(value: &Value) -> bool {
    match value {
        Value::String(s) => has_token(s),
        Value::Array(items) => items.iter().any(contains_tokens),
        Value::Object(map) => map.iter().any(|(k, v)| has_token(k) || contains_tokens(v)),
        _ => false,
    }
}

// ========================================
// Walks
// ========================================

/// Placeholder ids referenced by `value`, including through expressions.
pub fn collect_refs(value: &Value, out: &mut BTreeSet<VDataId>) {
    let mut visit = |s: &str| {
        for seg in segments(s) {
            match seg {
                Segment::Token {
                    token: Token::VData(id),
                    ..
                } => {
                    out.insert(id);
                }
                Segment::Token {
                    token: Token::Expr(expr),
                    ..
                } => expr.collect_refs(out),
                Segment::Text(_) => {}
            }
        }
    };
    walk_strings(value, &mut visit);
}

fn walk_strings(value: &Value, visit: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|v| walk_strings(v, visit)),
        Value::Object(map) => {
            for (k, v) in map {
                visit(k);
                walk_strings(v, visit);
            }
        }
        _ => {}
    }
}

/// What to put in place of one token.
pub(crate) enum Rewrite {
    Keep,
    /// Whole-string tokens become this value; embedded ones its string form.
    Value(Value),
    /// Another token (an expression that still has unresolved refs).
    Text(String),
}

/// Rewrite every token in `value`. Returns whether anything changed.
pub(crate) fn rewrite(value: &mut Value, f: &mut dyn FnMut(&Token) -> Rewrite) -> bool {
    match value {
        Value::String(s) => match rewrite_str(s, f) {
            Some(new) => {
                *value = new;
                true
            }
            None => false,
        },
        Value::Array(items) => {
            let mut changed = false;
            for item in items.iter_mut() {
                changed |= rewrite(item, f);
            }
            changed
        }
        Value::Object(map) => {
            let mut changed = false;
            if map.keys().any(|k| has_token(k)) {
                let old = std::mem::take(map);
                for (key, mut v) in old {
                    changed |= rewrite(&mut v, f);
                    let key = match rewrite_str(&key, f) {
                        Some(Value::String(new)) => {
                            changed = true;
                            new
                        }
                        Some(other) => {
                            changed = true;
                            js_string(&other)
                        }
                        None => key,
                    };
                    map.insert(key, v);
                }
            } else {
                for v in map.values_mut() {
                    changed |= rewrite(v, f);
                }
            }
            changed
        }
        _ => false,
    }
}

fn rewrite_str(s: &str, f: &mut dyn FnMut(&Token) -> Rewrite) -> Option<Value> {
    let segs = segments(s);
    if !segs.iter().any(|seg| matches!(seg, Segment::Token { .. })) {
        return None;
    }

    if let [Segment::Token { token, .. }] = segs.as_slice() {
        return match f(token) {
            Rewrite::Keep => None,
            Rewrite::Value(v) => Some(v),
            Rewrite::Text(t) => Some(Value::String(t)),
        };
    }

    let mut changed = false;
    let mut out = String::with_capacity(s.len());
    for seg in &segs {
        match seg {
            Segment::Text(text) => out.push_str(text),
            Segment::Token { token, raw } => match f(token) {
                Rewrite::Keep => out.push_str(raw),
                Rewrite::Value(v) => {
                    changed = true;
                    out.push_str(&js_string(&v));
                }
                Rewrite::Text(t) => {
                    changed = true;
                    out.push_str(&t);
                }
            },
        }
    }
    changed.then_some(Value::String(out))
}

/// Evaluate an expression that may have lost all of its refs, or re-encode it.
pub(crate) fn settle(expr: Expression) -> Rewrite {
    if expr.refs().is_empty() {
        return Rewrite::Value(expr.evaluate(&|_| None).unwrap_or(Value::Null));
    }
    match expr_token(&expr) {
        Ok(token) => Rewrite::Text(token),
        Err(err) => {
            warn!(error = %err, "failed to re-encode expression token");
            Rewrite::Keep
        }
    }
}

/// Replace placeholder `id` with `real` everywhere in `value`.
pub fn substitute(value: &mut Value, id: VDataId, real: &Value) -> bool {
    rewrite(value, &mut |token| match token {
        Token::VData(own) if *own == id => Rewrite::Value(real.clone()),
        Token::Expr(expr) if expr.refs().contains(&id) => {
            let mut expr = expr.clone();
            expr.substitute(id, real);
            settle(expr)
        }
        _ => Rewrite::Keep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdata::expr::BinaryOp;
    use serde_json::json;
    use ulid::Ulid;

    fn new_id() -> VDataId {
        VDataId::from_ulid(Ulid::new())
    }

    #[test]
    fn whole_token_parses() {
        let id = new_id();
        assert_eq!(parse_whole(&vdata_token(id)), Some(Token::VData(id)));
        assert_eq!(parse_whole(&format!("x{}", vdata_token(id))), None);
        assert_eq!(parse_whole("[vd:nope]"), None);
    }

    #[test]
    fn embedded_tokens_are_found() {
        let a = new_id();
        let b = new_id();
        let s = json!({
            "url": format!("/detail/{}", vdata_token(a)),
            format!("k-{}", vdata_token(b)): 1,
        });
        let mut refs = BTreeSet::new();
        collect_refs(&s, &mut refs);
        assert_eq!(refs, BTreeSet::from([a, b]));
        assert!(contains_tokens(&s));
        assert!(!contains_tokens(&json!({"url": "/detail/[vd:]"})));
    }

    #[test]
    fn substitute_whole_and_embedded() {
        let id = new_id();
        let token = vdata_token(id);
        let mut v = json!({
            "id": token.clone(),
            "url": format!("/detail/{token}"),
            "list": [token.clone(), "keep"],
        });
        assert!(substitute(&mut v, id, &json!(1010)));
        assert_eq!(
            v,
            json!({"id": 1010, "url": "/detail/1010", "list": [1010, "keep"]})
        );
        assert!(!substitute(&mut v, id, &json!(1010)));
    }

    #[test]
    fn substitute_settles_expressions() {
        let a = new_id();
        let b = new_id();
        let expr = Expression::binary(
            BinaryOp::Add,
            Expression::reference(a),
            Expression::reference(b),
        );
        let mut v = json!({ "sum": expr_token(&expr).unwrap() });

        assert!(substitute(&mut v, a, &json!(1)));
        // still waiting on b
        let remaining = parse_whole(v["sum"].as_str().unwrap()).unwrap();
        match remaining {
            Token::Expr(e) => assert_eq!(e.refs(), BTreeSet::from([b])),
            Token::VData(_) => panic!("expected an expression token"),
        }

        assert!(substitute(&mut v, b, &json!(2)));
        assert_eq!(v, json!({"sum": 3}));
    }

    #[test]
    fn substitute_rewrites_keys() {
        let id = new_id();
        let mut v = json!({ format!("row-{}", vdata_token(id)): true });
        assert!(substitute(&mut v, id, &json!("7")));
        assert_eq!(v, json!({"row-7": true}));
    }

    #[test]
    fn malformed_expression_token_is_text() {
        assert!(decode_expr("!!!").is_err());
        assert!(!contains_tokens(&json!("[vx:!!!]")));
    }
}
