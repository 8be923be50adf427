//! Virtual data: placeholders for values the server has not produced yet.
//!
//! - `value`: live graphs (`VValue`, `VData`, `LiveExpr`)
//! - `expr`: serializable derivation trees
//! - `token`: `[vd:..]` / `[vx:..]` tokens inside JSON
//! - `registry`: allocation, dehydration and resolution
//! - `state`: bound state cells and `update_state_effect`

mod expr;
mod registry;
mod state;
mod token;
mod value;

pub use expr::{BinaryOp, Coercion, Expression, apply_binary, apply_coercion, js_string, member_of};
pub use registry::{ProducedVData, VDataHolder, VDataRegistry, VirtualResponse};
pub use state::{StateCell, StateStore};
pub use token::{Token, collect_refs, contains_tokens, decode_expr, expr_token, parse_whole, substitute, vdata_token};
pub use value::{LiveExpr, VData, VValue};
