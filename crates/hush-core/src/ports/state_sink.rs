//! State sink port: where loading/data/error updates of a bound state go.

use serde::Serialize;
use serde_json::Value;

use crate::error::HushError;

#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Loading(bool),
    Data {
        /// Dehydrated form, placeholders as tokens.
        raw: Value,
        /// What a UI renders: real values where known, display values elsewhere.
        display: Value,
    },
    Error(Option<HushError>),
}

/// Latest known view of one state key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateView {
    pub loading: bool,
    pub raw: Value,
    pub display: Value,
    #[serde(serialize_with = "error_text")]
    pub error: Option<HushError>,
}

fn error_text<S: serde::Serializer>(error: &Option<HushError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl StateView {
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Loading(loading) => self.loading = loading,
            StateUpdate::Data { raw, display } => {
                self.raw = raw;
                self.display = display;
            }
            StateUpdate::Error(error) => self.error = error,
        }
    }
}

pub trait StateSink: Send + Sync {
    fn publish(&self, key: &str, update: StateUpdate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn view_applies_updates() {
        let mut view = StateView::default();
        view.apply(StateUpdate::Loading(true));
        view.apply(StateUpdate::Data {
            raw: json!("[vd:x]"),
            display: json!("--"),
        });
        view.apply(StateUpdate::Error(Some(HushError::Vetoed)));
        assert!(view.loading);
        assert_eq!(view.display, json!("--"));
        assert_eq!(view.error, Some(HushError::Vetoed));

        let s = serde_json::to_value(&view).unwrap();
        assert!(s["error"].as_str().unwrap().contains("vetoed"));
    }
}
