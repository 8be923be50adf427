//! Method descriptor: the serializable description of one request.
//!
//! Payload fields may carry dehydrated placeholder tokens (`[vd:..]`, `[vx:..]`),
//! both as whole strings and embedded in longer strings such as the URL.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
            Verb::Head => "HEAD",
            Verb::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    #[serde(rename = "type")]
    pub verb: Verb,

    pub url: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub headers: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Optional name used to look tasks up in the queue store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Ask the transport to bypass any response cache it keeps.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl MethodDescriptor {
    pub fn new(verb: Verb, url: impl Into<String>) -> Self {
        Self {
            verb,
            url: url.into(),
            params: Map::new(),
            headers: Map::new(),
            data: Value::Null,
            name: None,
            force: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Verb::Get, url)
    }

    pub fn post(url: impl Into<String>, data: Value) -> Self {
        Self::new(Verb::Post, url).with_data(data)
    }

    pub fn put(url: impl Into<String>, data: Value) -> Self {
        Self::new(Verb::Put, url).with_data(data)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Verb::Delete, url)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// State key for this method: verb, url and params.
    ///
    /// Hooks publish their state under this key, and `update_state_effect`
    /// looks states up by it.
    pub fn key(&self) -> String {
        if self.params.is_empty() {
            format!("{} {}", self.verb, self.url)
        } else {
            // Map is ordered, so the key is stable.
            format!("{} {} {}", self.verb, self.url, Value::Object(self.params.clone()))
        }
    }

    /// Every string-bearing part of the payload, for token scans.
    pub(crate) fn parts(&self) -> [Value; 4] {
        [
            Value::String(self.url.clone()),
            Value::Object(self.params.clone()),
            Value::Object(self.headers.clone()),
            self.data.clone(),
        ]
    }

    /// Apply `f` to every payload part in place. Returns true if anything changed.
    pub(crate) fn rewrite(&mut self, mut f: impl FnMut(&mut Value) -> bool) -> bool {
        let mut changed = false;

        let mut url = Value::String(std::mem::take(&mut self.url));
        changed |= f(&mut url);
        self.url = match url {
            Value::String(s) => s,
            other => crate::vdata::js_string(&other),
        };

        let mut params = Value::Object(std::mem::take(&mut self.params));
        changed |= f(&mut params);
        if let Value::Object(map) = params {
            self.params = map;
        }

        let mut headers = Value::Object(std::mem::take(&mut self.headers));
        changed |= f(&mut headers);
        if let Value::Object(map) = headers {
            self.headers = map;
        }

        changed |= f(&mut self.data);
        changed
    }
}
