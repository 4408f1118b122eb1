// SPDX-License-Identifier: MIT
//! Capability sets and stereotype matching.
//!
//! A capability set is an immutable ordered mapping from string keys to
//! JSON-valued leaves. Equality is structural; merge is right-biased per key.
//! A request matches a slot's stereotype iff every non-null requested
//! capability equals the stereotype's value — browser and platform names
//! compare case-insensitively, and a requested platform of `"any"` matches
//! every stereotype.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from a JSON value; `None` unless the value is an object.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(|m| Self(m.clone()))
    }

    /// Builder-style insert, used heavily in tests and stereotype literals.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Right-biased merge: keys from `overlay` win over keys from `self`.
    pub fn merge(&self, overlay: &Capabilities) -> Capabilities {
        let mut out = self.0.clone();
        for (k, v) in &overlay.0 {
            out.insert(k.clone(), v.clone());
        }
        Self(out)
    }

    /// Whether this requested capability set is satisfied by `stereotype`.
    ///
    /// Every non-null requested key must be present in the stereotype with a
    /// matching value; extra stereotype keys are fine.
    pub fn satisfied_by(&self, stereotype: &Capabilities) -> bool {
        self.0.iter().all(|(key, requested)| {
            if requested.is_null() {
                return true;
            }
            match stereotype.get(key) {
                Some(advertised) => values_match(key, requested, advertised),
                None => false,
            }
        })
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

impl FromIterator<(String, Value)> for Capabilities {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Keys whose string values are compared without case sensitivity.
const CASELESS_KEYS: &[&str] = &["browserName", "platformName"];

fn values_match(key: &str, requested: &Value, advertised: &Value) -> bool {
    if let (Value::String(req), Value::String(adv)) = (requested, advertised) {
        if key == "platformName" && req.eq_ignore_ascii_case("any") {
            return true;
        }
        if CASELESS_KEYS.contains(&key) {
            return req.eq_ignore_ascii_case(adv);
        }
    }
    requested == advertised
}
