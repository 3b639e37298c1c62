// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structured diagnostics for pipeline components.
//!
//! Components describe their configuration and counters into a tree of
//! named scopes. The tree renders to JSON for whatever sink collects it:
//!
//! ```text
//! {
//!   "consumerFactory": {
//!     "source": "batch",
//!     "consumerType": "Order",
//!     "timeLimit": "1s",
//!     "messageLimit": 10,
//!     "collector": { "batchesFormed": 4, ... }
//!   }
//! }
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::context::short_type_name;

/// Anything that can describe itself into a probe scope
pub trait Probe {
    fn probe(&self, scope: &mut ProbeScope);
}

#[derive(Debug, Clone, Default)]
pub struct ProbeScope {
    name: String,
    values: Map<String, Value>,
    scopes: Vec<ProbeScope>,
}

impl ProbeScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add<V: Serialize>(&mut self, key: &str, value: V) {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.values.insert(key.to_string(), value);
            }
            Err(e) => warn!("Failed to serialize probe value {key}: {e}"),
        }
    }

    pub fn create_scope(&mut self, name: impl Into<String>) -> &mut ProbeScope {
        self.scopes.push(ProbeScope::new(name));
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    /// Scope describing a consumer factory that builds consumers of type `C`
    pub fn create_consumer_factory_scope<C: ?Sized>(&mut self, source: &str) -> &mut ProbeScope {
        let scope = self.create_scope("consumerFactory");
        scope.add("source", source);
        scope.add("consumerType", short_type_name::<C>());
        scope
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn scope(&self, name: &str) -> Option<&ProbeScope> {
        self.scopes.iter().find(|scope| scope.name == name)
    }

    /// Renders the scope's values and children; repeated child names become arrays
    pub fn to_json(&self) -> Value {
        let mut map = self.values.clone();
        for child in &self.scopes {
            let value = child.to_json();
            match map.remove(&child.name) {
                None => {
                    map.insert(child.name.clone(), value);
                }
                Some(Value::Array(mut existing)) => {
                    existing.push(value);
                    map.insert(child.name.clone(), Value::Array(existing));
                }
                Some(existing) => {
                    map.insert(child.name.clone(), Value::Array(vec![existing, value]));
                }
            }
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Order;

    #[test]
    fn test_nested_scopes_render_to_json() {
        let mut root = ProbeScope::new("root");
        let factory = root.create_consumer_factory_scope::<Order>("batch");
        factory.add("messageLimit", 3);
        factory.create_scope("collector").add("batchesFormed", 2);

        assert_eq!(
            root.to_json(),
            json!({
                "consumerFactory": {
                    "source": "batch",
                    "consumerType": "Order",
                    "messageLimit": 3,
                    "collector": { "batchesFormed": 2 }
                }
            })
        );
    }

    #[test]
    fn test_repeated_scope_names_become_array() {
        let mut root = ProbeScope::new("root");
        root.create_scope("stage").add("id", 1);
        root.create_scope("stage").add("id", 2);
        root.create_scope("stage").add("id", 3);

        assert_eq!(
            root.to_json(),
            json!({ "stage": [{ "id": 1 }, { "id": 2 }, { "id": 3 }] })
        );
        assert_eq!(root.scope("stage").and_then(|s| s.get("id")), Some(&json!(1)));
    }
}
