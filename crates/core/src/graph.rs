//! Workflow documents in the ComfyUI node-graph format.
//!
//! A workflow is a JSON object mapping node IDs to node descriptors:
//!
//! ```json
//! { "3": { "class_type": "KSampler", "inputs": { "seed": 1, "model": ["4", 0] } } }
//! ```
//!
//! The graph is treated as opaque apart from a few helpers for filling in
//! caller-supplied values. No schema is enforced.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// A workflow document: node ID -> node descriptor, plus whatever extra
/// top-level keys a template carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph(Map<String, Value>);

impl WorkflowGraph {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value. Only objects are valid workflow documents.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::Validation(format!(
                "Workflow document must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert or overwrite a top-level key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `value` looks like a node descriptor (an object with a
    /// string `class_type`).
    pub fn is_node(value: &Value) -> bool {
        value.get("class_type").is_some_and(Value::is_string)
    }

    /// IDs of every entry that is a node descriptor.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, v)| Self::is_node(v))
            .map(|(k, _)| k.as_str())
    }

    pub fn class_type(&self, node_id: &str) -> Option<&str> {
        self.0.get(node_id)?.get("class_type")?.as_str()
    }

    /// Set a single input on an existing node.
    ///
    /// Returns `false` (and changes nothing) when `node_id` is not a node in
    /// this graph. A node without an `inputs` object gets one.
    pub fn set_input(&mut self, node_id: &str, input: &str, value: Value) -> bool {
        let Some(node) = self.0.get_mut(node_id) else {
            return false;
        };
        if !Self::is_node(node) {
            return false;
        }
        let Some(node) = node.as_object_mut() else {
            return false;
        };
        let inputs = node
            .entry("inputs")
            .or_insert_with(|| Value::Object(Map::new()));
        if !inputs.is_object() {
            *inputs = Value::Object(Map::new());
        }
        if let Some(inputs) = inputs.as_object_mut() {
            inputs.insert(input.to_string(), value);
        }
        true
    }

    /// Replace every `{{name}}` token found in string values of node inputs.
    ///
    /// Returns the number of strings that were rewritten.
    pub fn substitute(&mut self, name: &str, replacement: &str) -> usize {
        let token = format!("{{{{{name}}}}}");
        let mut count = 0;
        for node in self.0.values_mut() {
            if !Self::is_node(node) {
                continue;
            }
            if let Some(inputs) = node.get_mut("inputs") {
                count += substitute_in(inputs, &token, replacement);
            }
        }
        count
    }

    /// The document as sent to the server: node descriptors only.
    ///
    /// Extra top-level keys (such as `prompt` or `style` written from
    /// request parameters) are kept on disk but the server rejects them.
    pub fn submittable(&self) -> Value {
        let nodes: Map<String, Value> = self
            .0
            .iter()
            .filter(|(_, v)| Self::is_node(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(nodes)
    }
}

fn substitute_in(value: &mut Value, token: &str, replacement: &str) -> usize {
    match value {
        Value::String(s) if s.contains(token) => {
            *s = s.replace(token, replacement);
            1
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|v| substitute_in(v, token, replacement))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|v| substitute_in(v, token, replacement))
            .sum(),
        _ => 0,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
