//! Filling a template in from request parameters.
//!
//! Recognised parameters:
//!
//! | Key         | Effect |
//! |-------------|--------|
//! | `message`   | Top-level `prompt`, and every `{{prompt}}` in node inputs. Falls back to `prompt`. |
//! | `style`     | Top-level `style`, and every `{{style}}` in node inputs. |
//! | `overrides` | `{node_id: {input: value}}` merged into existing nodes. |
//!
//! Anything else is kept in the run record but does not touch the document.

use serde_json::Value;
use studio_core::graph::WorkflowGraph;

/// Build the workflow document for one run from `template`.
pub fn build_workflow(template: &WorkflowGraph, parameters: &Value) -> WorkflowGraph {
    let mut graph = template.clone();

    let prompt = parameters
        .get("message")
        .or_else(|| parameters.get("prompt"));
    if let Some(prompt) = prompt {
        apply_field(&mut graph, "prompt", prompt);
    }
    if let Some(style) = parameters.get("style") {
        apply_field(&mut graph, "style", style);
    }

    if let Some(overrides) = parameters.get("overrides").and_then(Value::as_object) {
        for (node_id, inputs) in overrides {
            let Some(inputs) = inputs.as_object() else {
                tracing::warn!(node_id = %node_id, "Ignoring override that is not an object");
                continue;
            };
            for (input, value) in inputs {
                if !graph.set_input(node_id, input, value.clone()) {
                    tracing::debug!(node_id = %node_id, input = %input, "Override for unknown node ignored");
                }
            }
        }
    }

    graph
}

fn apply_field(graph: &mut WorkflowGraph, name: &str, value: &Value) {
    graph.set(name, value.clone());
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => return,
        other => other.to_string(),
    };
    graph.substitute(name, &text);
}
