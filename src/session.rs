//! Session/context ledger: deterministic deep diff over JSON state trees.

use serde_json::{json, Value};

/// One change between two snapshots: dot-joined path, change type and the
/// before/after values. Lists that differ are reported wholesale.
pub fn diff_states(before: &Value, after: &Value) -> Vec<Value> {
    let mut changes = Vec::new();
    flatten_state_diff("", before, after, &mut changes);
    changes
}

fn flatten_state_diff(path: &str, before: &Value, after: &Value, changes: &mut Vec<Value>) {
    if let (Value::Object(before_map), Value::Object(after_map)) = (before, after) {
        let mut keys: Vec<&String> = before_map.keys().chain(after_map.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            let current_path = if path.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", path, key)
            };
            match (before_map.get(key), after_map.get(key)) {
                (None, Some(added)) => changes.push(json!({
                    "path": current_path,
                    "change_type": "added",
                    "before": Value::Null,
                    "after": added,
                })),
                (Some(removed), None) => changes.push(json!({
                    "path": current_path,
                    "change_type": "removed",
                    "before": removed,
                    "after": Value::Null,
                })),
                (Some(prev), Some(next)) => {
                    flatten_state_diff(&current_path, prev, next, changes)
                }
                (None, None) => {}
            }
        }
        return;
    }

    if before != after {
        changes.push(json!({
            "path": if path.is_empty() { "$" } else { path },
            "change_type": "changed",
            "before": before,
            "after": after,
        }));
    }
}
