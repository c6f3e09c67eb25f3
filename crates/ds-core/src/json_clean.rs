use serde_json::Value;

/// Recursively remove empty values from JSON-like payloads.
///
/// Empty means: null, whitespace-only strings, and objects/arrays that are
/// empty after pruning. Numbers (including 0) and booleans are preserved.
/// Returns `None` when the whole value prunes away.
pub fn prune_empty(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(Value::String(trimmed.to_string()))
            }
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = k.trim();
                if key.is_empty() {
                    continue;
                }
                if let Some(pruned) = prune_empty(v) {
                    out.insert(key.to_string(), pruned);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        Value::Array(items) => {
            let out: Vec<Value> = items.iter().filter_map(prune_empty).collect();
            if out.is_empty() {
                None
            } else {
                Some(Value::Array(out))
            }
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prunes_nulls_and_blank_strings() {
        let v = json!({"a": null, "b": "  ", "c": "keep", "d": 0, "e": false});
        let pruned = prune_empty(&v).unwrap();
        assert_eq!(pruned, json!({"c": "keep", "d": 0, "e": false}));
    }

    #[test]
    fn prunes_nested_empties() {
        let v = json!({"outer": {"inner": {"gone": ""}}, "list": [null, "", {"x": null}], "ok": [1]});
        let pruned = prune_empty(&v).unwrap();
        assert_eq!(pruned, json!({"ok": [1]}));
    }

    #[test]
    fn fully_empty_payload_prunes_to_none() {
        assert!(prune_empty(&json!({"a": {"b": null}})).is_none());
        assert!(prune_empty(&json!([])).is_none());
        assert!(prune_empty(&Value::Null).is_none());
    }

    #[test]
    fn trims_string_values_and_keys() {
        let v = json!({" name ": "  Ada  "});
        let pruned = prune_empty(&v).unwrap();
        assert_eq!(pruned, json!({"name": "Ada"}));
    }
}
