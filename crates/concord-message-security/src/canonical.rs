//! Deterministic JSON canonicalization: object keys sorted lexicographically
//! at every nesting level, so that two payloads with the same data but
//! different property insertion order sign and verify identically.

use serde_json::Value;

/// Render `value` as a canonical UTF-8 JSON string: every object's keys are
/// sorted lexicographically, recursively, through arrays and nested objects.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string keys always serialize"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_canonical_form() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn nested_objects_and_arrays_are_canonicalized_recursively() {
        let value = json!({
            "outer": {"z": 1, "a": [{"y": 1, "x": 2}]},
        });
        let canon = canonicalize(&value);
        assert_eq!(canon, r#"{"outer":{"a":[{"x":2,"y":1}],"z":1}}"#);
    }
}
