//! Deep removal of sensitive fields from a JSON value before it is logged
//! or surfaced to a UI layer. Fail-safe: any unexpected shape returns the
//! original value unchanged rather than erroring.

use serde_json::Value;

/// Field names stripped at every nesting level by [`sanitize`].
pub const SENSITIVE_FIELDS: &[&str] = &["apiKey", "token", "secret", "password", "credentials"];

/// Return a deep copy of `value` with every object property whose name is
/// in [`SENSITIVE_FIELDS`] removed, at any nesting depth including inside
/// arrays.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (key, val) in map {
                if SENSITIVE_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                cleaned.insert(key.clone(), sanitize(val));
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn removes_sensitive_fields_at_top_level() {
        let out = sanitize(&json!({"token": "abc", "keep": 1}));
        assert_eq!(out, json!({"keep": 1}));
    }

    #[test]
    fn removes_sensitive_fields_nested_in_objects_and_arrays() {
        let value = json!({
            "user": {"password": "p", "name": "x"},
            "items": [{"secret": "s"}, {"keep": true}],
        });
        let out = sanitize(&value);
        assert_eq!(
            out,
            json!({
                "user": {"name": "x"},
                "items": [{}, {"keep": true}],
            })
        );
    }

    proptest::proptest! {
        #[test]
        fn sanitize_never_panics_on_arbitrary_depth(n in 0u32..20) {
            let mut value = json!({"secret": "leaf"});
            for _ in 0..n {
                value = json!({"wrapper": value, "token": "x"});
            }
            let out = sanitize(&value);
            let rendered = out.to_string();
            for field in SENSITIVE_FIELDS {
                let needle = format!("\"{}\":", field);
                let absent = !rendered.contains(&needle);
                proptest::prop_assert!(absent);
            }
        }
    }
}
