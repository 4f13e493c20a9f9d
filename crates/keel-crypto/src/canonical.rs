//! Canonical JSON encoding.
//!
//! Object keys are emitted in byte order at every level, separators are
//! compact, and numbers use `serde_json`'s shortest round-trip formatting.
//! The output does not depend on how the `serde_json::Map` was built or on
//! whether `serde_json/preserve_order` is enabled somewhere in the build.

use serde_json::Value;

/// Encode `value` canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Null, Bool and Number have exactly one serde_json rendering.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    #[test]
    fn keys_are_sorted_recursively() {
        let value = json!({"b": 1, "a": {"d": [3, {"z": 0, "y": 1}], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"d":[3,{"y":1,"z":0}]},"b":1}"#
        );
    }

    #[test]
    fn floats_and_ints_stay_distinct() {
        assert_eq!(canonical_json(&json!([1, 1.0, -0.5, 1e21])), "[1,1.0,-0.5,1e21]");
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(canonical_json(&json!({"k\"": "line\nbreak"})), r#"{"k\"":"line\nbreak"}"#);
    }

    proptest! {
        #[test]
        fn insertion_order_does_not_matter(entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..12)) {
            let mut forward = Map::new();
            for (k, v) in entries.iter() {
                forward.insert(k.clone(), json!(v));
            }
            let mut backward = Map::new();
            for (k, v) in entries.iter().rev() {
                backward.insert(k.clone(), json!(v));
            }
            prop_assert_eq!(
                canonical_json(&Value::Object(forward)),
                canonical_json(&Value::Object(backward))
            );
        }

        #[test]
        fn canonical_output_parses_back_to_the_same_value(xs in proptest::collection::vec(-1.0e12f64..1.0e12, 0..16)) {
            let value = json!({"xs": xs});
            let parsed: Value = serde_json::from_str(&canonical_json(&value)).unwrap();
            prop_assert_eq!(parsed, value);
        }
    }
}
