// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deep merge for preset / alias / user argument layering.

use serde_json::Value;

/// Merge `overlay` onto `base`: objects merge recursively, everything else
/// is replaced by the overlay. The overlay always wins on conflicts.
#[must_use]
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_wins_on_scalars() {
        assert_eq!(deep_merge(json!(1), json!(2)), json!(2));
        assert_eq!(deep_merge(json!({"a": 1}), json!("x")), json!("x"));
    }

    #[test]
    fn objects_merge_recursively() {
        let base = json!({"a": {"x": 1, "y": 2}, "keep": true});
        let overlay = json!({"a": {"y": 3, "z": 4}});
        assert_eq!(
            deep_merge(base, overlay),
            json!({"a": {"x": 1, "y": 3, "z": 4}, "keep": true})
        );
    }

    #[test]
    fn arrays_are_replaced_not_merged() {
        assert_eq!(
            deep_merge(json!({"a": [1, 2]}), json!({"a": [3]})),
            json!({"a": [3]})
        );
    }

    #[test]
    fn three_layer_priority() {
        let preset = json!({"project": "shop", "target": "staging", "timeout": 5});
        let alias = json!({"target": "prod"});
        let user = json!({"timeout": 9});
        let merged = deep_merge(deep_merge(preset, alias), user);
        assert_eq!(
            merged,
            json!({"project": "shop", "target": "prod", "timeout": 9})
        );
    }
}
