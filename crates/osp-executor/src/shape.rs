// SPDX-License-Identifier: MIT OR Apache-2.0
//! Result shaping driven by the envelope-level `output` key.

use osp_template::lookup_path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Declarative transform applied to a raw tool result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Pick a sub-value by dotted path first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Keep only these top-level fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// Drop these top-level fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit: Option<Vec<String>>,
    /// For array results: rebuild each element as `{key: path-lookup}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<String, String>>,
}

impl OutputSpec {
    /// Apply the transform. Order: `path`, then `map` (arrays only), then
    /// `fields` / `omit`.
    #[must_use]
    pub fn apply(&self, result: Value) -> Value {
        let mut value = match &self.path {
            Some(path) => lookup_path(&result, path).unwrap_or(Value::Null),
            None => result,
        };

        if let Some(mapping) = &self.map {
            if let Value::Array(items) = value {
                value = Value::Array(
                    items
                        .iter()
                        .map(|item| {
                            let mut out = Map::new();
                            for (key, path) in mapping {
                                out.insert(
                                    key.clone(),
                                    lookup_path(item, path).unwrap_or(Value::Null),
                                );
                            }
                            Value::Object(out)
                        })
                        .collect(),
                );
            }
        }

        if let Value::Object(map) = &mut value {
            if let Some(fields) = &self.fields {
                map.retain(|key, _| fields.iter().any(|f| f == key));
            }
            if let Some(omit) = &self.omit {
                map.retain(|key, _| !omit.iter().any(|o| o == key));
            }
        }
        value
    }
}
