//! Structural parse: payload text into ordered rows.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{ContentKind, ItemParser, ParserDefinition, PathStep, Row};
use crate::error::{Error, Result};

/// Cut `payload` into rows according to `def`.
///
/// Zero rows is not an error. Malformed JSON for a JSON definition is.
pub(crate) fn parse_rows(def: &ParserDefinition, url: &str, payload: &str) -> Result<Vec<Row>> {
    match def.item_parser() {
        ItemParser::None => Ok(Vec::new()),
        ItemParser::Regex(_) => {
            let Some(re) = def.item_regex.as_ref() else {
                return Err(Error::InvalidDefinition {
                    label: def.label().to_string(),
                    reason: "item regex was not compiled; register the definition first".to_string(),
                });
            };
            Ok(regex_rows(re, payload))
        }
        ItemParser::JsonPath(path) => {
            if def.content_kind() != ContentKind::Json {
                return Err(Error::InvalidDefinition {
                    label: def.label().to_string(),
                    reason: "JSON item path on a raw payload".to_string(),
                });
            }
            let root: Value = serde_json::from_str(payload).map_err(|e| Error::MalformedPayload {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok(json_rows(&root, path))
        }
    }
}

fn regex_rows(re: &regex::Regex, payload: &str) -> Vec<Row> {
    let names: Vec<Option<&str>> = re.capture_names().collect();
    re.captures_iter(payload)
        .map(|caps| {
            let mut groups = BTreeMap::new();
            for (i, name) in names.iter().enumerate().skip(1) {
                if let Some(m) = caps.get(i) {
                    let key = name.map_or_else(|| i.to_string(), str::to_string);
                    groups.insert(key, m.as_str().to_string());
                }
            }
            Row::Captures(groups)
        })
        .collect()
}

/// Walk `path` over a set of current values. A trailing array expands into
/// one row per element.
fn json_rows(root: &Value, path: &[PathStep]) -> Vec<Row> {
    let mut current: Vec<&Value> = vec![root];

    for step in path {
        current = match step {
            PathStep::Key(key) => current.iter().filter_map(|v| v.get(key.as_str())).collect(),
            PathStep::Index(index) => current.iter().filter_map(|v| v.get(*index)).collect(),
            PathStep::Select { field, value, index } => current
                .iter()
                .filter_map(|v| v.as_array())
                .flat_map(|items| {
                    let selected = items.iter().filter(|item| item.get(field.as_str()) == Some(value));
                    match index {
                        Some(i) => selected.skip(*i).take(1).collect::<Vec<_>>(),
                        None => selected.collect(),
                    }
                })
                .collect(),
        };
    }

    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().cloned().map(Row::Json).collect::<Vec<_>>(),
            other => vec![Row::Json(other.clone())],
        })
        .collect()
}
