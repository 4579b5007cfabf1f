//! JSON document operations shared by store adapters.

use serde_json::Value;

use lodestar_common::{DocData, Error, Result};

/// Interpret a payload as a document body.
pub fn as_object(payload: &Value) -> Result<DocData> {
    match payload {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(DocData::new()),
        other => Err(Error::InvalidInput(format!(
            "Document payload must be an object, got {}",
            type_name(other)
        ))),
    }
}

/// Recursively merge `patch` into `target`. Nested objects merge, every
/// other value (arrays included) overwrites.
pub fn deep_merge(target: &mut DocData, patch: &DocData) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Overwrite top-level keys of `target` with those of `patch`.
pub fn assign(target: &mut DocData, patch: &DocData) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// Property paths for a `deleteProp` payload: one dot-path string or an
/// array of them.
pub fn prop_paths(payload: &Value) -> Result<Vec<String>> {
    match payload {
        Value::String(path) => Ok(vec![path.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(String::from).ok_or_else(|| {
                    Error::InvalidInput("deleteProp paths must be strings".to_string())
                })
            })
            .collect(),
        other => Err(Error::InvalidInput(format!(
            "deleteProp expects a string or array, got {}",
            type_name(other)
        ))),
    }
}

/// Remove each dot-separated property path from `target`. Missing paths
/// are ignored.
pub fn delete_props(target: &mut DocData, paths: &[String]) {
    for path in paths {
        let parts: Vec<&str> = path.split('.').collect();
        remove_path(target, &parts);
    }
}

fn remove_path(target: &mut DocData, parts: &[&str]) {
    match parts {
        [] => {}
        [leaf] => {
            target.remove(*leaf);
        }
        [head, rest @ ..] => {
            if let Some(Value::Object(next)) = target.get_mut(*head) {
                remove_path(next, rest);
            }
        }
    }
}

/// Read a numeric field by dot path.
pub fn number_at(doc: &DocData, path: &str) -> Option<f64> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut value = doc.get(first)?;
    for part in parts {
        value = value.as_object()?.get(part)?;
    }
    value.as_f64()
}

/// Short JSON type name for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
