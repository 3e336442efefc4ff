//! Passing callbacks as request parameters.
//!
//! Before a request is sent, every callback in its params is lifted out and
//! recorded under its slash-joined path from the root (`"opts/onProgress"`,
//! `"handlers/0"`). The request carries the list of paths. The receiving side
//! puts a remote stub back at each path, and invoking the stub sends a
//! callback invocation to the caller, which runs the original function.

use crate::error::ChannelError;
use crate::transaction::Transaction;
use crate::value::{Callback, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Deepest params nesting accepted. Matches the recursion limit of the JSON
/// decoder on the other side.
pub const MAX_PARAMS_DEPTH: usize = 128;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '/';

/// Remove every callback from `params`, returning them with their paths in
/// traversal order.
///
/// Callbacks are removed from objects and replaced by `null` in arrays.
/// Fails with `RecursiveParams` past [`MAX_PARAMS_DEPTH`] levels.
pub fn extract_callbacks(params: &mut Value) -> Result<Vec<(String, Callback)>, ChannelError> {
    let mut extracted = Vec::new();
    prune(params, "", 0, &mut extracted)?;
    Ok(extracted)
}

fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{}{}{}", parent, PATH_SEPARATOR, segment)
    }
}

fn prune(
    value: &mut Value,
    path: &str,
    depth: usize,
    extracted: &mut Vec<(String, Callback)>,
) -> Result<(), ChannelError> {
    if depth > MAX_PARAMS_DEPTH {
        return Err(ChannelError::RecursiveParams(MAX_PARAMS_DEPTH));
    }
    match value {
        Value::Object(map) => {
            let mut lifted = Vec::new();
            for (key, child) in map.iter_mut() {
                let child_path = join_path(path, key);
                if let Value::Callback(cb) = child {
                    extracted.push((child_path, cb.clone()));
                    lifted.push(key.clone());
                } else {
                    prune(child, &child_path, depth + 1, extracted)?;
                }
            }
            for key in lifted {
                map.remove(&key);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                let child_path = join_path(path, &index.to_string());
                if let Value::Callback(cb) = item {
                    extracted.push((child_path, cb.clone()));
                    *item = Value::Null;
                } else {
                    prune(item, &child_path, depth + 1, extracted)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Install a remote stub for each declared callback path.
///
/// Missing intermediate containers are created as objects; a non-container
/// in the way is replaced. An array grows by at most one element per
/// segment, so a path indexing past the end of an array is skipped.
pub fn install_stubs(params: &mut Value, paths: &[String], transaction: &Transaction) {
    'paths: for path in paths {
        let mut slot = &mut *params;
        for segment in path.split(PATH_SEPARATOR) {
            match child_slot(slot, segment) {
                Some(next) => slot = next,
                None => {
                    debug!(id = transaction.id(), callback = %path, "Skipping callback path with out-of-range index");
                    continue 'paths;
                }
            }
        }
        *slot = Value::Callback(Callback::remote(path.clone(), transaction.clone()));
    }
}

fn child_slot<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    let array_index = match &*value {
        Value::Array(_) => key.parse::<usize>().ok(),
        _ => None,
    };
    if let Some(index) = array_index {
        let Value::Array(items) = value else {
            return None;
        };
        if index == items.len() {
            items.push(Value::Null);
        }
        return items.get_mut(index);
    }
    if !matches!(value, Value::Object(_)) {
        *value = Value::Object(BTreeMap::new());
    }
    match value {
        Value::Object(map) => Some(map.entry(key.to_string()).or_default()),
        _ => None,
    }
}
