//! JSON Patch generation for partial-update APIs
//!
//! [`diff`] is a recursive structural comparison producing RFC 6902 shaped
//! operations. Object keys are visited in lexicographic order so the output is
//! deterministic. Arrays are compared as whole values and replaced when unequal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;

/// Patch verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

impl std::fmt::Display for PatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchOp::Add => write!(f, "add"),
            PatchOp::Remove => write!(f, "remove"),
            PatchOp::Replace => write!(f, "replace"),
        }
    }
}

/// One operation of a JSON Patch document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,

    /// JSON Pointer into the document
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
        }
    }
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("invalid patch document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("patch could not be applied: {0}")]
    Apply(#[from] json_patch::PatchError),
}

/// Compute the operations that turn `old` into `new`
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    if old == new {
        return ops;
    }
    match (old, new) {
        (Value::Null, _) => ops.push(PatchOperation::add("", new.clone())),
        (_, Value::Null) => ops.push(PatchOperation::replace("", Value::Null)),
        _ => diff_value("", old, new, &mut ops),
    }
    ops
}

fn diff_value(path: &str, old: &Value, new: &Value, ops: &mut Vec<PatchOperation>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => diff_object(path, old, new, ops),
        _ => ops.push(PatchOperation::replace(path, new.clone())),
    }
}

fn diff_object(
    path: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    ops: &mut Vec<PatchOperation>,
) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    for key in keys {
        let child = format!("{}/{}", path, escape_token(key));
        match (old.get(key), new.get(key)) {
            (Some(before), None) if !before.is_null() => ops.push(PatchOperation::remove(child)),
            (None, Some(after)) if !after.is_null() => {
                ops.push(PatchOperation::add(child, after.clone()))
            }
            (Some(before), Some(after)) if before != after => {
                if before.is_null() {
                    ops.push(PatchOperation::add(child, after.clone()));
                } else if after.is_null() {
                    ops.push(PatchOperation::remove(child));
                } else {
                    diff_value(&child, before, after, ops);
                }
            }
            _ => {}
        }
    }
}

/// Escape a key for use as a JSON Pointer reference token
fn escape_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Apply operations to a document in order
pub fn apply(doc: &mut Value, ops: &[PatchOperation]) -> Result<(), PatchError> {
    let patch: json_patch::Patch = serde_json::from_value(serde_json::to_value(ops)?)?;
    json_patch::patch(doc, &patch.0)?;
    Ok(())
}

/// Serialize operations as an RFC 6902 request body
pub fn to_request_body(ops: &[PatchOperation]) -> Result<String, PatchError> {
    Ok(serde_json::to_string(ops)?)
}

/// Deep equality where a `null` object member is the same as an absent one
pub fn semantically_eq(a: &Value, b: &Value) -> bool {
    strip_nulls(a) == strip_nulls(b)
}

fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_nulls).collect()),
        other => other.clone(),
    }
}
