//! Accessors over the dynamic object tree. Rendered objects stay untyped
//! (`serde_json::Value`); everything the reconcilers need from them goes
//! through these helpers.

use serde_json::Value;

use crate::{Gvk, ObjectKey, CONDITION_MAP_ANNOTATION, PHASE_ANNOTATION, REVISION_ANNOTATION};

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("object missing apiVersion")]
    MissingApiVersion,
    #[error("object missing kind")]
    MissingKind,
    #[error("object missing metadata.name")]
    MissingName,
}

/// Extract group/version/kind. Version and kind must be non-empty.
pub fn gvk_of(obj: &Value) -> Result<Gvk, ObjectError> {
    let api_version = obj
        .get("apiVersion")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ObjectError::MissingApiVersion)?;
    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ObjectError::MissingKind)?;
    Ok(Gvk::from_api_version(api_version, kind))
}

/// Identity key used for duplicate detection and ownership decisions.
pub fn key_of(obj: &Value) -> Result<ObjectKey, ObjectError> {
    let gvk = gvk_of(obj)?;
    let name = name_of(obj).ok_or(ObjectError::MissingName)?.to_string();
    Ok(ObjectKey { group: gvk.group, kind: gvk.kind, namespace: namespace_of(obj).map(String::from), name })
}

pub fn name_of(obj: &Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("name")).and_then(Value::as_str)
}

pub fn namespace_of(obj: &Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("namespace")).and_then(Value::as_str)
}

pub fn uid_of(obj: &Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("uid")).and_then(Value::as_str)
}

pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
}

pub fn label<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(key))
        .and_then(Value::as_str)
}

fn metadata_map<'a>(obj: &'a mut Value, field: &str) -> &'a mut serde_json::Map<String, Value> {
    let meta = obj
        .as_object_mut()
        .expect("object is not a map")
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    meta.as_object_mut()
        .expect("metadata is not a map")
        .entry(field)
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .expect("metadata field is not a map")
}

pub fn set_annotation(obj: &mut Value, key: &str, value: &str) {
    metadata_map(obj, "annotations").insert(key.to_string(), Value::String(value.to_string()));
}

pub fn remove_annotation(obj: &mut Value, key: &str) -> Option<String> {
    let annotations = obj
        .get_mut("metadata")?
        .get_mut("annotations")?
        .as_object_mut()?;
    let removed = annotations.remove(key).and_then(|v| v.as_str().map(String::from));
    if annotations.is_empty() {
        obj.get_mut("metadata")
            .and_then(Value::as_object_mut)
            .map(|m| m.remove("annotations"));
    }
    removed
}

pub fn set_label(obj: &mut Value, key: &str, value: &str) {
    metadata_map(obj, "labels").insert(key.to_string(), Value::String(value.to_string()));
}

/// Phase annotation, if present.
pub fn phase_of(obj: &Value) -> Option<&str> {
    annotation(obj, PHASE_ANNOTATION)
}

/// Read and strip the phase annotation in one go; rendering records the
/// phase separately and the annotation must not reach the cluster.
pub fn take_phase(obj: &mut Value) -> Option<String> {
    remove_annotation(obj, PHASE_ANNOTATION)
}

/// Revision recorded on the object by the last reconcile, when parseable.
pub fn revision_of(obj: &Value) -> Option<i64> {
    annotation(obj, REVISION_ANNOTATION).and_then(|s| s.parse().ok())
}

pub fn set_revision(obj: &mut Value, revision: i64) {
    set_annotation(obj, REVISION_ANNOTATION, &revision.to_string());
}

/// Parse the condition-map annotation: one `src => dst` pair per line.
/// Malformed lines are skipped.
pub fn condition_mappings(obj: &Value) -> Vec<(String, String)> {
    let Some(raw) = annotation(obj, CONDITION_MAP_ANNOTATION) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|line| {
            let (src, dst) = line.split_once("=>")?;
            let (src, dst) = (src.trim(), dst.trim());
            if src.is_empty() || dst.is_empty() {
                return None;
            }
            Some((src.to_string(), dst.to_string()))
        })
        .collect()
}

/// Walk a dotted path (`status.availableReplicas`) through the tree.
/// Supports a single trailing `[idx]` per segment.
pub fn path_value<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = obj;
    for seg in path.trim_start_matches('.').split('.') {
        if seg.is_empty() {
            return None;
        }
        let (key, idx) = match seg.split_once('[') {
            Some((k, rest)) => {
                let idx: usize = rest.strip_suffix(']')?.parse().ok()?;
                (k, Some(idx))
            }
            None => (seg, None),
        };
        cur = cur.get(key)?;
        if let Some(i) = idx {
            cur = cur.get(i)?;
        }
    }
    Some(cur)
}

/// Conditions from an unstructured object's status, as (type, status) pairs
/// plus the full condition value for message extraction.
pub fn object_conditions(obj: &Value) -> Vec<&Value> {
    obj.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

/// Find a condition by type and return its status string.
pub fn condition_status<'a>(obj: &'a Value, cond_type: &str) -> Option<&'a str> {
    object_conditions(obj).into_iter().find_map(|c| {
        if c.get("type").and_then(Value::as_str) == Some(cond_type) {
            c.get("status").and_then(Value::as_str)
        } else {
            None
        }
    })
}
