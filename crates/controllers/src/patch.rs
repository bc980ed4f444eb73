//! Minimal patch computation: the smallest merge patch that makes every
//! key present in the desired object hold the desired value on the live
//! object. Keys only the live object has are server-managed and preserved.

use serde_json::{Map, Value};

/// True when every desired key already holds the desired value.
pub fn subset_equal(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).map(|lv| subset_equal(v, lv)).unwrap_or(false)),
        // Arrays and scalars compare wholesale; merge semantics cannot
        // address individual elements.
        (a, b) => a == b,
    }
}

/// The merge patch to reconcile `live` toward `desired`, or `None` when
/// equality already holds.
pub fn compute_patch(desired: &Value, live: &Value) -> Option<Value> {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => {
            let mut patch = Map::new();
            for (k, v) in want {
                match have.get(k) {
                    Some(lv) => {
                        if let Some(sub) = compute_patch(v, lv) {
                            patch.insert(k.clone(), sub);
                        }
                    }
                    None => {
                        patch.insert(k.clone(), v.clone());
                    }
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        (a, b) => {
            if a == b {
                None
            } else {
                Some(a.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_objects_need_no_patch() {
        let desired = json!({"spec": {"replicas": 2}, "metadata": {"name": "web"}});
        let live = json!({
            "spec": {"replicas": 2},
            "metadata": {"name": "web", "uid": "u-1", "resourceVersion": "9"},
            "status": {"ready": true}
        });
        assert!(subset_equal(&desired, &live));
        assert_eq!(compute_patch(&desired, &live), None);
    }

    #[test]
    fn differing_scalar_patches_only_its_branch() {
        let desired = json!({"spec": {"replicas": 3, "paused": false}});
        let live = json!({"spec": {"replicas": 2, "paused": false, "extra": "keep"}});
        let patch = compute_patch(&desired, &live).unwrap();
        assert_eq!(patch, json!({"spec": {"replicas": 3}}));
    }

    #[test]
    fn missing_key_is_added() {
        let desired = json!({"metadata": {"labels": {"app": "web"}}});
        let live = json!({"metadata": {"name": "web"}});
        let patch = compute_patch(&desired, &live).unwrap();
        assert_eq!(patch, json!({"metadata": {"labels": {"app": "web"}}}));
    }

    #[test]
    fn arrays_replace_wholesale() {
        let desired = json!({"spec": {"ports": [80, 443]}});
        let live = json!({"spec": {"ports": [80]}});
        let patch = compute_patch(&desired, &live).unwrap();
        assert_eq!(patch, json!({"spec": {"ports": [80, 443]}}));
    }

    #[test]
    fn live_only_keys_are_preserved() {
        let desired = json!({"data": {"a": "1"}});
        let live = json!({"data": {"a": "1", "server-added": "x"}});
        assert_eq!(compute_patch(&desired, &live), None);
    }
}
