//! Phase chunking and content-addressed slice naming.

use sha2::{Digest, Sha256};

use pko_apis::v1alpha1::ObjectSetObject;

/// Inline budget per phase: 512 KiB of serialized objects, well under the
/// apiserver's object ceiling with headroom for status and managed fields.
pub const DEFAULT_INLINE_BYTES: usize = 512 * 1024;

/// Budget override from `PKO_SLICE_INLINE_BYTES`.
pub fn inline_budget() -> usize {
    std::env::var("PKO_SLICE_INLINE_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_INLINE_BYTES)
}

fn serialized_len(obj: &ObjectSetObject) -> usize {
    serde_json::to_vec(&obj.object).map(|v| v.len()).unwrap_or(0)
}

/// Greedily partition a phase's objects into groups whose serialized size
/// stays under `budget`. A single object over budget still forms its own
/// group; ordering is preserved.
pub fn chunk_objects(objects: &[ObjectSetObject], budget: usize) -> Vec<Vec<ObjectSetObject>> {
    let mut groups: Vec<Vec<ObjectSetObject>> = Vec::new();
    let mut current: Vec<ObjectSetObject> = Vec::new();
    let mut current_size = 0usize;
    for obj in objects {
        let size = serialized_len(obj);
        if !current.is_empty() && current_size + size > budget {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(obj.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Content hash over the sorted serialized object list plus the collision
/// counter, truncated to 16 hex chars.
pub fn content_hash(objects: &[ObjectSetObject], collision_count: i32) -> String {
    let mut serialized: Vec<Vec<u8>> = objects
        .iter()
        .filter_map(|o| serde_json::to_vec(&o.object).ok())
        .collect();
    serialized.sort();
    let mut hasher = Sha256::new();
    for s in &serialized {
        hasher.update(s);
        hasher.update([0u8]);
    }
    hasher.update(collision_count.to_be_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Slice name: `<deploymentName>-<hash>`.
pub fn slice_name(deployment: &str, objects: &[ObjectSetObject], collision_count: i32) -> String {
    format!("{deployment}-{}", content_hash(objects, collision_count))
}

/// Semantic equality of two slice payloads: same objects regardless of
/// list order.
pub fn objects_equal(a: &[ObjectSetObject], b: &[ObjectSetObject]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut sa: Vec<Vec<u8>> = a.iter().filter_map(|o| serde_json::to_vec(&o.object).ok()).collect();
    let mut sb: Vec<Vec<u8>> = b.iter().filter_map(|o| serde_json::to_vec(&o.object).ok()).collect();
    sa.sort();
    sb.sort();
    sa == sb
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str, pad: usize) -> ObjectSetObject {
        ObjectSetObject {
            object: json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name},
                "data": {"pad": "x".repeat(pad)}
            }),
        }
    }

    #[test]
    fn small_phase_stays_one_group() {
        let objects = vec![obj("a", 10), obj("b", 10)];
        let groups = chunk_objects(&objects, 4096);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn oversized_phase_chunks_preserving_order() {
        let objects = vec![obj("a", 300), obj("b", 300), obj("c", 300)];
        let groups = chunk_objects(&objects, 500);
        assert_eq!(groups.len(), 3);
        let names: Vec<_> = groups
            .iter()
            .flat_map(|g| g.iter().map(|o| o.object["metadata"]["name"].as_str().unwrap().to_string()))
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn single_oversized_object_forms_its_own_group() {
        let objects = vec![obj("big", 10_000)];
        let groups = chunk_objects(&objects, 500);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn names_are_deterministic_and_order_insensitive() {
        let a = vec![obj("a", 10), obj("b", 10)];
        let reversed = vec![obj("b", 10), obj("a", 10)];
        assert_eq!(slice_name("web", &a, 0), slice_name("web", &reversed, 0));
        assert_ne!(slice_name("web", &a, 0), slice_name("web", &a, 1));
        assert!(slice_name("web", &a, 0).starts_with("web-"));
        assert_eq!(slice_name("web", &a, 0).len(), "web-".len() + 16);
    }

    #[test]
    fn semantic_equality_ignores_order() {
        let a = vec![obj("a", 10), obj("b", 10)];
        let b = vec![obj("b", 10), obj("a", 10)];
        assert!(objects_equal(&a, &b));
        let c = vec![obj("a", 10), obj("c", 10)];
        assert!(!objects_equal(&a, &c));
    }
}
