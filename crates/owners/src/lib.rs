//! Ownership strategies. The native strategy uses the platform's
//! `metadata.ownerReferences`; the annotation strategy serializes owners
//! into a JSON annotation so references survive cluster boundaries where
//! UIDs mean nothing.
//!
//! One strategy per installation. When both owner forms appear on an
//! object the active strategy wins and the other form is left untouched.

#![forbid(unsafe_code)]

use serde_json::Value;
use tracing::trace;

use pko_core::{object, Gvk, OwnerRef, OWNERS_ANNOTATION};

#[derive(Debug, thiserror::Error)]
pub enum OwnershipError {
    #[error("object already controlled by {kind} {name}")]
    AlreadyOwned { kind: String, name: String },
}

/// The owner an operation acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    pub gvk: Gvk,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
}

impl OwnerInfo {
    fn to_ref(&self, controller: bool) -> OwnerRef {
        OwnerRef {
            group: self.gvk.group.clone(),
            kind: self.gvk.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            uid: self.uid.clone(),
            controller: Some(controller),
        }
    }

    fn matches(&self, owner: &OwnerRef) -> bool {
        owner.kind == self.gvk.kind
            && owner.name == self.name
            && (owner.uid == self.uid || owner.uid.is_empty() || self.uid.is_empty())
    }
}

/// Common capability set of both strategies. At most one controller edge
/// exists per object; every mutation is idempotent for the same owner.
pub trait OwnerStrategy: Send + Sync {
    /// Is `owner` the current controller of `obj`?
    fn is_controller(&self, owner: &OwnerInfo, obj: &Value) -> bool;

    /// The current controller edge, if any.
    fn controller_of(&self, obj: &Value) -> Option<OwnerRef>;

    /// Is `owner` in the owner set at all (controller or not)?
    fn is_owner(&self, owner: &OwnerInfo, obj: &Value) -> bool;

    /// Set `owner` as the controller. Fails with [`OwnershipError::AlreadyOwned`]
    /// when a different controller exists; a no-op when `owner` already
    /// controls the object.
    fn set_controller_reference(&self, owner: &OwnerInfo, obj: &mut Value)
        -> Result<(), OwnershipError>;

    /// Demote the current controller to a plain owner, keeping the edge.
    fn release_controller(&self, obj: &mut Value);

    /// Drop `owner` from the owner set entirely.
    fn remove_owner(&self, owner: &OwnerInfo, obj: &mut Value);

    /// Owners to requeue for an event on `obj`.
    fn owner_refs_for_event(&self, obj: &Value) -> Vec<OwnerRef>;
}

// ---- shared plumbing ----

fn read_refs(raw: Option<Vec<OwnerRef>>) -> Vec<OwnerRef> {
    raw.unwrap_or_default()
}

fn upsert_controller(
    mut owners: Vec<OwnerRef>,
    owner: &OwnerInfo,
) -> Result<Vec<OwnerRef>, OwnershipError> {
    if let Some(existing) = owners.iter().find(|o| o.is_controller()) {
        if owner.matches(existing) {
            return Ok(owners);
        }
        return Err(OwnershipError::AlreadyOwned {
            kind: existing.kind.clone(),
            name: existing.name.clone(),
        });
    }
    if let Some(slot) = owners.iter_mut().find(|o| owner.matches(o)) {
        slot.controller = Some(true);
        slot.uid = owner.uid.clone();
    } else {
        owners.push(owner.to_ref(true));
    }
    Ok(owners)
}

// ---- native strategy ----

/// Owner references in `metadata.ownerReferences`, the platform's native
/// form.
#[derive(Debug, Default)]
pub struct NativeStrategy;

fn native_read(obj: &Value) -> Vec<OwnerRef> {
    let refs = obj
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array);
    let Some(refs) = refs else { return Vec::new() };
    refs.iter()
        .filter_map(|r| {
            let api_version = r.get("apiVersion")?.as_str()?;
            let kind = r.get("kind")?.as_str()?;
            let gvk = Gvk::from_api_version(api_version, kind);
            Some(OwnerRef {
                group: gvk.group,
                kind: gvk.kind,
                name: r.get("name")?.as_str()?.to_string(),
                namespace: None,
                uid: r.get("uid").and_then(Value::as_str).unwrap_or_default().to_string(),
                controller: r.get("controller").and_then(Value::as_bool),
            })
        })
        .collect()
}

fn native_write(obj: &mut Value, owners: &[OwnerRef]) {
    let rendered: Vec<Value> = owners
        .iter()
        .map(|o| {
            // Owner kinds are always the operator's own v1alpha1 resources.
            let api_version = Gvk::new(&o.group, "v1alpha1", &o.kind).api_version();
            serde_json::json!({
                "apiVersion": api_version,
                "kind": o.kind,
                "name": o.name,
                "uid": o.uid,
                "controller": o.is_controller(),
                "blockOwnerDeletion": true,
            })
        })
        .collect();
    let meta = obj
        .as_object_mut()
        .and_then(|m| {
            m.entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()))
                .as_object_mut()
        });
    if let Some(meta) = meta {
        if rendered.is_empty() {
            meta.remove("ownerReferences");
        } else {
            meta.insert("ownerReferences".to_string(), Value::Array(rendered));
        }
    }
}

impl OwnerStrategy for NativeStrategy {
    fn is_controller(&self, owner: &OwnerInfo, obj: &Value) -> bool {
        native_read(obj).iter().any(|o| o.is_controller() && owner.matches(o))
    }

    fn controller_of(&self, obj: &Value) -> Option<OwnerRef> {
        native_read(obj).into_iter().find(OwnerRef::is_controller)
    }

    fn is_owner(&self, owner: &OwnerInfo, obj: &Value) -> bool {
        native_read(obj).iter().any(|o| owner.matches(o))
    }

    fn set_controller_reference(
        &self,
        owner: &OwnerInfo,
        obj: &mut Value,
    ) -> Result<(), OwnershipError> {
        let owners = upsert_controller(native_read(obj), owner)?;
        native_write(obj, &owners);
        trace!(owner = %owner.name, "controller reference set");
        Ok(())
    }

    fn release_controller(&self, obj: &mut Value) {
        let mut owners = native_read(obj);
        for o in owners.iter_mut() {
            o.controller = Some(false);
        }
        native_write(obj, &owners);
    }

    fn remove_owner(&self, owner: &OwnerInfo, obj: &mut Value) {
        let mut owners = native_read(obj);
        owners.retain(|o| !owner.matches(o));
        native_write(obj, &owners);
    }

    fn owner_refs_for_event(&self, obj: &Value) -> Vec<OwnerRef> {
        native_read(obj)
    }
}

// ---- annotation strategy ----

/// Owners serialized as JSON in the owners annotation, for cross-cluster
/// deployments.
#[derive(Debug, Default)]
pub struct AnnotationStrategy;

fn annotation_read(obj: &Value) -> Vec<OwnerRef> {
    let raw = object::annotation(obj, OWNERS_ANNOTATION);
    read_refs(raw.and_then(|s| serde_json::from_str(s).ok()))
}

fn annotation_write(obj: &mut Value, owners: &[OwnerRef]) {
    if owners.is_empty() {
        object::remove_annotation(obj, OWNERS_ANNOTATION);
        return;
    }
    // Serialization of a plain vec of serializable structs cannot fail.
    let encoded = serde_json::to_string(owners).unwrap_or_default();
    object::set_annotation(obj, OWNERS_ANNOTATION, &encoded);
}

impl OwnerStrategy for AnnotationStrategy {
    fn is_controller(&self, owner: &OwnerInfo, obj: &Value) -> bool {
        annotation_read(obj).iter().any(|o| o.is_controller() && owner.matches(o))
    }

    fn controller_of(&self, obj: &Value) -> Option<OwnerRef> {
        annotation_read(obj).into_iter().find(OwnerRef::is_controller)
    }

    fn is_owner(&self, owner: &OwnerInfo, obj: &Value) -> bool {
        annotation_read(obj).iter().any(|o| owner.matches(o))
    }

    fn set_controller_reference(
        &self,
        owner: &OwnerInfo,
        obj: &mut Value,
    ) -> Result<(), OwnershipError> {
        let owners = upsert_controller(annotation_read(obj), owner)?;
        annotation_write(obj, &owners);
        Ok(())
    }

    fn release_controller(&self, obj: &mut Value) {
        let mut owners = annotation_read(obj);
        for o in owners.iter_mut() {
            o.controller = Some(false);
        }
        annotation_write(obj, &owners);
    }

    fn remove_owner(&self, owner: &OwnerInfo, obj: &mut Value) {
        let mut owners = annotation_read(obj);
        owners.retain(|o| !owner.matches(o));
        annotation_write(obj, &owners);
    }

    fn owner_refs_for_event(&self, obj: &Value) -> Vec<OwnerRef> {
        annotation_read(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner(name: &str, uid: &str) -> OwnerInfo {
        OwnerInfo {
            gvk: Gvk::new("package-operator.run", "v1alpha1", "ObjectSet"),
            name: name.to_string(),
            namespace: Some("prod".to_string()),
            uid: uid.to_string(),
        }
    }

    fn strategies() -> Vec<Box<dyn OwnerStrategy>> {
        vec![Box::new(NativeStrategy), Box::new(AnnotationStrategy)]
    }

    #[test]
    fn set_then_is_controller_both_strategies() {
        for strategy in strategies() {
            let mut obj = json!({"metadata": {"name": "cm"}});
            let a = owner("web-1", "uid-1");
            strategy.set_controller_reference(&a, &mut obj).unwrap();
            assert!(strategy.is_controller(&a, &obj));
            assert!(strategy.is_owner(&a, &obj));

            // idempotent for the same owner
            strategy.set_controller_reference(&a, &mut obj).unwrap();
            assert_eq!(strategy.owner_refs_for_event(&obj).len(), 1);
        }
    }

    #[test]
    fn second_controller_is_rejected() {
        for strategy in strategies() {
            let mut obj = json!({"metadata": {"name": "cm"}});
            strategy.set_controller_reference(&owner("web-1", "uid-1"), &mut obj).unwrap();
            let err = strategy
                .set_controller_reference(&owner("web-2", "uid-2"), &mut obj)
                .unwrap_err();
            assert!(matches!(err, OwnershipError::AlreadyOwned { .. }));
        }
    }

    #[test]
    fn release_then_set_hands_over() {
        for strategy in strategies() {
            let mut obj = json!({"metadata": {"name": "cm"}});
            let old = owner("web-1", "uid-1");
            let new = owner("web-2", "uid-2");
            strategy.set_controller_reference(&old, &mut obj).unwrap();
            strategy.release_controller(&mut obj);
            strategy.set_controller_reference(&new, &mut obj).unwrap();

            assert!(strategy.is_controller(&new, &obj));
            assert!(!strategy.is_controller(&old, &obj));
            // old owner edge is kept, demoted
            assert!(strategy.is_owner(&old, &obj));
            // exactly one controller
            let controllers: Vec<_> = strategy
                .owner_refs_for_event(&obj)
                .into_iter()
                .filter(OwnerRef::is_controller)
                .collect();
            assert_eq!(controllers.len(), 1);
        }
    }

    #[test]
    fn remove_owner_drops_the_edge() {
        for strategy in strategies() {
            let mut obj = json!({"metadata": {"name": "cm"}});
            let a = owner("web-1", "uid-1");
            strategy.set_controller_reference(&a, &mut obj).unwrap();
            strategy.remove_owner(&a, &mut obj);
            assert!(!strategy.is_owner(&a, &obj));
            assert!(strategy.owner_refs_for_event(&obj).is_empty());
        }
    }

    #[test]
    fn annotation_strategy_roundtrips_json() {
        let mut obj = json!({"metadata": {"name": "cm"}});
        AnnotationStrategy
            .set_controller_reference(&owner("web-1", "uid-1"), &mut obj)
            .unwrap();
        let raw = object::annotation(&obj, OWNERS_ANNOTATION).unwrap();
        let parsed: Vec<OwnerRef> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].name, "web-1");
        assert_eq!(parsed[0].namespace.as_deref(), Some("prod"));
    }
}
