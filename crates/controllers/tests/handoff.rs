#![forbid(unsafe_code)]

//! Revision hand-off: an object controlled by revision N moves to N+1
//! exclusively once N+1 declares N as previous.

use pko_controllers::adoption::{decide, AdoptionOutcome};
use pko_controllers::patch::{compute_patch, subset_equal};
use pko_core::{object, Gvk, OwnerRef, REVISION_ANNOTATION};
use pko_owners::{AnnotationStrategy, NativeStrategy, OwnerInfo, OwnerStrategy};
use serde_json::json;

fn object_set_owner(name: &str, uid: &str) -> OwnerInfo {
    OwnerInfo {
        gvk: Gvk::new("package-operator.run", "v1alpha1", "ObjectSet"),
        name: name.to_string(),
        namespace: Some("prod".to_string()),
        uid: uid.to_string(),
    }
}

fn hand_off(strategy: &dyn OwnerStrategy) {
    let rev_n = object_set_owner("web-1", "uid-1");
    let rev_n1 = object_set_owner("web-2", "uid-2");

    // live object as revision N left it
    let mut live = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "cm", "namespace": "prod"},
        "data": {"k": "v"}
    });
    strategy.set_controller_reference(&rev_n, &mut live).unwrap();
    object::set_revision(&mut live, 1);

    // revision N+1 decides
    let outcome = decide(strategy, &rev_n1, 2, &["web-1"], false, &live).unwrap();
    assert_eq!(outcome, AdoptionOutcome::Adopt);

    // ... and applies the hand-off the way the phase reconciler does
    strategy.release_controller(&mut live);
    strategy.set_controller_reference(&rev_n1, &mut live).unwrap();
    object::set_revision(&mut live, 2);

    // exclusively controlled by N+1
    assert!(strategy.is_controller(&rev_n1, &live));
    assert!(!strategy.is_controller(&rev_n, &live));
    let controllers: Vec<OwnerRef> = strategy
        .owner_refs_for_event(&live)
        .into_iter()
        .filter(OwnerRef::is_controller)
        .collect();
    assert_eq!(controllers.len(), 1);
    assert_eq!(controllers[0].name, "web-2");

    // revision annotation equals N+1
    assert_eq!(
        object::annotation(&live, REVISION_ANNOTATION),
        Some("2")
    );

    // second reconcile of N+1 is a no-op
    let outcome = decide(strategy, &rev_n1, 2, &["web-1"], false, &live).unwrap();
    assert_eq!(outcome, AdoptionOutcome::NoOp);
}

#[test]
fn hand_off_native_strategy() {
    hand_off(&NativeStrategy);
}

#[test]
fn hand_off_annotation_strategy() {
    hand_off(&AnnotationStrategy);
}

#[test]
fn stale_revision_does_not_steal_back() {
    let strategy = NativeStrategy;
    let rev_n = object_set_owner("web-1", "uid-1");
    let rev_n1 = object_set_owner("web-2", "uid-2");

    let mut live = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "cm", "namespace": "prod"}
    });
    strategy.set_controller_reference(&rev_n1, &mut live).unwrap();
    object::set_revision(&mut live, 2);

    // the old revision reconciling late must leave the object alone
    let outcome = decide(&strategy, &rev_n, 1, &[], false, &live).unwrap();
    assert_eq!(outcome, AdoptionOutcome::SkipNewerRevision);
}

#[test]
fn desired_state_patch_converges() {
    // after hand-off the patch against an already-converged object is None
    let desired = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "cm", "labels": {"app": "web"}},
        "data": {"k": "v"}
    });
    let live = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "cm",
            "labels": {"app": "web"},
            "uid": "u",
            "resourceVersion": "42",
            "managedFields": [{}]
        },
        "data": {"k": "v"},
        "status": {}
    });
    assert!(subset_equal(&desired, &live));
    assert_eq!(compute_patch(&desired, &live), None);

    let drifted = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "cm", "labels": {"app": "web"}},
        "data": {"k": "other"}
    });
    let patch = compute_patch(&desired, &drifted).unwrap();
    assert_eq!(patch, json!({"data": {"k": "v"}}));
}
