//! Adoption decision: a pure function of owner state, object state, and
//! revision. The phase reconciler acts on the outcome; nothing here
//! touches the cluster.

use serde_json::Value;

use pko_core::object;
use pko_owners::{OwnerInfo, OwnerStrategy};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdoptionError {
    /// The object exists but no declared previous revision controls it;
    /// surfaced on status and not retried until an external change.
    #[error("object {key} is not owned by a previous revision")]
    NotOwnedByPreviousRevision { key: String },
    /// The object records this revision but a different controller holds
    /// it; fatal for this object.
    #[error("revision collision on {key}: revision {revision} already written by another owner")]
    RevisionCollision { key: String, revision: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptionOutcome {
    /// Already controlled by this revision; nothing to do.
    NoOp,
    /// Take the controller edge and stamp the revision.
    Adopt,
    /// A newer revision owns the object; leave it alone.
    SkipNewerRevision,
}

/// Decide whether `owner` (at `revision`, superseding `previous_names`)
/// may take the object.
pub fn decide(
    strategy: &dyn OwnerStrategy,
    owner: &OwnerInfo,
    revision: i64,
    previous_names: &[&str],
    force_adoption: bool,
    live: &Value,
) -> Result<AdoptionOutcome, AdoptionError> {
    let key = object::key_of(live).map(|k| k.to_string()).unwrap_or_else(|_| "<unknown>".into());

    if strategy.is_controller(owner, live) {
        return Ok(AdoptionOutcome::NoOp);
    }

    if let Some(recorded) = object::revision_of(live) {
        if recorded > revision {
            return Ok(AdoptionOutcome::SkipNewerRevision);
        }
        if recorded == revision && strategy.controller_of(live).is_some() {
            return Err(AdoptionError::RevisionCollision { key, revision });
        }
    }

    match strategy.controller_of(live) {
        Some(controller) => {
            if previous_names.contains(&controller.name.as_str()) {
                Ok(AdoptionOutcome::Adopt)
            } else {
                Err(AdoptionError::NotOwnedByPreviousRevision { key })
            }
        }
        None if force_adoption => Ok(AdoptionOutcome::Adopt),
        None => Err(AdoptionError::NotOwnedByPreviousRevision { key }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_core::Gvk;
    use pko_owners::NativeStrategy;
    use serde_json::json;

    fn owner(name: &str, uid: &str) -> OwnerInfo {
        OwnerInfo {
            gvk: Gvk::new("package-operator.run", "v1alpha1", "ObjectSet"),
            name: name.to_string(),
            namespace: Some("ns".to_string()),
            uid: uid.to_string(),
        }
    }

    fn controlled_by(name: &str, uid: &str, revision: Option<i64>) -> Value {
        let mut obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"}
        });
        NativeStrategy.set_controller_reference(&owner(name, uid), &mut obj).unwrap();
        if let Some(rev) = revision {
            pko_core::object::set_revision(&mut obj, rev);
        }
        obj
    }

    use pko_owners::OwnerStrategy as _;

    #[test]
    fn already_controlled_is_noop() {
        let live = controlled_by("web-2", "uid-2", Some(2));
        let outcome =
            decide(&NativeStrategy, &owner("web-2", "uid-2"), 2, &["web-1"], false, &live).unwrap();
        assert_eq!(outcome, AdoptionOutcome::NoOp);
    }

    #[test]
    fn newer_revision_wins() {
        let live = controlled_by("web-3", "uid-3", Some(3));
        let outcome =
            decide(&NativeStrategy, &owner("web-2", "uid-2"), 2, &["web-1"], false, &live).unwrap();
        assert_eq!(outcome, AdoptionOutcome::SkipNewerRevision);
    }

    #[test]
    fn previous_revision_hand_off_adopts() {
        let live = controlled_by("web-1", "uid-1", Some(1));
        let outcome =
            decide(&NativeStrategy, &owner("web-2", "uid-2"), 2, &["web-1"], false, &live).unwrap();
        assert_eq!(outcome, AdoptionOutcome::Adopt);
    }

    #[test]
    fn unrelated_controller_is_an_error() {
        let live = controlled_by("stranger", "uid-x", Some(1));
        let err =
            decide(&NativeStrategy, &owner("web-2", "uid-2"), 2, &["web-1"], false, &live)
                .unwrap_err();
        assert!(matches!(err, AdoptionError::NotOwnedByPreviousRevision { .. }));
    }

    #[test]
    fn orphan_requires_force() {
        let live = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"}
        });
        let err = decide(&NativeStrategy, &owner("web-1", "uid-1"), 1, &[], false, &live)
            .unwrap_err();
        assert!(matches!(err, AdoptionError::NotOwnedByPreviousRevision { .. }));

        let outcome =
            decide(&NativeStrategy, &owner("web-1", "uid-1"), 1, &[], true, &live).unwrap();
        assert_eq!(outcome, AdoptionOutcome::Adopt);
    }

    #[test]
    fn equal_revision_different_controller_collides() {
        let live = controlled_by("web-other", "uid-x", Some(2));
        let err =
            decide(&NativeStrategy, &owner("web-2", "uid-2"), 2, &["web-other"], false, &live)
                .unwrap_err();
        assert!(matches!(err, AdoptionError::RevisionCollision { revision: 2, .. }));
    }
}
