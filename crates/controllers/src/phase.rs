//! Phase reconciler: apply one phase's objects under adoption rules, probe
//! availability, and tear phases down in reverse.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::Client;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};

use pko_apis::v1alpha1::ObjectSetProbe;
use pko_apis::{new_condition, Condition};
use pko_core::backoff::OwnerBackoff;
use pko_core::{object, OwnerRef, CACHE_LABEL, CONDITION_TRUE, EXTERNAL_ANNOTATION};
use pko_owners::{OwnerInfo, OwnerStrategy};
use pko_watch::DynamicWatcher;

use crate::adoption::{self, AdoptionOutcome};
use crate::discovery::{dynamic_api, find_api_resource};
use crate::patch::compute_patch;
use crate::probes::phase_available;
use crate::{with_conflict_retry, ControllerError};

const FIELD_MANAGER: &str = "package-operator";

/// Who the phase is reconciled for.
#[derive(Debug, Clone)]
pub struct PhaseOwner {
    pub info: OwnerInfo,
    pub revision: i64,
    /// Names of the previous revisions this owner supersedes.
    pub previous: Vec<String>,
}

impl PhaseOwner {
    fn owner_ref(&self) -> OwnerRef {
        OwnerRef {
            group: self.info.gvk.group.clone(),
            kind: self.info.gvk.kind.clone(),
            name: self.info.name.clone(),
            namespace: self.info.namespace.clone(),
            uid: self.info.uid.clone(),
            controller: None,
        }
    }
}

/// Result of reconciling one phase.
#[derive(Debug, Default)]
pub struct PhaseResult {
    pub available: bool,
    pub probe_failures: Vec<String>,
    /// Per-object adoption issues; surfaced on status, not retried until
    /// an external change.
    pub issues: Vec<String>,
    /// Set when an external resource is missing and the owner should be
    /// requeued after its backoff delay.
    pub retry_after: Option<Duration>,
    /// Conditions copied off live objects via the condition-map annotation.
    pub mapped_conditions: Vec<Condition>,
}

/// Reconciles objects of a single phase. The force-adoption flag is
/// injected at construction and only ever set during bootstrap.
pub struct PhaseReconciler {
    client: Client,
    strategy: Arc<dyn OwnerStrategy>,
    backoff: Arc<OwnerBackoff>,
    watcher: Option<Arc<DynamicWatcher>>,
    force_adoption: bool,
}

impl PhaseReconciler {
    pub fn new(
        client: Client,
        strategy: Arc<dyn OwnerStrategy>,
        backoff: Arc<OwnerBackoff>,
        watcher: Option<Arc<DynamicWatcher>>,
    ) -> Self {
        Self { client, strategy, backoff, watcher, force_adoption: false }
    }

    pub fn with_force_adoption(mut self, force: bool) -> Self {
        self.force_adoption = force;
        self
    }

    /// Build the desired form of a rendered object: dynamic-cache label,
    /// controller edge, revision stamp.
    pub fn desired_object(&self, owner: &PhaseOwner, rendered: &Value) -> Value {
        let mut desired = rendered.clone();
        object::set_label(&mut desired, CACHE_LABEL, "True");
        object::set_revision(&mut desired, owner.revision);
        // The rendered object carries no owners; setting the controller
        // edge on it cannot collide.
        let _ = self.strategy.set_controller_reference(&owner.info, &mut desired);
        desired
    }

    /// Reconcile every object of the phase concurrently, then probe.
    /// Objects marked external are left untouched.
    pub async fn reconcile_phase(
        &self,
        owner: &PhaseOwner,
        objects: &[Value],
        probes: &[ObjectSetProbe],
    ) -> Result<PhaseResult, ControllerError> {
        let outcomes = join_all(
            objects
                .iter()
                .filter(|o| object::annotation(o, EXTERNAL_ANNOTATION) != Some("True"))
                .map(|o| self.reconcile_object(owner, o)),
        )
        .await;

        let mut result = PhaseResult::default();
        let mut live_objects = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(Some(live)) => {
                    result.mapped_conditions.extend(mapped_conditions(&live));
                    live_objects.push(live);
                }
                Ok(None) => {}
                Err(ControllerError::UnmappableKind { kind }) => {
                    let delay = self.backoff.next(&owner.info.uid);
                    warn!(owner = %owner.info.name, kind = %kind, delay_s = delay.as_secs(), "external kind missing; backing off");
                    counter!("phase_external_missing", 1u64);
                    result.retry_after = Some(match result.retry_after {
                        Some(existing) => existing.min(delay),
                        None => delay,
                    });
                }
                Err(ControllerError::Adoption(e)) => {
                    counter!("phase_adoption_errors", 1u64);
                    result.issues.push(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        self.backoff.gc();

        let refs: Vec<&Value> = live_objects.iter().collect();
        let (available, failures) = phase_available(probes, &refs);
        result.available = available && result.issues.is_empty() && result.retry_after.is_none();
        result.probe_failures = failures;
        Ok(result)
    }

    /// Reconcile one object; returns the live object after write, or
    /// `None` when a newer revision owns it.
    async fn reconcile_object(
        &self,
        owner: &PhaseOwner,
        rendered: &Value,
    ) -> Result<Option<Value>, ControllerError> {
        let gvk = object::gvk_of(rendered).map_err(|source| ControllerError::Object {
            key: object::name_of(rendered).unwrap_or("<unnamed>").to_string(),
            source,
        })?;
        let name = object::name_of(rendered)
            .ok_or_else(|| ControllerError::Internal("rendered object missing name".into()))?
            .to_string();
        let namespace = object::namespace_of(rendered)
            .map(String::from)
            .or_else(|| owner.info.namespace.clone());

        let (ar, namespaced) = find_api_resource(self.client.clone(), &gvk).await?;
        if let Some(watcher) = &self.watcher {
            watcher.watch(&owner.owner_ref(), gvk.clone());
        }
        let api = dynamic_api(self.client.clone(), &ar, namespaced, namespace.as_deref());

        let desired = self.desired_object(owner, rendered);
        let previous: Vec<&str> = owner.previous.iter().map(String::as_str).collect();

        with_conflict_retry(|| {
            let api = api.clone();
            let desired = desired.clone();
            let previous = previous.clone();
            let name = name.clone();
            async move {
                match api.get_opt(&name).await? {
                    None => {
                        let obj: DynamicObject = serde_json::from_value(desired.clone())
                            .map_err(|e| ControllerError::Internal(e.to_string()))?;
                        let created = api.create(&PostParams::default(), &obj).await?;
                        debug!(object = %name, "object created");
                        Ok(Some(serde_json::to_value(created)
                            .map_err(|e| ControllerError::Internal(e.to_string()))?))
                    }
                    Some(live_obj) => {
                        let live = serde_json::to_value(&live_obj)
                            .map_err(|e| ControllerError::Internal(e.to_string()))?;
                        let outcome = adoption::decide(
                            self.strategy.as_ref(),
                            &owner.info,
                            owner.revision,
                            &previous,
                            self.force_adoption,
                            &live,
                        )?;
                        let desired = match outcome {
                            AdoptionOutcome::SkipNewerRevision => {
                                debug!(object = %name, "newer revision owns object; skipping");
                                return Ok(None);
                            }
                            AdoptionOutcome::NoOp => desired,
                            AdoptionOutcome::Adopt => {
                                info!(object = %name, owner = %owner.info.name, "adopting object");
                                counter!("phase_adoptions", 1u64);
                                let mut with_owners = live.clone();
                                self.strategy.release_controller(&mut with_owners);
                                self.strategy
                                    .set_controller_reference(&owner.info, &mut with_owners)
                                    .map_err(|e| ControllerError::Internal(e.to_string()))?;
                                let mut desired = desired.clone();
                                carry_owners(&mut desired, &with_owners);
                                desired
                            }
                        };
                        match compute_patch(&desired, &live) {
                            None => Ok(Some(live)),
                            Some(patch) => {
                                let patched = api
                                    .patch(
                                        &name,
                                        &PatchParams::default(),
                                        &Patch::Merge(&patch),
                                    )
                                    .await?;
                                debug!(object = %name, "object patched");
                                Ok(Some(serde_json::to_value(patched)
                                    .map_err(|e| ControllerError::Internal(e.to_string()))?))
                            }
                        }
                    }
                }
            }
        })
        .await
    }

    /// Tear down one phase. Returns true only when every object is gone
    /// from the apiserver; owned objects with finalizers keep it false
    /// until they drain.
    pub async fn teardown_phase(
        &self,
        owner: &PhaseOwner,
        objects: &[Value],
    ) -> Result<bool, ControllerError> {
        let mut done = true;
        for rendered in objects.iter().rev() {
            if object::annotation(rendered, EXTERNAL_ANNOTATION) == Some("True") {
                continue;
            }
            let gvk = match object::gvk_of(rendered) {
                Ok(gvk) => gvk,
                Err(_) => continue,
            };
            let Some(name) = object::name_of(rendered) else { continue };
            let namespace = object::namespace_of(rendered)
                .map(String::from)
                .or_else(|| owner.info.namespace.clone());

            let (ar, namespaced) = match find_api_resource(self.client.clone(), &gvk).await {
                Ok(found) => found,
                // Kind no longer served: nothing of it can remain.
                Err(ControllerError::UnmappableKind { .. }) => continue,
                Err(e) => return Err(e),
            };
            let api = dynamic_api(self.client.clone(), &ar, namespaced, namespace.as_deref());

            match api.get_opt(name).await? {
                None => {}
                Some(live_obj) => {
                    let live = serde_json::to_value(&live_obj)
                        .map_err(|e| ControllerError::Internal(e.to_string()))?;
                    if !self.strategy.is_controller(&owner.info, &live) {
                        // Not ours to delete; drop out of the owner set.
                        let mut released = live.clone();
                        self.strategy.remove_owner(&owner.info, &mut released);
                        if let Some(patch) = compute_patch(&released, &live) {
                            let _ = api
                                .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                                .await;
                        }
                        continue;
                    }
                    match api.delete(name, &DeleteParams::default()).await {
                        Ok(_) => {
                            debug!(object = %name, "delete issued");
                            // Still present until the finalizers drain.
                            done = false;
                        }
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(done)
    }

    /// Drop every watch registration held for `owner`; called once full
    /// teardown has finished.
    pub fn release_watches(&self, owner: &PhaseOwner) {
        if let Some(watcher) = &self.watcher {
            watcher.free(&owner.owner_ref());
        }
    }
}

/// Carry the owner list of `source` onto `desired` so the ownership
/// mutation rides along with the regular patch.
fn carry_owners(desired: &mut Value, source: &Value) {
    if let Some(refs) = source.get("metadata").and_then(|m| m.get("ownerReferences")) {
        if let Some(meta) = desired.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("ownerReferences".to_string(), refs.clone());
        }
    }
    if let Some(owners) = object::annotation(source, pko_core::OWNERS_ANNOTATION) {
        let owners = owners.to_string();
        object::set_annotation(desired, pko_core::OWNERS_ANNOTATION, &owners);
    }
}

/// Conditions copied from a live object according to its condition-map
/// annotation (`src => dst`, one per line).
pub fn mapped_conditions(live: &Value) -> Vec<Condition> {
    let mappings = object::condition_mappings(live);
    if mappings.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (src, dst) in mappings {
        if let Some(status) = object::condition_status(live, &src) {
            let message = object::object_conditions(live)
                .into_iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some(src.as_str()))
                .and_then(|c| c.get("message").and_then(Value::as_str))
                .unwrap_or("")
                .to_string();
            out.push(new_condition(&dst, status, "MappedCondition", &message));
        }
    }
    out
}

/// True when a mapped condition set reports every destination True; test
/// helper and status plumbing.
pub fn all_true(conditions: &[Condition]) -> bool {
    conditions.iter().all(|c| c.status == CONDITION_TRUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_core::CONDITION_MAP_ANNOTATION;
    use serde_json::json;

    #[test]
    fn mapped_conditions_follow_the_annotation() {
        let live = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "annotations": {CONDITION_MAP_ANNOTATION: "Available => WebAvailable"}
            },
            "status": {"conditions": [
                {"type": "Available", "status": "True", "message": "ok"},
                {"type": "Progressing", "status": "False"}
            ]}
        });
        let mapped = mapped_conditions(&live);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].r#type, "WebAvailable");
        assert_eq!(mapped[0].status, "True");
        assert_eq!(mapped[0].message.as_deref(), Some("ok"));
        assert!(all_true(&mapped));
    }

    #[test]
    fn unmapped_objects_contribute_nothing() {
        let live = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"}
        });
        assert!(mapped_conditions(&live).is_empty());
    }

    #[test]
    fn carry_owners_moves_both_forms() {
        let mut desired = json!({"metadata": {"name": "cm"}});
        let source = json!({
            "metadata": {
                "name": "cm",
                "ownerReferences": [{"apiVersion": "v1", "kind": "X", "name": "a", "uid": "u"}],
                "annotations": {pko_core::OWNERS_ANNOTATION: "[]"}
            }
        });
        carry_owners(&mut desired, &source);
        assert!(desired["metadata"]["ownerReferences"].is_array());
        assert_eq!(
            object::annotation(&desired, pko_core::OWNERS_ANNOTATION),
            Some("[]")
        );
    }
}
