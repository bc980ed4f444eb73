//! ObjectSet controller: owns one revision through rollout, availability,
//! archival, and finalizer-gated teardown. Generic over the namespaced
//! and cluster-scoped variants through `ObjectSetLike` plus a small
//! access shim for API construction.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use pko_apis::v1alpha1::{
    ClusterObjectSet, ClusterObjectSlice, ObjectSet, ObjectSetLifecycleState, ObjectSetLike,
    ObjectSetObject, ObjectSetTemplatePhase, ObjectSlice,
};
use pko_apis::{condition_is_true, new_condition, set_condition, Condition};
use pko_core::{
    Gvk, COND_ARCHIVED, COND_AVAILABLE, COND_IN_TRANSITION, COND_PAUSED, COND_SUCCEEDED,
    CONDITION_FALSE, CONDITION_TRUE, ORPHAN_FINALIZER, REVISION_ANNOTATION, TEARDOWN_FINALIZER,
};
use pko_owners::OwnerInfo;

use crate::phase::{PhaseOwner, PhaseReconciler};
use crate::ControllerError;

const FIELD_MANAGER: &str = "package-operator";

/// What the caller should do after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    RequeueAfter(Duration),
}

/// Variant-specific API plumbing: typed API handles and slice resolution.
#[async_trait]
pub trait ObjectSetAccess<OS>: Send + Sync {
    fn api(&self, client: Client, namespace: Option<&str>) -> Api<OS>;
    async fn slice_objects(
        &self,
        client: Client,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Vec<ObjectSetObject>, ControllerError>;
}

/// Namespaced ObjectSet / ObjectSlice plumbing.
pub struct NamespacedAccess;

#[async_trait]
impl ObjectSetAccess<ObjectSet> for NamespacedAccess {
    fn api(&self, client: Client, namespace: Option<&str>) -> Api<ObjectSet> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::default_namespaced(client),
        }
    }

    async fn slice_objects(
        &self,
        client: Client,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Vec<ObjectSetObject>, ControllerError> {
        let api: Api<ObjectSlice> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::default_namespaced(client),
        };
        Ok(api.get(name).await?.spec.objects)
    }
}

/// Cluster-scoped plumbing.
pub struct ClusterAccess;

#[async_trait]
impl ObjectSetAccess<ClusterObjectSet> for ClusterAccess {
    fn api(&self, client: Client, _namespace: Option<&str>) -> Api<ClusterObjectSet> {
        Api::all(client)
    }

    async fn slice_objects(
        &self,
        client: Client,
        _namespace: Option<&str>,
        name: &str,
    ) -> Result<Vec<ObjectSetObject>, ControllerError> {
        let api: Api<ClusterObjectSlice> = Api::all(client);
        Ok(api.get(name).await?.spec.objects)
    }
}

pub struct ObjectSetReconciler<OS, A> {
    client: Client,
    access: A,
    phases: PhaseReconciler,
    _marker: std::marker::PhantomData<OS>,
}

impl<OS, A> ObjectSetReconciler<OS, A>
where
    OS: ObjectSetLike,
    A: ObjectSetAccess<OS>,
{
    pub fn new(client: Client, access: A, phases: PhaseReconciler) -> Self {
        Self { client, access, phases, _marker: std::marker::PhantomData }
    }

    fn phase_owner(&self, os: &OS) -> PhaseOwner {
        PhaseOwner {
            info: OwnerInfo {
                gvk: Gvk::from_api_version(&OS::api_version(&()), &OS::kind(&())),
                name: os.name_any(),
                namespace: os.meta().namespace.clone(),
                uid: os.meta().uid.clone().unwrap_or_default(),
            },
            revision: revision_of(os),
            previous: os.previous().iter().map(|p| p.name.clone()).collect(),
        }
    }

    async fn phase_objects(
        &self,
        os: &OS,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<Vec<Value>, ControllerError> {
        let mut objects: Vec<Value> =
            phase.objects.iter().map(|o| o.object.clone()).collect();
        for slice_name in &phase.slices {
            let sliced = self
                .access
                .slice_objects(self.client.clone(), os.meta().namespace.as_deref(), slice_name)
                .await?;
            objects.extend(sliced.into_iter().map(|o| o.object));
        }
        Ok(objects)
    }

    /// One reconcile pass for a revision.
    pub async fn reconcile(&self, os: &OS) -> Result<ReconcileOutcome, ControllerError> {
        let t0 = std::time::Instant::now();
        counter!("objectset_reconciles", 1u64);
        let name = os.name_any();
        let api = self.access.api(self.client.clone(), os.meta().namespace.as_deref());

        if os.meta().deletion_timestamp.is_some() || os.is_archived() {
            let outcome = self.teardown(os, &api).await;
            histogram!("objectset_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
            return outcome;
        }

        self.ensure_finalizer(os, &api).await?;

        let mut conditions = os.status_conditions().to_vec();
        let generation = os.meta().generation;

        if os.is_paused() {
            // Paused reconciliation reports but never writes objects. The
            // observed generation still advances so tooling sees the spec
            // change was noticed.
            set_condition(
                &mut conditions,
                new_condition(COND_PAUSED, CONDITION_TRUE, "Paused", "reconciliation paused"),
            );
            self.write_status(&api, &name, os, conditions, generation).await?;
            return Ok(ReconcileOutcome::Done);
        }
        remove_condition(&mut conditions, COND_PAUSED);

        let owner = self.phase_owner(os);
        let mut requeue: Option<Duration> = None;
        let mut all_available = true;

        for phase in os.phases() {
            let objects = self.phase_objects(os, phase).await?;
            let result = self
                .phases
                .reconcile_phase(&owner, &objects, &os.template_spec().availability_probes)
                .await?;

            for mapped in result.mapped_conditions {
                set_condition(&mut conditions, mapped);
            }
            if !result.issues.is_empty() {
                set_condition(
                    &mut conditions,
                    new_condition(
                        COND_AVAILABLE,
                        CONDITION_FALSE,
                        "AdoptionBlocked",
                        &result.issues.join("; "),
                    ),
                );
                all_available = false;
                break;
            }
            if let Some(delay) = result.retry_after {
                requeue = Some(requeue.map_or(delay, |r| r.min(delay)));
                all_available = false;
                break;
            }
            if !result.available {
                debug!(objectset = %name, phase = %phase.name, "phase not yet available");
                set_condition(
                    &mut conditions,
                    new_condition(
                        COND_AVAILABLE,
                        CONDITION_FALSE,
                        "ProbeFailure",
                        &result.probe_failures.join("; "),
                    ),
                );
                all_available = false;
                // A phase advances only when its predecessor is Available.
                break;
            }
        }

        if all_available {
            set_condition(
                &mut conditions,
                new_condition(COND_AVAILABLE, CONDITION_TRUE, "Available", "all phases available"),
            );
            if !condition_is_true(&conditions, COND_SUCCEEDED) {
                set_condition(
                    &mut conditions,
                    new_condition(COND_SUCCEEDED, CONDITION_TRUE, "RolloutSucceeded", "revision became available"),
                );
            }
            set_condition(
                &mut conditions,
                new_condition(COND_IN_TRANSITION, CONDITION_FALSE, "Idle", "rollout complete"),
            );
            self.archive_previous(os).await?;
        } else {
            set_condition(
                &mut conditions,
                new_condition(COND_IN_TRANSITION, CONDITION_TRUE, "RollingOut", "phases are being reconciled"),
            );
        }

        self.write_status(&api, &name, os, conditions, generation).await?;
        histogram!("objectset_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match requeue {
            Some(delay) => Ok(ReconcileOutcome::RequeueAfter(delay)),
            None if !all_available => Ok(ReconcileOutcome::RequeueAfter(Duration::from_secs(30))),
            None => Ok(ReconcileOutcome::Done),
        }
    }

    /// Reverse-order teardown; the finalizer is removed only when every
    /// owned object is gone. The orphan finalizer skips child deletion.
    async fn teardown(&self, os: &OS, api: &Api<OS>) -> Result<ReconcileOutcome, ControllerError> {
        let name = os.name_any();
        let finalizers = os.meta().finalizers.clone().unwrap_or_default();

        let orphaned = finalizers.iter().any(|f| f == ORPHAN_FINALIZER);
        let owner = self.phase_owner(os);
        let mut done = true;
        if !orphaned {
            for phase in os.phases().iter().rev() {
                let objects = self.phase_objects(os, phase).await?;
                if !self.phases.teardown_phase(&owner, &objects).await? {
                    done = false;
                    break;
                }
            }
        }

        if !done {
            debug!(objectset = %name, "teardown waiting on object deletion");
            return Ok(ReconcileOutcome::RequeueAfter(Duration::from_secs(10)));
        }
        self.phases.release_watches(&owner);

        if os.is_archived() && os.meta().deletion_timestamp.is_none() {
            let mut conditions = os.status_conditions().to_vec();
            set_condition(
                &mut conditions,
                new_condition(COND_ARCHIVED, CONDITION_TRUE, "Archived", "revision archived"),
            );
            set_condition(
                &mut conditions,
                new_condition(COND_AVAILABLE, CONDITION_FALSE, "Archived", "revision archived"),
            );
            self.write_status(api, &name, os, conditions, os.meta().generation).await?;
            return Ok(ReconcileOutcome::Done);
        }

        // Deletion: drop our finalizer, the apiserver finishes the rest.
        if finalizers.iter().any(|f| f == TEARDOWN_FINALIZER) {
            let remaining: Vec<&String> =
                finalizers.iter().filter(|f| *f != TEARDOWN_FINALIZER).collect();
            let patch = json!({"metadata": {"finalizers": remaining}});
            api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)).await?;
            info!(objectset = %name, "teardown complete; finalizer removed");
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn ensure_finalizer(&self, os: &OS, api: &Api<OS>) -> Result<(), ControllerError> {
        let finalizers = os.meta().finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == TEARDOWN_FINALIZER) {
            return Ok(());
        }
        let mut with_new = finalizers;
        with_new.push(TEARDOWN_FINALIZER.to_string());
        let patch = json!({"metadata": {"finalizers": with_new}});
        api.patch(&os.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Archive the declared previous revisions once this one is Available.
    /// Adoption has already moved shared objects over; archived revisions
    /// tear down whatever they still control.
    async fn archive_previous(&self, os: &OS) -> Result<(), ControllerError> {
        let api = self.access.api(self.client.clone(), os.meta().namespace.as_deref());
        for previous in os.previous() {
            match api.get_opt(&previous.name).await? {
                None => continue,
                Some(prev) => {
                    if prev.is_archived() {
                        continue;
                    }
                    let patch = json!({"spec": {"lifecycleState": "Archived"}});
                    match api
                        .patch(&previous.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                        .await
                    {
                        Ok(_) => info!(previous = %previous.name, "previous revision archived"),
                        Err(e) => warn!(previous = %previous.name, error = %e, "archive failed; will retry"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn write_status(
        &self,
        api: &Api<OS>,
        name: &str,
        os: &OS,
        conditions: Vec<Condition>,
        generation: Option<i64>,
    ) -> Result<(), ControllerError> {
        let status = json!({
            "status": {
                "conditions": conditions,
                "revision": revision_of(os),
                "observedGeneration": generation,
            }
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&status))
            .await?;
        Ok(())
    }
}

/// Revision number of a set: status wins, the creation annotation seeds
/// it before the first status write.
pub fn revision_of<OS: ObjectSetLike>(os: &OS) -> i64 {
    os.revision()
        .or_else(|| {
            os.meta()
                .annotations
                .as_ref()
                .and_then(|a| a.get(REVISION_ANNOTATION))
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(0)
}

fn remove_condition(conditions: &mut Vec<Condition>, cond_type: &str) {
    conditions.retain(|c| c.r#type != cond_type);
}

/// Lifecycle transition guard: an Archived revision never reactivates.
pub fn may_transition(from: ObjectSetLifecycleState, to: ObjectSetLifecycleState) -> bool {
    use ObjectSetLifecycleState::*;
    !matches!((from, to), (Archived, Active) | (Archived, Paused))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_apis::v1alpha1::{ObjectSetSpec, PreviousRevisionRef};

    #[test]
    fn archived_never_reactivates() {
        use ObjectSetLifecycleState::*;
        assert!(may_transition(Active, Paused));
        assert!(may_transition(Active, Archived));
        assert!(may_transition(Paused, Active));
        assert!(!may_transition(Archived, Active));
        assert!(!may_transition(Archived, Paused));
        assert!(may_transition(Archived, Archived));
    }

    #[test]
    fn revision_prefers_status_over_annotation() {
        let mut os = ObjectSet::new("web-2", ObjectSetSpec::default());
        os.metadata.annotations =
            Some([(REVISION_ANNOTATION.to_string(), "2".to_string())].into_iter().collect());
        assert_eq!(revision_of(&os), 2);
        os.set_revision(5);
        assert_eq!(revision_of(&os), 5);
    }

    #[test]
    fn phase_owner_previous_names() {
        let mut os = ObjectSet::new(
            "web-2",
            ObjectSetSpec {
                previous: vec![PreviousRevisionRef { name: "web-1".into() }],
                ..Default::default()
            },
        );
        os.metadata.namespace = Some("prod".into());
        os.metadata.uid = Some("uid-2".into());
        // phase_owner is private to the reconciler; check the pieces it
        // derives from instead.
        assert_eq!(os.previous()[0].name, "web-1");
        assert_eq!(os.meta().namespace.as_deref(), Some("prod"));
    }
}
