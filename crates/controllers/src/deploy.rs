//! Package deployer: translate a rendered package into an
//! ObjectDeployment with chunked ObjectSlices, then materialize the next
//! ObjectSet revision when the template changed.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use metrics::{counter, histogram};
use tracing::{debug, info};

use pko_apis::v1alpha1::{
    LabelSelectorSpec, ObjectDeployment, ObjectDeploymentSpec, ObjectSet, ObjectSetObject,
    ObjectSetSpec, ObjectSetTemplate, ObjectSetTemplateMetadata, ObjectSetTemplatePhase,
    ObjectSetTemplateSpec, ObjectSlice, ObjectSliceSpec, PreviousRevisionRef,
};
use pko_core::{INSTANCE_LABEL, PACKAGE_LABEL, REVISION_ANNOTATION};
use pko_packages::PackageInstance;

use crate::slices::{chunk_objects, inline_budget, objects_equal, slice_name};
use crate::{with_conflict_retry, ControllerError};

const MAX_SLICE_COLLISIONS: i32 = 5;
const FIELD_MANAGER: &str = "package-operator";

/// Deploys rendered packages into a namespace.
pub struct PackageDeployer {
    client: Client,
}

impl PackageDeployer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Write the desired ObjectDeployment (and its slices) for a rendered
    /// package, creating the next ObjectSet revision when the template
    /// changed.
    pub async fn deploy(
        &self,
        namespace: &str,
        instance_name: &str,
        instance: &PackageInstance,
    ) -> Result<(), ControllerError> {
        let t0 = std::time::Instant::now();
        counter!("deploy_attempts", 1u64);

        let labels = package_labels(&instance.manifest.metadata.name, instance_name);
        let deployments: Api<ObjectDeployment> = Api::namespaced(self.client.clone(), namespace);

        // Pre-create with an empty template so slices can carry an owner
        // reference to the deployment.
        let mut deployment = match deployments.get_opt(instance_name).await? {
            Some(existing) => existing,
            None => {
                let stub = ObjectDeployment::new(
                    instance_name,
                    ObjectDeploymentSpec {
                        selector: LabelSelectorSpec { match_labels: labels.clone() },
                        template: ObjectSetTemplate::default(),
                        revision_history_limit: None,
                    },
                );
                let mut stub = stub;
                stub.metadata.labels = Some(labels.clone().into_iter().collect());
                deployments.create(&PostParams::default(), &stub).await.map_err(|e| {
                    counter!("deploy_err", 1u64);
                    ControllerError::from(e)
                })?
            }
        };

        let slices: Api<ObjectSlice> = Api::namespaced(self.client.clone(), namespace);
        let owner_ref = controller_owner_ref(&deployment);
        let budget = inline_budget();

        let mut phases = Vec::new();
        for phase in &instance.manifest.spec.phases {
            let objects: Vec<ObjectSetObject> = instance
                .phase_objects(&phase.name)
                .into_iter()
                .map(|o| ObjectSetObject { object: o.clone() })
                .collect();
            // An empty phase is elided from the template entirely.
            if objects.is_empty() {
                continue;
            }
            let groups = chunk_objects(&objects, budget);
            let phase_bytes: usize = objects
                .iter()
                .map(|o| serde_json::to_vec(&o.object).map(|v| v.len()).unwrap_or(0))
                .sum();
            let template_phase = if groups.len() == 1 && phase_bytes <= budget {
                ObjectSetTemplatePhase {
                    name: phase.name.clone(),
                    class: phase.class.clone(),
                    objects,
                    slices: Vec::new(),
                }
            } else {
                let mut slice_names = Vec::new();
                for group in groups {
                    let name = self
                        .ensure_slice(&slices, instance_name, &owner_ref, &mut deployment, group)
                        .await?;
                    slice_names.push(name);
                }
                ObjectSetTemplatePhase {
                    name: phase.name.clone(),
                    class: phase.class.clone(),
                    objects: Vec::new(),
                    slices: slice_names,
                }
            };
            phases.push(template_phase);
        }

        let template = ObjectSetTemplate {
            metadata: ObjectSetTemplateMetadata {
                labels: labels.clone(),
                annotations: BTreeMap::new(),
            },
            spec: ObjectSetTemplateSpec {
                phases,
                availability_probes: instance.manifest.spec.availability_probes.clone(),
                success_delay_seconds: None,
            },
        };

        self.update_deployment(&deployments, instance_name, &labels, template.clone()).await?;
        self.reconcile_revisions(namespace, instance_name, &labels, &template).await?;

        histogram!("deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("deploy_ok", 1u64);
        Ok(())
    }

    /// Create or reuse the content-addressed slice for one object group.
    /// Name collisions with non-equal content bump the collision counter
    /// and retry, bounded.
    async fn ensure_slice(
        &self,
        slices: &Api<ObjectSlice>,
        deployment_name: &str,
        owner_ref: &OwnerReference,
        deployment: &mut ObjectDeployment,
        objects: Vec<ObjectSetObject>,
    ) -> Result<String, ControllerError> {
        use pko_apis::v1alpha1::ObjectDeploymentLike;

        let base = deployment.collision_count();
        let mut name = String::new();
        for attempt in 0..=MAX_SLICE_COLLISIONS {
            name = slice_name(deployment_name, &objects, base + attempt);
            let mut slice = ObjectSlice::new(&name, ObjectSliceSpec { objects: objects.clone() });
            slice.metadata.owner_references = Some(vec![owner_ref.clone()]);
            match slices.create(&PostParams::default(), &slice).await {
                Ok(_) => {
                    debug!(slice = %name, "slice created");
                    if attempt > 0 {
                        deployment.set_collision_count(base + attempt);
                    }
                    return Ok(name);
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    let existing = slices.get(&name).await?;
                    let same_owner = existing
                        .metadata
                        .owner_references
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .any(|o| o.uid == owner_ref.uid);
                    if same_owner && objects_equal(&existing.spec.objects, &objects) {
                        debug!(slice = %name, "slice reused");
                        return Ok(name);
                    }
                    counter!("slice_collisions", 1u64);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::SliceCollisionExhausted { name })
    }

    /// Merge annotations/labels (new keys win) and swap the template spec.
    async fn update_deployment(
        &self,
        deployments: &Api<ObjectDeployment>,
        name: &str,
        labels: &BTreeMap<String, String>,
        template: ObjectSetTemplate,
    ) -> Result<(), ControllerError> {
        with_conflict_retry(|| {
            let deployments = deployments.clone();
            let template = template.clone();
            let labels = labels.clone();
            async move {
                let mut current = match deployments.get_opt(name).await? {
                    Some(d) => d,
                    // Deleted underneath us: recreate rather than fail the pass.
                    None => ObjectDeployment::new(
                        name,
                        ObjectDeploymentSpec {
                            selector: LabelSelectorSpec { match_labels: labels.clone() },
                            template: ObjectSetTemplate::default(),
                            revision_history_limit: None,
                        },
                    ),
                };
                let merged = current.metadata.labels.take().map(|mut have| {
                    for (k, v) in &labels {
                        have.insert(k.clone(), v.clone());
                    }
                    have
                });
                current.metadata.labels =
                    Some(merged.unwrap_or_else(|| labels.clone().into_iter().collect()));
                current.spec.selector = LabelSelectorSpec { match_labels: labels.clone() };
                current.spec.template = template;

                if current.metadata.uid.is_some() {
                    deployments
                        .replace(name, &PostParams::default(), &current)
                        .await
                        .map(|_| ())
                        .map_err(ControllerError::from)
                } else {
                    deployments
                        .create(&PostParams::default(), &current)
                        .await
                        .map(|_| ())
                        .map_err(ControllerError::from)
                }
            }
        })
        .await
    }

    /// Create the next ObjectSet revision when the deployment template
    /// does not match the latest revision.
    async fn reconcile_revisions(
        &self,
        namespace: &str,
        deployment_name: &str,
        labels: &BTreeMap<String, String>,
        template: &ObjectSetTemplate,
    ) -> Result<(), ControllerError> {
        let sets: Api<ObjectSet> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{INSTANCE_LABEL}={}", labels[INSTANCE_LABEL]);
        let existing = sets.list(&ListParams::default().labels(&selector)).await?;

        let mut revisions: Vec<(i64, &ObjectSet)> = existing
            .items
            .iter()
            .map(|os| (revision_of_set(os), os))
            .collect();
        revisions.sort_by_key(|(rev, _)| *rev);

        if let Some((_, latest)) = revisions.last() {
            if latest.spec.template == template.spec {
                return Ok(());
            }
        }
        let next_revision = revisions.last().map(|(rev, _)| rev + 1).unwrap_or(1);
        let previous = revisions
            .iter()
            .map(|(_, os)| PreviousRevisionRef { name: os.name_any() })
            .collect();

        let deployments: Api<ObjectDeployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = deployments.get(deployment_name).await?;

        let name = format!("{deployment_name}-{next_revision}");
        let mut object_set = ObjectSet::new(
            &name,
            ObjectSetSpec {
                lifecycle_state: Default::default(),
                previous,
                template: template.spec.clone(),
            },
        );
        object_set.metadata.labels = Some(labels.clone().into_iter().collect());
        object_set.metadata.annotations = Some(
            [(REVISION_ANNOTATION.to_string(), next_revision.to_string())].into_iter().collect(),
        );
        object_set.metadata.owner_references = Some(vec![controller_owner_ref(&deployment)]);
        match sets.create(&PostParams::default(), &object_set).await {
            Ok(_) => {
                info!(objectset = %name, revision = next_revision, "revision created");
                let status = serde_json::json!({"status": {"revision": next_revision}});
                let _ = deployments
                    .patch_status(deployment_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&status))
                    .await;
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()), // raced another pass
            Err(e) => Err(e.into()),
        }
    }
}

/// Identifying labels every rendered object and owned resource carries.
pub fn package_labels(package: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PACKAGE_LABEL.to_string(), package.to_string()),
        (INSTANCE_LABEL.to_string(), instance.to_string()),
    ])
}

/// Revision recorded on an ObjectSet: status wins, the creation
/// annotation seeds it before the first status write.
pub fn revision_of_set(os: &ObjectSet) -> i64 {
    use pko_apis::v1alpha1::ObjectSetLike;
    os.revision()
        .or_else(|| {
            os.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REVISION_ANNOTATION))
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(0)
}

fn controller_owner_ref<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: owner.meta().name.clone().unwrap_or_default(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_labels_are_selector_and_template_labels() {
        let labels = package_labels("web", "web-prod");
        assert_eq!(labels[PACKAGE_LABEL], "web");
        assert_eq!(labels[INSTANCE_LABEL], "web-prod");
    }

    #[test]
    fn revision_reads_status_then_annotation() {
        let mut os = ObjectSet::new("web-3", Default::default());
        assert_eq!(revision_of_set(&os), 0);
        os.metadata.annotations =
            Some([(REVISION_ANNOTATION.to_string(), "3".to_string())].into_iter().collect());
        assert_eq!(revision_of_set(&os), 3);
        use pko_apis::v1alpha1::ObjectSetLike;
        os.set_revision(4);
        assert_eq!(revision_of_set(&os), 4);
    }

    #[test]
    fn owner_ref_carries_kind_and_uid() {
        let mut deployment = ObjectDeployment::new("web", Default::default());
        deployment.metadata.uid = Some("uid-1".into());
        let or = controller_owner_ref(&deployment);
        assert_eq!(or.kind, "ObjectDeployment");
        assert_eq!(or.api_version, "package-operator.run/v1alpha1");
        assert_eq!(or.uid, "uid-1");
        assert_eq!(or.controller, Some(true));
    }
}
