//! Cluster API types, `package-operator.run/v1alpha1`.
//!
//! Every kind comes in a namespaced and a cluster-scoped variant; the
//! `ObjectSetLike` / `ObjectDeploymentLike` traits let the controllers treat
//! both uniformly.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Condition;

pub const GROUP: &str = "package-operator.run";
pub const VERSION: &str = "v1alpha1";

/// Lifecycle state requested on an ObjectSet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ObjectSetLifecycleState {
    #[default]
    Active,
    Paused,
    Archived,
}

/// Reference to a previous revision this ObjectSet supersedes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreviousRevisionRef {
    pub name: String,
}

/// A single object inside a phase, kept as the raw rendered tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetObject {
    pub object: Value,
}

/// A named, ordered group of objects. Objects live inline or spill into
/// ObjectSlices referenced by name, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplatePhase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectSetObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slices: Vec<String>,
}

/// Selects objects a probe applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSelector {
    pub kind: KindSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<NameSelector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KindSelector {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

/// Name match, anchored regular expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NameSelector {
    pub pattern: String,
}

/// One probe primitive. Externally tagged so the YAML reads
/// `condition: {...}` / `fieldsEqual: {...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Probe {
    Condition(ConditionProbe),
    FieldsEqual(FieldsEqualProbe),
    JsonPath(JsonPathProbe),
    Cel(CelProbe),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionProbe {
    pub r#type: String,
    #[serde(default = "default_condition_status")]
    pub status: String,
}

fn default_condition_status() -> String {
    "True".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldsEqualProbe {
    pub field_a: String,
    pub field_b: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JsonPathProbe {
    pub path: String,
    pub value: Value,
}

/// CEL-style scalar equality: `self.<path> == <literal>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CelProbe {
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Probe plus the objects it selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetProbe {
    pub selector: ProbeSelector,
    pub probes: Vec<Probe>,
}

/// The parts of an ObjectSet spec shared with the deployment template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<ObjectSetTemplatePhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_delay_seconds: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// ObjectSet is one immutable revision of a package's objects.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectSet",
    namespaced,
    status = "ObjectSetStatus",
    printcolumn = r#"{"name":"Revision","type":"integer","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetSpec {
    #[serde(default)]
    pub lifecycle_state: ObjectSetLifecycleState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PreviousRevisionRef>,
    #[serde(flatten)]
    pub template: ObjectSetTemplateSpec,
}

/// Cluster-scoped ObjectSet.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterObjectSet",
    status = "ObjectSetStatus",
    printcolumn = r#"{"name":"Revision","type":"integer","jsonPath":".status.revision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectSetSpec {
    #[serde(default)]
    pub lifecycle_state: ObjectSetLifecycleState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PreviousRevisionRef>,
    #[serde(flatten)]
    pub template: ObjectSetTemplateSpec,
}

/// Label selector restricted to equality matches; all this system needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplate {
    #[serde(default)]
    pub metadata: ObjectSetTemplateMetadata,
    #[serde(default)]
    pub spec: ObjectSetTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// ObjectDeployment owns a series of ObjectSet revisions.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectDeployment",
    namespaced,
    status = "ObjectDeploymentStatus",
    printcolumn = r#"{"name":"Revision","type":"integer","jsonPath":".status.revision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentSpec {
    #[serde(default)]
    pub selector: LabelSelectorSpec,
    #[serde(default)]
    pub template: ObjectSetTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterObjectDeployment",
    status = "ObjectDeploymentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectDeploymentSpec {
    #[serde(default)]
    pub selector: LabelSelectorSpec,
    #[serde(default)]
    pub template: ObjectSetTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
}

/// Content-addressed chunk of objects spilled out of an oversized phase.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectSlice",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSliceSpec {
    pub objects: Vec<ObjectSetObject>,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ClusterObjectSlice"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectSliceSpec {
    pub objects: Vec<ObjectSetObject>,
}

/// Uniform access to the namespaced and cluster-scoped ObjectSet variants.
pub trait ObjectSetLike:
    kube::Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn lifecycle_state(&self) -> ObjectSetLifecycleState;
    fn previous(&self) -> &[PreviousRevisionRef];
    fn template_spec(&self) -> &ObjectSetTemplateSpec;
    fn status_conditions(&self) -> &[Condition];
    fn status_conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn revision(&self) -> Option<i64>;
    fn set_revision(&mut self, revision: i64);
    fn set_observed_generation(&mut self, generation: Option<i64>);

    fn is_paused(&self) -> bool {
        self.lifecycle_state() == ObjectSetLifecycleState::Paused
    }
    fn is_archived(&self) -> bool {
        self.lifecycle_state() == ObjectSetLifecycleState::Archived
    }
    fn phases(&self) -> &[ObjectSetTemplatePhase] {
        &self.template_spec().phases
    }
}

macro_rules! impl_object_set_like {
    ($ty:ty) => {
        impl ObjectSetLike for $ty {
            fn lifecycle_state(&self) -> ObjectSetLifecycleState {
                self.spec.lifecycle_state
            }
            fn previous(&self) -> &[PreviousRevisionRef] {
                &self.spec.previous
            }
            fn template_spec(&self) -> &ObjectSetTemplateSpec {
                &self.spec.template
            }
            fn status_conditions(&self) -> &[Condition] {
                self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
            }
            fn status_conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }
            fn revision(&self) -> Option<i64> {
                self.status.as_ref().and_then(|s| s.revision)
            }
            fn set_revision(&mut self, revision: i64) {
                self.status.get_or_insert_with(Default::default).revision = Some(revision);
            }
            fn set_observed_generation(&mut self, generation: Option<i64>) {
                self.status.get_or_insert_with(Default::default).observed_generation = generation;
            }
        }
    };
}

impl_object_set_like!(ObjectSet);
impl_object_set_like!(ClusterObjectSet);

/// Uniform access to the deployment variants.
pub trait ObjectDeploymentLike:
    kube::Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn selector_labels(&self) -> &BTreeMap<String, String>;
    fn template(&self) -> &ObjectSetTemplate;
    fn set_template(&mut self, template: ObjectSetTemplate);
    fn collision_count(&self) -> i32;
    fn set_collision_count(&mut self, count: i32);
    fn status_conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn status_revision(&self) -> Option<i64>;
    fn set_status_revision(&mut self, revision: i64);
}

macro_rules! impl_object_deployment_like {
    ($ty:ty) => {
        impl ObjectDeploymentLike for $ty {
            fn selector_labels(&self) -> &BTreeMap<String, String> {
                &self.spec.selector.match_labels
            }
            fn template(&self) -> &ObjectSetTemplate {
                &self.spec.template
            }
            fn set_template(&mut self, template: ObjectSetTemplate) {
                self.spec.template = template;
            }
            fn collision_count(&self) -> i32 {
                self.status.as_ref().and_then(|s| s.collision_count).unwrap_or(0)
            }
            fn set_collision_count(&mut self, count: i32) {
                self.status.get_or_insert_with(Default::default).collision_count = Some(count);
            }
            fn status_conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }
            fn status_revision(&self) -> Option<i64> {
                self.status.as_ref().and_then(|s| s.revision)
            }
            fn set_status_revision(&mut self, revision: i64) {
                self.status.get_or_insert_with(Default::default).revision = Some(revision);
            }
        }
    };
}

impl_object_deployment_like!(ObjectDeployment);
impl_object_deployment_like!(ClusterObjectDeployment);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_yaml_shape() {
        let yaml = r#"
selector:
  kind:
    group: apps
    kind: Deployment
probes:
- condition:
    type: Available
    status: "True"
- fieldsEqual:
    fieldA: .status.updatedReplicas
    fieldB: .status.replicas
"#;
        let probe: ObjectSetProbe = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(probe.selector.kind.kind, "Deployment");
        assert_eq!(probe.probes.len(), 2);
        assert!(matches!(probe.probes[0], Probe::Condition(_)));
        assert!(matches!(probe.probes[1], Probe::FieldsEqual(_)));
    }

    #[test]
    fn objectset_spec_flattens_template() {
        let yaml = r#"
lifecycleState: Paused
previous:
- name: web-1
phases:
- name: deploy
  objects:
  - object:
      apiVersion: v1
      kind: ConfigMap
      metadata: {name: cm}
"#;
        let spec: ObjectSetSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.lifecycle_state, ObjectSetLifecycleState::Paused);
        assert_eq!(spec.previous.len(), 1);
        assert_eq!(spec.template.phases[0].name, "deploy");
    }

    #[test]
    fn adapter_reads_both_variants() {
        let os = ObjectSet::new("web-2", ObjectSetSpec::default());
        assert!(!os.is_paused());
        assert!(os.phases().is_empty());
        let cos = ClusterObjectSet::new("web-2", ClusterObjectSetSpec::default());
        assert_eq!(cos.revision(), None);
    }
}
