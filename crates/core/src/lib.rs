//! Package operator core types: annotations, owner references, and the
//! dynamic object tree helpers shared by every other crate.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod backoff;
pub mod object;

/// File contents keyed by forward-slash relative path.
pub type FileMap = std::collections::BTreeMap<String, Vec<u8>>;

/// Annotation naming the rollout phase an object belongs to. Required on
/// every rendered object.
pub const PHASE_ANNOTATION: &str = "package-operator.run/phase";
/// Annotation carrying the revision number of the ObjectSet that last
/// reconciled the object.
pub const REVISION_ANNOTATION: &str = "package-operator.run/revision";
/// Annotation mapping source condition types to destination types,
/// one `src => dst` pair per line.
pub const CONDITION_MAP_ANNOTATION: &str = "package-operator.run/condition-map";
/// Marks an object as externally managed; excluded from the managed set.
pub const EXTERNAL_ANNOTATION: &str = "package-operator.run/external";
/// Annotation-encoded owner references for cross-cluster deployments.
pub const OWNERS_ANNOTATION: &str = "package-operator.run/owners";

/// Label opting an object into the dynamic cache.
pub const CACHE_LABEL: &str = "package-operator.run/cache";
/// Label naming the package an object was rendered from.
pub const PACKAGE_LABEL: &str = "package-operator.run/package";
/// Label naming the concrete package instance.
pub const INSTANCE_LABEL: &str = "package-operator.run/instance";

/// Finalizer gating ObjectSet deletion on teardown completion.
pub const TEARDOWN_FINALIZER: &str = "package-operator.run/teardown";
/// Finalizer that skips child deletion on teardown.
pub const ORPHAN_FINALIZER: &str = "package-operator.run/orphan";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// ObjectSet condition types
pub const COND_AVAILABLE: &str = "Available";
pub const COND_IN_TRANSITION: &str = "InTransition";
pub const COND_PAUSED: &str = "Paused";
pub const COND_ARCHIVED: &str = "Archived";
pub const COND_SUCCEEDED: &str = "Succeeded";
/// Package-level condition: the image was pulled and validated.
pub const COND_UNPACKED: &str = "Unpacked";

/// Group/version/kind triple for dynamic objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Parse an `apiVersion` string (`v1` or `group/v1`).
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Identity of an object within a cluster, namespace optional for
/// cluster-scoped kinds. Version is deliberately absent: two revisions of
/// the same object must collide on this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gk = if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        };
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", gk, ns, self.name),
            None => write!(f, "{} {}", gk, self.name),
        }
    }
}

/// Owner reference in the strategy-neutral form used by the annotation
/// strategy and the dynamic watcher. Mirrors the native owner reference but
/// keeps group/kind split and namespace explicit so it survives
/// serialization across clusters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

impl OwnerRef {
    pub fn is_controller(&self) -> bool {
        self.controller.unwrap_or(false)
    }
}

pub mod prelude {
    pub use super::{Gvk, ObjectKey, OwnerRef};
}
