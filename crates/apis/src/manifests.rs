//! Package manifest file formats, `manifests.package-operator.run`.
//!
//! Hub version is `v1`; the legacy `v1alpha1` converts forward on load.
//! Unknown groups or versions are rejected, never guessed at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::v1alpha1::ObjectSetProbe;

pub const MANIFEST_GROUP: &str = "manifests.package-operator.run";
pub const MANIFEST_HUB_VERSION: &str = "v1";
pub const KIND_MANIFEST: &str = "PackageManifest";
pub const KIND_MANIFEST_LOCK: &str = "PackageManifestLock";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("parsing manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("manifest missing apiVersion or kind")]
    MissingTypeMeta,
    #[error("unknown manifest group {group:?} (expected {MANIFEST_GROUP})")]
    UnknownGroup { group: String },
    #[error("unknown manifest version {version:?}")]
    UnknownVersion { version: String },
    #[error("unexpected kind {got:?} (expected {want})")]
    WrongKind { got: String, want: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageScope {
    Cluster,
    Namespaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPhase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestImage {
    pub name: String,
    pub image: String,
}

/// Per-instance configuration schema, OpenAPI v3 subset kept untyped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "openAPIV3Schema")]
    pub openapi_v3_schema: Option<Value>,
}

/// Marker: the package splits into components under `components/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestComponents {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifestSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<PackageScope>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<ManifestPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ManifestImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ManifestConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<ManifestComponents>,
}

/// Context a template test case renders with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContext {
    #[serde(default)]
    pub package: TemplateContextPackage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContextPackage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateTestCase {
    pub name: String,
    #[serde(default)]
    pub context: TemplateContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeconformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema_locations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifestTest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template: Vec<TemplateTestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconform: Option<KubeconformConfig>,
}

/// Canonical in-memory manifest (hub version).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    pub spec: PackageManifestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<PackageManifestTest>,
}

impl PackageManifest {
    pub fn phase_names(&self) -> Vec<&str> {
        self.spec.phases.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn has_phase(&self, name: &str) -> bool {
        self.spec.phases.iter().any(|p| p.name == name)
    }

    pub fn image_map(&self) -> BTreeMap<&str, &str> {
        self.spec.images.iter().map(|i| (i.name.as_str(), i.image.as_str())).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockImage {
    pub name: String,
    pub image: String,
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifestLockSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<LockImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifestLock {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ManifestMetadata,
    pub spec: PackageManifestLockSpec,
}

// ---- legacy v1alpha1 ----
//
// v1alpha1 carried images as a name -> reference map; everything else
// matches the hub shape.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageManifestSpecV1Alpha1 {
    #[serde(default)]
    scopes: Vec<PackageScope>,
    #[serde(default)]
    phases: Vec<ManifestPhase>,
    #[serde(default)]
    images: BTreeMap<String, String>,
    #[serde(default)]
    config: Option<ManifestConfig>,
    #[serde(default)]
    availability_probes: Vec<ObjectSetProbe>,
    #[serde(default)]
    components: Option<ManifestComponents>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageManifestV1Alpha1 {
    metadata: ManifestMetadata,
    spec: PackageManifestSpecV1Alpha1,
    #[serde(default)]
    test: Option<PackageManifestTest>,
}

impl From<PackageManifestV1Alpha1> for PackageManifest {
    fn from(old: PackageManifestV1Alpha1) -> Self {
        let images = old
            .spec
            .images
            .into_iter()
            .map(|(name, image)| ManifestImage { name, image })
            .collect();
        PackageManifest {
            api_version: format!("{MANIFEST_GROUP}/{MANIFEST_HUB_VERSION}"),
            kind: KIND_MANIFEST.to_string(),
            metadata: old.metadata,
            spec: PackageManifestSpec {
                scopes: old.spec.scopes,
                phases: old.spec.phases,
                images,
                config: old.spec.config,
                availability_probes: old.spec.availability_probes,
                components: old.spec.components,
            },
            test: old.test,
        }
    }
}

fn type_meta(doc: &serde_yaml::Value) -> Result<(String, String, String), ManifestError> {
    let api_version = doc
        .get("apiVersion")
        .and_then(serde_yaml::Value::as_str)
        .ok_or(ManifestError::MissingTypeMeta)?;
    let kind = doc
        .get("kind")
        .and_then(serde_yaml::Value::as_str)
        .ok_or(ManifestError::MissingTypeMeta)?
        .to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok((group, version, kind))
}

/// Parse a manifest at any recognised version and convert it to the hub.
pub fn parse_manifest(data: &[u8]) -> Result<PackageManifest, ManifestError> {
    let doc: serde_yaml::Value = serde_yaml::from_slice(data)?;
    let (group, version, kind) = type_meta(&doc)?;
    if group != MANIFEST_GROUP {
        return Err(ManifestError::UnknownGroup { group });
    }
    if kind != KIND_MANIFEST {
        return Err(ManifestError::WrongKind { got: kind, want: KIND_MANIFEST });
    }
    match version.as_str() {
        MANIFEST_HUB_VERSION => Ok(serde_yaml::from_slice(data)?),
        "v1alpha1" => {
            let old: PackageManifestV1Alpha1 = serde_yaml::from_slice(data)?;
            Ok(old.into())
        }
        _ => Err(ManifestError::UnknownVersion { version }),
    }
}

/// Parse a lock file at any recognised version and convert it to the hub.
/// The lock shape is identical across versions.
pub fn parse_lock(data: &[u8]) -> Result<PackageManifestLock, ManifestError> {
    let doc: serde_yaml::Value = serde_yaml::from_slice(data)?;
    let (group, version, kind) = type_meta(&doc)?;
    if group != MANIFEST_GROUP {
        return Err(ManifestError::UnknownGroup { group });
    }
    if kind != KIND_MANIFEST_LOCK {
        return Err(ManifestError::WrongKind { got: kind, want: KIND_MANIFEST_LOCK });
    }
    match version.as_str() {
        MANIFEST_HUB_VERSION | "v1alpha1" => Ok(serde_yaml::from_slice(data)?),
        _ => Err(ManifestError::UnknownVersion { version }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HUB: &str = r#"
apiVersion: manifests.package-operator.run/v1
kind: PackageManifest
metadata:
  name: web
spec:
  scopes: [namespaced]
  phases:
  - name: pre
  - name: deploy
    class: hosted
  images:
  - name: app
    image: quay.io/example/app:v1
"#;

    const LEGACY: &str = r#"
apiVersion: manifests.package-operator.run/v1alpha1
kind: PackageManifest
metadata:
  name: web
spec:
  scopes: [namespaced]
  phases:
  - name: deploy
  images:
    app: quay.io/example/app:v1
    sidecar: quay.io/example/sidecar:v2
"#;

    #[test]
    fn hub_roundtrip() {
        let m = parse_manifest(HUB.as_bytes()).unwrap();
        assert_eq!(m.metadata.name, "web");
        assert_eq!(m.phase_names(), vec!["pre", "deploy"]);
        assert_eq!(m.spec.phases[1].class.as_deref(), Some("hosted"));
        assert_eq!(m.spec.scopes, vec![PackageScope::Namespaced]);
    }

    #[test]
    fn legacy_images_map_converts_to_sorted_list() {
        let m = parse_manifest(LEGACY.as_bytes()).unwrap();
        assert_eq!(m.api_version, "manifests.package-operator.run/v1");
        let names: Vec<_> = m.spec.images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["app", "sidecar"]);
    }

    #[test]
    fn unknown_group_rejected() {
        let doc = HUB.replace("manifests.package-operator.run/v1", "other.example.com/v1");
        match parse_manifest(doc.as_bytes()) {
            Err(ManifestError::UnknownGroup { group }) => assert_eq!(group, "other.example.com"),
            other => panic!("expected UnknownGroup, got {other:?}"),
        }
    }

    #[test]
    fn unknown_version_rejected() {
        let doc = HUB.replace("/v1\n", "/v9\n");
        assert!(matches!(parse_manifest(doc.as_bytes()), Err(ManifestError::UnknownVersion { .. })));
    }

    #[test]
    fn lock_parses() {
        let lock = r#"
apiVersion: manifests.package-operator.run/v1
kind: PackageManifestLock
spec:
  images:
  - name: app
    image: quay.io/example/app:v1
    digest: sha256:abc
"#;
        let l = parse_lock(lock.as_bytes()).unwrap();
        assert_eq!(l.spec.images[0].digest, "sha256:abc");
    }

    #[test]
    fn lock_kind_mismatch() {
        assert!(matches!(
            parse_lock(HUB.as_bytes()),
            Err(ManifestError::WrongKind { .. })
        ));
    }
}
