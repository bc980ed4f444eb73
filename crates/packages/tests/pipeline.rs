#![forbid(unsafe_code)]

//! Full package pipeline: folder import, structural validation, template
//! rendering.

use pko_packages::render::render_package;
use pko_packages::validate::{load_package, reasons, validate_package};
use pko_packages::RawPackage;

const MANIFEST: &str = r#"
apiVersion: manifests.package-operator.run/v1
kind: PackageManifest
metadata:
  name: web
spec:
  scopes: [namespaced]
  phases:
  - name: config
  - name: deploy
  availabilityProbes:
  - selector:
      kind:
        group: apps
        kind: Deployment
    probes:
    - condition:
        type: Available
        status: "True"
"#;

const DEPLOYMENT_TMPL: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ package.name }}
  namespace: {{ package.namespace }}
  annotations:
    package-operator.run/phase: deploy
spec:
  replicas: {{ config.replicas }}
"#;

const CONFIGMAP: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: web-config
  annotations:
    package-operator.run/phase: config
data:
  mode: standard
"#;

fn write_package(dir: &std::path::Path) {
    std::fs::write(dir.join("manifest.yaml"), MANIFEST).unwrap();
    std::fs::write(dir.join("deployment.yaml.gotmpl"), DEPLOYMENT_TMPL).unwrap();
    std::fs::write(dir.join("cm.yaml"), CONFIGMAP).unwrap();
    // ignored content
    std::fs::write(dir.join(".hidden.yaml"), "junk: true").unwrap();
    std::fs::write(dir.join("_helpers.yaml"), "kind: Ignored").unwrap();
    std::fs::write(dir.join("notes.txt"), "not yaml").unwrap();
}

fn instance_context() -> pko_apis::manifests::TemplateContext {
    pko_apis::manifests::TemplateContext {
        package: pko_apis::manifests::TemplateContextPackage {
            name: "web-prod".into(),
            namespace: Some("prod".into()),
            ..Default::default()
        },
        config: Some(serde_json::json!({"replicas": 2})),
        environment: Default::default(),
    }
}

#[test]
fn folder_to_rendered_instance() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path());

    let raw = RawPackage::from_folder(dir.path()).unwrap();
    assert!(raw.get(".hidden.yaml").is_none());

    let package = load_package(&raw).unwrap();
    assert!(validate_package(&package).is_empty());

    let (instance, rendered) = render_package(
        &package.manifest,
        package.lock.as_ref(),
        &package.files,
        &instance_context(),
    )
    .unwrap();

    assert!(rendered.contains_key("deployment.yaml"));
    assert_eq!(instance.objects.len(), 2);

    // every rendered object's phase names a declared phase
    for obj in &instance.objects {
        let phase = obj.phase.as_deref().unwrap();
        assert!(instance.manifest.has_phase(phase), "unknown phase {phase}");
    }

    let deploy_objects = instance.phase_objects("deploy");
    assert_eq!(deploy_objects.len(), 1);
    assert_eq!(deploy_objects[0]["spec"]["replicas"], serde_json::json!(2));
    assert_eq!(
        deploy_objects[0]["metadata"]["namespace"],
        serde_json::json!("prod")
    );

    let config_objects = instance.phase_objects("config");
    assert_eq!(config_objects.len(), 1);
    assert_eq!(
        pko_core::object::label(config_objects[0], pko_core::PACKAGE_LABEL),
        Some("web")
    );
}

#[test]
fn missing_phase_annotation_surfaces_contract_message() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path());
    // one object without the phase annotation
    std::fs::write(
        dir.path().join("stray.yaml"),
        "apiVersion: v1\nkind: Secret\nmetadata: {name: stray}\n",
    )
    .unwrap();

    let raw = RawPackage::from_folder(dir.path()).unwrap();
    let package = load_package(&raw).unwrap();
    let violations = validate_package(&package);
    let rendered: Vec<String> = violations.iter().map(ToString::to_string).collect();
    assert!(
        rendered
            .iter()
            .any(|line| line.contains("Missing package-operator.run/phase Annotation")),
        "violations: {rendered:?}"
    );
}

#[test]
fn rendered_output_feeds_validation_per_test_case() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_with_tests = format!(
        "{MANIFEST}test:\n  template:\n  - name: two-replicas\n    context:\n      package:\n        name: web-test\n        namespace: testing\n      config:\n        replicas: 2\n"
    );
    std::fs::write(dir.path().join("manifest.yaml"), manifest_with_tests).unwrap();
    std::fs::write(dir.path().join("deployment.yaml.gotmpl"), DEPLOYMENT_TMPL).unwrap();
    std::fs::write(dir.path().join("cm.yaml"), CONFIGMAP).unwrap();

    let raw = RawPackage::from_folder(dir.path()).unwrap();
    let package = load_package(&raw).unwrap();
    // validation renders with the test case context and passes
    assert!(validate_package(&package).is_empty());
}
