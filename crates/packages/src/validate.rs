//! Structural validation. Validators never short-circuit: one pass
//! collects every violation it can find and the aggregate is returned as
//! a single error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use pko_apis::manifests::{
    self, PackageManifest, PackageManifestLock, TemplateContext, TemplateContextPackage,
};

use crate::components::{split_components, ComponentFiles};
use crate::render::render_package;
use crate::{Package, PhasedObject, RawPackage, LOCK_FILE, MANIFEST_FILES};

/// Stable violation reasons; user-facing, matched by tooling.
pub mod reasons {
    pub const MANIFEST_NOT_FOUND: &str = "Package manifest not found";
    pub const MANIFEST_INVALID: &str = "Invalid package manifest";
    pub const LOCK_INVALID: &str = "Invalid package manifest lock";
    pub const SCOPES_EMPTY: &str = "Package scopes not set";
    pub const DUPLICATE_PHASE: &str = "Duplicate phase name";
    pub const MISSING_PHASE_ANNOTATION: &str = "Missing package-operator.run/phase Annotation";
    pub const UNKNOWN_PHASE: &str = "Phase not declared in manifest";
    pub const MISSING_GVK: &str = "Object without apiVersion or kind";
    pub const DUPLICATE_OBJECT: &str = "Duplicate object";
    pub const MISSING_LOCK: &str = "manifest.lock.yaml required when images are specified";
    pub const UNEXPECTED_LOCK: &str = "manifest.lock.yaml present but manifest has no images";
    pub const LOCK_IMAGE_MISSING: &str = "Image missing from lock file";
    pub const LOCK_IMAGE_EXTRA: &str = "Image in lock file not in manifest";
    pub const LOCK_IMAGE_MISMATCH: &str = "Lock file image reference does not match manifest";
    pub const INVALID_LABELS: &str = "Invalid labels";
    pub const STRAY_COMPONENT_FILE: &str = "File directly under components/ belongs to no component";
    pub const NESTED_COMPONENTS: &str = "Nested multi-component packages are not supported";
    pub const RENDER_FAILED: &str = "Template rendering failed";
    pub const FIXTURE_MISMATCH: &str = "Template fixture mismatch";
    #[cfg(feature = "schema-validate")]
    pub const INVALID_CONFIG: &str = "Configuration invalid against schema";
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub reason: String,
    pub details: Option<String>,
    pub path: Option<String>,
    pub doc_index: Option<usize>,
    pub component: Option<String>,
}

impl Violation {
    pub fn new(reason: &str) -> Self {
        Self { reason: reason.to_string(), details: None, path: None, doc_index: None, component: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn at_doc(mut self, doc_index: usize) -> Self {
        self.doc_index = Some(doc_index);
        self
    }

    pub fn in_component(mut self, component: &str) -> Self {
        self.component = Some(component.to_string());
        self
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(details) = &self.details {
            write!(f, ": {details}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " in {path}")?;
            if let Some(idx) = self.doc_index {
                write!(f, " (document {idx})")?;
            }
        }
        if let Some(component) = &self.component {
            write!(f, " [component {component}]")?;
        }
        Ok(())
    }
}

/// Aggregate of every violation found in one validation pass.
#[derive(Debug)]
pub struct InvalidError {
    pub violations: Vec<Violation>,
}

impl std::error::Error for InvalidError {}

impl std::fmt::Display for InvalidError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

/// Parse and structurally validate a raw package, components included.
/// Violations accumulate; any violation fails the load.
pub fn load_package(raw: &RawPackage) -> Result<Package, InvalidError> {
    let mut violations = Vec::new();
    let package = parse_package(raw, None, &mut violations);
    match package {
        Some(package) if violations.is_empty() => Ok(package),
        _ => Err(InvalidError { violations }),
    }
}

fn parse_package(
    raw: &RawPackage,
    component: Option<&str>,
    violations: &mut Vec<Violation>,
) -> Option<Package> {
    let tag = |v: Violation| match component {
        Some(c) => v.in_component(c),
        None => v,
    };

    let (root_files, component_files, stray) = split_components(raw);

    let manifest_bytes = MANIFEST_FILES.iter().find_map(|name| root_files.get(*name));
    let Some(manifest_bytes) = manifest_bytes else {
        violations.push(tag(Violation::new(reasons::MANIFEST_NOT_FOUND)));
        return None;
    };
    let manifest = match manifests::parse_manifest(manifest_bytes) {
        Ok(m) => m,
        Err(e) => {
            violations.push(tag(
                Violation::new(reasons::MANIFEST_INVALID)
                    .with_details(e.to_string())
                    .at_path("manifest.yaml"),
            ));
            return None;
        }
    };
    let lock = match root_files.get(LOCK_FILE) {
        Some(bytes) => match manifests::parse_lock(bytes) {
            Ok(l) => Some(l),
            Err(e) => {
                violations.push(tag(
                    Violation::new(reasons::LOCK_INVALID)
                        .with_details(e.to_string())
                        .at_path(LOCK_FILE),
                ));
                None
            }
        },
        None => None,
    };

    for v in validate_manifest(&manifest) {
        violations.push(tag(v));
    }
    for v in validate_lock(&manifest, lock.as_ref()) {
        violations.push(tag(v));
    }

    let mut components = Vec::new();
    if manifest.spec.components.is_some() {
        for path in &stray {
            violations.push(tag(
                Violation::new(reasons::STRAY_COMPONENT_FILE).at_path(path.clone()),
            ));
        }
        for ComponentFiles { name, files } in component_files {
            let sub_raw = match RawPackage::from_files(files) {
                Ok(r) => r,
                Err(e) => {
                    violations.push(
                        Violation::new(reasons::MANIFEST_INVALID)
                            .with_details(e.to_string())
                            .in_component(&name),
                    );
                    continue;
                }
            };
            // Components cannot themselves split into components.
            if component.is_some() {
                violations.push(
                    Violation::new(reasons::NESTED_COMPONENTS).in_component(&name),
                );
                continue;
            }
            if let Some(sub) = parse_package(&sub_raw, Some(&name), violations) {
                if sub.manifest.spec.components.is_some() {
                    violations.push(
                        Violation::new(reasons::NESTED_COMPONENTS).in_component(&name),
                    );
                } else {
                    components.push((name, sub));
                }
            }
        }
    }

    Some(Package { manifest, lock, files: root_files, components })
}

/// Manifest-level checks: scope set, unique phase names.
pub fn validate_manifest(manifest: &PackageManifest) -> Vec<Violation> {
    let mut violations = Vec::new();
    if manifest.spec.scopes.is_empty() {
        violations.push(Violation::new(reasons::SCOPES_EMPTY));
    }
    let mut seen = std::collections::BTreeSet::new();
    for phase in &manifest.spec.phases {
        if !seen.insert(phase.name.as_str()) {
            violations.push(
                Violation::new(reasons::DUPLICATE_PHASE).with_details(phase.name.clone()),
            );
        }
    }
    violations
}

/// Lock checks: present iff images declared, image-name set equality,
/// reference equality.
pub fn validate_lock(
    manifest: &PackageManifest,
    lock: Option<&PackageManifestLock>,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    match (manifest.spec.images.is_empty(), lock) {
        (false, None) => {
            violations.push(Violation::new(reasons::MISSING_LOCK));
        }
        (true, Some(_)) => {
            violations.push(Violation::new(reasons::UNEXPECTED_LOCK).at_path(LOCK_FILE));
        }
        (false, Some(lock)) => {
            let manifest_images = manifest.image_map();
            for image in &manifest.spec.images {
                match lock.spec.images.iter().find(|l| l.name == image.name) {
                    None => violations.push(
                        Violation::new(reasons::LOCK_IMAGE_MISSING)
                            .with_details(image.name.clone()),
                    ),
                    Some(locked) if locked.image != image.image => violations.push(
                        Violation::new(reasons::LOCK_IMAGE_MISMATCH).with_details(format!(
                            "{}: manifest has {}, lock has {}",
                            image.name, image.image, locked.image
                        )),
                    ),
                    Some(_) => {}
                }
            }
            for locked in &lock.spec.images {
                if !manifest_images.contains_key(locked.name.as_str()) {
                    violations.push(
                        Violation::new(reasons::LOCK_IMAGE_EXTRA)
                            .with_details(locked.name.clone()),
                    );
                }
            }
        }
        (true, None) => {}
    }
    violations
}

static LABEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?$").expect("label regex"));
static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?(\.[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?)*$")
        .expect("subdomain regex")
});

fn label_key_valid(key: &str) -> bool {
    match key.split_once('/') {
        Some((prefix, name)) => {
            prefix.len() <= 253 && DNS_SUBDOMAIN.is_match(prefix) && LABEL_NAME.is_match(name)
        }
        None => LABEL_NAME.is_match(key),
    }
}

fn label_value_valid(value: &str) -> bool {
    value.is_empty() || LABEL_NAME.is_match(value)
}

/// Object-level checks on the rendered instance: phase annotation, known
/// phase, GVK presence, duplicates across phases, label grammar.
pub fn validate_objects(manifest: &PackageManifest, objects: &[PhasedObject]) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut seen = std::collections::BTreeMap::new();
    for (idx, phased) in objects.iter().enumerate() {
        let obj = &phased.object;

        match &phased.phase {
            None => violations.push(
                Violation::new(reasons::MISSING_PHASE_ANNOTATION).at_doc(idx),
            ),
            Some(phase) if !manifest.has_phase(phase) => violations.push(
                Violation::new(reasons::UNKNOWN_PHASE)
                    .with_details(phase.clone())
                    .at_doc(idx),
            ),
            Some(_) => {}
        }

        match pko_core::object::key_of(obj) {
            Err(_) => violations.push(Violation::new(reasons::MISSING_GVK).at_doc(idx)),
            Ok(key) => {
                if let Some(first) = seen.insert(key.clone(), idx) {
                    violations.push(
                        Violation::new(reasons::DUPLICATE_OBJECT)
                            .with_details(format!("{key} first seen at document {first}"))
                            .at_doc(idx),
                    );
                }
            }
        }

        if let Some(labels) = obj
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
        {
            for (key, value) in labels {
                let value_ok = value.as_str().map(label_value_valid).unwrap_or(false);
                if !label_key_valid(key) || !value_ok {
                    violations.push(
                        Violation::new(reasons::INVALID_LABELS)
                            .with_details(format!("{key}={value}"))
                            .at_doc(idx),
                    );
                }
            }
        }
    }
    violations
}

/// Contexts a package validates under: its declared template test cases,
/// or one default context.
pub fn validation_contexts(manifest: &PackageManifest) -> Vec<TemplateContext> {
    let from_tests: Vec<_> = manifest
        .test
        .as_ref()
        .map(|t| t.template.iter().map(|c| c.context.clone()).collect())
        .unwrap_or_default();
    if !from_tests.is_empty() {
        return from_tests;
    }
    vec![TemplateContext {
        package: TemplateContextPackage {
            name: manifest.metadata.name.clone(),
            namespace: None,
            ..Default::default()
        },
        config: None,
        environment: Default::default(),
    }]
}

/// Full validation pass over a loaded package: render under every context
/// and run the object validators. Component packages validate recursively.
pub fn validate_package(package: &Package) -> Vec<Violation> {
    let mut violations = Vec::new();
    for ctx in validation_contexts(&package.manifest) {
        match render_package(&package.manifest, package.lock.as_ref(), &package.files, &ctx) {
            Ok((instance, _)) => {
                violations.extend(validate_objects(&package.manifest, &instance.objects));
                #[cfg(feature = "schema-validate")]
                violations.extend(validate_config(&package.manifest, ctx.config.as_ref()));
            }
            Err(e) => violations.push(
                Violation::new(reasons::RENDER_FAILED).with_details(e.to_string()),
            ),
        }
    }
    for (name, sub) in &package.components {
        for v in validate_package(sub) {
            violations.push(v.in_component(name));
        }
    }
    debug!(package = %package.manifest.metadata.name, violations = violations.len(), "validated package");
    violations
}

/// External source of object schemas, kubeconform style. Keyed by GVK;
/// returning `None` skips the object.
#[cfg(feature = "schema-validate")]
pub trait SchemaSource {
    fn schema_for(&self, gvk: &pko_core::Gvk) -> Option<Value>;
}

/// Validate rendered objects against an external schema source.
#[cfg(feature = "schema-validate")]
pub fn validate_object_schemas(
    source: &dyn SchemaSource,
    objects: &[PhasedObject],
) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (idx, phased) in objects.iter().enumerate() {
        let Ok(gvk) = pko_core::object::gvk_of(&phased.object) else {
            continue; // reported by validate_objects
        };
        let Some(schema) = source.schema_for(&gvk) else { continue };
        let Ok(compiled) = jsonschema::JSONSchema::compile(&schema) else {
            violations.push(
                Violation::new(reasons::INVALID_CONFIG)
                    .with_details(format!("schema for {gvk} does not compile"))
                    .at_doc(idx),
            );
            continue;
        };
        if let Err(errors) = compiled.validate(&phased.object) {
            for e in errors {
                violations.push(
                    Violation::new(reasons::INVALID_CONFIG)
                        .with_details(format!("{gvk}: {e}"))
                        .at_doc(idx),
                );
            }
        }
    }
    violations
}

/// Validate an instance configuration against the manifest's OpenAPI
/// schema, when one is declared.
#[cfg(feature = "schema-validate")]
pub fn validate_config(manifest: &PackageManifest, config: Option<&Value>) -> Vec<Violation> {
    let Some(schema) = manifest
        .spec
        .config
        .as_ref()
        .and_then(|c| c.openapi_v3_schema.as_ref())
    else {
        return Vec::new();
    };
    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(c) => c,
        Err(e) => {
            return vec![Violation::new(reasons::INVALID_CONFIG)
                .with_details(format!("schema does not compile: {e}"))]
        }
    };
    let empty = Value::Object(Default::default());
    let config = config.unwrap_or(&empty);
    match compiled.validate(config) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                Violation::new(reasons::INVALID_CONFIG)
                    .with_details(e.to_string())
                    .at_path(e.instance_path.to_string())
            })
            .collect(),
    }
}
