//! Template rendering: execute `.gotmpl` files against the render context,
//! then collect the YAML tree into concrete objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::Environment;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use pko_apis::manifests::{PackageManifest, PackageManifestLock, TemplateContext};
use pko_core::{object, FileMap, INSTANCE_LABEL, PACKAGE_LABEL};

use crate::{PackageInstance, PhasedObject, TEMPLATE_SUFFIX};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template {path}: {message}")]
    Template { path: String, message: String },
    #[error("parsing {path} document {doc_index}: {message}")]
    Yaml { path: String, doc_index: usize, message: String },
}

/// Everything templates can see.
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub package: pko_apis::manifests::TemplateContextPackage,
    pub config: Value,
    pub images: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
}

impl RenderContext {
    /// Assemble the context for a manifest plus an instance context.
    /// Images resolve through the lock when present, falling back to the
    /// manifest references.
    pub fn build(
        manifest: &PackageManifest,
        lock: Option<&PackageManifestLock>,
        instance: &TemplateContext,
    ) -> Self {
        let mut images: BTreeMap<String, String> = manifest
            .spec
            .images
            .iter()
            .map(|i| (i.name.clone(), i.image.clone()))
            .collect();
        if let Some(lock) = lock {
            for img in &lock.spec.images {
                images.insert(img.name.clone(), format!("{}@{}", img.image, img.digest));
            }
        }
        Self {
            package: instance.package.clone(),
            config: instance.config.clone().unwrap_or_else(|| Value::Object(Default::default())),
            images,
            environment: instance.environment.clone(),
        }
    }
}

/// Render every `.gotmpl` file; the output lands at the same path minus
/// the suffix and the template source is dropped from the tree. All
/// templates are registered up front so helper files (`_*`) stay
/// includable.
pub fn render_templates(files: &FileMap, ctx: &RenderContext) -> Result<FileMap, RenderError> {
    let mut env = Environment::new();
    let lookup = Arc::new(files.clone());
    env.add_function("file_get", move |path: String| -> Result<String, minijinja::Error> {
        if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
            return Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("file_get path {path:?} escapes the package root"),
            ));
        }
        match lookup.get(&path) {
            Some(data) => String::from_utf8(data.clone()).map_err(|_| {
                minijinja::Error::new(
                    minijinja::ErrorKind::InvalidOperation,
                    format!("file_get {path:?}: not valid UTF-8"),
                )
            }),
            None => Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("file_get {path:?}: no such file in package"),
            )),
        }
    });

    for (path, data) in files {
        if !path.ends_with(TEMPLATE_SUFFIX) {
            continue;
        }
        let source = String::from_utf8(data.clone()).map_err(|_| RenderError::Template {
            path: path.clone(),
            message: "not valid UTF-8".to_string(),
        })?;
        env.add_template_owned(path.clone(), source).map_err(|e| RenderError::Template {
            path: path.clone(),
            message: e.to_string(),
        })?;
    }

    let ctx_value = minijinja::value::Value::from_serialize(ctx);
    let mut out = FileMap::new();
    for (path, data) in files {
        let Some(target) = path.strip_suffix(TEMPLATE_SUFFIX) else {
            out.insert(path.clone(), data.clone());
            continue;
        };
        let template = env.get_template(path).map_err(|e| RenderError::Template {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let rendered = template.render(&ctx_value).map_err(|e| RenderError::Template {
            path: path.clone(),
            message: e.to_string(),
        })?;
        debug!(path = %path, bytes = rendered.len(), "rendered template");
        out.insert(target.to_string(), rendered.into_bytes());
    }
    Ok(out)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_yaml(path: &str) -> bool {
    path.ends_with(".yaml") || path.ends_with(".yml")
}

/// True for files collected into the object set: YAML, not a helper, not
/// the manifest or lock.
fn is_object_source(path: &str) -> bool {
    let base = basename(path);
    is_yaml(path)
        && !base.starts_with('_')
        && !crate::MANIFEST_FILES.contains(&base)
        && base != crate::LOCK_FILE
}

/// Collect objects from the rendered tree: split document streams, drop
/// empty documents, merge package labels, record and strip the phase
/// annotation. Object order is file order; files iterate in path order.
pub fn collect_objects(
    files: &FileMap,
    package_name: &str,
    instance_name: &str,
) -> Result<Vec<PhasedObject>, RenderError> {
    use serde::Deserialize;

    let mut objects = Vec::new();
    for (path, data) in files {
        if !is_object_source(path) {
            continue;
        }
        let text = String::from_utf8_lossy(data);
        for (doc_index, doc) in serde_yaml::Deserializer::from_str(&text).enumerate() {
            let yaml = serde_yaml::Value::deserialize(doc).map_err(|e| RenderError::Yaml {
                path: path.clone(),
                doc_index,
                message: e.to_string(),
            })?;
            if yaml.is_null() {
                continue;
            }
            let mut obj: Value = serde_json::to_value(yaml).map_err(|e| RenderError::Yaml {
                path: path.clone(),
                doc_index,
                message: e.to_string(),
            })?;
            if !obj.is_object() {
                return Err(RenderError::Yaml {
                    path: path.clone(),
                    doc_index,
                    message: "document is not a mapping".to_string(),
                });
            }
            object::set_label(&mut obj, PACKAGE_LABEL, package_name);
            object::set_label(&mut obj, INSTANCE_LABEL, instance_name);
            let phase = object::take_phase(&mut obj);
            objects.push(PhasedObject { phase, object: obj });
        }
    }
    Ok(objects)
}

/// Render a validated package with the given instance context.
pub fn render_package(
    manifest: &PackageManifest,
    lock: Option<&PackageManifestLock>,
    files: &FileMap,
    instance: &TemplateContext,
) -> Result<(PackageInstance, FileMap), RenderError> {
    let ctx = RenderContext::build(manifest, lock, instance);
    let rendered = render_templates(files, &ctx)?;
    let objects = collect_objects(&rendered, &manifest.metadata.name, &instance.package.name)?;
    Ok((PackageInstance { manifest: manifest.clone(), objects }, rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_apis::manifests::TemplateContextPackage;
    use pko_core::PHASE_ANNOTATION;

    fn manifest() -> PackageManifest {
        pko_apis::manifests::parse_manifest(
            br#"
apiVersion: manifests.package-operator.run/v1
kind: PackageManifest
metadata:
  name: web
spec:
  scopes: [namespaced]
  phases:
  - name: deploy
  images:
  - name: app
    image: quay.io/example/app:v1
"#,
        )
        .unwrap()
    }

    fn instance_ctx() -> TemplateContext {
        TemplateContext {
            package: TemplateContextPackage {
                name: "web-prod".into(),
                namespace: Some("prod".into()),
                ..Default::default()
            },
            config: Some(serde_json::json!({"replicas": 3})),
            environment: Default::default(),
        }
    }

    #[test]
    fn templates_render_and_suffix_drops() {
        let files = FileMap::from([(
            "deploy/web.yaml.gotmpl".to_string(),
            b"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ package.name }}\n  annotations:\n    package-operator.run/phase: deploy\nspec:\n  replicas: {{ config.replicas }}\n".to_vec(),
        )]);
        let (instance, rendered) =
            render_package(&manifest(), None, &files, &instance_ctx()).unwrap();
        assert!(rendered.contains_key("deploy/web.yaml"));
        assert!(!rendered.contains_key("deploy/web.yaml.gotmpl"));
        assert_eq!(instance.objects.len(), 1);
        let obj = &instance.objects[0];
        assert_eq!(obj.phase.as_deref(), Some("deploy"));
        assert_eq!(obj.object["spec"]["replicas"], serde_json::json!(3));
        assert_eq!(obj.object["metadata"]["name"], serde_json::json!("web-prod"));
        // phase annotation stripped, labels merged
        assert!(pko_core::object::phase_of(&obj.object).is_none());
        assert_eq!(
            pko_core::object::label(&obj.object, PACKAGE_LABEL),
            Some("web")
        );
        assert_eq!(
            pko_core::object::label(&obj.object, INSTANCE_LABEL),
            Some("web-prod")
        );
    }

    #[test]
    fn helper_files_render_but_collect_skips_them() {
        let files = FileMap::from([
            ("_helpers.yaml".to_string(), b"kind: Ignored\n".to_vec()),
            (
                "cm.yaml".to_string(),
                format!(
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  annotations:\n    {PHASE_ANNOTATION}: deploy\n"
                )
                .into_bytes(),
            ),
        ]);
        let objects = collect_objects(&files, "web", "web").unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object["kind"], serde_json::json!("ConfigMap"));
    }

    #[test]
    fn document_streams_split_and_empty_docs_drop() {
        let files = FileMap::from([(
            "multi.yaml".to_string(),
            b"---\napiVersion: v1\nkind: ConfigMap\nmetadata: {name: a}\n---\n---\napiVersion: v1\nkind: ConfigMap\nmetadata: {name: b}\n".to_vec(),
        )]);
        let objects = collect_objects(&files, "p", "p").unwrap();
        let names: Vec<_> = objects
            .iter()
            .map(|o| o.object["metadata"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn images_prefer_lock_digests() {
        let lock = pko_apis::manifests::parse_lock(
            br#"
apiVersion: manifests.package-operator.run/v1
kind: PackageManifestLock
spec:
  images:
  - name: app
    image: quay.io/example/app:v1
    digest: sha256:abc
"#,
        )
        .unwrap();
        let ctx = RenderContext::build(&manifest(), Some(&lock), &instance_ctx());
        assert_eq!(ctx.images["app"], "quay.io/example/app:v1@sha256:abc");
    }

    #[test]
    fn file_get_reads_package_files() {
        let files = FileMap::from([
            ("snippet.txt".to_string(), b"from-file".to_vec()),
            (
                "cm.yaml.gotmpl".to_string(),
                b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  annotations:\n    package-operator.run/phase: deploy\ndata:\n  body: \"{{ file_get('snippet.txt') }}\"\n".to_vec(),
            ),
        ]);
        let (instance, _) = render_package(&manifest(), None, &files, &instance_ctx()).unwrap();
        assert_eq!(
            instance.objects[0].object["data"]["body"],
            serde_json::json!("from-file")
        );
    }

    #[test]
    fn file_get_traversal_is_an_error() {
        let files = FileMap::from([(
            "cm.yaml.gotmpl".to_string(),
            b"{{ file_get('../etc/passwd') }}\n".to_vec(),
        )]);
        let err = render_package(&manifest(), None, &files, &instance_ctx()).unwrap_err();
        assert!(matches!(err, RenderError::Template { .. }));
    }

    #[test]
    fn rendering_plain_files_is_identity() {
        let files = FileMap::from([("cm.yaml".to_string(), b"kind: ConfigMap\n".to_vec())]);
        let ctx = RenderContext::build(&manifest(), None, &instance_ctx());
        let rendered = render_templates(&files, &ctx).unwrap();
        assert_eq!(rendered, files);
    }
}
