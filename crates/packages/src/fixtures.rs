//! Template fixture tests. Each manifest test case re-renders the package
//! with its context and compares the rendered template outputs against a
//! stored fixture tree; first run populates the fixtures.

use std::path::{Path, PathBuf};

use similar::TextDiff;
use tracing::info;

use crate::render::{render_templates, RenderContext};
use crate::validate::{reasons, Violation};
use crate::{Package, FIXTURES_DIR, TEMPLATE_SUFFIX};

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("fixture io {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Render(#[from] crate::render::RenderError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FixtureError + '_ {
    move |source| FixtureError::Io { path: path.to_path_buf(), source }
}

/// Run every template test case. `root` is the package source directory on
/// disk (fixtures live under `<root>/.test-fixtures/<case>/`).
pub fn run_template_tests(root: &Path, package: &Package) -> Result<Vec<Violation>, FixtureError> {
    let Some(test) = package.manifest.test.as_ref() else {
        return Ok(Vec::new());
    };
    let mut violations = Vec::new();
    for case in &test.template {
        let ctx = RenderContext::build(&package.manifest, package.lock.as_ref(), &case.context);
        let rendered = render_templates(&package.files, &ctx)?;
        let case_dir = root.join(FIXTURES_DIR).join(&case.name);

        // Only rendered template outputs are compared; static files are
        // covered by version control.
        let outputs: Vec<(&String, &Vec<u8>)> = package
            .files
            .keys()
            .filter_map(|p| p.strip_suffix(TEMPLATE_SUFFIX))
            .filter_map(|target| rendered.get_key_value(target))
            .collect();

        if !case_dir.exists() {
            info!(case = %case.name, dir = %case_dir.display(), "populating template fixtures");
            for (path, data) in &outputs {
                let dst = case_dir.join(path);
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err(parent))?;
                }
                std::fs::write(&dst, data).map_err(io_err(&dst))?;
            }
            continue;
        }

        for (path, data) in &outputs {
            let fixture_path = case_dir.join(path);
            let expected = match std::fs::read(&fixture_path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    violations.push(
                        Violation::new(reasons::FIXTURE_MISMATCH)
                            .with_details(format!("case {}: fixture file missing", case.name))
                            .at_path((*path).clone()),
                    );
                    continue;
                }
                Err(e) => return Err(io_err(&fixture_path)(e)),
            };
            if expected != **data {
                let expected = String::from_utf8_lossy(&expected).into_owned();
                let actual = String::from_utf8_lossy(data).into_owned();
                let diff = TextDiff::from_lines(&expected, &actual)
                    .unified_diff()
                    .header("fixture", "rendered")
                    .to_string();
                violations.push(
                    Violation::new(reasons::FIXTURE_MISMATCH)
                        .with_details(format!("case {}:\n{}", case.name, diff))
                        .at_path((*path).clone()),
                );
            }
        }
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::load_package;
    use crate::RawPackage;
    use pko_core::FileMap;

    const MANIFEST: &str = r#"
apiVersion: manifests.package-operator.run/v1
kind: PackageManifest
metadata:
  name: web
spec:
  scopes: [namespaced]
  phases: [{name: deploy}]
test:
  template:
  - name: base
    context:
      package:
        name: web-test
"#;

    fn package() -> Package {
        load_package(
            &RawPackage::from_files(FileMap::from([
                ("manifest.yaml".to_string(), MANIFEST.as_bytes().to_vec()),
                (
                    "cm.yaml.gotmpl".to_string(),
                    b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ package.name }}\n  annotations:\n    package-operator.run/phase: deploy\n".to_vec(),
                ),
            ]))
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn first_run_populates_then_passes() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package();

        let violations = run_template_tests(dir.path(), &pkg).unwrap();
        assert!(violations.is_empty());
        let fixture = dir.path().join(FIXTURES_DIR).join("base").join("cm.yaml");
        assert!(fixture.exists());

        // second run compares clean
        let violations = run_template_tests(dir.path(), &pkg).unwrap();
        assert!(violations.is_empty());
    }

    #[test]
    fn drifted_fixture_reports_unified_diff() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package();
        run_template_tests(dir.path(), &pkg).unwrap();

        let fixture = dir.path().join(FIXTURES_DIR).join("base").join("cm.yaml");
        std::fs::write(&fixture, "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: other\n").unwrap();

        let violations = run_template_tests(dir.path(), &pkg).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].reason, reasons::FIXTURE_MISMATCH);
        let details = violations[0].details.as_deref().unwrap();
        assert!(details.contains("-  name: other"), "details: {details}");
        assert!(details.contains("+  name: web-test"), "details: {details}");
    }
}
