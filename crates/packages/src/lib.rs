//! Package pipeline: import raw files, validate structure, render templates
//! into concrete objects.

#![forbid(unsafe_code)]

use pko_apis::manifests::{PackageManifest, PackageManifestLock};
use pko_core::FileMap;
use serde_json::Value;

pub mod build;
pub mod components;
pub mod fixtures;
pub mod import;
pub mod render;
pub mod validate;

pub use import::RawPackage;
pub use validate::{InvalidError, Violation};

/// Manifest file names probed in order.
pub const MANIFEST_FILES: [&str; 2] = ["manifest.yaml", "manifest.yml"];
/// Lock file name.
pub const LOCK_FILE: &str = "manifest.lock.yaml";
/// Directory holding component sub-packages.
pub const COMPONENTS_DIR: &str = "components";
/// Template suffix; files ending in this are rendered and the suffix dropped.
pub const TEMPLATE_SUFFIX: &str = ".gotmpl";
/// Directory holding template test fixtures.
pub const FIXTURES_DIR: &str = ".test-fixtures";

/// Structurally validated package: parsed manifest, optional lock, raw
/// files, and component sub-packages.
#[derive(Debug, Clone)]
pub struct Package {
    pub manifest: PackageManifest,
    pub lock: Option<PackageManifestLock>,
    pub files: FileMap,
    pub components: Vec<(String, Package)>,
}

/// A rendered object together with its recorded phase. The phase
/// annotation is stripped during rendering; `phase` is `None` when the
/// object never carried one (a validation error).
#[derive(Debug, Clone, PartialEq)]
pub struct PhasedObject {
    pub phase: Option<String>,
    pub object: Value,
}

/// Output of rendering: manifest plus the flat, ordered object list.
#[derive(Debug, Clone)]
pub struct PackageInstance {
    pub manifest: PackageManifest,
    pub objects: Vec<PhasedObject>,
}

impl PackageInstance {
    /// Objects of one phase, in render order.
    pub fn phase_objects(&self, phase: &str) -> Vec<&Value> {
        self.objects
            .iter()
            .filter(|o| o.phase.as_deref() == Some(phase))
            .map(|o| &o.object)
            .collect()
    }
}
