//! Package build support: lock resolution against the registry and the
//! file set that ships inside an image.

use tracing::info;

use pko_apis::manifests::{
    LockImage, PackageManifest, PackageManifestLock, PackageManifestLockSpec, KIND_MANIFEST_LOCK,
    MANIFEST_GROUP, MANIFEST_HUB_VERSION,
};
use pko_core::FileMap;
use pko_registry::{PackagePuller, RegistryError};

use crate::{Package, LOCK_FILE};

/// Resolve current digests for every manifest image and build the lock.
/// Returns `None` when the existing lock already matches.
pub async fn resolve_lock(
    manifest: &PackageManifest,
    existing: Option<&PackageManifestLock>,
    puller: &dyn PackagePuller,
) -> Result<Option<PackageManifestLock>, RegistryError> {
    if manifest.spec.images.is_empty() {
        return Ok(None);
    }
    let mut images = Vec::with_capacity(manifest.spec.images.len());
    for image in &manifest.spec.images {
        let digest = puller.head_digest(&image.image).await?;
        images.push(LockImage { name: image.name.clone(), image: image.image.clone(), digest });
    }
    let lock = PackageManifestLock {
        api_version: format!("{MANIFEST_GROUP}/{MANIFEST_HUB_VERSION}"),
        kind: KIND_MANIFEST_LOCK.to_string(),
        metadata: Default::default(),
        spec: PackageManifestLockSpec { images },
    };
    if existing.map(|e| e.spec == lock.spec).unwrap_or(false) {
        return Ok(None);
    }
    info!(package = %manifest.metadata.name, images = lock.spec.images.len(), "resolved lock file");
    Ok(Some(lock))
}

/// Serialize a lock back to its file form.
pub fn lock_to_yaml(lock: &PackageManifestLock) -> Result<Vec<u8>, serde_yaml::Error> {
    serde_yaml::to_string(lock).map(String::into_bytes)
}

/// The file set shipped in a package image: the validated package's raw
/// files, with the freshly resolved lock spliced in when one was produced.
pub fn image_files(package: &Package, resolved_lock: Option<&PackageManifestLock>) -> FileMap {
    let mut files = package.files.clone();
    for (name, component) in &package.components {
        for (path, data) in &component.files {
            files.insert(format!("{}/{}/{}", crate::COMPONENTS_DIR, name, path), data.clone());
        }
    }
    if let Some(lock) = resolved_lock {
        if let Ok(bytes) = lock_to_yaml(lock) {
            files.insert(LOCK_FILE.to_string(), bytes);
        }
    }
    files
}
