#![forbid(unsafe_code)]

//! Build-and-read-back: a package file set survives the image tar
//! round-trip minus hidden files, with the package/ prefix stripped.

use pko_core::FileMap;
use pko_registry::oci::{blob_digest, read_image_tar, to_oci_layer, write_image_tar};

fn package_files() -> FileMap {
    FileMap::from([
        ("manifest.yaml".to_string(), b"apiVersion: manifests.package-operator.run/v1\nkind: PackageManifest\n".to_vec()),
        ("manifest.lock.yaml".to_string(), b"kind: PackageManifestLock\n".to_vec()),
        ("deploy/web.yaml".to_string(), b"kind: Deployment\n".to_vec()),
        ("deploy/cm.yaml".to_string(), b"kind: ConfigMap\n".to_vec()),
        (".test-fixtures/base/deploy.yaml".to_string(), b"fixture".to_vec()),
        (".git/HEAD".to_string(), b"ref".to_vec()),
    ])
}

#[test]
fn image_tar_roundtrip_is_identity_on_visible_files() {
    let files = package_files();
    let mut image = Vec::new();
    let digest = write_image_tar(&mut image, &files).unwrap();
    assert!(digest.starts_with("sha256:"));

    let back = read_image_tar(image.as_slice()).unwrap();
    let expected: FileMap = files
        .iter()
        .filter(|(path, _)| !path.split('/').any(|seg| seg.starts_with('.')))
        .map(|(path, data)| (path.clone(), data.clone()))
        .collect();
    assert_eq!(back, expected);
    assert_eq!(back.len(), 4);
}

#[test]
fn equal_content_produces_equal_image_digests() {
    let files = package_files();
    let mut first = Vec::new();
    let mut second = Vec::new();
    let d1 = write_image_tar(&mut first, &files).unwrap();
    let d2 = write_image_tar(&mut second, &files).unwrap();
    assert_eq!(d1, d2);
    assert_eq!(blob_digest(&first), blob_digest(&second));
}

#[test]
fn layer_digest_changes_with_content() {
    let files = package_files();
    let mut changed = files.clone();
    changed.insert("deploy/web.yaml".to_string(), b"kind: StatefulSet\n".to_vec());
    let a = to_oci_layer(&files).unwrap();
    let b = to_oci_layer(&changed).unwrap();
    assert_ne!(blob_digest(&a), blob_digest(&b));
}
