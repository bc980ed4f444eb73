//! Codec between a package file map and the single gzipped tar layer of a
//! package image. Files live under `package/` inside the layer; the prefix
//! is added on encode and stripped on decode.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use pko_core::FileMap;

use crate::RegistryError;

/// Prefix for package files inside the image layer.
pub const IMAGE_PREFIX: &str = "package/";

/// Media type of the package layer.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.package-operator.package.v1.tar+gzip";

/// True when the path's basename, or any directory component, starts with a
/// dot. Such files never enter or leave an image.
pub fn is_hidden(path: &str) -> bool {
    path.split('/').any(|seg| seg.starts_with('.'))
}

/// Reject absolute paths and `..` traversal.
pub fn check_path(path: &str) -> Result<(), RegistryError> {
    if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(RegistryError::UnexpectedEntry { path: path.to_string() });
    }
    Ok(())
}

/// Encode `files` into a gzipped tar layer, each path prefixed with
/// `package/`. Hidden files are dropped.
pub fn to_oci_layer(files: &FileMap) -> Result<Vec<u8>, RegistryError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        if is_hidden(path) {
            continue;
        }
        check_path(path)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{IMAGE_PREFIX}{path}"), data.as_slice())
            .map_err(|e| RegistryError::Tar(e.to_string()))?;
    }
    let encoder = builder.into_inner().map_err(|e| RegistryError::Tar(e.to_string()))?;
    Ok(encoder.finish()?)
}

/// Decode a gzipped tar layer back into a file map, stripping the
/// `package/` prefix. Entries outside the prefix are an error; hidden
/// files and non-regular entries are dropped.
pub fn from_oci_layer(layer: &[u8]) -> Result<FileMap, RegistryError> {
    let mut archive = tar::Archive::new(GzDecoder::new(layer));
    let mut files = FileMap::new();
    for entry in archive.entries().map_err(|e| RegistryError::Tar(e.to_string()))? {
        let mut entry = entry.map_err(|e| RegistryError::Tar(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| RegistryError::Tar(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let Some(stripped) = path.strip_prefix(IMAGE_PREFIX) else {
            return Err(RegistryError::UnexpectedEntry { path });
        };
        if stripped.is_empty() || is_hidden(stripped) {
            continue;
        }
        check_path(stripped)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(stripped.to_string(), data);
    }
    Ok(files)
}

/// `sha256:<hex>` digest of a blob, as used in OCI descriptors.
pub fn blob_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Write an image to a standalone tar file: OCI image layout with a single
/// layer blob. Enough for `build --output` and offline validation.
pub fn write_image_tar<W: Write>(out: W, files: &FileMap) -> Result<String, RegistryError> {
    let layer = to_oci_layer(files)?;
    let layer_digest = blob_digest(&layer);
    let config = b"{}".to_vec();
    let config_digest = blob_digest(&config);
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": [{
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": layer_digest,
            "size": layer.len(),
        }],
    });
    let manifest_bytes = serde_json::to_vec(&manifest)
        .map_err(|e| RegistryError::Tar(e.to_string()))?;
    let manifest_digest = blob_digest(&manifest_bytes);
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest_bytes.len(),
        }],
    });
    let index_bytes = serde_json::to_vec(&index)
        .map_err(|e| RegistryError::Tar(e.to_string()))?;

    let mut builder = tar::Builder::new(out);
    let mut append = |path: String, data: &[u8]| -> Result<(), RegistryError> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data)
            .map_err(|e| RegistryError::Tar(e.to_string()))
    };
    append("oci-layout".into(), br#"{"imageLayoutVersion":"1.0.0"}"#)?;
    append(format!("blobs/sha256/{}", layer_digest.trim_start_matches("sha256:")), &layer)?;
    append(format!("blobs/sha256/{}", config_digest.trim_start_matches("sha256:")), &config)?;
    append(
        format!("blobs/sha256/{}", manifest_digest.trim_start_matches("sha256:")),
        &manifest_bytes,
    )?;
    append("index.json".into(), &index_bytes)?;
    builder.finish().map_err(|e| RegistryError::Tar(e.to_string()))?;
    Ok(manifest_digest)
}

/// Read a package file map back from a standalone image tar written by
/// [`write_image_tar`] (or any single-package-layer OCI layout).
pub fn read_image_tar<R: Read>(input: R) -> Result<FileMap, RegistryError> {
    let mut archive = tar::Archive::new(input);
    let mut blobs: std::collections::BTreeMap<String, Vec<u8>> = Default::default();
    let mut manifest_digest: Option<String> = None;
    for entry in archive.entries().map_err(|e| RegistryError::Tar(e.to_string()))? {
        let mut entry = entry.map_err(|e| RegistryError::Tar(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| RegistryError::Tar(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        if path == "index.json" {
            let index: serde_json::Value = serde_json::from_slice(&data)
                .map_err(|e| RegistryError::Tar(e.to_string()))?;
            manifest_digest = index["manifests"][0]["digest"].as_str().map(String::from);
        } else if let Some(digest) = path.strip_prefix("blobs/sha256/") {
            blobs.insert(format!("sha256:{digest}"), data);
        }
    }
    let manifest_digest = manifest_digest
        .ok_or_else(|| RegistryError::Tar("image tar missing index.json".into()))?;
    let manifest_bytes = blobs
        .get(&manifest_digest)
        .ok_or_else(|| RegistryError::Tar("image tar missing manifest blob".into()))?;
    let manifest: serde_json::Value = serde_json::from_slice(manifest_bytes)
        .map_err(|e| RegistryError::Tar(e.to_string()))?;
    let layer_digest = manifest["layers"][0]["digest"]
        .as_str()
        .ok_or_else(|| RegistryError::Tar("image manifest has no layers".into()))?;
    let layer = blobs
        .get(layer_digest)
        .ok_or_else(|| RegistryError::Tar("image tar missing layer blob".into()))?;
    from_oci_layer(layer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> FileMap {
        FileMap::from([
            ("manifest.yaml".to_string(), b"kind: PackageManifest".to_vec()),
            ("deploy/web.yaml".to_string(), b"kind: Deployment".to_vec()),
            (".git/config".to_string(), b"secret".to_vec()),
            ("deploy/.DS_Store".to_string(), b"junk".to_vec()),
        ])
    }

    #[test]
    fn layer_roundtrip_strips_prefix_and_hidden_files() {
        let layer = to_oci_layer(&files()).unwrap();
        let back = from_oci_layer(&layer).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back["manifest.yaml"], b"kind: PackageManifest");
        assert_eq!(back["deploy/web.yaml"], b"kind: Deployment");
    }

    #[test]
    fn non_prefixed_entry_is_an_error() {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "stray.txt", &b"hi"[..]).unwrap();
        let layer = builder.into_inner().unwrap().finish().unwrap();
        assert!(matches!(
            from_oci_layer(&layer),
            Err(RegistryError::UnexpectedEntry { path }) if path == "stray.txt"
        ));
    }

    #[test]
    fn traversal_rejected() {
        let mut files = FileMap::new();
        files.insert("a/../../etc/passwd".to_string(), b"x".to_vec());
        assert!(to_oci_layer(&files).is_err());
    }

    #[test]
    fn image_tar_roundtrip() {
        let mut buf = Vec::new();
        let digest = write_image_tar(&mut buf, &files()).unwrap();
        assert!(digest.starts_with("sha256:"));
        let back = read_image_tar(buf.as_slice()).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.contains_key("deploy/web.yaml"));
    }

    #[test]
    fn digest_is_stable_for_equal_content() {
        let layer_a = to_oci_layer(&files()).unwrap();
        let layer_b = to_oci_layer(&files()).unwrap();
        assert_eq!(blob_digest(&layer_a), blob_digest(&layer_b));
    }
}
