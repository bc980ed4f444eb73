//! Repository index: a named list of packages with their published digests
//! and semver versions. Round-trips through a single YAML file and, for
//! remote catalogs, an OCI image.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pko_core::FileMap;
use pko_registry::{PackagePuller, PackagePusher, RegistryError};

/// File name of the index inside its OCI image.
pub const INDEX_FILE: &str = "index.yaml";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("package {package} digest {digest} not found")]
    NotFound { package: String, digest: String },
    #[error("package {package} not found")]
    PackageNotFound { package: String },
    #[error("package {package}: record has no digest")]
    EmptyDigest { package: String },
    #[error("invalid version {version:?}: {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("io {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing index: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("index image has no {INDEX_FILE}")]
    MissingIndexFile,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One published image of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    /// Package name; keys the entry this record lives in.
    pub name: String,
    pub image: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<Version>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Entry {
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    data: Vec<Data>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexMetadata {
    name: String,
}

/// The index itself. Entries are keyed by package name, data records by
/// digest; digests are unique within a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryIndex {
    name: String,
    entries: BTreeMap<String, BTreeMap<String, Data>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    api_version: String,
    kind: String,
    metadata: IndexMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    entries: Vec<Entry>,
}

const API_VERSION: &str = "manifests.package-operator.run/v1";
const KIND: &str = "Repository";

/// Parse a user-supplied version string.
pub fn parse_version(version: &str) -> Result<Version, RepositoryError> {
    Version::parse(version).map_err(|source| RepositoryError::InvalidVersion {
        version: version.to_string(),
        source,
    })
}

impl RepositoryIndex {
    /// Create an empty index with the given logical name.
    pub fn init(name: &str) -> Self {
        Self { name: name.to_string(), entries: BTreeMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add or update the `(package, digest)` record. Adding an equal
    /// payload twice is a no-op.
    pub fn add(&mut self, data: Data) -> Result<(), RepositoryError> {
        if data.digest.is_empty() {
            return Err(RepositoryError::EmptyDigest { package: data.name });
        }
        debug!(package = %data.name, digest = %data.digest, "adding index entry");
        self.entries
            .entry(data.name.clone())
            .or_default()
            .insert(data.digest.clone(), data);
        Ok(())
    }

    /// Remove the `(package, digest)` record; the entry disappears with
    /// its last record. Missing records are an error.
    pub fn remove(&mut self, package: &str, digest: &str) -> Result<(), RepositoryError> {
        let entry = self.entries.get_mut(package).ok_or_else(|| RepositoryError::NotFound {
            package: package.to_string(),
            digest: digest.to_string(),
        })?;
        if entry.remove(digest).is_none() {
            return Err(RepositoryError::NotFound {
                package: package.to_string(),
                digest: digest.to_string(),
            });
        }
        if entry.is_empty() {
            self.entries.remove(package);
        }
        Ok(())
    }

    /// Package names in the index, sorted.
    pub fn list_entries(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// All versions published for a package, sorted ascending, de-duplicated.
    pub fn list_versions(&self, package: &str) -> Result<Vec<Version>, RepositoryError> {
        let entry = self
            .entries
            .get(package)
            .ok_or_else(|| RepositoryError::PackageNotFound { package: package.to_string() })?;
        let mut versions: Vec<Version> =
            entry.values().flat_map(|d| d.versions.iter().cloned()).collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    /// The record published under a digest.
    pub fn get_digest(&self, package: &str, digest: &str) -> Result<&Data, RepositoryError> {
        self.entries
            .get(package)
            .and_then(|e| e.get(digest))
            .ok_or_else(|| RepositoryError::NotFound {
                package: package.to_string(),
                digest: digest.to_string(),
            })
    }

    /// Digests published for a package, sorted.
    pub fn get_digests(&self, package: &str) -> Result<Vec<&str>, RepositoryError> {
        let entry = self
            .entries
            .get(package)
            .ok_or_else(|| RepositoryError::PackageNotFound { package: package.to_string() })?;
        Ok(entry.keys().map(String::as_str).collect())
    }

    /// The record carrying a specific version.
    pub fn get_version(&self, package: &str, version: &Version) -> Result<&Data, RepositoryError> {
        let entry = self
            .entries
            .get(package)
            .ok_or_else(|| RepositoryError::PackageNotFound { package: package.to_string() })?;
        entry
            .values()
            .find(|d| d.versions.contains(version))
            .ok_or_else(|| RepositoryError::NotFound {
                package: package.to_string(),
                digest: version.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ---- round-trips ----

    pub fn to_yaml(&self) -> Result<String, RepositoryError> {
        let file = IndexFile {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: IndexMetadata { name: self.name.clone() },
            entries: self
                .entries
                .iter()
                .map(|(name, data)| Entry {
                    name: name.clone(),
                    data: data.values().cloned().collect(),
                })
                .collect(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, RepositoryError> {
        let file: IndexFile = serde_yaml::from_str(text)?;
        let mut entries: BTreeMap<String, BTreeMap<String, Data>> = BTreeMap::new();
        for entry in file.entries {
            let slot = entries.entry(entry.name).or_default();
            for data in entry.data {
                slot.insert(data.digest.clone(), data);
            }
        }
        Ok(Self { name: file.metadata.name, entries })
    }

    pub fn save(&self, path: &Path) -> Result<(), RepositoryError> {
        let yaml = self.to_yaml()?;
        std::fs::write(path, yaml)
            .map_err(|source| RepositoryError::Io { path: path.to_path_buf(), source })
    }

    pub fn load(path: &Path) -> Result<Self, RepositoryError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| RepositoryError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&text)
    }

    /// Push the index as a single-file package image.
    pub async fn push(
        &self,
        pusher: &dyn PackagePusher,
        tags: &[String],
    ) -> Result<String, RepositoryError> {
        let files = FileMap::from([(INDEX_FILE.to_string(), self.to_yaml()?.into_bytes())]);
        Ok(pusher.push(tags, &files).await?)
    }

    /// Pull an index image published by [`RepositoryIndex::push`].
    pub async fn pull(
        puller: &dyn PackagePuller,
        reference: &str,
    ) -> Result<Self, RepositoryError> {
        let files = puller.pull(reference).await?;
        let data = files.get(INDEX_FILE).ok_or(RepositoryError::MissingIndexFile)?;
        Self::from_yaml(&String::from_utf8_lossy(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(name: &str, digest: &str, versions: &[&str]) -> Data {
        Data {
            name: name.to_string(),
            image: format!("quay.io/example/{name}"),
            digest: digest.to_string(),
            versions: versions.iter().map(|v| Version::parse(v).unwrap()).collect(),
            constraints: Vec::new(),
        }
    }

    #[test]
    fn add_twice_is_a_noop_and_remove_restores() {
        let mut index = RepositoryIndex::init("test-repo");
        let initial = index.clone();
        index.add(data("a", "sha256:1", &["1.0.0"])).unwrap();
        let after_add = index.clone();
        index.add(data("a", "sha256:1", &["1.0.0"])).unwrap();
        assert_eq!(index, after_add);

        index.remove("a", "sha256:1").unwrap();
        assert_eq!(index, initial);

        // removing again errors
        assert!(matches!(
            index.remove("a", "sha256:1"),
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[test]
    fn two_packages_versions_and_digests() {
        let mut index = RepositoryIndex::init("test-repo");
        index.add(data("a", "sha256:1", &["1.0.0", "1.1.0"])).unwrap();
        index.add(data("b", "sha256:2", &["1.0.0"])).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.list_entries(), vec!["a", "b"]);

        let versions = index.list_versions("a").unwrap();
        assert_eq!(
            versions,
            vec![Version::parse("1.0.0").unwrap(), Version::parse("1.1.0").unwrap()]
        );
        let rec = index.get_digest("a", "sha256:1").unwrap();
        assert_eq!(rec.versions.len(), 2);

        index.remove("b", "sha256:2").unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn get_version_finds_owning_record() {
        let mut index = RepositoryIndex::init("r");
        index.add(data("a", "sha256:1", &["1.0.0"])).unwrap();
        index.add(data("a", "sha256:2", &["2.0.0"])).unwrap();
        let rec = index.get_version("a", &Version::parse("2.0.0").unwrap()).unwrap();
        assert_eq!(rec.digest, "sha256:2");
        assert!(index.get_version("a", &Version::parse("3.0.0").unwrap()).is_err());
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.yaml");
        let mut index = RepositoryIndex::init("test-repo");
        index.add(data("a", "sha256:1", &["1.0.0", "1.1.0"])).unwrap();
        index.add(data("b", "sha256:2", &["0.3.1"])).unwrap();
        index.save(&path).unwrap();
        let back = RepositoryIndex::load(&path).unwrap();
        assert_eq!(back, index);
        assert_eq!(back.name(), "test-repo");
    }
}
