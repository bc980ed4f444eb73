//! Package import from folder, pre-built file maps, or OCI images. All
//! sources produce the same in-memory shape with the same exclusions.

use std::path::{Path, PathBuf};

use tracing::debug;

use pko_core::FileMap;
use pko_registry::oci::{check_path, is_hidden};
use pko_registry::{PackagePuller, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path {path:?} escapes the package root")]
    Traversal { path: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Raw file map of a package, before any parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPackage {
    files: FileMap,
}

impl RawPackage {
    /// Wrap an existing file map, applying the hidden-file exclusion and
    /// rejecting traversal.
    pub fn from_files(files: FileMap) -> Result<Self, ImportError> {
        let mut out = FileMap::new();
        for (path, data) in files {
            if is_hidden(&path) {
                continue;
            }
            check_path(&path).map_err(|_| ImportError::Traversal { path: path.clone() })?;
            out.insert(path, data);
        }
        Ok(Self { files: out })
    }

    /// Recursively read a folder. Dot-files and dot-directories are
    /// silently dropped.
    pub fn from_folder(root: &Path) -> Result<Self, ImportError> {
        let mut files = FileMap::new();
        walk(root, root, &mut files)?;
        debug!(root = %root.display(), files = files.len(), "imported package folder");
        Ok(Self { files })
    }

    /// Pull an image through `puller`. The puller already strips the
    /// `package/` prefix and fails on entries outside it.
    pub async fn from_image(
        puller: &dyn PackagePuller,
        reference: &str,
    ) -> Result<Self, ImportError> {
        let files = puller.pull(reference).await?;
        Self::from_files(files)
    }

    pub fn files(&self) -> &FileMap {
        &self.files
    }

    pub fn into_files(self) -> FileMap {
        self.files
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn walk(root: &Path, dir: &Path, files: &mut FileMap) -> Result<(), ImportError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ImportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ImportError::Io { path: dir.to_path_buf(), source })?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().map_err(|source| ImportError::Io {
            path: path.clone(),
            source,
        })?;
        if file_type.is_dir() {
            walk(root, &path, files)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .map_err(|_| ImportError::Traversal { path: path.display().to_string() })?;
            let data = std::fs::read(&path).map_err(|source| ImportError::Io {
                path: path.clone(),
                source,
            })?;
            files.insert(rel, data);
        }
    }
    Ok(())
}
