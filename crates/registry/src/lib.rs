//! Registry access for package images: the file-map codec, the pull/push
//! seams the rest of the system consumes, and in-flight de-duplication of
//! concurrent pulls.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use pko_core::FileMap;

pub mod dedup;
pub mod http;
pub mod oci;

pub use dedup::DedupPuller;
pub use http::HttpRegistry;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tar: {0}")]
    Tar(String),
    #[error("image {reference}: {message}")]
    Transport { reference: String, message: String },
    #[error("image entry {path:?} outside the package/ prefix")]
    UnexpectedEntry { path: String },
    #[error("unauthorized pulling {reference}")]
    Unauthorized { reference: String },
}

/// Credentials for a registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: &str, password: &str) -> Self {
        Self { username: Some(username.to_string()), password: Some(password.to_string()) }
    }
}

/// Resolves credentials for a registry host. Implementations range from
/// static secrets to service-account-indexed pull secrets.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn auth_for(&self, registry_host: &str) -> Result<RegistryAuth, RegistryError>;
}

/// Always-anonymous credential source.
pub struct AnonymousCredentials;

#[async_trait]
impl CredentialSource for AnonymousCredentials {
    async fn auth_for(&self, _registry_host: &str) -> Result<RegistryAuth, RegistryError> {
        Ok(RegistryAuth::anonymous())
    }
}

/// Pulls the file set of a package image.
#[async_trait]
pub trait PackagePuller: Send + Sync {
    /// Pull `reference` and return its files with the `package/` prefix
    /// already stripped.
    async fn pull(&self, reference: &str) -> Result<FileMap, RegistryError>;

    /// Resolve `reference` to its content digest without fetching layers.
    async fn head_digest(&self, reference: &str) -> Result<String, RegistryError>;
}

/// Pushes a package file set as an image.
#[async_trait]
pub trait PackagePusher: Send + Sync {
    /// Push `files` to every reference in `tags`; returns the manifest digest.
    async fn push(&self, tags: &[String], files: &FileMap) -> Result<String, RegistryError>;
}
