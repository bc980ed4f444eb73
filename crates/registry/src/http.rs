//! Minimal OCI distribution client: just enough of the protocol to pull
//! and push single-layer package images. Anything fancier (token auth
//! flows, foreign layers, schema1) is out of scope.

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use pko_core::FileMap;

use crate::oci::{self, LAYER_MEDIA_TYPE};
use crate::{CredentialSource, PackagePuller, PackagePusher, RegistryError};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Parsed image reference: `host/repository[:tag][@sha256:...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub host: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl Reference {
    pub fn parse(reference: &str) -> Result<Self, RegistryError> {
        let bad = |message: &str| RegistryError::Transport {
            reference: reference.to_string(),
            message: message.to_string(),
        };
        let (rest, digest) = match reference.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (reference, None),
        };
        let (host, path) = rest.split_once('/').ok_or_else(|| bad("missing registry host"))?;
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (path.to_string(), "latest".to_string()),
        };
        if repository.is_empty() {
            return Err(bad("empty repository"));
        }
        Ok(Self { host: host.to_string(), repository, tag, digest })
    }
}

/// reqwest-backed registry client. `insecure` selects plain HTTP, for
/// local test registries.
pub struct HttpRegistry {
    client: reqwest::Client,
    creds: Box<dyn CredentialSource>,
    insecure: bool,
}

impl HttpRegistry {
    pub fn new(creds: Box<dyn CredentialSource>, insecure: bool) -> Self {
        Self { client: reqwest::Client::new(), creds, insecure }
    }

    fn base_url(&self, host: &str) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{host}/v2")
    }

    async fn auth_header(&self, host: &str) -> Result<Option<String>, RegistryError> {
        let auth = self.creds.auth_for(host).await?;
        Ok(match (auth.username, auth.password) {
            (Some(u), Some(p)) => {
                Some(format!("Basic {}", BASE64_STANDARD.encode(format!("{u}:{p}"))))
            }
            _ => None,
        })
    }

    async fn get(
        &self,
        reference: &Reference,
        url: &str,
        accept: &str,
    ) -> Result<reqwest::Response, RegistryError> {
        let mut req = self.client.get(url).header("Accept", accept);
        if let Some(h) = self.auth_header(&reference.host).await? {
            req = req.header("Authorization", h);
        }
        let resp = req.send().await.map_err(|e| RegistryError::Transport {
            reference: format!("{}/{}", reference.host, reference.repository),
            message: e.to_string(),
        })?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized {
                reference: format!("{}/{}", reference.host, reference.repository),
            });
        }
        if !resp.status().is_success() {
            return Err(RegistryError::Transport {
                reference: format!("{}/{}", reference.host, reference.repository),
                message: format!("{} fetching {}", resp.status(), url),
            });
        }
        Ok(resp)
    }

    async fn fetch_manifest(
        &self,
        reference: &Reference,
    ) -> Result<(serde_json::Value, String), RegistryError> {
        let base = self.base_url(&reference.host);
        let target = reference.digest.clone().unwrap_or_else(|| reference.tag.clone());
        let url = format!("{base}/{}/manifests/{target}", reference.repository);
        let resp = self.get(reference, &url, MANIFEST_MEDIA_TYPE).await?;
        let body = resp.bytes().await.map_err(|e| RegistryError::Transport {
            reference: format!("{}/{}", reference.host, reference.repository),
            message: e.to_string(),
        })?;
        let digest = format!("sha256:{:x}", Sha256::digest(&body));
        let manifest: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| RegistryError::Transport {
                reference: format!("{}/{}", reference.host, reference.repository),
                message: format!("decoding manifest: {e}"),
            })?;
        Ok((manifest, digest))
    }

    async fn upload_blob(
        &self,
        reference: &Reference,
        data: &[u8],
    ) -> Result<String, RegistryError> {
        let digest = oci::blob_digest(data);
        let base = self.base_url(&reference.host);
        let url = format!("{base}/{}/blobs/uploads/?digest={digest}", reference.repository);
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec());
        if let Some(h) = self.auth_header(&reference.host).await? {
            req = req.header("Authorization", h);
        }
        let resp = req.send().await.map_err(|e| RegistryError::Transport {
            reference: format!("{}/{}", reference.host, reference.repository),
            message: e.to_string(),
        })?;
        if !resp.status().is_success() {
            return Err(RegistryError::Transport {
                reference: format!("{}/{}", reference.host, reference.repository),
                message: format!("{} uploading blob", resp.status()),
            });
        }
        Ok(digest)
    }
}

#[async_trait]
impl PackagePuller for HttpRegistry {
    async fn pull(&self, reference: &str) -> Result<FileMap, RegistryError> {
        let parsed = Reference::parse(reference)?;
        let (manifest, _) = self.fetch_manifest(&parsed).await?;
        let layer_digest = manifest["layers"][0]["digest"].as_str().ok_or_else(|| {
            RegistryError::Transport {
                reference: reference.to_string(),
                message: "manifest has no layers".to_string(),
            }
        })?;
        let base = self.base_url(&parsed.host);
        let url = format!("{base}/{}/blobs/{layer_digest}", parsed.repository);
        let resp = self.get(&parsed, &url, "application/octet-stream").await?;
        let layer = resp.bytes().await.map_err(|e| RegistryError::Transport {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;
        debug!(reference, bytes = layer.len(), "pulled package layer");
        oci::from_oci_layer(&layer)
    }

    async fn head_digest(&self, reference: &str) -> Result<String, RegistryError> {
        let parsed = Reference::parse(reference)?;
        let (_, digest) = self.fetch_manifest(&parsed).await?;
        Ok(digest)
    }
}

#[async_trait]
impl PackagePusher for HttpRegistry {
    async fn push(&self, tags: &[String], files: &FileMap) -> Result<String, RegistryError> {
        let layer = oci::to_oci_layer(files)?;
        let config = b"{}".to_vec();
        let mut last_digest = String::new();
        for tag in tags {
            let parsed = Reference::parse(tag)?;
            let layer_digest = self.upload_blob(&parsed, &layer).await?;
            let config_digest = self.upload_blob(&parsed, &config).await?;
            let manifest = serde_json::json!({
                "schemaVersion": 2,
                "mediaType": MANIFEST_MEDIA_TYPE,
                "config": {
                    "mediaType": CONFIG_MEDIA_TYPE,
                    "digest": config_digest,
                    "size": config.len(),
                },
                "layers": [{
                    "mediaType": LAYER_MEDIA_TYPE,
                    "digest": layer_digest,
                    "size": layer.len(),
                }],
            });
            let body = serde_json::to_vec(&manifest).map_err(|e| RegistryError::Transport {
                reference: tag.clone(),
                message: e.to_string(),
            })?;
            last_digest = format!("sha256:{:x}", Sha256::digest(&body));
            let base = self.base_url(&parsed.host);
            let url = format!("{base}/{}/manifests/{}", parsed.repository, parsed.tag);
            let mut req = self
                .client
                .put(&url)
                .header("Content-Type", MANIFEST_MEDIA_TYPE)
                .body(body);
            if let Some(h) = self.auth_header(&parsed.host).await? {
                req = req.header("Authorization", h);
            }
            let resp = req.send().await.map_err(|e| RegistryError::Transport {
                reference: tag.clone(),
                message: e.to_string(),
            })?;
            if !resp.status().is_success() {
                return Err(RegistryError::Transport {
                    reference: tag.clone(),
                    message: format!("{} pushing manifest", resp.status()),
                });
            }
            info!(tag = %tag, digest = %last_digest, "pushed package image");
        }
        Ok(last_digest)
    }
}
