//! Pull-secret credential source: resolves registry auth from the docker
//! config secrets attached to a service account.

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::Api;
use kube::Client;
use serde_json::Value;
use tracing::debug;

use pko_registry::{CredentialSource, RegistryAuth, RegistryError};

/// Reads `kubernetes.io/dockerconfigjson` secrets referenced as image
/// pull secrets by a service account.
pub struct ServiceAccountCredentials {
    client: Client,
    namespace: String,
    service_account: String,
}

impl ServiceAccountCredentials {
    pub fn new(client: Client, namespace: &str, service_account: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            service_account: service_account.to_string(),
        }
    }
}

/// Extract `{username, password}` for a registry host from a docker
/// config JSON document. Accepts both the `auth` base64 blob and split
/// username/password fields.
pub fn auth_from_docker_config(config: &Value, registry_host: &str) -> Option<RegistryAuth> {
    let auths = config.get("auths")?.as_object()?;
    let entry = auths.get(registry_host).or_else(|| {
        // registries are commonly keyed with a scheme prefix
        auths
            .iter()
            .find(|(key, _)| key.trim_start_matches("https://").trim_start_matches("http://") == registry_host)
            .map(|(_, v)| v)
    })?;
    if let Some(auth) = entry.get("auth").and_then(Value::as_str) {
        let decoded = BASE64_STANDARD.decode(auth).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        return Some(RegistryAuth::basic(user, pass));
    }
    let user = entry.get("username").and_then(Value::as_str)?;
    let pass = entry.get("password").and_then(Value::as_str)?;
    Some(RegistryAuth::basic(user, pass))
}

#[async_trait]
impl CredentialSource for ServiceAccountCredentials {
    async fn auth_for(&self, registry_host: &str) -> Result<RegistryAuth, RegistryError> {
        let transport = |message: String| RegistryError::Transport {
            reference: registry_host.to_string(),
            message,
        };
        let accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let account = accounts
            .get_opt(&self.service_account)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let Some(account) = account else {
            return Ok(RegistryAuth::anonymous());
        };
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        for reference in account.image_pull_secrets.unwrap_or_default() {
            let Some(name) = reference.name else { continue };
            let Some(secret) = secrets
                .get_opt(&name)
                .await
                .map_err(|e| transport(e.to_string()))?
            else {
                continue;
            };
            let Some(data) = secret.data.as_ref().and_then(|d| d.get(".dockerconfigjson")) else {
                continue;
            };
            let Ok(config) = serde_json::from_slice::<Value>(&data.0) else { continue };
            if let Some(auth) = auth_from_docker_config(&config, registry_host) {
                debug!(secret = %name, registry = %registry_host, "pull secret matched");
                return Ok(auth);
            }
        }
        Ok(RegistryAuth::anonymous())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn docker_config_auth_blob() {
        let config = json!({
            "auths": {
                "quay.io": {"auth": BASE64_STANDARD.encode("bot:hunter2")}
            }
        });
        let auth = auth_from_docker_config(&config, "quay.io").unwrap();
        assert_eq!(auth, RegistryAuth::basic("bot", "hunter2"));
    }

    #[test]
    fn docker_config_split_fields_and_scheme_prefix() {
        let config = json!({
            "auths": {
                "https://registry.example.com": {"username": "u", "password": "p"}
            }
        });
        let auth = auth_from_docker_config(&config, "registry.example.com").unwrap();
        assert_eq!(auth, RegistryAuth::basic("u", "p"));
    }

    #[test]
    fn unknown_registry_yields_none() {
        let config = json!({"auths": {"quay.io": {"auth": "x"}}});
        assert!(auth_from_docker_config(&config, "ghcr.io").is_none());
    }
}
