//! Bootstrapper: installs the operator from the package baked into its
//! own container image, forcing adoption so it takes ownership of its own
//! objects, then hands off to the regular controllers.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pko_apis::manifests::{TemplateContext, TemplateContextPackage};
use pko_controllers::deploy::PackageDeployer;
use pko_packages::render::render_package;
use pko_packages::validate::{load_package, validate_package};
use pko_packages::{PackageInstance, RawPackage};

/// Default location of the operator's own package inside the image.
pub const SELF_PACKAGE_PATH: &str = "/.package";
/// Deployment the bootstrap waits on before handing off.
pub const SELF_DEPLOYMENT: &str = "package-operator-manager";

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A known-issue fix: eligible-then-executed, in order. The first run
/// error aborts bootstrap.
#[async_trait]
pub trait Fix: Send + Sync {
    fn name(&self) -> &str;
    /// Should `run` execute?
    async fn check(&self, client: &Client, namespace: &str) -> Result<bool>;
    async fn run(&self, client: &Client, namespace: &str) -> Result<()>;
}

/// Pre-1.0 installs could leave a failed bootstrap Job behind that blocks
/// reinstallation; delete it.
pub struct DeleteStuckBootstrapJob;

#[async_trait]
impl Fix for DeleteStuckBootstrapJob {
    fn name(&self) -> &str {
        "delete-stuck-bootstrap-job"
    }

    async fn check(&self, client: &Client, namespace: &str) -> Result<bool> {
        let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
        let Some(job) = jobs.get_opt("package-operator-bootstrap").await? else {
            return Ok(false);
        };
        let failed = job
            .status
            .as_ref()
            .and_then(|s| s.failed)
            .unwrap_or(0);
        Ok(failed > 0)
    }

    async fn run(&self, client: &Client, namespace: &str) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
        jobs.delete("package-operator-bootstrap", &DeleteParams::foreground()).await?;
        info!("stuck bootstrap job deleted");
        Ok(())
    }
}

pub struct Bootstrapper {
    client: Client,
    namespace: String,
    package_path: PathBuf,
    fixes: Vec<Box<dyn Fix>>,
}

impl Bootstrapper {
    pub fn new(client: Client, namespace: &str) -> Self {
        let package_path = std::env::var("PKO_SELF_PACKAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(SELF_PACKAGE_PATH));
        Self {
            client,
            namespace: namespace.to_string(),
            package_path,
            fixes: vec![Box::new(DeleteStuckBootstrapJob)],
        }
    }

    pub fn with_package_path(mut self, path: PathBuf) -> Self {
        self.package_path = path;
        self
    }

    pub fn with_fixes(mut self, fixes: Vec<Box<dyn Fix>>) -> Self {
        self.fixes = fixes;
        self
    }

    /// Run the bootstrap sequence; cancels `run_token` once the
    /// operator's own deployment reports an available replica.
    pub async fn run(&self, run_token: CancellationToken) -> Result<()> {
        log_proxy_env();
        self.apply_fixes().await?;
        let instance = self.load_self_package()?;
        self.install(&instance).await?;
        self.wait_for_self(&run_token).await?;
        run_token.cancel();
        info!("bootstrap complete; run context cancelled");
        Ok(())
    }

    async fn apply_fixes(&self) -> Result<()> {
        for fix in &self.fixes {
            let eligible = fix
                .check(&self.client, &self.namespace)
                .await
                .with_context(|| format!("checking fix {}", fix.name()))?;
            if !eligible {
                continue;
            }
            info!(fix = fix.name(), "applying known-issue fix");
            fix.run(&self.client, &self.namespace)
                .await
                .with_context(|| format!("fix {} failed", fix.name()))?;
        }
        Ok(())
    }

    fn load_self_package(&self) -> Result<PackageInstance> {
        let raw = RawPackage::from_folder(&self.package_path)
            .with_context(|| format!("reading self package at {}", self.package_path.display()))?;
        let package = load_package(&raw).map_err(|e| anyhow::anyhow!("self package invalid:\n{e}"))?;
        let violations = validate_package(&package);
        if !violations.is_empty() {
            anyhow::bail!(
                "self package invalid:\n{}",
                violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
            );
        }
        let ctx = TemplateContext {
            package: TemplateContextPackage {
                name: package.manifest.metadata.name.clone(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            config: None,
            environment: Default::default(),
        };
        let (instance, _) = render_package(&package.manifest, package.lock.as_ref(), &package.files, &ctx)?;
        Ok(instance)
    }

    async fn install(&self, instance: &PackageInstance) -> Result<()> {
        use pko_apis::v1alpha1::ObjectSet;
        use pko_controllers::objectset::{
            NamespacedAccess, ObjectSetReconciler, ReconcileOutcome,
        };
        use pko_controllers::phase::PhaseReconciler;
        use pko_core::backoff::OwnerBackoff;
        use pko_owners::NativeStrategy;

        let deployer = PackageDeployer::new(self.client.clone());
        let name = instance.manifest.metadata.name.clone();
        deployer
            .deploy(&self.namespace, &name, instance)
            .await
            .context("deploying self package")?;

        // Drive the fresh revision ourselves with adoption forced, so the
        // operator takes ownership of objects a previous install left
        // behind. The regular controllers take over afterwards.
        let phases = PhaseReconciler::new(
            self.client.clone(),
            Arc::new(NativeStrategy),
            Arc::new(OwnerBackoff::default()),
            None,
        )
        .with_force_adoption(true);
        let reconciler = ObjectSetReconciler::new(self.client.clone(), NamespacedAccess, phases);

        let sets: Api<ObjectSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("{}={}", pko_core::INSTANCE_LABEL, name);
        let list = sets.list(&ListParams::default().labels(&selector)).await?;
        let latest = list
            .items
            .iter()
            .max_by_key(|os| pko_controllers::objectset::revision_of(*os))
            .cloned();
        if let Some(latest) = latest {
            for _ in 0..30 {
                match reconciler.reconcile(&latest).await.context("bootstrap reconcile")? {
                    ReconcileOutcome::Done => break,
                    ReconcileOutcome::RequeueAfter(delay) => {
                        tokio::time::sleep(delay.min(POLL_INTERVAL)).await
                    }
                }
            }
        }
        info!(package = %name, "self package installed with forced adoption");
        Ok(())
    }

    async fn wait_for_self(&self, run_token: &CancellationToken) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        loop {
            if run_token.is_cancelled() {
                anyhow::bail!("bootstrap cancelled");
            }
            match deployments.get_opt(SELF_DEPLOYMENT).await {
                Ok(Some(deployment)) => {
                    let available = deployment
                        .status
                        .as_ref()
                        .and_then(|s| s.available_replicas)
                        .unwrap_or(0);
                    if available >= 1 {
                        info!(available, "operator deployment is available");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "polling operator deployment"),
            }
            tokio::select! {
                _ = run_token.cancelled() => anyhow::bail!("bootstrap cancelled"),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

fn log_proxy_env() {
    for key in ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"] {
        match std::env::var(key) {
            Ok(value) if !value.is_empty() => info!(%key, %value, "proxy configuration applied"),
            _ => {}
        }
    }
}

