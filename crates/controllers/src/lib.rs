//! Reconcilers driving packages onto the cluster: the deployer translates
//! a rendered package into an ObjectDeployment with chunked slices, the
//! phase reconciler applies and probes individual objects, and the
//! objectset controller owns revision lifecycle.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod adoption;
pub mod creds;
pub mod deploy;
pub mod discovery;
pub mod objectset;
pub mod patch;
pub mod phase;
pub mod probes;
pub mod slices;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("kind {kind} is not served by the cluster")]
    UnmappableKind { kind: String },
    #[error("object {key}: {source}")]
    Object {
        key: String,
        #[source]
        source: pko_core::object::ObjectError,
    },
    #[error(transparent)]
    Adoption(#[from] adoption::AdoptionError),
    #[error("slice collision retries exhausted for {name}")]
    SliceCollisionExhausted { name: String },
    #[error("{0}")]
    Internal(String),
}

impl ControllerError {
    /// Conflict on write; retried with backoff inside the same reconcile.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Not-found; races create during updates.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

/// Bounded conflict retry: 5 attempts, 25ms doubling.
pub async fn with_conflict_retry<T, F, Fut>(mut op: F) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ControllerError>>,
{
    let mut delay = Duration::from_millis(25);
    let mut last = None;
    for _ in 0..5 {
        match op().await {
            Err(e) if e.is_conflict() => {
                tokio::time::sleep(delay).await;
                delay *= 2;
                last = Some(e);
            }
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| ControllerError::Internal("conflict retry exhausted".into())))
}
