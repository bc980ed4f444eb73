//! GVK resolution against the live apiserver. Unmappable kinds are the
//! transient external-resource failure the phase reconciler backs off on.

use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};

use pko_core::Gvk;

use crate::ControllerError;

/// Resolve a GVK to its API resource; returns the resource and whether it
/// is namespaced.
pub async fn find_api_resource(
    client: Client,
    gvk: &Gvk,
) -> Result<(ApiResource, bool), ControllerError> {
    let want = GroupVersionKind {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
    };
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == want.group && ar.version == want.version && ar.kind == want.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(ControllerError::UnmappableKind { kind: gvk.to_string() })
}

/// Dynamic API handle scoped to `namespace` when the kind is namespaced.
pub fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}
