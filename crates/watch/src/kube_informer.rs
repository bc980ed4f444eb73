//! Production informer spawner: a kube list+watch stream per key,
//! dispatching events to the shared sink list until stopped.

use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{InformerSpawner, SharedSinks, WatchEvent, WatchEventKind, WatchKey};

pub struct KubeInformerSpawner {
    client: Client,
}

impl KubeInformerSpawner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> anyhow::Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    anyhow::bail!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

fn dispatch(sinks: &SharedSinks, key: &WatchKey, kind: WatchEventKind, obj: &DynamicObject) {
    let object = match serde_json::to_value(obj) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "informer object does not serialize; dropping event");
            return;
        }
    };
    let event = WatchEvent { kind, object };
    let sinks = sinks.lock().expect("sink lock poisoned").clone();
    for sink in sinks {
        sink.handle(key, &event);
    }
}

async fn run_informer(client: Client, key: WatchKey, sinks: SharedSinks, mut stop: oneshot::Receiver<()>) {
    let gvk = GroupVersionKind {
        group: key.gvk.group.clone(),
        version: key.gvk.version.clone(),
        kind: key.gvk.kind.clone(),
    };
    let (ar, namespaced) = match find_api_resource(client.clone(), &gvk).await {
        Ok(found) => found,
        Err(e) => {
            error!(gvk = %key.gvk, error = %e, "informer cannot resolve kind");
            return;
        }
    };
    let api: Api<DynamicObject> = match (&key.namespace, namespaced) {
        (Some(ns), true) => Api::namespaced_with(client.clone(), ns, &ar),
        _ => Api::all_with(client.clone(), &ar),
    };

    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(gvk = %key.gvk, ns = ?key.namespace, "informer watching");
    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!(gvk = %key.gvk, "informer stop requested");
                break;
            }
            next = stream.try_next() => {
                match next {
                    Ok(Some(Event::Applied(o))) => dispatch(&sinks, &key, WatchEventKind::Applied, &o),
                    Ok(Some(Event::Deleted(o))) => dispatch(&sinks, &key, WatchEventKind::Deleted, &o),
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(gvk = %key.gvk, count = list.len(), "watch restarted");
                        for o in &list {
                            dispatch(&sinks, &key, WatchEventKind::Applied, o);
                        }
                    }
                    Ok(None) => {
                        warn!(gvk = %key.gvk, "informer stream ended");
                        break;
                    }
                    Err(e) => {
                        // watcher backs off internally; log and continue
                        warn!(gvk = %key.gvk, error = %e, "informer stream error");
                    }
                }
            }
        }
    }
    info!(gvk = %key.gvk, ns = ?key.namespace, "informer exited");
}

impl InformerSpawner for KubeInformerSpawner {
    fn spawn(
        &self,
        key: &WatchKey,
        sinks: SharedSinks,
        stop: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let key = key.clone();
        tokio::spawn(run_informer(client, key, sinks, stop))
    }
}
