//! Dynamic watch multiplexer. At most one informer runs per
//! (group, kind, version, namespace); its events fan out to every
//! registered sink, and owners register interest so events can requeue
//! them. When the last registration for a key is freed the informer is
//! stopped and forgotten.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use metrics::gauge;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pko_core::{Gvk, OwnerRef};

pub mod kube_informer;

pub use kube_informer::KubeInformerSpawner;

/// Informer identity: kind plus optional namespace scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub object: serde_json::Value,
}

/// Receives every event of every informer. Sinks registered late are
/// subscribed to already-running informers automatically.
pub trait EventSink: Send + Sync {
    fn handle(&self, key: &WatchKey, event: &WatchEvent);
}

pub type SharedSinks = Arc<Mutex<Vec<Arc<dyn EventSink>>>>;

/// Spawns the long-lived informer task for a key. The task must exit when
/// the stop channel fires.
pub trait InformerSpawner: Send + Sync {
    fn spawn(&self, key: &WatchKey, sinks: SharedSinks, stop: oneshot::Receiver<()>)
        -> JoinHandle<()>;
}

struct Informer {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WatchState {
    informers: HashMap<WatchKey, Informer>,
    registrations: HashMap<WatchKey, HashSet<OwnerRef>>,
}

/// The multiplexer. All map mutations and informer starts/stops happen
/// under one mutex.
pub struct DynamicWatcher {
    spawner: Box<dyn InformerSpawner>,
    sinks: SharedSinks,
    state: Mutex<WatchState>,
}

impl DynamicWatcher {
    pub fn new(spawner: Box<dyn InformerSpawner>) -> Self {
        Self {
            spawner,
            sinks: Arc::new(Mutex::new(Vec::new())),
            state: Mutex::new(WatchState::default()),
        }
    }

    /// Register a sink. Existing informers deliver to it from now on.
    pub fn start(&self, sink: Arc<dyn EventSink>) {
        self.sinks.lock().expect("sink lock poisoned").push(sink);
    }

    /// Register `owner`'s interest in `gvk`. Namespace-scoped owners watch
    /// their own namespace; cluster-scoped owners watch cluster-wide. The
    /// informer is created on first registration.
    pub fn watch(&self, owner: &OwnerRef, gvk: Gvk) {
        let key = WatchKey { gvk, namespace: owner.namespace.clone() };
        let mut state = self.state.lock().expect("watch lock poisoned");
        let registrations = state.registrations.entry(key.clone()).or_default();
        if !registrations.insert(owner.clone()) {
            return;
        }
        if !state.informers.contains_key(&key) {
            let (stop_tx, stop_rx) = oneshot::channel();
            let task = self.spawner.spawn(&key, Arc::clone(&self.sinks), stop_rx);
            state.informers.insert(key.clone(), Informer { stop: stop_tx, task });
            gauge!("dynamic_informers", state.informers.len() as f64);
            info!(gvk = %key.gvk, ns = ?key.namespace, "informer started");
        } else {
            debug!(gvk = %key.gvk, ns = ?key.namespace, owner = %owner.name, "joined existing informer");
        }
    }

    /// Drop every registration held by `owner`. Informers whose
    /// registration set empties are stopped and forgotten.
    pub fn free(&self, owner: &OwnerRef) {
        let mut state = self.state.lock().expect("watch lock poisoned");
        let mut emptied = Vec::new();
        state.registrations.retain(|key, owners| {
            owners.remove(owner);
            if owners.is_empty() {
                emptied.push(key.clone());
                false
            } else {
                true
            }
        });
        for key in emptied {
            if let Some(informer) = state.informers.remove(&key) {
                // Close the stop channel; the task observes it and exits.
                let _ = informer.stop.send(());
                informer.task.abort();
                info!(gvk = %key.gvk, ns = ?key.namespace, "informer stopped");
            }
        }
        gauge!("dynamic_informers", state.informers.len() as f64);
    }

    /// Owners registered for a kind/namespace; used by the event handler
    /// to requeue them.
    pub fn owners_for(&self, gvk: &Gvk, namespace: Option<&str>) -> Vec<OwnerRef> {
        let key = WatchKey { gvk: gvk.clone(), namespace: namespace.map(String::from) };
        let state = self.state.lock().expect("watch lock poisoned");
        let mut owners: Vec<OwnerRef> = state
            .registrations
            .get(&key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        // A cluster-wide informer also serves namespaced events.
        if namespace.is_some() {
            let wide = WatchKey { gvk: gvk.clone(), namespace: None };
            if let Some(set) = state.registrations.get(&wide) {
                owners.extend(set.iter().cloned());
            }
        }
        owners
    }

    /// Number of live informers; diagnostics and tests.
    pub fn informer_count(&self) -> usize {
        self.state.lock().expect("watch lock poisoned").informers.len()
    }

    /// True when an informer runs for exactly this key.
    pub fn is_watching(&self, gvk: &Gvk, namespace: Option<&str>) -> bool {
        let key = WatchKey { gvk: gvk.clone(), namespace: namespace.map(String::from) };
        self.state.lock().expect("watch lock poisoned").informers.contains_key(&key)
    }

    /// Stop every informer; used on shutdown.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("watch lock poisoned");
        state.registrations.clear();
        for (key, informer) in state.informers.drain() {
            let _ = informer.stop.send(());
            informer.task.abort();
            debug!(gvk = %key.gvk, "informer stopped on shutdown");
        }
    }
}

/// Sink that requeues every owner registered for an event's kind and
/// namespace. Holds the watcher weakly; the watcher holds the sink.
pub struct RequeueSink {
    watcher: std::sync::Weak<DynamicWatcher>,
    tx: tokio::sync::mpsc::Sender<OwnerRef>,
}

impl RequeueSink {
    pub fn new(watcher: &Arc<DynamicWatcher>, tx: tokio::sync::mpsc::Sender<OwnerRef>) -> Self {
        Self { watcher: Arc::downgrade(watcher), tx }
    }
}

impl EventSink for RequeueSink {
    fn handle(&self, key: &WatchKey, event: &WatchEvent) {
        let Some(watcher) = self.watcher.upgrade() else { return };
        let namespace = event
            .object
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(serde_json::Value::as_str)
            .or(key.namespace.as_deref());
        for owner in watcher.owners_for(&key.gvk, namespace) {
            if self.tx.try_send(owner).is_err() {
                warn!(gvk = %key.gvk, "requeue channel full; dropping owner event");
            }
        }
    }
}

impl Drop for DynamicWatcher {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            for (_, informer) in state.informers.drain() {
                let _ = informer.stop.send(());
                informer.task.abort();
            }
        } else {
            warn!("watch state poisoned at drop");
        }
    }
}
