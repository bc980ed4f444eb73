//! In-flight de-duplication of concurrent image pulls. All callers for the
//! same reference share one transport request; each receives its own copy
//! of the file map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::oneshot;
use tracing::debug;

use pko_core::FileMap;

use crate::{PackagePuller, RegistryError};

type PullResult = Result<FileMap, String>;

/// Wraps a [`PackagePuller`], collapsing concurrent pulls of the same
/// reference into a single request. The waiter table and the puller task
/// lifecycle share one mutex; one-slot channels keep the broadcast from
/// ever blocking.
pub struct DedupPuller<P> {
    inner: Arc<P>,
    waiting: Arc<Mutex<HashMap<String, Vec<oneshot::Sender<PullResult>>>>>,
}

impl<P> DedupPuller<P>
where
    P: PackagePuller + 'static,
{
    pub fn new(inner: P) -> Self {
        Self { inner: Arc::new(inner), waiting: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub async fn pull(&self, reference: &str) -> Result<FileMap, RegistryError> {
        let (tx, rx) = oneshot::channel();
        let start_pull = {
            let mut waiting = self.waiting.lock().expect("pull table lock poisoned");
            match waiting.get_mut(reference) {
                Some(waiters) => {
                    counter!("pull_dedup_joined", 1u64);
                    waiters.push(tx);
                    false
                }
                None => {
                    waiting.insert(reference.to_string(), vec![tx]);
                    true
                }
            }
        };

        if start_pull {
            let inner = Arc::clone(&self.inner);
            let waiting = Arc::clone(&self.waiting);
            let reference = reference.to_string();
            tokio::spawn(async move {
                let result = inner
                    .pull(&reference)
                    .await
                    .map_err(|e| e.to_string());
                // Remove the entry and broadcast under the same lock so a
                // late joiner either sees the entry or starts a fresh pull.
                let waiters = waiting
                    .lock()
                    .expect("pull table lock poisoned")
                    .remove(&reference)
                    .unwrap_or_default();
                debug!(reference = %reference, waiters = waiters.len(), "pull complete");
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        match rx.await {
            Ok(Ok(files)) => Ok(files),
            Ok(Err(message)) => Err(RegistryError::Transport {
                reference: reference.to_string(),
                message,
            }),
            Err(_) => Err(RegistryError::Transport {
                reference: reference.to_string(),
                message: "pull task dropped".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingPuller {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PackagePuller for CountingPuller {
        async fn pull(&self, _reference: &str) -> Result<FileMap, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Hold the pull open long enough for every caller to join.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(FileMap::from([("manifest.yaml".to_string(), b"m".to_vec())]))
        }

        async fn head_digest(&self, _reference: &str) -> Result<String, RegistryError> {
            Ok("sha256:0".to_string())
        }
    }

    #[tokio::test]
    async fn concurrent_pulls_hit_transport_once() {
        let dedup = Arc::new(DedupPuller::new(CountingPuller { calls: AtomicUsize::new(0) }));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let d = Arc::clone(&dedup);
            handles.push(tokio::spawn(async move { d.pull("quay.io/example/app:v1").await }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }
        assert_eq!(dedup.inner.calls.load(Ordering::SeqCst), 1);
        // every caller gets an equal, independent copy
        for r in &results {
            assert_eq!(r, &results[0]);
        }
        let mut first = results.pop().unwrap();
        first.insert("extra".to_string(), vec![]);
        assert!(!results.iter().any(|r| r.contains_key("extra")));
    }

    #[tokio::test]
    async fn next_pull_after_completion_is_fresh() {
        let dedup = DedupPuller::new(CountingPuller { calls: AtomicUsize::new(0) });
        dedup.pull("ref").await.unwrap();
        dedup.pull("ref").await.unwrap();
        assert_eq!(dedup.inner.calls.load(Ordering::SeqCst), 2);
    }
}
