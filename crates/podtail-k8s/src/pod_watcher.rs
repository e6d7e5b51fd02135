use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::ListParams;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podtail_types::PodSnapshot;

#[derive(Clone, Debug)]
pub struct PodWatcherOptions {
    /// Pending events per stream before the watch loop blocks
    pub event_buffer: usize,

    /// How often the watch is restarted with a full re-list
    pub resync_interval: Duration,
}

impl Default for PodWatcherOptions {
    fn default() -> Self {
        Self {
            event_buffer: 100,
            resync_interval: Duration::from_secs(300),
        }
    }
}

/// Latest snapshot of every pod currently known, keyed by UID
#[derive(Clone, Default)]
pub struct PodRegistry {
    pods: Arc<RwLock<HashMap<String, PodSnapshot>>>,
}

impl PodRegistry {
    pub fn get(&self, uid: &str) -> Option<PodSnapshot> {
        self.pods.read().get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.read().is_empty()
    }

    /// Store a snapshot, returning true if the UID was not known before
    fn upsert(&self, pod: PodSnapshot) -> bool {
        self.pods.write().insert(pod.uid.clone(), pod).is_none()
    }

    fn remove(&self, uid: &str) -> Option<PodSnapshot> {
        self.pods.write().remove(uid)
    }

    fn uids(&self) -> Vec<String> {
        self.pods.read().keys().cloned().collect()
    }
}

/// Turns raw watch events into registry updates and arrived/departed
/// notifications.
///
/// Sends block while a channel is full, so a slow consumer throttles the
/// watch instead of growing an unbounded queue.
pub struct PodEventRouter {
    registry: PodRegistry,
    arrived: mpsc::Sender<PodSnapshot>,
    departed: mpsc::Sender<String>,

    /// UIDs seen since the last `Init`, while a re-list is in progress
    relisted: Option<HashSet<String>>,
}

impl PodEventRouter {
    /// Apply one watch event. Fails once the consumer has gone away.
    pub async fn handle(&mut self, event: Event<Pod>) -> Result<()> {
        match event {
            Event::Init => {
                debug!("pod listing started");
                self.relisted = Some(HashSet::new());
            }
            Event::InitApply(pod) => {
                if let Some(uid) = self.apply(&pod).await? {
                    if let Some(seen) = &mut self.relisted {
                        seen.insert(uid);
                    }
                }
            }
            Event::InitDone => {
                // anything not re-listed was deleted while we weren't watching
                if let Some(seen) = self.relisted.take() {
                    for uid in self.registry.uids() {
                        if !seen.contains(&uid) {
                            self.depart(&uid).await?;
                        }
                    }
                }
                debug!(pods = self.registry.len(), "pod listing complete");
            }
            Event::Apply(pod) => {
                self.apply(&pod).await?;
            }
            Event::Delete(pod) => {
                if let Some(uid) = pod.metadata.uid.as_deref() {
                    self.depart(uid).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply(&self, pod: &Pod) -> Result<Option<String>> {
        let Some(snapshot) = pod_to_snapshot(pod) else {
            warn!(name = ?pod.metadata.name, "ignoring pod without a UID");
            return Ok(None);
        };
        let uid = snapshot.uid.clone();

        if self.registry.upsert(snapshot.clone()) {
            debug!(%uid, name = %snapshot.name, namespace = %snapshot.namespace, "watcher got new pod");
            self.arrived
                .send(snapshot)
                .await
                .context("pod arrival consumer dropped")?;
        } else {
            debug!(%uid, name = %snapshot.name, "watcher got updated pod");
        }
        Ok(Some(uid))
    }

    async fn depart(&self, uid: &str) -> Result<()> {
        let Some(pod) = self.registry.remove(uid) else {
            return Ok(());
        };

        debug!(%uid, name = %pod.name, namespace = %pod.namespace, "watcher got deleted pod");
        self.departed
            .send(uid.to_string())
            .await
            .context("pod departure consumer dropped")?;
        Ok(())
    }
}

/// Watches the pods matching a selector and reports their comings and goings
pub struct PodWatcher {
    registry: PodRegistry,
    arrived: mpsc::Receiver<PodSnapshot>,
    departed: mpsc::Receiver<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PodWatcher {
    /// List once to validate the selectors, then keep watching in the background.
    ///
    /// # Errors
    ///
    /// Fails if the initial list is rejected (bad selector, missing RBAC,
    /// unreachable API server). Later watch failures are retried forever.
    pub async fn new(
        client: kube::Client,
        namespace: Option<&str>,
        label_selector: &str,
        field_selector: &str,
        options: PodWatcherOptions,
    ) -> Result<Self> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };

        api.list(
            &ListParams::default()
                .labels(label_selector)
                .fields(field_selector)
                .limit(1),
        )
        .await
        .with_context(|| format!("Failed to list pods matching '{}'", label_selector))?;

        let (mut watcher, router) = Self::manual(options.event_buffer);
        let config = watcher::Config::default()
            .labels(label_selector)
            .fields(field_selector);

        info!(
            namespace = namespace.unwrap_or("*"),
            label_selector, field_selector, "starting pod watcher"
        );
        watcher.task = Some(tokio::spawn(watch_pods(
            api,
            config,
            router,
            options.resync_interval,
            watcher.cancel.clone(),
        )));
        Ok(watcher)
    }

    /// A watcher fed by hand through the returned router instead of the API
    pub fn manual(capacity: usize) -> (Self, PodEventRouter) {
        let registry = PodRegistry::default();
        let (arrived_tx, arrived_rx) = mpsc::channel(capacity);
        let (departed_tx, departed_rx) = mpsc::channel(capacity);

        let router = PodEventRouter {
            registry: registry.clone(),
            arrived: arrived_tx,
            departed: departed_tx,
            relisted: None,
        };
        let watcher = Self {
            registry,
            arrived: arrived_rx,
            departed: departed_rx,
            cancel: CancellationToken::new(),
            task: None,
        };
        (watcher, router)
    }

    /// Latest snapshot of a pod, if it is currently known
    pub fn get(&self, uid: &str) -> Option<PodSnapshot> {
        self.registry.get(uid)
    }

    /// Shared handle for lookups from other tasks
    pub fn registry(&self) -> PodRegistry {
        self.registry.clone()
    }

    /// Both event streams: pods seen for the first time, and UIDs of deleted pods
    pub fn receivers(
        &mut self,
    ) -> (
        &mut mpsc::Receiver<PodSnapshot>,
        &mut mpsc::Receiver<String>,
    ) {
        (&mut self.arrived, &mut self.departed)
    }

    /// Stop watching and wait for the watch task to exit
    pub async fn stop(&mut self) {
        // wakes a producer blocked on a full channel
        self.arrived.close();
        self.departed.close();
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "pod watch task failed");
            }
        }
    }
}

impl Drop for PodWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Watch loop: reconnects with backoff on errors and restarts with a fresh
/// list every `resync` so deletions missed during an outage are noticed.
async fn watch_pods(
    api: Api<Pod>,
    config: watcher::Config,
    mut router: PodEventRouter,
    resync: Duration,
    cancel: CancellationToken,
) {
    loop {
        let mut stream = watcher::watcher(api.clone(), config.clone())
            .default_backoff()
            .boxed();
        let resync_at = tokio::time::sleep(resync);
        tokio::pin!(resync_at);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return,

                _ = &mut resync_at => {
                    debug!("re-listing pods");
                    break;
                }

                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        if let Err(error) = router.handle(event).await {
                            debug!(%error, "pod watch stopping");
                            return;
                        }
                    }
                    Some(Err(error)) => warn!(%error, "pod watch failed, reconnecting"),
                    None => {
                        warn!("pod watch stream ended, restarting");
                        break;
                    }
                },
            }
        }
    }
}

/// Convert a k8s Pod to a PodSnapshot; pods without a UID are skipped
pub fn pod_to_snapshot(pod: &Pod) -> Option<PodSnapshot> {
    let metadata = &pod.metadata;
    let mut snapshot = PodSnapshot::new(
        metadata.uid.clone()?,
        metadata.name.clone().unwrap_or_default(),
        metadata.namespace.clone().unwrap_or_default(),
    );

    snapshot.labels = metadata.labels.clone().unwrap_or_default();
    snapshot.annotations = metadata.annotations.clone().unwrap_or_default();

    if let Some(spec) = &pod.spec {
        snapshot.node_name = spec.node_name.clone();
        snapshot.containers = spec.containers.iter().map(|c| c.name.clone()).collect();
    }

    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn create_test_pod(uid: &str, name: &str, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([(
                    "version".to_string(),
                    version.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_string()),
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_to_snapshot() {
        let snapshot = pod_to_snapshot(&create_test_pod("u1", "web", "v1")).unwrap();

        assert_eq!(snapshot.uid, "u1");
        assert_eq!(snapshot.name, "web");
        assert_eq!(snapshot.namespace, "default");
        assert_eq!(snapshot.containers, vec!["app"]);
        assert_eq!(snapshot.node_name.as_deref(), Some("node-1"));
        assert_eq!(snapshot.labels.get("version").map(String::as_str), Some("v1"));

        assert!(pod_to_snapshot(&Pod::default()).is_none());
    }

    #[tokio::test]
    async fn test_first_observation_arrives_once() {
        let (mut watcher, mut router) = PodWatcher::manual(10);

        router
            .handle(Event::Apply(create_test_pod("u1", "web", "v1")))
            .await
            .unwrap();
        router
            .handle(Event::Apply(create_test_pod("u1", "web", "v2")))
            .await
            .unwrap();

        let (arrived, _) = watcher.receivers();
        let first = arrived.try_recv().unwrap();
        assert_eq!(first.labels["version"], "v1");
        assert!(arrived.try_recv().is_err());

        let latest = watcher.get("u1").unwrap();
        assert_eq!(latest.labels["version"], "v2");
    }

    #[tokio::test]
    async fn test_delete_departs_once() {
        let (mut watcher, mut router) = PodWatcher::manual(10);
        let pod = create_test_pod("u1", "web", "v1");

        router.handle(Event::Apply(pod.clone())).await.unwrap();
        router.handle(Event::Delete(pod.clone())).await.unwrap();
        router.handle(Event::Delete(pod)).await.unwrap();
        router
            .handle(Event::Delete(create_test_pod("never-seen", "ghost", "v1")))
            .await
            .unwrap();

        let (_, departed) = watcher.receivers();
        assert_eq!(departed.try_recv().unwrap(), "u1");
        assert!(departed.try_recv().is_err());
        assert!(watcher.get("u1").is_none());
    }

    #[tokio::test]
    async fn test_relist_departs_missed_deletions() {
        let (mut watcher, mut router) = PodWatcher::manual(10);

        router
            .handle(Event::Apply(create_test_pod("u1", "web-1", "v1")))
            .await
            .unwrap();
        router
            .handle(Event::Apply(create_test_pod("u2", "web-2", "v1")))
            .await
            .unwrap();

        router.handle(Event::Init).await.unwrap();
        router
            .handle(Event::InitApply(create_test_pod("u2", "web-2", "v2")))
            .await
            .unwrap();
        router.handle(Event::InitDone).await.unwrap();

        let (arrived, departed) = watcher.receivers();
        assert_eq!(arrived.try_recv().unwrap().uid, "u1");
        assert_eq!(arrived.try_recv().unwrap().uid, "u2");
        assert!(arrived.try_recv().is_err());
        assert_eq!(departed.try_recv().unwrap(), "u1");
        assert!(departed.try_recv().is_err());

        assert!(watcher.get("u1").is_none());
        assert_eq!(watcher.get("u2").unwrap().labels["version"], "v2");
    }

    #[tokio::test]
    async fn test_full_channel_blocks_producer() {
        let (mut watcher, mut router) = PodWatcher::manual(1);

        router
            .handle(Event::Apply(create_test_pod("u1", "web-1", "v1")))
            .await
            .unwrap();

        let producer = tokio::spawn(async move {
            router
                .handle(Event::Apply(create_test_pod("u2", "web-2", "v1")))
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        let (arrived, _) = watcher.receivers();
        assert_eq!(arrived.recv().await.unwrap().uid, "u1");
        producer.await.unwrap();
        assert_eq!(arrived.recv().await.unwrap().uid, "u2");
    }

    #[tokio::test]
    async fn test_stop_releases_blocked_producer() {
        let (mut watcher, mut router) = PodWatcher::manual(1);
        router
            .handle(Event::Apply(create_test_pod("u1", "web-1", "v1")))
            .await
            .unwrap();

        watcher.stop().await;

        let result = router
            .handle(Event::Apply(create_test_pod("u2", "web-2", "v1")))
            .await;
        assert!(result.is_err());
    }
}
