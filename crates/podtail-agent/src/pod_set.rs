use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, error, info, warn};

use podtail_k8s::{PodRegistry, PodWatcher, PodWatcherOptions, node_field_selector};
use podtail_logs::{LineHandlerFactory, PathWatcher, PathWatcherHandle, PathWatcherOptions, StateRecorder};
use podtail_types::{PodSnapshot, SELF_EXCLUSION_SELECTOR, WatcherConfig};

use crate::resolver::{PodLogResolver, container_filter};

/// Builds the line handler factory for one pod's files
pub trait PodHandlerFactory: Send + Sync {
    /// `pods` gives live access to the pod's latest snapshot while it runs
    fn for_pod(&self, pod: &PodSnapshot, pods: &PodRegistry) -> Result<Arc<dyn LineHandlerFactory>>;
}

/// How often, and how patiently, a pod whose log directory is not ready
/// yet is retried
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Everything a pod set needs besides the pod stream itself
#[derive(Clone)]
pub struct PodSetContext {
    pub watcher: WatcherConfig,
    pub base_log_dir: PathBuf,
    pub legacy_log_paths: bool,
    pub state: Option<StateRecorder>,
    pub handlers: Arc<dyn PodHandlerFactory>,
    pub path_options: PathWatcherOptions,
    pub pod_options: PodWatcherOptions,
    pub retry: RetryPolicy,
}

/// Label selector with the agent's own pods excluded
pub fn scoped_label_selector(selector: &str) -> String {
    if selector.is_empty() {
        SELF_EXCLUSION_SELECTOR.to_string()
    } else {
        format!("{},{}", selector, SELF_EXCLUSION_SELECTOR)
    }
}

/// Tails the logs of every pod matching one watcher configuration
pub struct PodSetTailer {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PodSetTailer {
    /// Watch this node's pods matching the configured selector
    pub async fn connect(client: kube::Client, node_name: &str, ctx: PodSetContext) -> Result<Self> {
        let label_selector =
            scoped_label_selector(ctx.watcher.label_selector.as_deref().unwrap_or_default());

        let watcher = PodWatcher::new(
            client,
            ctx.watcher.scoped_namespace(),
            &label_selector,
            &node_field_selector(node_name),
            ctx.pod_options.clone(),
        )
        .await?;

        Ok(Self::start(watcher, ctx))
    }

    /// Run the control loop over an existing pod watcher, which the
    /// tailer takes ownership of
    pub fn start(watcher: PodWatcher, ctx: PodSetContext) -> Self {
        let cancel = CancellationToken::new();
        let set = PodSet::new(ctx, watcher.registry());
        let task = tokio::spawn(set.run(watcher, cancel.clone()));

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop every pod's watcher, then the pod watcher itself
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "pod set task failed");
            }
        }
    }
}

impl Drop for PodSetTailer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A pod waiting for its log directory to appear
struct PendingPod {
    pod: PodSnapshot,
    watcher: PathWatcher,
    attempt: u32,
}

/// State owned by the control loop
struct PodSet {
    ctx: PodSetContext,
    registry: PodRegistry,
    watchers: HashMap<String, PathWatcherHandle>,
    retries: DelayQueue<PendingPod>,
    pending: HashMap<String, delay_queue::Key>,
}

impl PodSet {
    fn new(ctx: PodSetContext, registry: PodRegistry) -> Self {
        Self {
            ctx,
            registry,
            watchers: HashMap::new(),
            retries: DelayQueue::new(),
            pending: HashMap::new(),
        }
    }

    async fn run(mut self, mut pods: PodWatcher, cancel: CancellationToken) {
        {
            let (arrived, departed) = pods.receivers();
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    Some(pod) = arrived.recv() => self.pod_arrived(pod),

                    Some(uid) = departed.recv() => self.pod_departed(&uid).await,

                    Some(expired) = self.retries.next(), if !self.retries.is_empty() => {
                        self.retry(expired.into_inner());
                    }

                    else => break,
                }
            }
        }

        for (uid, handle) in self.watchers.drain() {
            debug!(%uid, "stopping pod watcher");
            handle.stop().await;
        }
        pods.stop().await;
    }

    fn pod_arrived(&mut self, pod: PodSnapshot) {
        if self.watchers.contains_key(&pod.uid) || self.pending.contains_key(&pod.uid) {
            debug!(uid = %pod.uid, "pod already tracked");
            return;
        }

        let factory = match self.ctx.handlers.for_pod(&pod, &self.registry) {
            Ok(factory) => factory,
            Err(error) => {
                error!(uid = %pod.uid, name = %pod.name, error = %format!("{error:#}"), "failed to build line handlers for pod");
                return;
            }
        };

        let filter = match container_filter(
            &pod,
            &self.ctx.base_log_dir,
            self.ctx.watcher.container(),
            self.ctx.legacy_log_paths,
            &self.ctx.watcher.exclude_paths,
        ) {
            Ok(filter) => filter,
            Err(error) => {
                error!(uid = %pod.uid, name = %pod.name, %error, "failed to build file filter for pod");
                return;
            }
        };

        info!(uid = %pod.uid, name = %pod.name, namespace = %pod.namespace, "setting up watcher for pod");
        let watcher = PathWatcher::new(
            Box::new(PodLogResolver::new(
                pod.clone(),
                self.ctx.base_log_dir.clone(),
                self.ctx.legacy_log_paths,
            )),
            filter,
            factory,
            self.ctx.state.clone(),
            self.ctx.path_options.clone(),
        );
        self.try_start(PendingPod {
            pod,
            watcher,
            attempt: 0,
        });
    }

    fn retry(&mut self, pending: PendingPod) {
        self.pending.remove(&pending.pod.uid);
        self.try_start(pending);
    }

    /// Start the pod's watcher if its log pattern resolves, else queue a retry
    fn try_start(&mut self, mut pending: PendingPod) {
        let pod = &pending.pod;

        let error = match pending.watcher.resolve_pattern().map(str::to_owned) {
            Ok(pattern) => {
                info!(uid = %pod.uid, name = %pod.name, namespace = %pod.namespace, %pattern, "starting watcher for pod");
                let uid = pod.uid.clone();
                self.watchers.insert(uid, pending.watcher.start());
                return;
            }
            Err(error) => error,
        };

        if !error.is_transient() || pending.attempt >= self.ctx.retry.max_retries {
            error!(uid = %pod.uid, name = %pod.name, namespace = %pod.namespace, %error, "error setting up watcher, giving up on this pod");
            return;
        }

        pending.attempt += 1;
        let delay = self.ctx.retry.delay(pending.attempt);
        warn!(uid = %pod.uid, name = %pod.name, %error, retry_attempts = pending.attempt, ?delay, "got error setting up watcher, retrying");

        let uid = pending.pod.uid.clone();
        let key = self.retries.insert(pending, delay);
        self.pending.insert(uid, key);
    }

    async fn pod_departed(&mut self, uid: &str) {
        if let Some(key) = self.pending.remove(uid) {
            self.retries.remove(&key);
            debug!(%uid, "pod deleted, dropped pending retry");
        }

        if let Some(handle) = self.watchers.remove(uid) {
            info!(%uid, "pod deleted, stopping watcher");
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use k8s_openapi::api::core::v1::{Pod, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::watcher::Event;
    use parking_lot::Mutex;
    use podtail_logs::{LineHandler, TailerOptions};

    use super::*;

    type Collected = Arc<Mutex<Vec<(String, String)>>>;

    /// Collects `(pod name, line)` pairs from every pod
    #[derive(Default)]
    struct Collector {
        lines: Collected,
    }

    struct PodLines {
        pod: String,
        lines: Collected,
    }

    impl LineHandlerFactory for PodLines {
        fn new_handler(&self, _path: &Path) -> Box<dyn LineHandler> {
            let pod = self.pod.clone();
            let lines = Arc::clone(&self.lines);
            Box::new(move |line: &str| lines.lock().push((pod.clone(), line.to_string())))
        }
    }

    impl PodHandlerFactory for Collector {
        fn for_pod(&self, pod: &PodSnapshot, _pods: &PodRegistry) -> Result<Arc<dyn LineHandlerFactory>> {
            Ok(Arc::new(PodLines {
                pod: pod.name.clone(),
                lines: Arc::clone(&self.lines),
            }))
        }
    }

    fn context(base: &Path, handlers: Arc<dyn PodHandlerFactory>, base_delay: Duration) -> PodSetContext {
        PodSetContext {
            watcher: WatcherConfig {
                label_selector: Some(String::new()),
                ..WatcherConfig::default()
            },
            base_log_dir: base.to_path_buf(),
            legacy_log_paths: false,
            state: None,
            handlers,
            path_options: PathWatcherOptions {
                check_interval: Duration::from_millis(20),
                tailer: TailerOptions {
                    poll_interval: Duration::from_millis(10),
                    ..TailerOptions::default()
                },
            },
            pod_options: PodWatcherOptions::default(),
            retry: RetryPolicy {
                max_retries: 2,
                base_delay,
            },
        }
    }

    fn snapshot(uid: &str, name: &str) -> PodSnapshot {
        PodSnapshot::new(uid.into(), name.into(), "default".into())
    }

    fn create_test_pod(uid: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    fn write_log(path: &Path, data: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[test]
    fn test_scoped_label_selector() {
        assert_eq!(scoped_label_selector(""), "k8s-app!=podtail-agent");
        assert_eq!(
            scoped_label_selector("app=web"),
            "app=web,k8s-app!=podtail-agent"
        );
    }

    #[test]
    fn test_retry_delay_grows_with_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unready_pod_does_not_block_others() {
        let base = tempfile::tempdir().unwrap();
        write_log(&base.path().join("pods/ready/app/0.log"), "hello\n");

        let collector = Arc::new(Collector::default());
        let lines = Arc::clone(&collector.lines);
        // a blocking retry of the stuck pod would take 1s + 2s
        let ctx = context(base.path(), collector, Duration::from_secs(1));

        let (watcher, mut router) = PodWatcher::manual(10);
        let mut tailer = PodSetTailer::start(watcher, ctx);

        router.handle(Event::Apply(create_test_pod("stuck", "stuck"))).await.unwrap();
        router.handle(Event::Apply(create_test_pod("ready", "ready"))).await.unwrap();

        assert!(
            wait_for(|| lines.lock().as_slice() == [("ready".to_string(), "hello".to_string())])
                .await
        );
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_pods_are_served_after_retries_run_out() {
        let base = tempfile::tempdir().unwrap();
        write_log(&base.path().join("pods/later/app/0.log"), "hello\n");

        let collector = Arc::new(Collector::default());
        let lines = Arc::clone(&collector.lines);
        let ctx = context(base.path(), collector, Duration::from_millis(10));

        let (watcher, mut router) = PodWatcher::manual(10);
        let mut tailer = PodSetTailer::start(watcher, ctx);

        router.handle(Event::Apply(create_test_pod("stuck", "stuck"))).await.unwrap();
        // two retries at 10ms and 20ms, then the pod is dropped
        tokio::time::sleep(Duration::from_millis(150)).await;

        router.handle(Event::Apply(create_test_pod("later", "later"))).await.unwrap();
        assert!(
            wait_for(|| lines.lock().as_slice() == [("later".to_string(), "hello".to_string())])
                .await
        );
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_departed_pod_stops_tailing() {
        let base = tempfile::tempdir().unwrap();
        let log = base.path().join("pods/web/app/0.log");
        write_log(&log, "one\n");

        let collector = Arc::new(Collector::default());
        let lines = Arc::clone(&collector.lines);
        let ctx = context(base.path(), collector, Duration::from_millis(10));

        let (watcher, mut router) = PodWatcher::manual(10);
        let mut tailer = PodSetTailer::start(watcher, ctx);

        let pod = create_test_pod("web", "web");
        router.handle(Event::Apply(pod.clone())).await.unwrap();
        assert!(wait_for(|| lines.lock().len() == 1).await);

        router.handle(Event::Delete(pod)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&log, "one\ntwo\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(lines.lock().len(), 1);
        tailer.stop().await;
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let base = tempfile::tempdir().unwrap();
        let ctx = context(base.path(), Arc::new(Collector::default()), Duration::from_millis(10));
        let mut set = PodSet::new(ctx, PodRegistry::default());

        set.pod_arrived(snapshot("stuck", "stuck"));
        assert_eq!(set.pending.len(), 1);

        for _ in 0..2 {
            let expired = set.retries.next().await.unwrap();
            set.retry(expired.into_inner());
        }

        assert!(set.pending.is_empty());
        assert!(set.retries.is_empty());
        assert!(set.watchers.is_empty());
    }

    #[tokio::test]
    async fn test_late_log_directory_is_picked_up_on_retry() {
        let base = tempfile::tempdir().unwrap();
        let ctx = context(base.path(), Arc::new(Collector::default()), Duration::from_millis(10));
        let mut set = PodSet::new(ctx, PodRegistry::default());

        set.pod_arrived(snapshot("late", "late"));
        assert!(set.watchers.is_empty());

        write_log(&base.path().join("pods/late/app/0.log"), "");
        let expired = set.retries.next().await.unwrap();
        set.retry(expired.into_inner());

        assert!(set.pending.is_empty());
        assert!(set.watchers.contains_key("late"));

        for (_, handle) in set.watchers.drain() {
            handle.stop().await;
        }
    }

    #[tokio::test]
    async fn test_departure_cancels_pending_retry() {
        let base = tempfile::tempdir().unwrap();
        let ctx = context(base.path(), Arc::new(Collector::default()), Duration::from_secs(10));
        let mut set = PodSet::new(ctx, PodRegistry::default());

        set.pod_arrived(snapshot("stuck", "stuck"));
        assert_eq!(set.pending.len(), 1);

        set.pod_departed("stuck").await;
        assert!(set.pending.is_empty());
        assert!(set.retries.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_arrival_is_ignored() {
        let base = tempfile::tempdir().unwrap();
        write_log(&base.path().join("pods/web/app/0.log"), "");
        let collector = Arc::new(Collector::default());
        let ctx = context(base.path(), collector, Duration::from_millis(10));
        let mut set = PodSet::new(ctx, PodRegistry::default());

        set.pod_arrived(snapshot("web", "web"));
        set.pod_arrived(snapshot("web", "web"));
        assert_eq!(set.watchers.len(), 1);

        set.pod_departed("web").await;
        assert!(set.watchers.is_empty());
    }
}
