//! Shared types for podtail
//!
//! This crate contains data structures used across multiple podtail crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Annotation the kubelet attaches to static and critical pods. Some
/// layouts name the pod log directory after it instead of the UID.
pub const CONFIG_HASH_ANNOTATION: &str = "kubernetes.io/config.hash";

/// Label selector term appended to every watcher so the agent never tails
/// its own output.
pub const SELF_EXCLUSION_SELECTOR: &str = "k8s-app!=podtail-agent";

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Point-in-time view of a pod, replaced wholesale on every update
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PodSnapshot {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<String>,
    pub node_name: Option<String>,
}

impl PodSnapshot {
    pub fn new(uid: String, name: String, namespace: String) -> Self {
        Self {
            uid,
            name,
            namespace,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            containers: Vec::new(),
            node_name: None,
        }
    }

    /// The kubelet config hash, if this pod carries one
    pub fn config_hash(&self) -> Option<&str> {
        self.annotations
            .get(CONFIG_HASH_ANNOTATION)
            .map(String::as_str)
            .filter(|hash| !hash.is_empty())
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Where a tailer starts reading a file it has no checkpoint for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    #[default]
    Beginning,
    End,
}

/// Top-level agent configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Root of the node's log tree (`/var/log` on a standard kubelet)
    pub base_log_dir: PathBuf,

    /// Force the flat `containers/<pod>_<ns>_*.log` layout
    pub legacy_log_paths: bool,

    /// Location of the offset database
    pub state_path: PathBuf,

    /// Fallback log filter when `RUST_LOG` is unset
    pub verbosity: Option<String>,

    pub read_from: ReadFrom,
    pub reconcile_interval_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub resync_interval_secs: u64,

    /// Retries after the first failed log-path resolution of a pod
    pub pod_retry_limit: u32,
    pub pod_retry_delay_ms: u64,

    /// Capacity of the pod event channels
    pub event_buffer: usize,

    pub watchers: Vec<WatcherConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_log_dir: PathBuf::from("/var/log"),
            legacy_log_paths: false,
            state_path: PathBuf::from("/var/lib/podtail/state"),
            verbosity: None,
            read_from: ReadFrom::Beginning,
            reconcile_interval_ms: 1000,
            checkpoint_interval_ms: 1000,
            poll_interval_ms: 250,
            resync_interval_secs: 300,
            pod_retry_limit: 3,
            pod_retry_delay_ms: 1000,
            event_buffer: 100,
            watchers: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn pod_retry_delay(&self) -> Duration {
        Duration::from_millis(self.pod_retry_delay_ms)
    }
}

/// One logical set of files to tail
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Namespace to watch (None or empty = all namespaces)
    pub namespace: Option<String>,

    /// `None` disables pod watching; an empty string selects every pod
    pub label_selector: Option<String>,

    /// Only tail this container's logs
    pub container_name: Option<String>,

    /// Glob patterns of files never to tail
    pub exclude_paths: Vec<String>,

    /// Static glob patterns tailed regardless of pods
    pub paths: Vec<String>,
}

impl WatcherConfig {
    /// Namespace to scope the pod API to, treating "" as all namespaces
    pub fn scoped_namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    pub fn container(&self) -> Option<&str> {
        self.container_name.as_deref().filter(|c| !c.is_empty())
    }
}
