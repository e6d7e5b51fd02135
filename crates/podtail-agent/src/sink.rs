use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use podtail_k8s::PodRegistry;
use podtail_logs::{LineHandler, LineHandlerFactory};
use podtail_types::PodSnapshot;

use crate::pod_set::PodHandlerFactory;

type Output = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes every tailed line as one JSON object per line
#[derive(Clone)]
pub struct JsonLinesSink {
    out: Output,
}

#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp: DateTime<Utc>,
    path: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    pod: Option<PodMetadata<'a>>,
    line: &'a str,
}

#[derive(Serialize)]
struct PodMetadata<'a> {
    uid: &'a str,
    name: &'a str,
    namespace: &'a str,
    labels: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_name: Option<&'a str>,
}

impl<'a> From<&'a PodSnapshot> for PodMetadata<'a> {
    fn from(pod: &'a PodSnapshot) -> Self {
        Self {
            uid: &pod.uid,
            name: &pod.name,
            namespace: &pod.namespace,
            labels: &pod.labels,
            node_name: pod.node_name.as_deref(),
        }
    }
}

impl JsonLinesSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Handlers for statically configured paths, without pod metadata
    pub fn for_paths(&self) -> Arc<dyn LineHandlerFactory> {
        Arc::new(FileLines {
            out: Arc::clone(&self.out),
            pod: None,
        })
    }
}

impl PodHandlerFactory for JsonLinesSink {
    fn for_pod(
        &self,
        pod: &PodSnapshot,
        pods: &PodRegistry,
    ) -> anyhow::Result<Arc<dyn LineHandlerFactory>> {
        Ok(Arc::new(FileLines {
            out: Arc::clone(&self.out),
            pod: Some((pod.clone(), pods.clone())),
        }))
    }
}

struct FileLines {
    out: Output,
    pod: Option<(PodSnapshot, PodRegistry)>,
}

impl LineHandlerFactory for FileLines {
    fn new_handler(&self, path: &Path) -> Box<dyn LineHandler> {
        Box::new(JsonLineHandler {
            path: path.to_path_buf(),
            out: Arc::clone(&self.out),
            pod: self.pod.clone().map(|(last_known, pods)| PodLookup { last_known, pods }),
        })
    }
}

/// Latest metadata for a pod, falling back to the last snapshot seen once
/// the pod has left the registry
struct PodLookup {
    last_known: PodSnapshot,
    pods: PodRegistry,
}

impl PodLookup {
    fn current(&mut self) -> &PodSnapshot {
        if let Some(pod) = self.pods.get(&self.last_known.uid) {
            self.last_known = pod;
        }
        &self.last_known
    }
}

struct JsonLineHandler {
    path: PathBuf,
    out: Output,
    pod: Option<PodLookup>,
}

impl LineHandler for JsonLineHandler {
    fn handle(&mut self, line: &str) {
        let record = LogRecord {
            timestamp: Utc::now(),
            path: &self.path,
            pod: self.pod.as_mut().map(|lookup| PodMetadata::from(lookup.current())),
            line,
        };

        let mut out = self.out.lock();
        let written = serde_json::to_writer(&mut *out, &record)
            .map_err(io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(error) = written {
            warn!(path = %self.path.display(), %error, "failed to write log record");
        }
    }
}
