use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ResolveError;
use crate::filter::{PathFilter, expand};
use crate::handler::LineHandlerFactory;
use crate::state::StateRecorder;
use crate::tailer::{Tailer, TailerOptions};

/// Produces the glob a path watcher expands on every tick
pub trait PatternResolver: Send {
    fn resolve(&mut self) -> Result<String, ResolveError>;
}

/// A fixed pattern, as configured
impl PatternResolver for String {
    fn resolve(&mut self) -> Result<String, ResolveError> {
        Ok(self.clone())
    }
}

#[derive(Clone, Debug)]
pub struct PathWatcherOptions {
    /// Time between reconciliations against the filesystem
    pub check_interval: Duration,
    pub tailer: TailerOptions,
}

impl Default for PathWatcherOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            tailer: TailerOptions::default(),
        }
    }
}

/// Keeps exactly one tailer running per file matching a glob pattern
pub struct PathWatcher {
    resolver: Box<dyn PatternResolver>,

    /// Resolved pattern, cached after the first success
    pattern: Option<String>,

    filter: PathFilter,
    factory: Arc<dyn LineHandlerFactory>,
    state: Option<StateRecorder>,
    options: PathWatcherOptions,

    tailers: HashMap<PathBuf, Tailer>,
}

impl PathWatcher {
    pub fn new(
        resolver: Box<dyn PatternResolver>,
        filter: PathFilter,
        factory: Arc<dyn LineHandlerFactory>,
        state: Option<StateRecorder>,
        options: PathWatcherOptions,
    ) -> Self {
        Self {
            resolver,
            pattern: None,
            filter,
            factory,
            state,
            options,
            tailers: HashMap::new(),
        }
    }

    /// Resolve the pattern unless an earlier call already did
    pub fn resolve_pattern(&mut self) -> Result<&str, ResolveError> {
        let pattern = match self.pattern.take() {
            Some(pattern) => pattern,
            None => self.resolver.resolve()?,
        };
        Ok(self.pattern.insert(pattern).as_str())
    }

    /// Spawn the reconciliation loop
    pub fn start(self) -> PathWatcherHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        PathWatcherHandle { cancel, task }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check().await,
            }
        }

        for (_, mut tailer) in self.tailers.drain() {
            tailer.stop().await;
        }
        debug!(pattern = ?self.pattern, "path watcher stopped");
    }

    /// One reconciliation pass: tail new files, retire vanished ones
    async fn check(&mut self) {
        let pattern = match self.resolve_pattern() {
            Ok(pattern) => pattern.to_string(),
            Err(ResolveError::NotYetDeterminable(reason)) => {
                debug!(%reason, "log pattern not yet determinable");
                return;
            }
            Err(error) => {
                warn!(%error, "failed to resolve log pattern");
                return;
            }
        };

        let files = match expand(&pattern) {
            Ok(files) => files,
            Err(error) => {
                error!(%pattern, %error, "invalid glob pattern");
                return;
            }
        };

        let mut current = HashSet::with_capacity(files.len());
        for path in files {
            if !self.tailers.contains_key(&path) && self.filter.accepts(&path) {
                self.start_tailer(path.clone()).await;
            }
            current.insert(path);
        }

        let gone: Vec<PathBuf> = self
            .tailers
            .keys()
            .filter(|path| !current.contains(*path))
            .cloned()
            .collect();
        for path in gone {
            if let Some(mut tailer) = self.tailers.remove(&path) {
                tailer.stop().await;
                tailer.clear();
                info!(path = %path.display(), "file is gone, stopped tailing");
            }
        }
    }

    async fn start_tailer(&mut self, path: PathBuf) {
        match Tailer::open(&path, self.state.clone(), self.options.tailer.clone()).await {
            Ok(mut tailer) => {
                tailer.run(self.factory.new_handler(&path));
                self.tailers.insert(path, tailer);
            }
            // retried on the next tick if the file still matches
            Err(error) => warn!(path = %path.display(), %error, "failed to open file"),
        }
    }
}

/// A running path watcher
pub struct PathWatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PathWatcherHandle {
    /// Stop reconciling and wait for every tailer to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            warn!(%error, "path watcher task failed");
        }
    }
}
