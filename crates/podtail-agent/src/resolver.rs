use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use thiserror::Error;
use tracing::{debug, info};

use podtail_logs::{PathFilter, PatternResolver, ResolveError};
use podtail_types::PodSnapshot;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid container filter")]
    Include(#[from] regex::Error),

    #[error("invalid exclude pattern")]
    Exclude(#[from] glob::PatternError),
}

/// Glob for every log file of `pod` under `base_dir`.
///
/// Layouts are probed newest first:
/// - `pods/<ns>_<name>_<uid>/<container>/N.log`
/// - `pods/<ns>_<name>_<hash>/...` or `pods/<hash>/...` for pods carrying a
///   kubelet config hash
/// - `pods/<uid>/<container>/N.log`, or the older flat `pods/<uid>/<container>_N.log`
///
/// With `legacy` set the flat `containers/<name>_<ns>_*.log` symlink
/// layout is returned without touching the disk.
pub fn resolve_log_pattern(
    pod: &PodSnapshot,
    base_dir: &Path,
    legacy: bool,
) -> Result<String, ResolveError> {
    if legacy {
        return Ok(format!(
            "{}/{}_{}_*.log",
            glob_dir(&base_dir.join("containers")),
            pod.name,
            pod.namespace
        ));
    }

    let pods_dir = base_dir.join("pods");

    let named = pods_dir.join(format!("{}_{}_{}", pod.namespace, pod.name, pod.uid));
    if named.exists() {
        return Ok(nested(&named));
    }

    if let Some(hash) = pod.config_hash() {
        let named = pods_dir.join(format!("{}_{}_{}", pod.namespace, pod.name, hash));
        if named.exists() {
            return Ok(nested(&named));
        }

        let hashed = pods_dir.join(hash);
        if hashed.exists() {
            info!(name = %pod.name, uid = %pod.uid, %hash, "critical pod detected, using config hash for log dir");
            return layout_of(&hashed);
        }
    }

    let by_uid = pods_dir.join(&pod.uid);
    if by_uid.exists() {
        return layout_of(&by_uid);
    }

    Err(ResolveError::NotYetDeterminable(format!(
        "no log directory for pod {} under {}",
        pod.uid,
        pods_dir.display()
    )))
}

/// Pick between `<dir>/*/*` and `<dir>/*` depending on whether the
/// directory holds per-container subdirectories
fn layout_of(dir: &Path) -> Result<String, ResolveError> {
    let io_error = |source| ResolveError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut empty = true;
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        empty = false;
        // follows symlinks, so a linked container dir still counts
        if entry.path().is_dir() {
            return Ok(nested(dir));
        }
    }

    if empty {
        debug!(path = %dir.display(), "no files in log path yet");
        return Err(ResolveError::NotYetDeterminable(format!(
            "{} is empty",
            dir.display()
        )));
    }
    Ok(format!("{}/*", glob_dir(dir)))
}

fn nested(dir: &Path) -> String {
    format!("{}/*/*", glob_dir(dir))
}

fn glob_dir(dir: &Path) -> String {
    Pattern::escape(&dir.to_string_lossy())
}

/// Filter restricting a pod's files to one container, plus the watcher's
/// exclude globs.
///
/// Must agree with the layouts [`resolve_log_pattern`] produces: one regex
/// for the legacy layout, otherwise one per pod-directory layout, keyed by
/// the config hash when the pod has one and the UID otherwise.
pub fn container_filter(
    pod: &PodSnapshot,
    base_dir: &Path,
    container: Option<&str>,
    legacy: bool,
    excludes: &[String],
) -> Result<PathFilter, FilterError> {
    let mut filter = PathFilter::new().with_excludes(excludes)?;

    let Some(container) = container else {
        return Ok(filter);
    };

    let base = regex::escape(base_dir.to_string_lossy().trim_end_matches('/'));
    let container = regex::escape(container);
    let name = regex::escape(&pod.name);
    let namespace = regex::escape(&pod.namespace);

    if legacy {
        filter = filter.with_include(&format!(
            r"^{base}/containers/{name}_{namespace}_{container}-.+\.log"
        ))?;
    } else {
        let id = regex::escape(pod.config_hash().unwrap_or(&pod.uid));
        filter = filter
            .with_include(&format!(
                r"^{base}/pods/{namespace}_{name}_{id}/{container}/[0-9]*\.log"
            ))?
            .with_include(&format!(r"^{base}/pods/{id}/{container}/[0-9]*\.log"))?
            .with_include(&format!(r"^{base}/pods/{id}/{container}_[0-9]*\.log"))?;
    }

    debug!(pod = %pod.name, ?filter, "container filter");
    Ok(filter)
}

/// Resolves a pod's log glob lazily, from inside its path watcher
pub struct PodLogResolver {
    pod: PodSnapshot,
    base_dir: PathBuf,
    legacy: bool,
}

impl PodLogResolver {
    pub fn new(pod: PodSnapshot, base_dir: PathBuf, legacy: bool) -> Self {
        Self {
            pod,
            base_dir,
            legacy,
        }
    }
}

impl PatternResolver for PodLogResolver {
    fn resolve(&mut self) -> Result<String, ResolveError> {
        resolve_log_pattern(&self.pod, &self.base_dir, self.legacy)
    }
}
