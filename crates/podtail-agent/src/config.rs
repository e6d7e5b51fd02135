//! Agent configuration loading.
//!
//! The file is TOML; every setting has a default, so an empty file is
//! valid apart from having nothing to watch.

use std::path::{Path, PathBuf};

use thiserror::Error;

use podtail_logs::PathFilter;
use podtail_types::AgentConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/podtail/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}'")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("watcher {index}: {reason}")]
    Watcher { index: usize, reason: String },
}

/// Load and validate the configuration at `path`
pub fn load_config(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> Result<AgentConfig, ConfigError> {
    let config: AgentConfig = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings the agent cannot run with
pub fn validate(config: &AgentConfig) -> Result<(), ConfigError> {
    for (value, name) in [
        (config.reconcile_interval_ms, "reconcile_interval_ms"),
        (config.checkpoint_interval_ms, "checkpoint_interval_ms"),
        (config.poll_interval_ms, "poll_interval_ms"),
        (config.resync_interval_secs, "resync_interval_secs"),
        (config.event_buffer as u64, "event_buffer"),
    ] {
        if value == 0 {
            return Err(ConfigError::Zero(name));
        }
    }

    for (index, watcher) in config.watchers.iter().enumerate() {
        let invalid = |reason: &str| ConfigError::Watcher {
            index,
            reason: reason.to_string(),
        };

        if watcher.label_selector.is_none() && watcher.paths.is_empty() {
            return Err(invalid("needs a label_selector or at least one path"));
        }

        if watcher.container().is_some() && watcher.label_selector.is_none() {
            return Err(invalid("container_name requires a label_selector"));
        }

        if let Err(error) = PathFilter::new().with_excludes(&watcher.exclude_paths) {
            return Err(invalid(&format!("bad exclude pattern: {}", error)));
        }

        for path in &watcher.paths {
            if let Err(error) = glob::Pattern::new(path) {
                return Err(invalid(&format!("bad path pattern '{}': {}", path, error)));
            }
        }
    }

    Ok(())
}
