use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the offset store
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state store at {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },

    #[error("state store operation failed")]
    Store(#[from] sled::Error),

    #[error("corrupt offset record for {0}")]
    Corrupt(PathBuf),
}

/// Failures turning a pod (or any other source) into a glob pattern
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The log directory is missing or still empty. Usually the pod has
    /// only just been scheduled, so callers should try again later.
    #[error("log path not yet determinable: {0}")]
    NotYetDeterminable(String),

    #[error("failed to inspect {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResolveError {
    /// Whether retrying the resolution later can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotYetDeterminable(_) => true,
            // the directory vanished between stat and readdir
            Self::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
        }
    }
}
