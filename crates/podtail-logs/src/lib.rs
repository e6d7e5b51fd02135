//! Log file tailing for podtail
//!
//! This crate provides the offset store, single-file tailers, and the
//! glob-driven path watcher that reconciles a set of tailers against disk.

mod error;
mod filter;
mod handler;
mod state;
mod tailer;
mod watcher;

pub use error::{ResolveError, StateError};
pub use filter::{PathFilter, expand};
pub use handler::{LineHandler, LineHandlerFactory};
pub use state::StateRecorder;
pub use tailer::{Tailer, TailerOptions};
pub use watcher::{PathWatcher, PathWatcherHandle, PathWatcherOptions, PatternResolver};

// Re-export types used in our public API
pub use podtail_types::ReadFrom;

#[cfg(test)]
pub(crate) mod testing;
