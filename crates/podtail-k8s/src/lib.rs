//! Kubernetes client for podtail
//!
//! This crate provides Kubernetes API integration: building a client and
//! watching the pods scheduled on this node.

mod client;
mod pod_watcher;

pub use client::{connect, node_field_selector};
pub use pod_watcher::{PodEventRouter, PodRegistry, PodWatcher, PodWatcherOptions, pod_to_snapshot};

// Re-export types that are used in our public API
pub use podtail_types::PodSnapshot;
