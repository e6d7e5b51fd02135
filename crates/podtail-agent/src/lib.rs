//! Pod-aware log tailing for podtail
//!
//! This crate ties pod discovery to file tailing: it maps pods to their
//! on-disk log layout, runs one path watcher per pod, and loads the agent
//! configuration.

pub mod config;
mod pod_set;
mod resolver;
mod sink;

pub use config::{ConfigError, load_config};
pub use pod_set::{PodHandlerFactory, PodSetContext, PodSetTailer, RetryPolicy, scoped_label_selector};
pub use resolver::{FilterError, PodLogResolver, container_filter, resolve_log_pattern};
pub use sink::JsonLinesSink;
